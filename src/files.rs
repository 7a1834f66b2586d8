//! Locating the segment files of an image on disk.
//!
//! EWF names segments by extension: `.E01` through `.E99`, then the
//! three-letter run `.EAA`, `.EAB`, … up to `.ZZZ`. Lowercase variants
//! (`.e01`) exist as well; this module generates the uppercase sequence
//! and accepts either when probing.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Segments 1 to 99 use `E01`..`E99`; from 100 on the extension counts
/// through `EAA`..`EZZ`, `FAA`.. and so forth. The sequence ends at `ZZZ`.
pub fn segment_extension(segment_number: u32) -> Result<String> {
    if segment_number == 0 {
        return Err(Error::InvalidInput("segment numbers start at one"));
    }
    if segment_number < 100 {
        return Ok(format!("E{segment_number:02}"));
    }
    let index = segment_number - 100;
    let letter = index / 676;
    if letter > u32::from(b'Z' - b'E') {
        return Err(Error::InvalidInput(
            "segment number past the extension sequence",
        ));
    }
    let first = b'E' + letter as u8;
    let second = b'A' + ((index / 26) % 26) as u8;
    let third = b'A' + (index % 26) as u8;
    Ok(String::from_utf8_lossy(&[first, second, third]).into_owned())
}

/// The path of a numbered segment file, derived from the image's first
/// segment path: `evidence.E01` → `evidence.E17`.
pub fn segment_filename(first_segment: &Path, segment_number: u32) -> Result<PathBuf> {
    Ok(first_segment.with_extension(segment_extension(segment_number)?))
}

/// Enumerates the on-disk segment files belonging to one image.
pub struct SegmentFileLoader {
    first_segment: PathBuf,
}

impl SegmentFileLoader {
    /// `first_segment` is the path of the `.E01` file.
    pub fn new(first_segment: PathBuf) -> Self {
        SegmentFileLoader { first_segment }
    }

    pub fn has_segment(&self, segment_number: u32) -> bool {
        self.segment_path(segment_number)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// The expected path of a segment, preferring whichever case variant
    /// exists on disk.
    pub fn segment_path(&self, segment_number: u32) -> Result<PathBuf> {
        let upper = segment_filename(&self.first_segment, segment_number)?;
        if upper.exists() {
            return Ok(upper);
        }
        let lower = self
            .first_segment
            .with_extension(segment_extension(segment_number)?.to_lowercase());
        if lower.exists() {
            Ok(lower)
        } else {
            Ok(upper)
        }
    }

    /// All segment paths present on disk, in segment order, stopping at
    /// the first gap in the numbering.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for segment_number in 1.. {
            let path = self.segment_path(segment_number)?;
            if !path.exists() {
                break;
            }
            paths.push(path);
        }
        Ok(paths)
    }
}
