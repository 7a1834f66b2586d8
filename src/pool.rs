//! A pool of segment file handles. Images can span a thousand segment
//! files, far past typical descriptor limits, so entries open lazily and
//! the pool closes the least recently used handle once a budget is hit.
//!
//! Reads are absolute-positioned: each call seeks then reads under the
//! entry's lock, so concurrent readers on different entries never contend
//! and two readers of the same entry never interleave a seek with a read.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{Error, Result};

type Opener<S> = Box<dyn Fn() -> std::io::Result<S> + Send + Sync>;

struct PoolEntry<S> {
    opener: Opener<S>,
    io: Mutex<Option<S>>,
    last_used: AtomicU64,
}

/// Multiplexes file handles across segment files. `S` is anything
/// `Read + Seek`; production images use `File`, tests use in-memory
/// cursors.
pub struct FileIoPool<S> {
    entries: Vec<PoolEntry<S>>,
    max_open: usize,
    clock: AtomicU64,
}

impl<S> std::fmt::Debug for FileIoPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIoPool")
            .field("entries", &self.entries.len())
            .field("max_open", &self.max_open)
            .finish()
    }
}

impl<S: Read + Seek> FileIoPool<S> {
    /// A pool keeping at most `max_open` handles open at a time. A budget
    /// of zero is rounded up to one.
    pub fn new(max_open: usize) -> Self {
        FileIoPool {
            entries: Vec::new(),
            max_open: max_open.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Register a segment file, returning its pool entry number. The
    /// opener runs on first use and again whenever the entry has been
    /// closed to satisfy the open-handle budget.
    pub fn append(&mut self, opener: impl Fn() -> std::io::Result<S> + Send + Sync + 'static) -> usize {
        self.entries.push(PoolEntry {
            opener: Box::new(opener),
            io: Mutex::new(None),
            last_used: AtomicU64::new(0),
        });
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read exactly `buf.len()` bytes at `offset` within the given entry.
    /// A short read is an I/O error, never treated as end of data.
    pub fn read_exact_at(&self, entry: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let slot = self
            .entries
            .get(entry)
            .ok_or(Error::InvalidInput("file io pool entry out of range"))?;

        let mut guard = slot.io.lock().unwrap();
        if guard.is_none() {
            self.make_room(entry)?;
            *guard = Some((slot.opener)()?);
        }
        let io = guard.as_mut().unwrap();
        io.seek(SeekFrom::Start(offset))?;
        io.read_exact(buf)?;

        slot.last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
        Ok(())
    }

    /// How many entries other than `about_to_open` hold an open handle.
    /// Entries locked by another thread are counted as open.
    fn open_count(&self, about_to_open: usize) -> usize {
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != about_to_open)
            .filter(|(_, e)| match e.io.try_lock() {
                Ok(guard) => guard.is_some(),
                Err(_) => true,
            })
            .count()
    }

    /// Close the least recently used open entry (other than `keep`) until
    /// the budget allows `keep` to open one more handle.
    fn make_room(&self, keep: usize) -> Result<()> {
        while self.open_count(keep) >= self.max_open {
            let mut victim: Option<(usize, u64)> = None;
            for (index, entry) in self.entries.iter().enumerate() {
                if index == keep {
                    continue;
                }
                if let Ok(guard) = entry.io.try_lock() {
                    if guard.is_some() {
                        let used = entry.last_used.load(Ordering::Relaxed);
                        if victim.map_or(true, |(_, best)| used < best) {
                            victim = Some((index, used));
                        }
                    }
                }
            }
            match victim {
                Some((index, _)) => {
                    // a racing reader may have re-taken the lock; skip it
                    if let Ok(mut guard) = self.entries[index].io.try_lock() {
                        *guard = None;
                    } else {
                        return Err(Error::PoolExhausted);
                    }
                }
                None => return Err(Error::PoolExhausted),
            }
        }
        Ok(())
    }
}
