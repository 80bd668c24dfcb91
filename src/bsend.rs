//! The buffered-send region
//!
//! A buffered-mode send copies its message into a region the application attached beforehand and
//! completes as soon as the copy is made. Every message occupies a range of the region, plus
//! [`BSEND_OVERHEAD`] bytes of bookkeeping, until the transport has delivered it. Ranges are handed
//! out first fit and never overlap.
//!
//! # Standard section(s)
//!
//! 3.6

use std::ops::Range;

use log::debug;

use crate::error::{Error, ErrorKind, Result};

/// Bookkeeping bytes charged against the region for every buffered message
pub const BSEND_OVERHEAD: usize = 32;

/// The region attached for buffered-mode sends and the ranges currently claimed from it
#[derive(Debug, Default)]
pub struct BufferPool {
    region: Option<Vec<u8>>,
    // Sorted by start, adjacent ranges are always merged.
    free: Vec<Range<usize>>,
    claimed: usize,
}

impl BufferPool {
    /// A pool without a region
    pub fn new() -> BufferPool {
        BufferPool::default()
    }

    /// Attach `region`, the whole of which becomes available to buffered sends.
    ///
    /// Fails with `BufferAlreadyExists` if a region is attached; `region` is dropped in that case.
    pub fn attach(&mut self, region: Vec<u8>) -> Result<()> {
        if self.region.is_some() {
            return Err(Error::new(ErrorKind::BufferAlreadyExists));
        }
        debug!("attaching buffered-send region of {} bytes", region.len());
        self.free.clear();
        if !region.is_empty() {
            self.free.push(0..region.len());
        }
        self.claimed = 0;
        self.region = Some(region);
        Ok(())
    }

    /// Detach the region and hand it back.
    ///
    /// Returns an empty `Vec` if no region is attached. Ranges still claimed are forgotten, so the
    /// caller drains outstanding buffered sends first.
    pub fn detach(&mut self) -> Vec<u8> {
        self.free.clear();
        self.claimed = 0;
        match self.region.take() {
            Some(region) => {
                debug!("detached buffered-send region of {} bytes", region.len());
                region
            }
            None => Vec::new(),
        }
    }

    /// Whether a region is attached
    pub fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    /// Size of the attached region, `0` if none is attached
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, Vec::len)
    }

    /// Number of bytes currently claimed
    pub fn in_use(&self) -> usize {
        self.claimed
    }

    /// Number of bytes not claimed
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|r| r.len()).sum()
    }

    /// Claim `len` contiguous bytes, first fit.
    ///
    /// Fails with `BufferExhausted` if no region is attached or no free range is long enough.
    pub fn claim(&mut self, len: usize) -> Result<Range<usize>> {
        if self.region.is_none() {
            return Err(Error::with_detail(
                ErrorKind::BufferExhausted,
                "no buffered-send region is attached",
            ));
        }
        let slot = self.free.iter().position(|r| r.len() >= len).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::BufferExhausted,
                format!(
                    "{} bytes requested, {} of {} bytes free",
                    len,
                    self.free_bytes(),
                    self.capacity()
                ),
            )
        })?;
        let start = self.free[slot].start;
        if self.free[slot].len() == len {
            self.free.remove(slot);
        } else {
            self.free[slot].start += len;
        }
        self.claimed += len;
        Ok(start..start + len)
    }

    /// The bytes of a claimed range
    pub fn region_mut(&mut self, range: Range<usize>) -> Option<&mut [u8]> {
        self.region.as_mut().and_then(|region| region.get_mut(range))
    }

    /// Return a claimed range to the pool.
    ///
    /// Ranges claimed before the region was detached are ignored.
    pub fn release(&mut self, range: Range<usize>) {
        if range.is_empty() || range.end > self.capacity() {
            return;
        }
        let at = self.free.partition_point(|r| r.start < range.start);
        if self.free.get(at).map_or(false, |r| r.start < range.end)
            || (at > 0 && self.free[at - 1].end > range.start)
        {
            // Not a claimed range.
            return;
        }
        self.claimed = self.claimed.saturating_sub(range.len());
        self.free.insert(at, range);
        if at + 1 < self.free.len() && self.free[at].end == self.free[at + 1].start {
            let next = self.free.remove(at + 1);
            self.free[at].end = next.end;
        }
        if at > 0 && self.free[at - 1].end == self.free[at].start {
            let this = self.free.remove(at);
            self.free[at - 1].end = this.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_detach_scenario() {
        let mut pool = BufferPool::new();
        let x = vec![0u8; 100];
        let base = x.as_ptr();
        pool.attach(x).unwrap();

        let y = vec![0u8; 50];
        assert_eq!(
            pool.attach(y).unwrap_err().kind(),
            ErrorKind::BufferAlreadyExists
        );

        let back = pool.detach();
        assert_eq!(back.as_ptr(), base);
        assert_eq!(back.len(), 100);

        let none = pool.detach();
        assert!(none.is_empty());
        assert_eq!(none.capacity(), 0);
    }

    #[test]
    fn claims_do_not_overlap() {
        let mut pool = BufferPool::new();
        pool.attach(vec![0u8; 100]).unwrap();
        let a = pool.claim(40).unwrap();
        let b = pool.claim(40).unwrap();
        assert_eq!(a, 0..40);
        assert_eq!(b, 40..80);
        assert_eq!(
            pool.claim(40).unwrap_err().kind(),
            ErrorKind::BufferExhausted
        );
        assert_eq!(pool.in_use(), 80);

        pool.release(a);
        let c = pool.claim(30).unwrap();
        assert_eq!(c, 0..30);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.claim(100).unwrap(), 0..100);
    }

    #[test]
    fn released_neighbours_merge() {
        let mut pool = BufferPool::new();
        pool.attach(vec![0u8; 30]).unwrap();
        let a = pool.claim(10).unwrap();
        let b = pool.claim(10).unwrap();
        let c = pool.claim(10).unwrap();
        pool.release(a);
        pool.release(c);
        assert!(pool.claim(20).is_err());
        pool.release(b);
        assert_eq!(pool.free_bytes(), 30);
        assert_eq!(pool.claim(30).unwrap(), 0..30);
    }

    #[test]
    fn claim_without_region_is_exhausted() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.claim(1).unwrap_err().kind(), ErrorKind::BufferExhausted);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut pool = BufferPool::new();
        pool.attach(vec![0u8; 16]).unwrap();
        let a = pool.claim(8).unwrap();
        pool.release(a.clone());
        pool.release(a);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_bytes(), 16);
    }
}
