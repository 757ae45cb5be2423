//! The raw-device buffer descriptor (spec section 3, "Raw-device buffer
//! descriptor") and its LBA ring arithmetic, ported from `update_lba`/
//! `lba_to_offset` in `camogm_align.c`.

pub const LBA_SIZE: u64 = 512;

/// Tracks the write head of the wrap-around ring of 512-byte LBAs that
/// backs a raw-device recording session.
#[derive(Clone, Debug)]
pub struct RawDeviceBuffer {
    pub lba_start: u64,
    pub lba_end: u64,
    pub lba_current: u64,
    pub total_rec_len: u64,
    pub last_jpeg_size: u64,
    pub overruns: u64,
}

impl RawDeviceBuffer {
    pub fn new(lba_start: u64, lba_end: u64) -> RawDeviceBuffer {
        RawDeviceBuffer {
            lba_start,
            lba_end,
            lba_current: lba_start,
            total_rec_len: 0,
            last_jpeg_size: 0,
            overruns: 0,
        }
    }

    /// Reserves space for a write of `blocks` whole 512-byte blocks.
    /// If the write would carry `lba_current` past `lba_end` (i.e. it
    /// would straddle the physical end of the partition), the head wraps
    /// to `lba_start` *before* the write so every individual `writev`
    /// lands in one contiguous span; this counts one overrun. Returns the
    /// LBA to write at and whether a wrap occurred.
    pub fn reserve(&mut self, blocks: u64) -> (u64, bool) {
        if self.lba_current + blocks > self.lba_end {
            self.lba_current = self.lba_start;
            self.overruns += 1;
            (self.lba_start, true)
        } else {
            (self.lba_current, false)
        }
    }

    /// Commits a write of `blocks` blocks at the position last returned
    /// by [`RawDeviceBuffer::reserve`].
    pub fn advance(&mut self, blocks: u64) {
        self.lba_current += blocks;
        debug_assert!(self.lba_current <= self.lba_end);
    }

    pub fn lba_to_offset(&self, lba: u64) -> u64 {
        lba * LBA_SIZE
    }

    pub fn ring_capacity_bytes(&self) -> u64 {
        (self.lba_end - self.lba_start) * LBA_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_without_wrap() {
        let mut buf = RawDeviceBuffer::new(2048, 2048 + 32);
        let (at, wrapped) = buf.reserve(12);
        assert_eq!(at, 2048);
        assert!(!wrapped);
        buf.advance(12);
        assert_eq!(buf.lba_current, 2060);
        assert_eq!(buf.overruns, 0);
    }

    #[test]
    fn wraps_before_straddling_write() {
        // 16 KiB buffer (32 LBAs), 6 KiB frames (12 LBAs each).
        let mut buf = RawDeviceBuffer::new(2048, 2048 + 32);
        let (at1, w1) = buf.reserve(12);
        buf.advance(12);
        assert_eq!((at1, w1), (2048, false));
        assert_eq!(buf.lba_current, 2060);

        let (at2, w2) = buf.reserve(12);
        buf.advance(12);
        assert_eq!((at2, w2), (2060, false));
        assert_eq!(buf.lba_current, 2072);

        // 2072 + 12 = 2084 > 2080 -> wraps before writing frame 3.
        let (at3, w3) = buf.reserve(12);
        buf.advance(12);
        assert_eq!(at3, 2048);
        assert!(w3);
        assert_eq!(buf.overruns, 1);
        assert_eq!(buf.lba_current, 2060);
    }

    #[test]
    fn offset_is_lba_times_sector_size() {
        let buf = RawDeviceBuffer::new(0, 1000);
        assert_eq!(buf.lba_to_offset(10), 5120);
    }
}
