//! Raw-device alignment engine (spec section 4.3), ported from
//! `examples/original_source/src/camogm_align.c`'s `align_frame`,
//! `prep_last_block` and the `CHUNK_*` remapping it does ahead of every
//! `writev`.
//!
//! Implemented as the pure-ish `AlignmentEngine::submit` the design notes
//! (spec section 9) call for: all mutable scratch (the common stage, the
//! carry buffer, the alignment tail) lives in one owned struct, and JPEG
//! payload bytes are never copied — only the handful of header/common
//! bytes and the sub-sector tail that must ride into the next frame.

use crate::packet::Packet;
use smallvec::SmallVec;
use std::io::IoSlice;

pub const PHY_BLOCK_SIZE: usize = 512;
pub const ALIGNMENT_SIZE: usize = 32;

/// One piece of a [`SectorBatch`]: either borrowed straight from the
/// capture ring (the JPEG payload, untouched) or built fresh in scratch
/// space this call (header/Exif/padding/carry).
pub enum Chunk<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl<'a> Chunk<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Borrowed(s) => s,
            Chunk::Owned(v) => v,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// One alignment-engine submission: a sequence of chunks whose combined
/// length is always a multiple of [`PHY_BLOCK_SIZE`], ready for a single
/// `writev`.
#[derive(Default)]
pub struct SectorBatch<'a> {
    chunks: SmallVec<[Chunk<'a>; 6]>,
}

impl<'a> SectorBatch<'a> {
    fn push(&mut self, c: Chunk<'a>) {
        if !c.as_slice().is_empty() {
            self.chunks.push(c);
        }
    }

    pub fn total_len(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn blocks(&self) -> usize {
        self.total_len() / PHY_BLOCK_SIZE
    }

    /// Borrows every chunk as an `IoSlice` for a single `writev`.
    pub fn io_slices(&self) -> SmallVec<[IoSlice<'_>; 6]> {
        self.chunks.iter().map(|c| IoSlice::new(c.as_slice())).collect()
    }

    /// Flattens every chunk into one owned buffer. Used at the writer
    /// thread hand-off boundary (spec section 4.4), where the batch can no
    /// longer borrow straight from the capture ring once it crosses a
    /// thread; also handy in tests that want to inspect the whole batch.
    pub fn to_vec(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.as_slice().to_vec()).collect()
    }
}

/// How many bytes of `trailer`, `data1` and `data0` (consumed in that
/// priority order, matching "Trailer + end of JpegData1 + end of
/// JpegData0" from spec section 4.3) must move into the carry buffer to
/// bring the submission down to a 512-byte multiple.
fn peel_overhang(overhang: usize, data0_len: usize, data1_len: usize, trailer_len: usize) -> (usize, usize, usize) {
    let mut remaining = overhang;
    let trailer_take = remaining.min(trailer_len);
    remaining -= trailer_take;
    let data1_take = remaining.min(data1_len);
    remaining -= data1_take;
    let data0_take = remaining.min(data0_len);
    remaining -= data0_take;
    debug_assert_eq!(remaining, 0, "frame too small to supply the computed overhang");
    (data0_take, data1_take, trailer_take)
}

/// Owns the scratch buffers (`CommonStage`, `CarryBuffer`) across calls.
/// One instance per raw-device recording session.
pub struct AlignmentEngine {
    carry: Vec<u8>,
}

impl AlignmentEngine {
    pub fn new() -> AlignmentEngine {
        AlignmentEngine { carry: Vec::new() }
    }

    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Submits one assembled frame. Returns `None` when the frame (plus
    /// any carried remainder) is still short of a full sector and has
    /// been entirely deferred into the carry buffer (spec 4.3 step 1).
    pub fn submit<'a>(&mut self, packet: &Packet<'a>) -> Option<SectorBatch<'a>> {
        let total_bytes = packet.total_len();
        if total_bytes + self.carry.len() < PHY_BLOCK_SIZE {
            self.carry.extend_from_slice(packet.header_lead());
            if let Some(e) = packet.exif {
                self.carry.extend_from_slice(e);
            }
            self.carry.extend_from_slice(packet.header_tail());
            self.carry.extend_from_slice(packet.data0);
            if let Some(d1) = packet.data1 {
                self.carry.extend_from_slice(d1);
            }
            self.carry.extend_from_slice(packet.trailer);
            return None;
        }

        // Step 2+3: drain the carry into CommonStage, append leader/Exif/header,
        // then stuff an APP15 marker so CommonStage lands on a 32-byte boundary.
        let mut common = std::mem::take(&mut self.carry);
        common.extend_from_slice(packet.header_lead());
        if let Some(e) = packet.exif {
            common.extend_from_slice(e);
        }
        common.extend_from_slice(packet.header_tail());

        let len_so_far = common.len();
        let mut pad = (ALIGNMENT_SIZE - (len_so_far % ALIGNMENT_SIZE)) % ALIGNMENT_SIZE;
        if pad < 6 {
            pad += ALIGNMENT_SIZE;
        }
        let marker_len: u16 = (pad - 2) as u16;
        common.push(0xff);
        common.push(0xef);
        common.push((marker_len >> 8) as u8);
        common.push((marker_len & 0xff) as u8);
        common.resize(common.len() + (pad - 4), 0);
        debug_assert_eq!(common.len() % ALIGNMENT_SIZE, 0);

        let mut data0 = packet.data0;
        let mut data1 = packet.data1;
        let mut trailer = packet.trailer;

        let len_all = common.len() + data0.len() + data1.map_or(0, <[u8]>::len) + trailer.len();
        let overhang = len_all % PHY_BLOCK_SIZE;

        let mut batch = SectorBatch::default();
        let mut align_tail: Option<Vec<u8>> = None;

        if overhang > 0 {
            // Step 4: peel the overhang into the carry for next frame.
            let (d0_take, d1_take, t_take) =
                peel_overhang(overhang, data0.len(), data1.map_or(0, <[u8]>::len), trailer.len());
            let mut carry = Vec::with_capacity(overhang);
            carry.extend_from_slice(&data0[data0.len() - d0_take..]);
            if let Some(d1) = data1 {
                carry.extend_from_slice(&d1[d1.len() - d1_take..]);
            }
            carry.extend_from_slice(&trailer[trailer.len() - t_take..]);
            debug_assert_eq!(carry.len(), overhang);
            self.carry = carry;

            data0 = &data0[..data0.len() - d0_take];
            data1 = data1.map(|d| &d[..d.len() - d1_take]);
            trailer = &trailer[..trailer.len() - t_take];
        } else {
            // Step 5: already sector-aligned in aggregate; still need every
            // individual element 32-byte aligned, so fold the mod-32 tail of
            // the last data slot plus the trailer into one AlignTail chunk.
            if let Some(d1) = data1.filter(|d| !d.is_empty()) {
                let k = d1.len() % ALIGNMENT_SIZE;
                let mut tail = Vec::with_capacity(k + trailer.len());
                tail.extend_from_slice(&d1[d1.len() - k..]);
                tail.extend_from_slice(trailer);
                data1 = Some(&d1[..d1.len() - k]);
                trailer = &[];
                align_tail = Some(tail);
            } else {
                let k = data0.len() % ALIGNMENT_SIZE;
                let mut tail = Vec::with_capacity(k + trailer.len());
                tail.extend_from_slice(&data0[data0.len() - k..]);
                tail.extend_from_slice(trailer);
                data0 = &data0[..data0.len() - k];
                trailer = &[];
                align_tail = Some(tail);
            }
        }

        batch.push(Chunk::Owned(common));
        batch.push(Chunk::Borrowed(data0));
        if let Some(d1) = data1 {
            batch.push(Chunk::Borrowed(d1));
        }
        batch.push(Chunk::Borrowed(trailer));
        if let Some(tail) = align_tail {
            batch.push(Chunk::Owned(tail));
        }

        debug_assert_eq!(batch.total_len() % PHY_BLOCK_SIZE, 0);
        Some(batch)
    }

    /// Final-flush path used on `stop()`: zero-pads whatever remains in the
    /// carry buffer up to one full sector and emits it, matching
    /// `prep_last_block` in the original source. Returns `None` if there
    /// was nothing carried.
    pub fn flush(&mut self) -> Option<SectorBatch<'static>> {
        if self.carry.is_empty() {
            return None;
        }
        let mut carry = std::mem::take(&mut self.carry);
        carry.resize(PHY_BLOCK_SIZE, 0);
        let mut batch = SectorBatch::default();
        batch.push(Chunk::Owned(carry));
        Some(batch)
    }
}

impl Default for AlignmentEngine {
    fn default() -> AlignmentEngine {
        AlignmentEngine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet<'a>(header: &'a [u8], data: &'a [u8]) -> Packet<'a> {
        Packet::assemble(false, header, None, data, None)
    }

    #[test]
    fn defers_tiny_frame_entirely() {
        let mut eng = AlignmentEngine::new();
        let header = [0xffu8, 0xd8];
        let data = vec![0xabu8; 298]; // header(2) + data(298) + trailer(2) = 302 bytes
        let p = packet(&header, &data);
        assert!(eng.submit(&p).is_none());
        assert_eq!(eng.carry_len(), 302);
    }

    #[test]
    fn second_frame_completes_one_sector_with_remainder() {
        let mut eng = AlignmentEngine::new();
        let header = [0xffu8, 0xd8];
        let data1 = vec![0x11u8; 298];
        let p1 = packet(&header, &data1);
        assert!(eng.submit(&p1).is_none());

        let data2 = vec![0x22u8; 398];
        let p2 = packet(&header, &data2);
        let batch = eng.submit(&p2).expect("second frame should flush a sector");
        assert_eq!(batch.total_len() % PHY_BLOCK_SIZE, 0);
        assert_eq!(batch.blocks(), 1);
        for chunk in batch.chunks.iter() {
            // Every element is 32-byte aligned except possibly the very last one.
            if !std::ptr::eq(chunk.as_slice(), batch.chunks.last().unwrap().as_slice()) {
                assert_eq!(chunk.len() % ALIGNMENT_SIZE, 0);
            }
        }
    }

    #[test]
    fn every_submission_is_sector_aligned_for_large_frames() {
        let mut eng = AlignmentEngine::new();
        let header = [0xffu8; 300];
        for n in 0..20 {
            let data = vec![n as u8; 6000 + n];
            let p = packet(&header, &data);
            if let Some(batch) = eng.submit(&p) {
                assert_eq!(batch.total_len() % PHY_BLOCK_SIZE, 0);
            }
        }
        let remainder = eng.carry_len();
        assert!(remainder < PHY_BLOCK_SIZE);
    }

    #[test]
    fn flush_pads_remaining_carry_to_one_sector() {
        let mut eng = AlignmentEngine::new();
        let header = [0xffu8, 0xd8];
        let data = vec![0xabu8; 10];
        let p = packet(&header, &data);
        assert!(eng.submit(&p).is_none());
        let batch = eng.flush().unwrap();
        assert_eq!(batch.total_len(), PHY_BLOCK_SIZE);
        assert_eq!(eng.carry_len(), 0);
    }

    #[test]
    fn no_payload_bytes_are_copied() {
        // The JPEG data chunk surviving in the batch must point at the same
        // memory as the original packet slice (pointer identity), never a copy.
        let mut eng = AlignmentEngine::new();
        let header = [0xffu8, 0xd8];
        let data1 = vec![0x11u8; 298];
        let p1 = packet(&header, &data1);
        assert!(eng.submit(&p1).is_none());

        let data2 = vec![0x22u8; 900];
        let p2 = packet(&header, &data2);
        let batch = eng.submit(&p2).unwrap();
        let found = batch.chunks.iter().any(|c| match c {
            Chunk::Borrowed(s) => s.as_ptr() == data2.as_ptr(),
            Chunk::Owned(_) => false,
        });
        assert!(found, "expected one chunk to borrow directly from the source JPEG payload");
    }
}
