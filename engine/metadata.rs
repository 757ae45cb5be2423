//! The 32-byte inter-frame metadata record written by the compressor ahead
//! of each frame in a capture ring (spec section 6, "Inter-frame metadata
//! record"). Ported from the field layout implied by `camogm.c`'s
//! `frame_params[chn].{frame_length,meta_index,signffff}`.

use base::{bail_t, format_err_t, Error, ErrorKind};
use byteorder::{ByteOrder, LittleEndian};

pub const RECORD_LEN: usize = 32;
pub const SIGNATURE: u16 = 0xffff;

/// Offset of the `(sec, usec)` timestamp pair from the *next* metadata
/// slot, per spec section 6: `META_SEC_OFFSET` bytes back from the 32-byte
/// aligned slot that follows this frame's payload.
pub const META_SEC_OFFSET: usize = 8;

/// A decoded 32-byte metadata record. Never constructed except via
/// [`FrameParams::parse`], so a live value always carries a checked
/// signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameParams {
    pub frame_length: u32,
    /// Offset passed to the Exif device's positional `meta_index` seek to
    /// select the page matching this frame.
    pub meta_index: u32,
    /// Raw sensor/compressor parameter bytes, offsets `4..24` of the
    /// record; opaque to this implementation.
    pub raw_params: [u8; 20],
}

impl FrameParams {
    /// Parses and signature-checks one 32-byte record. Mirrors the
    /// "signature check is a mandatory first step after any read"
    /// invariant from spec section 3.
    pub fn parse(buf: &[u8]) -> Result<FrameParams, Error> {
        if buf.len() != RECORD_LEN {
            bail_t!(Internal, "metadata record must be {} bytes, got {}", RECORD_LEN, buf.len());
        }
        let signature = LittleEndian::read_u16(&buf[28..30]);
        if signature != SIGNATURE {
            return Err(format_err_t!(
                FrameBroken,
                "metadata signature {:#06x} != {:#06x}",
                signature,
                SIGNATURE
            ));
        }
        let frame_length = LittleEndian::read_u32(&buf[0..4]);
        let meta_index = LittleEndian::read_u32(&buf[24..28]);
        let mut raw_params = [0u8; 20];
        raw_params.copy_from_slice(&buf[4..24]);
        Ok(FrameParams { frame_length, meta_index, raw_params })
    }

    /// Computes the ring offset of this record's `(sec, usec)` timestamp,
    /// per spec section 6:
    /// `((ring_offset + frame_length + 35) & !0x1F) + 32 - META_SEC_OFFSET`,
    /// wrapped modulo `circ_size`.
    pub fn timestamp_offset(&self, ring_offset: usize, circ_size: usize) -> usize {
        let next_slot = (ring_offset.wrapping_add(self.frame_length as usize).wrapping_add(35)) & !0x1f;
        let ts_offset = next_slot.wrapping_add(32).wrapping_sub(META_SEC_OFFSET);
        ts_offset % circ_size
    }

    /// Frame width, little-endian at `raw_params[0..2]`. Spec section 3
    /// names width/height as part of the record's "sensor/compressor
    /// parameters" span without giving exact offsets; placed here
    /// alongside `meta_index`'s resolved offset.
    pub fn width(&self) -> u16 {
        LittleEndian::read_u16(&self.raw_params[0..2])
    }

    /// Frame height, little-endian at `raw_params[2..4]`.
    pub fn height(&self) -> u16 {
        LittleEndian::read_u16(&self.raw_params[2..4])
    }
}

/// The `(sec, usec)` pair read from the 8 bytes at a record's timestamp
/// offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTimestamp {
    pub sec: u32,
    pub usec: u32,
}

impl FrameTimestamp {
    pub fn parse(buf: &[u8]) -> FrameTimestamp {
        FrameTimestamp {
            sec: LittleEndian::read_u32(&buf[0..4]),
            usec: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(frame_length: u32, meta_index: u32, signature: u16) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        LittleEndian::write_u32(&mut buf[0..4], frame_length);
        LittleEndian::write_u32(&mut buf[24..28], meta_index);
        LittleEndian::write_u16(&mut buf[28..30], signature);
        buf
    }

    #[test]
    fn parses_well_formed_record() {
        let buf = record(123_456, 7, SIGNATURE);
        let p = FrameParams::parse(&buf).unwrap();
        assert_eq!(p.frame_length, 123_456);
        assert_eq!(p.meta_index, 7);
    }

    #[test]
    fn rejects_bad_signature() {
        let buf = record(10, 0, 0x1234);
        let e = FrameParams::parse(&buf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FrameBroken);
    }

    #[test]
    fn rejects_wrong_length() {
        FrameParams::parse(&[0u8; 31]).unwrap_err();
    }

    #[test]
    fn timestamp_offset_wraps_ring() {
        let p = FrameParams::parse(&record(100, 0, SIGNATURE)).unwrap();
        let circ_size = 1 << 16;
        let off = p.timestamp_offset(circ_size - 16, circ_size);
        assert!(off < circ_size);
    }
}
