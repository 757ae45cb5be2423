//! Packet assembler (spec section 4.2): turns one frame's pieces —
//! JPEG header, Exif blob, and possibly-wrapped JPEG payload — into an
//! ordered list of borrowed byte slices without copying the payload.

use smallvec::SmallVec;

/// Trailing End-Of-Image marker, owned so every sink can reference it
/// without the capture ring being involved.
pub const EOI: [u8; 2] = [0xff, 0xd9];

/// Packet-type tag prefixed onto OGM packets only (spec section 4.2, item 1).
pub const OGM_TAG: [u8; 1] = [0x01];

/// One assembled frame, in the chunk roles the raw-device alignment
/// engine (section 4.3) and the simple sinks (JPEG-file, OGM, MOV) both
/// need. `data1` is populated only when the JPEG payload straddles the
/// capture ring's wrap point.
pub struct Packet<'a> {
    pub ogm_tag: bool,
    pub leader: &'static [u8],
    pub exif: Option<&'a [u8]>,
    pub header: &'a [u8],
    pub data0: &'a [u8],
    pub data1: Option<&'a [u8]>,
    pub trailer: &'static [u8],
}

/// JPEG Start-Of-Image marker; also serves as the packet assembler's
/// `Leader` slot.
pub const SOI: [u8; 2] = [0xff, 0xd8];

impl<'a> Packet<'a> {
    /// Assembles one frame per spec section 4.2.
    ///
    /// `header` is the full captured JPEG header (including its own
    /// leading SOI); when `exif` is `Some`, the assembler splits the
    /// header at its first two bytes and interleaves the Exif blob,
    /// matching "SOI, then Exif, then `jpeg_header[2..]`".
    pub fn assemble(
        for_ogm: bool,
        header: &'a [u8],
        exif: Option<&'a [u8]>,
        data0: &'a [u8],
        data1: Option<&'a [u8]>,
    ) -> Packet<'a> {
        Packet {
            ogm_tag: for_ogm,
            leader: &SOI,
            exif,
            header,
            data0,
            data1,
            trailer: &EOI,
        }
    }

    /// The header slice actually emitted before/around the Exif blob:
    /// `header[0..2]` (the SOI already embedded in the captured header)
    /// when Exif is present, else the whole header.
    pub fn header_lead(&self) -> &'a [u8] {
        if self.exif.is_some() {
            &self.header[0..2.min(self.header.len())]
        } else {
            self.header
        }
    }

    /// The header tail emitted after the Exif blob (empty when there is
    /// no Exif).
    pub fn header_tail(&self) -> &'a [u8] {
        if self.exif.is_some() {
            &self.header[2.min(self.header.len())..]
        } else {
            &[]
        }
    }

    /// Total byte length of the assembled packet, for sizing
    /// `segment_length_bytes` and MOV `frame_lengths[]`.
    pub fn total_len(&self) -> usize {
        let mut n = 0;
        if self.ogm_tag {
            n += OGM_TAG.len();
        }
        n += self.header_lead().len();
        n += self.exif.map_or(0, |e| e.len());
        n += self.header_tail().len();
        n += self.data0.len();
        n += self.data1.map_or(0, |d| d.len());
        n += self.trailer.len();
        n
    }

    /// Renders the packet as an ordered list of slices for a simple
    /// sequential-write sink (JPEG-file, OGM, MOV). The raw-device sink
    /// instead goes through [`crate::align::AlignmentEngine`], which needs
    /// the chunk roles individually rather than this flattened form.
    pub fn slices(&self) -> SmallVec<[&'a [u8]; 8]> {
        let mut v: SmallVec<[&'a [u8]; 8]> = SmallVec::new();
        if self.ogm_tag {
            v.push(&OGM_TAG);
        }
        v.push(self.header_lead());
        if let Some(exif) = self.exif {
            v.push(exif);
        }
        let tail = self.header_tail();
        if !tail.is_empty() {
            v.push(tail);
        }
        v.push(self.data0);
        if let Some(d1) = self.data1 {
            v.push(d1);
        }
        v.push(self.trailer);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_without_exif() {
        let header = [0xff, 0xd8, 0x01, 0x02];
        let data = [0xaa; 16];
        let p = Packet::assemble(false, &header, None, &data, None);
        let slices = p.slices();
        assert_eq!(slices[0], &header[..]);
        assert_eq!(*slices.last().unwrap(), &EOI[..]);
        assert_eq!(p.total_len(), header.len() + data.len() + EOI.len());
    }

    #[test]
    fn assembles_with_exif_splits_header() {
        let header = [0xff, 0xd8, 0x01, 0x02, 0x03];
        let exif = [0xde, 0xad, 0xbe, 0xef];
        let data = [0xaa; 4];
        let p = Packet::assemble(false, &header, Some(&exif), &data, None);
        let slices = p.slices();
        assert_eq!(slices[0], &header[0..2]);
        assert_eq!(slices[1], &exif[..]);
        assert_eq!(slices[2], &header[2..]);
    }

    #[test]
    fn ogm_tag_prefixes_packet() {
        let header = [0xff, 0xd8];
        let data = [0u8; 2];
        let p = Packet::assemble(true, &header, None, &data, None);
        let slices = p.slices();
        assert_eq!(slices[0], &OGM_TAG[..]);
    }

    #[test]
    fn wrapped_payload_emits_two_data_slices() {
        let header = [0xff, 0xd8];
        let d0 = [1u8; 3];
        let d1 = [2u8; 5];
        let p = Packet::assemble(false, &header, None, &d0, Some(&d1));
        let slices = p.slices();
        assert!(slices.iter().any(|s| *s == &d0[..]));
        assert!(slices.iter().any(|s| *s == &d1[..]));
    }
}
