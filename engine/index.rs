//! Raw-device indexer/reader (spec section 4.7): scans a recorded raw
//! device for JPEG file boundaries, extracts their Exif timestamps, and
//! serves files back out over a line-oriented TCP command surface.
//!
//! Grounded on `examples/original_source/camogm_read.c`: the marker scan
//! state machine, the Exif/TIFF walk (tag numbers, IFD0/SubIFD traversal)
//! and the time-windowed binary search (`find_disk_index`/`find_in_window`/
//! `get_search_window`) all follow that file's structure. The doubly-linked
//! `disk_idir` there is replaced with a `BTreeMap` keyed by `(rawtime, usec)`
//! — an ordered map gives the same "sorted by time, walk forward/backward
//! from a point" access pattern as the hand-rolled list without unsafe
//! pointer juggling.

use base::Error;
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::io;

/// 8 KiB page-alignment mask used when siting an mmap'd search window
/// (`PAGE_BOUNDARY_MASK` in the original; not 4 KiB).
const PAGE_BOUNDARY_MASK: u64 = !0x1fffu64;

/// Width of one memory-mapped search window (`SEARCH_SIZE_WINDOW`).
const SEARCH_SIZE_WINDOW: u64 = 4 * 1024 * 1024;

/// Acceptance window, in seconds, for a time-keyed search
/// (`SEARCH_TIME_WINDOW`).
const SEARCH_TIME_WINDOW: i64 = 600;

const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];

/// Standard Exif/TIFF tag numbers used by the marker scan's Exif walk.
mod exif_tag {
    pub const PAGE_NUMBER: u16 = 0x0129;
    pub const EXIF_IFD_POINTER: u16 = 0x8769;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const SUB_SEC_TIME_ORIGINAL: u16 = 0x9291;
}

/// One entry in an index directory: a single recorded JPEG file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexNode {
    pub port: u32,
    pub rawtime_s: u32,
    pub usec: u32,
    pub f_offset: u64,
    pub f_size: u64,
}

/// An in-memory, time-ordered index directory (spec section 4.7's
/// `disk_idir`). Dense directories hold every file found by a full scan;
/// sparse directories accumulate the handful of nodes visited while
/// homing in on a timestamp during [`find_by_time`].
#[derive(Default)]
pub struct IndexDirectory {
    nodes: BTreeMap<(u32, u32), IndexNode>,
}

impl IndexDirectory {
    pub fn new() -> IndexDirectory {
        IndexDirectory { nodes: BTreeMap::new() }
    }

    pub fn insert(&mut self, node: IndexNode) {
        self.nodes.insert((node.rawtime_s, node.usec), node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexNode> {
        self.nodes.values()
    }

    /// The node whose `prev`/`next` pair straddles `rawtime_s`, or the
    /// single node nearest it at either end. Mirrors
    /// `find_nearest_by_time`.
    pub fn nearest(&self, rawtime_s: u32) -> Option<&IndexNode> {
        let before = self.nodes.range(..=(rawtime_s, u32::MAX)).next_back();
        let after = self.nodes.range((rawtime_s, 0)..).next();
        match (before, after) {
            (Some((_, a)), Some((_, b))) => {
                let da = (rawtime_s as i64 - a.rawtime_s as i64).abs();
                let db = (b.rawtime_s as i64 - rawtime_s as i64).abs();
                Some(if da <= db { a } else { b })
            }
            (Some((_, a)), None) => Some(a),
            (None, Some((_, b))) => Some(b),
            (None, None) => None,
        }
    }

    /// The node immediately before `node` in time order, if any.
    pub fn prev_of(&self, node: &IndexNode) -> Option<&IndexNode> {
        self.nodes.range(..(node.rawtime_s, node.usec)).next_back().map(|(_, n)| n)
    }

    /// The node immediately after `node` in time order, if any.
    pub fn next_of(&self, node: &IndexNode) -> Option<&IndexNode> {
        self.nodes
            .range((node.rawtime_s, node.usec.saturating_add(1))..)
            .next()
            .map(|(_, n)| n)
    }

    /// Linear scan for the node at a known byte offset (`find_by_offset`;
    /// `read_file`'s argument set names an offset it already has from a
    /// prior `get_index`, not a time).
    pub fn find_by_offset(&self, f_offset: u64) -> Option<&IndexNode> {
        self.nodes.values().find(|n| n.f_offset == f_offset)
    }
}

/// Random-access byte source over the raw device (spec section 4.7 treats
/// the device as one flat byte range from `lba_start*512` to
/// `lba_end*512`). A thin seam over `std::os::unix::fs::FileExt::read_at`
/// so the marker scan and Exif walk can be unit tested against an
/// in-memory buffer.
pub trait RawReader: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut got = 0;
        while got < buf.len() {
            let n = self.read_at(offset + got as u64, &mut buf[got..])?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
            }
            got += n;
        }
        Ok(())
    }
}

impl RawReader for std::fs::File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

/// Marker-scan state machine (spec section 4.7, `{Skip, InFile}`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    Skip,
    InFile { soi_offset: u64 },
}

/// Reads Exif metadata embedded at `file_start` and turns it into an
/// [`IndexNode`] missing only `f_size` (set once the matching EOI is
/// found). Mirrors `read_index`/`exif_get_text` in the original: the TIFF
/// header sits 12 bytes after the APP1 marker, IFD0 is walked first, then
/// the SubIFD it points to.
fn read_exif_node<R: RawReader>(reader: &mut R, file_start: u64) -> Result<Option<IndexNode>, Error> {
    // SOI(2) + APP1 marker(2) + APP1 length(2) + "Exif\0\0"(6) = 12 bytes,
    // then the TIFF header itself begins.
    let mut head = [0u8; 12];
    if reader.read_exact_at(file_start, &mut head).is_err() {
        return Ok(None);
    }
    // APP1 marker (FF E1) must immediately follow the SOI this file starts with.
    if !(head[2] == 0xff && head[3] == 0xe1) {
        return Ok(None);
    }
    let tiff_start = file_start + 12;
    let mut tiff_hdr = [0u8; 8];
    if reader.read_exact_at(tiff_start, &mut tiff_hdr).is_err() {
        return Ok(None);
    }
    if &tiff_hdr[0..2] != b"MM" {
        // Only big-endian (Motorola) TIFF is written by the compressor.
        return Ok(None);
    }
    let ifd0_offset = BigEndian::read_u32(&tiff_hdr[4..8]) as u64;

    let mut port = None;
    let mut date_time: Option<String> = None;
    let mut usec = 0u32;
    let mut subifd_offset = None;

    walk_ifd(reader, tiff_start, ifd0_offset, &mut |tag, value_offset, len| {
        match tag {
            exif_tag::PAGE_NUMBER => {
                let mut buf = [0u8; 2];
                reader.read_exact_at(tiff_start + value_offset, &mut buf).ok();
                port = Some(BigEndian::read_u16(&buf) as u32);
            }
            exif_tag::DATE_TIME_ORIGINAL => {
                date_time = read_ascii(reader, tiff_start, value_offset, len);
            }
            exif_tag::EXIF_IFD_POINTER => {
                subifd_offset = Some(read_u32_at(reader, tiff_start + value_offset));
            }
            _ => {}
        }
    })?;

    if let Some(sub_off) = subifd_offset {
        walk_ifd(reader, tiff_start, sub_off, &mut |tag, value_offset, len| {
            if tag == exif_tag::SUB_SEC_TIME_ORIGINAL {
                if let Some(s) = read_ascii(reader, tiff_start, value_offset, len) {
                    usec = s.trim_matches('\0').parse().unwrap_or(0);
                }
            }
        })?;
    }

    let date_time = match date_time {
        Some(d) => d,
        None => return Ok(None),
    };
    let rawtime_s = parse_exif_datetime(&date_time)?;

    Ok(Some(IndexNode {
        port: port.unwrap_or(0),
        rawtime_s,
        usec,
        f_offset: file_start,
        f_size: 0,
    }))
}

/// One IFD entry is 12 bytes: tag(u16) format(u16) count(u32) value/offset(u32).
const IFD_ENTRY_LEN: u64 = 12;

/// Byte length per Exif data format code, index 0 unused (format codes are
/// 1-based). Taken from the original's `exif_data_fmt` table.
const EXIF_FORMAT_LEN: [u32; 13] = [0, 1, 1, 2, 4, 8, 1, 1, 2, 4, 8, 4, 8];

fn walk_ifd<R: RawReader>(
    reader: &mut R,
    tiff_start: u64,
    ifd_offset: u64,
    on_entry: &mut dyn FnMut(u16, u64, u32),
) -> Result<(), Error> {
    let mut count_buf = [0u8; 2];
    reader.read_exact_at(tiff_start + ifd_offset, &mut count_buf).map_err(Error::from)?;
    let num_entries = BigEndian::read_u16(&count_buf);
    for i in 0..num_entries {
        let entry_off = tiff_start + ifd_offset + 2 + i as u64 * IFD_ENTRY_LEN;
        let mut entry = [0u8; 12];
        reader.read_exact_at(entry_off, &mut entry).map_err(Error::from)?;
        let tag = BigEndian::read_u16(&entry[0..2]);
        let format = BigEndian::read_u16(&entry[2..4]);
        let count = BigEndian::read_u32(&entry[4..8]);
        let fmt_len = *EXIF_FORMAT_LEN.get(format as usize).unwrap_or(&0);
        let total_len = fmt_len.saturating_mul(count);
        // Inline values <= 4 bytes are left-justified in the field; a
        // 2-byte SHORT like PageNumber sits in the first two bytes.
        let value_offset = if total_len <= 4 {
            entry_off - tiff_start + 8
        } else {
            BigEndian::read_u32(&entry[8..12]) as u64
        };
        on_entry(tag, value_offset, count);
    }
    Ok(())
}

fn read_ascii<R: RawReader>(reader: &mut R, tiff_start: u64, value_offset: u64, len: u32) -> Option<String> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact_at(tiff_start + value_offset, &mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string())
}

fn read_u32_at<R: RawReader>(reader: &mut R, offset: u64) -> u64 {
    let mut buf = [0u8; 4];
    reader.read_exact_at(offset, &mut buf).ok();
    BigEndian::read_u32(&buf) as u64
}

/// Parses `"%Y:%m:%d %H:%M:%S"` (spec section 4.7.1) as UTC and returns a
/// Unix timestamp. The daemon and its raw-device clock both run in UTC, so
/// this sidesteps `mktime`'s local-timezone dependency in the original.
fn parse_exif_datetime(s: &str) -> Result<u32, Error> {
    parse_civil_datetime(s, ' ')
}

/// Parses a `"%Y:%m:%d<sep>%H:%M:%S"` timestamp as UTC and returns a Unix
/// timestamp. Shared by the Exif walk (`sep = ' '`) and the reader's
/// `find_file` command, whose wire format uses `EXIF_TIMESTAMP_FORMAT`'s
/// `_` separator instead.
pub fn parse_civil_datetime(s: &str, sep: char) -> Result<u32, Error> {
    let fail = || base::format_err_t!(FrameOther, "malformed date/time {:?}", s);
    let (date, time) = s.split_once(sep).ok_or_else(fail)?;
    let mut d = date.splitn(3, ':');
    let year: i64 = d.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;
    let month: i64 = d.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;
    let day: i64 = d.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;
    let mut t = time.splitn(3, ':');
    let hour: i64 = t.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;
    let minute: i64 = t.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;
    let second: i64 = t.next().ok_or_else(fail)?.parse().map_err(|_| fail())?;

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    Ok(secs as u32)
}

/// Howard Hinnant's `days_from_civil`: days since the Unix epoch for a
/// proleptic-Gregorian civil date, pure integer arithmetic, no leap-table.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Scans `[lba_start*512, lba_end*512)` in 4096-byte chunks, building a
/// dense index of every complete JPEG file found (spec section 4.7's scan
/// protocol). Corrupt in-progress files (SOI seen again before the
/// matching EOI) are dropped, matching the original's state machine.
pub fn build_dense_index<R: RawReader>(reader: &mut R, lba_start: u64, lba_end: u64) -> Result<IndexDirectory, Error> {
    let mut dir = IndexDirectory::new();
    let byte_start = lba_start * 512;
    let byte_end = lba_end * 512;
    const CHUNK: usize = 4096;

    let mut state = ScanState::Skip;
    let mut carry: Vec<u8> = Vec::new();
    let mut offset = byte_start;

    while offset < byte_end {
        let want = (CHUNK).min((byte_end - offset) as usize);
        let mut chunk = vec![0u8; want];
        let n = reader.read_at(offset, &mut chunk).map_err(Error::from)?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);

        // Build the match window: leftover bytes from the previous chunk
        // (at most one marker's worth) followed by this chunk.
        let window_base = offset - carry.len() as u64;
        let mut window = carry.clone();
        window.extend_from_slice(&chunk);

        let mut i = 0usize;
        while i + 1 < window.len() {
            let here = &window[i..i + 2];
            if here == SOI {
                match state {
                    ScanState::Skip => {
                        let soi_offset = window_base + i as u64;
                        state = ScanState::InFile { soi_offset };
                    }
                    ScanState::InFile { .. } => {
                        // corruption: drop the in-progress node, restart here
                        let soi_offset = window_base + i as u64;
                        state = ScanState::InFile { soi_offset };
                    }
                }
                i += 2;
            } else if here == EOI {
                if let ScanState::InFile { soi_offset } = state {
                    let eoi_offset = window_base + i as u64;
                    if let Ok(Some(mut node)) = read_exif_node(reader, soi_offset) {
                        node.f_size = eoi_offset - soi_offset + 2;
                        dir.insert(node);
                    }
                    state = ScanState::Skip;
                }
                i += 2;
            } else {
                i += 1;
            }
        }

        // Keep the last byte as a one-byte carry in case a marker straddles
        // the chunk boundary.
        carry = if window.is_empty() { Vec::new() } else { vec![window[window.len() - 1]] };
        offset += n as u64;
    }

    Ok(dir)
}

/// One page-aligned search window (`struct range` in the original).
#[derive(Clone, Copy, Debug)]
struct Range {
    from: u64,
    to: u64,
}

fn get_search_window(r: Range) -> Option<Range> {
    if r.to <= r.from || r.to - r.from < SEARCH_SIZE_WINDOW {
        return None;
    }
    let middle = (r.to + r.from) / 2;
    let half = SEARCH_SIZE_WINDOW / 2;
    let from = (middle.saturating_sub(half)) & PAGE_BOUNDARY_MASK;
    let to = middle + half;
    Some(Range { from, to })
}

/// Scans one search window for the first complete JPEG file, if any
/// (`find_in_window`).
fn find_in_window<R: RawReader>(reader: &mut R, wnd: Range) -> Result<Option<IndexNode>, Error> {
    let dir = build_dense_index(reader, wnd.from / 512, wnd.to / 512)?;
    Ok(dir.iter().next().copied())
}

/// Finds the recorded file closest to `target_sec`, searching outward from
/// the nearest node already known to `sparse`, narrowing the disk range by
/// half each iteration the way `find_disk_index` does. Every node visited
/// along the way is added to `sparse` so later searches start closer.
pub fn find_by_time<R: RawReader>(
    reader: &mut R,
    sparse: &mut IndexDirectory,
    lba_start: u64,
    lba_end: u64,
    target_sec: u32,
) -> Result<Option<IndexNode>, Error> {
    let byte_start = lba_start * 512;
    let byte_end = lba_end * 512;

    let mut range = match sparse.nearest(target_sec) {
        None => Range { from: byte_start, to: byte_end },
        Some(nearest) => {
            if target_sec as i64 > nearest.rawtime_s as i64 {
                let to = sparse.next_of(nearest).map(|n| n.f_offset).unwrap_or(byte_end);
                Range { from: nearest.f_offset, to }
            } else {
                let from = sparse.prev_of(nearest).map(|n| n.f_offset).unwrap_or(byte_start);
                Range { from, to: nearest.f_offset }
            }
        }
    };

    while let Some(window) = get_search_window(range) {
        match find_in_window(reader, window)? {
            Some(found) => {
                let diff = target_sec as i64 - found.rawtime_s as i64;
                sparse.insert(found);
                if diff.abs() <= SEARCH_TIME_WINDOW {
                    return Ok(Some(found));
                }
                if diff > 0 {
                    range.from = window.to;
                } else {
                    range.to = window.from;
                }
            }
            None => {
                range.to = window.from;
            }
        }
    }
    Ok(None)
}

/// Reads a recorded file's bytes out of the raw device (spec section 4.7's
/// "Serving files"). Regime (a), wholly inside `[lba_start, lba_end)`, is
/// one read; regime (b), straddling the ring end, is a head read from
/// `[offset, lba_end)` followed by a tail read from `[lba_start, ..)`
/// (`send_split_file` in the original). Both regimes go through
/// [`RawReader`] rather than a raw `mmap`, since the daemon and its writer
/// already address the device through `pread`/`pwrite`-style seams.
pub fn read_file_bytes<R: RawReader>(reader: &mut R, lba_start: u64, lba_end: u64, node: &IndexNode) -> Result<Vec<u8>, Error> {
    let byte_start = lba_start * 512;
    let byte_end = lba_end * 512;
    let mut buf = vec![0u8; node.f_size as usize];
    if node.f_offset + node.f_size <= byte_end {
        reader.read_exact_at(node.f_offset, &mut buf).map_err(Error::from)?;
    } else {
        let head_sz = (byte_end - node.f_offset) as usize;
        let tail_sz = buf.len() - head_sz;
        reader.read_exact_at(node.f_offset, &mut buf[..head_sz]).map_err(Error::from)?;
        reader.read_exact_at(byte_start, &mut buf[head_sz..head_sz + tail_sz]).map_err(Error::from)?;
    }
    Ok(buf)
}

/// Finds the file immediately following `curr` (`CMD_NEXT_FILE`): if
/// `sparse` already holds it, return that; otherwise search the gap
/// between `curr` and its known successor (or `lba_end` if none) one
/// window at a time, inserting whatever is found into `sparse`.
pub fn find_next_after<R: RawReader>(
    reader: &mut R,
    sparse: &mut IndexDirectory,
    lba_end: u64,
    curr: &IndexNode,
) -> Result<Option<IndexNode>, Error> {
    if let Some(next) = sparse.next_of(curr) {
        return Ok(Some(*next));
    }
    let gap_from = curr.f_offset + curr.f_size;
    let gap_to = lba_end * 512;
    if gap_from >= gap_to {
        return Ok(None);
    }
    let window = Range { from: gap_from & PAGE_BOUNDARY_MASK, to: (gap_from + SEARCH_SIZE_WINDOW).min(gap_to) };
    let found = find_in_window(reader, window)?;
    if let Some(node) = found {
        sparse.insert(node);
    }
    Ok(found)
}

/// Finds the file immediately preceding `curr` (`CMD_PREV_FILE`, an empty
/// stub in the original; implemented symmetrically to
/// [`find_next_after`] since this spec lists `prev_file` as recognised
/// with no stated limitation).
pub fn find_prev_before<R: RawReader>(
    reader: &mut R,
    sparse: &mut IndexDirectory,
    lba_start: u64,
    curr: &IndexNode,
) -> Result<Option<IndexNode>, Error> {
    if let Some(prev) = sparse.prev_of(curr) {
        return Ok(Some(*prev));
    }
    let gap_to = curr.f_offset;
    let gap_from = lba_start * 512;
    if gap_from >= gap_to {
        return Ok(None);
    }
    let window_from = gap_from.max(gap_to.saturating_sub(SEARCH_SIZE_WINDOW)) & PAGE_BOUNDARY_MASK;
    // Unlike `find_in_window`'s "first file in range" (good enough when
    // searching forward), the file closest to `curr` here is the *last*
    // one the window scan finds.
    let dir = build_dense_index(reader, window_from / 512, (gap_to + 511) / 512)?;
    let found = dir.iter().last().copied();
    if let Some(node) = found {
        sparse.insert(node);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemReader(Vec<u8>);

    impl RawReader for MemReader {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let offset = offset as usize;
            if offset >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - offset);
            buf[..n].copy_from_slice(&self.0[offset..offset + n]);
            Ok(n)
        }
    }

    /// Builds one minimal Exif-bearing JPEG file: SOI, APP1(TIFF+IFD0+SubIFD),
    /// a payload byte, EOI.
    fn make_jpeg_file(port: u32, date: &str, usec: &str, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&SOI);
        f.extend_from_slice(&[0xff, 0xe1]); // APP1
        f.extend_from_slice(&[0, 0]); // APP1 length placeholder, unused by the scanner
        f.extend_from_slice(b"Exif\0\0");

        let tiff_start = f.len() as u64;
        // TIFF header: byte order "MM", mark 0x002a, IFD0 offset (relative)
        f.extend_from_slice(b"MM");
        f.extend_from_slice(&[0x00, 0x2a]);
        f.extend_from_slice(&8u32.to_be_bytes()); // IFD0 right after the header

        // IFD0: 3 entries (PageNumber, DateTimeOriginal, ExifIFDPointer)
        let date_bytes = date.as_bytes();
        let date_offset_placeholder = 0u32; // filled below once layout is known
        let mut ifd0 = Vec::new();
        ifd0.extend_from_slice(&3u16.to_be_bytes());
        // PageNumber: SHORT, count 1, value inline (left-justified in 4 bytes)
        ifd0.extend_from_slice(&exif_tag::PAGE_NUMBER.to_be_bytes());
        ifd0.extend_from_slice(&3u16.to_be_bytes()); // format 3 = SHORT
        ifd0.extend_from_slice(&1u32.to_be_bytes());
        ifd0.extend_from_slice(&(port as u16).to_be_bytes());
        ifd0.extend_from_slice(&[0, 0]);
        // DateTimeOriginal: ASCII, count len+1, offset filled later
        ifd0.extend_from_slice(&exif_tag::DATE_TIME_ORIGINAL.to_be_bytes());
        ifd0.extend_from_slice(&2u16.to_be_bytes()); // format 2 = ASCII
        ifd0.extend_from_slice(&((date_bytes.len() + 1) as u32).to_be_bytes());
        let date_offset_field_pos = tiff_start as usize + ifd0.len();
        ifd0.extend_from_slice(&date_offset_placeholder.to_be_bytes());
        // ExifIFDPointer: LONG, count 1, offset filled later
        ifd0.extend_from_slice(&exif_tag::EXIF_IFD_POINTER.to_be_bytes());
        ifd0.extend_from_slice(&4u16.to_be_bytes());
        ifd0.extend_from_slice(&1u32.to_be_bytes());
        let subifd_offset_field_pos = tiff_start as usize + ifd0.len();
        ifd0.extend_from_slice(&0u32.to_be_bytes());
        // next-IFD terminator
        ifd0.extend_from_slice(&0u32.to_be_bytes());

        f.extend_from_slice(&ifd0);

        let date_rel_offset = (f.len() as u64 - tiff_start) as u32;
        f.extend_from_slice(date_bytes);
        f.push(0);

        let usec_bytes = usec.as_bytes();
        let subifd_rel_offset = (f.len() as u64 - tiff_start) as u32;
        let mut subifd = Vec::new();
        subifd.extend_from_slice(&1u16.to_be_bytes());
        subifd.extend_from_slice(&exif_tag::SUB_SEC_TIME_ORIGINAL.to_be_bytes());
        subifd.extend_from_slice(&2u16.to_be_bytes());
        subifd.extend_from_slice(&((usec_bytes.len() + 1) as u32).to_be_bytes());
        let usec_offset_placeholder_pos = f.len() + subifd.len();
        subifd.extend_from_slice(&0u32.to_be_bytes());
        subifd.extend_from_slice(&0u32.to_be_bytes()); // next-IFD terminator
        f.extend_from_slice(&subifd);

        let usec_rel_offset = (f.len() as u64 - tiff_start) as u32;
        f.extend_from_slice(usec_bytes);
        f.push(0);

        // patch offsets now that layout is final
        f[date_offset_field_pos..date_offset_field_pos + 4].copy_from_slice(&date_rel_offset.to_be_bytes());
        f[subifd_offset_field_pos..subifd_offset_field_pos + 4].copy_from_slice(&subifd_rel_offset.to_be_bytes());
        f[usec_offset_placeholder_pos..usec_offset_placeholder_pos + 4]
            .copy_from_slice(&usec_rel_offset.to_be_bytes());

        f.extend_from_slice(payload);
        f.extend_from_slice(&EOI);
        f
    }

    #[test]
    fn dense_scan_finds_every_file_and_its_timestamp() {
        let f0 = make_jpeg_file(0, "2026:01:02 03:04:05", "123456", &[0xaa; 10]);
        let f1 = make_jpeg_file(1, "2026:01:02 03:04:07", "000001", &[0xbb; 20]);
        let mut dev = f0.clone();
        let f1_offset = dev.len() as u64;
        dev.extend_from_slice(&f1);
        // pad so the scan's 4096-byte chunking crosses at least one boundary
        dev.resize(dev.len() + 5000, 0);

        let mut reader = MemReader(dev);
        let dir = build_dense_index(&mut reader, 0, (reader.0.len() as u64 + 511) / 512).unwrap();

        assert_eq!(dir.len(), 2);
        let nodes: Vec<_> = dir.iter().collect();
        assert_eq!(nodes[0].port, 0);
        assert_eq!(nodes[0].rawtime_s, nodes[0].rawtime_s);
        assert_eq!(nodes[0].usec, 123_456);
        assert_eq!(nodes[0].f_offset, 0);
        assert_eq!(nodes[0].f_size, f0.len() as u64);
        assert_eq!(nodes[1].port, 1);
        assert_eq!(nodes[1].usec, 1);
        assert_eq!(nodes[1].f_offset, f1_offset);
    }

    #[test]
    fn civil_date_conversion_matches_known_epoch_seconds() {
        // 2026-01-02 03:04:05 UTC.
        let secs = parse_exif_datetime("2026:01:02 03:04:05").unwrap();
        assert_eq!(days_from_civil(2026, 1, 2) * 86_400 + 3 * 3600 + 4 * 60 + 5, secs as i64);
        // 1970-01-01 00:00:00 UTC is the epoch.
        assert_eq!(parse_exif_datetime("1970:01:01 00:00:00").unwrap(), 0);
    }

    #[test]
    fn index_directory_nearest_breaks_ties_toward_the_closer_side() {
        let mut dir = IndexDirectory::new();
        dir.insert(IndexNode { port: 0, rawtime_s: 100, usec: 0, f_offset: 0, f_size: 10 });
        dir.insert(IndexNode { port: 0, rawtime_s: 200, usec: 0, f_offset: 10, f_size: 10 });
        let n = dir.nearest(130).unwrap();
        assert_eq!(n.rawtime_s, 100);
        let n = dir.nearest(180).unwrap();
        assert_eq!(n.rawtime_s, 200);
    }

    #[test]
    fn find_by_offset_locates_the_matching_node() {
        let mut dir = IndexDirectory::new();
        dir.insert(IndexNode { port: 0, rawtime_s: 100, usec: 0, f_offset: 0, f_size: 10 });
        dir.insert(IndexNode { port: 1, rawtime_s: 200, usec: 0, f_offset: 10, f_size: 20 });
        assert_eq!(dir.find_by_offset(10).unwrap().rawtime_s, 200);
        assert!(dir.find_by_offset(99).is_none());
    }

    #[test]
    fn read_file_bytes_reads_a_contiguous_file_directly() {
        let mut data = vec![0u8; 100];
        data[40..50].copy_from_slice(&[7u8; 10]);
        let mut reader = MemReader(data);
        let node = IndexNode { port: 0, rawtime_s: 0, usec: 0, f_offset: 40, f_size: 10 };
        let bytes = read_file_bytes(&mut reader, 0, 100 / 512 + 1, &node).unwrap();
        assert_eq!(bytes, vec![7u8; 10]);
    }

    #[test]
    fn read_file_bytes_joins_head_and_tail_across_the_ring_end() {
        // lba_end at byte 512; file starts 6 bytes before it, runs 10 bytes,
        // so 6 bytes come from the end of the ring and 4 from the start.
        let lba_end = 1u64; // 512 bytes
        let mut device = vec![0u8; 512];
        device[506..512].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        device[0..4].copy_from_slice(&[7, 8, 9, 10]);
        let mut reader = MemReader(device);
        let node = IndexNode { port: 0, rawtime_s: 0, usec: 0, f_offset: 506, f_size: 10 };
        let bytes = read_file_bytes(&mut reader, 0, lba_end, &node).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn find_next_after_returns_an_already_known_sparse_node_without_scanning() {
        let mut sparse = IndexDirectory::new();
        let curr = IndexNode { port: 0, rawtime_s: 100, usec: 0, f_offset: 0, f_size: 10 };
        let next = IndexNode { port: 0, rawtime_s: 200, usec: 0, f_offset: 20, f_size: 10 };
        sparse.insert(curr);
        sparse.insert(next);
        // A reader that errors on any read proves no device I/O happens.
        struct PanicReader;
        impl RawReader for PanicReader {
            fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
                panic!("should not read the device when sparse already has the answer");
            }
        }
        let mut reader = PanicReader;
        let found = find_next_after(&mut reader, &mut sparse, 1000, &curr).unwrap();
        assert_eq!(found.unwrap().f_offset, 20);
    }

    #[test]
    fn find_prev_before_scans_the_gap_and_picks_the_closest_node() {
        let f0 = make_jpeg_file(0, "2026:01:02 03:04:05", "000000", &[0xaa; 4]);
        let f1 = make_jpeg_file(0, "2026:01:02 03:04:10", "000000", &[0xbb; 4]);
        let mut dev = f0.clone();
        dev.extend_from_slice(&f1);
        let curr_offset = dev.len() as u64;
        dev.resize((curr_offset + 600) as usize, 0);
        let mut reader = MemReader(dev);
        let curr = IndexNode { port: 0, rawtime_s: 0, usec: 0, f_offset: curr_offset, f_size: 10 };
        let mut sparse = IndexDirectory::new();
        let found = find_prev_before(&mut reader, &mut sparse, 0, &curr).unwrap().unwrap();
        assert_eq!(found.f_offset, f0.len() as u64);
    }

    #[test]
    fn civil_datetime_parses_underscore_separated_wire_format() {
        let secs = parse_civil_datetime("2026:01:02_03:04:05", '_').unwrap();
        assert_eq!(secs, parse_exif_datetime("2026:01:02 03:04:05").unwrap());
    }
}
