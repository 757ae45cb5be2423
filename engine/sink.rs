//! Format sinks: the four things a packet can become (spec section 1,
//! "one of several container formats"). Each implements [`FormatSink`] so
//! [`crate::drain`] can stay ignorant of which one is live.

use crate::align::AlignmentEngine;
use crate::metadata::FrameTimestamp;
use crate::mov::{self, MovCtx, SamplesToChunk};
use crate::ogm::{OgmMuxer, StreamHeaderParams};
use crate::packet::Packet;
use crate::rawdev::RawDeviceBuffer;
use crate::writer::WriterChannel;
use base::Error;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Live raw-device ring stats (spec section 7's `raw_overruns`/
/// `raw_lba_current`/`raw_percent_done`), read from the sink that's
/// actually driving the ring rather than the geometry fixed at session
/// start.
#[derive(Clone, Copy, Debug)]
pub struct RawStatusSnapshot {
    pub overruns: u64,
    pub lba_current: u64,
    pub percent_done: f64,
}

/// One assembled frame in, nothing out but success/failure — the
/// boundary the drain loop (spec section 4.1) writes across without
/// knowing which container format is live.
pub trait FormatSink: Send {
    fn write_packet(&mut self, packet: &Packet<'_>, ts: FrameTimestamp, port: usize) -> Result<(), Error>;
    fn finish(&mut self) -> Result<(), Error>;

    /// Raw-device ring stats, for sinks backed by one. `None` for the
    /// file-based sinks.
    fn raw_snapshot(&self) -> Option<RawStatusSnapshot> {
        None
    }
}

/// One JPEG file per frame (spec section 8 scenario 1), named
/// `<prefix><port>_<sec>_<usec:06>.jpeg`.
pub struct JpegFileSink {
    pub prefix: String,
}

impl FormatSink for JpegFileSink {
    fn write_packet(&mut self, packet: &Packet<'_>, ts: FrameTimestamp, port: usize) -> Result<(), Error> {
        let path = format!("{}{}_{}_{:06}.jpeg", self.prefix, port, ts.sec, ts.usec);
        let mut f = File::create(&path)?;
        for s in packet.slices() {
            f.write_all(s)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Sector-aligned continuous ring on a block device (spec section 4.3/4.4).
pub struct RawDeviceSink {
    pub align: AlignmentEngine,
    pub raw: RawDeviceBuffer,
    pub writer: WriterChannel,
}

impl RawDeviceSink {
    fn submit(&mut self, batch_blocks: u64, bytes: Vec<u8>) -> Result<(), Error> {
        let (lba, _wrapped) = self.raw.reserve(batch_blocks);
        self.writer.write(lba, bytes)?;
        self.raw.advance(batch_blocks);
        Ok(())
    }
}

impl FormatSink for RawDeviceSink {
    fn write_packet(&mut self, packet: &Packet<'_>, _ts: FrameTimestamp, _port: usize) -> Result<(), Error> {
        if let Some(batch) = self.align.submit(packet) {
            let blocks = batch.blocks() as u64;
            self.submit(blocks, batch.to_vec())?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        if let Some(batch) = self.align.flush() {
            let blocks = batch.blocks() as u64;
            self.submit(blocks, batch.to_vec())?;
        }
        Ok(())
    }

    fn raw_snapshot(&self) -> Option<RawStatusSnapshot> {
        let span = self.raw.lba_end - self.raw.lba_start;
        let percent_done = if span > 0 { 100.0 * (self.raw.lba_current - self.raw.lba_start) as f64 / span as f64 } else { 0.0 };
        Some(RawStatusSnapshot { overruns: self.raw.overruns, lba_current: self.raw.lba_current, percent_done })
    }
}

/// Ogg Media stream (spec section 4.6).
pub struct OgmFileSink {
    pub file: File,
    pub muxer: OgmMuxer,
    pub params: StreamHeaderParams,
    started: bool,
}

impl OgmFileSink {
    pub fn new(file: File, muxer: OgmMuxer, params: StreamHeaderParams) -> OgmFileSink {
        OgmFileSink { file, muxer, params, started: false }
    }
}

impl FormatSink for OgmFileSink {
    fn write_packet(&mut self, packet: &Packet<'_>, _ts: FrameTimestamp, _port: usize) -> Result<(), Error> {
        if !self.started {
            self.muxer.write_bos(&mut self.file, &self.params)?;
            self.muxer.write_comment(&mut self.file)?;
            self.started = true;
        }
        self.muxer.write_frame(&mut self.file, packet)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.muxer.write_eos(&mut self.file)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// QuickTime (.mov) file, video (and optionally audio) (spec section 4.5).
pub struct MovFileSink {
    pub file: File,
    pub template: Vec<mov::Node>,
    pub frame_lengths: Vec<u32>,
    pub width: u16,
    pub height: u16,
    pub timescale: u32,
    pub frame_duration: u32,
    pub frames_per_chunk: u32,
    pub data_start: u64,
    pub audio_channels: u16,
    pub audio_sample_rate: u32,
    pub audio_timescale: u32,
    pub audio_bytes_per_frame: u32,
    pub samples_to_chunk: SamplesToChunk,
}

/// Computes the header-region reservation per spec section 4.5's layout
/// formula.
pub fn data_start(max_frames: u32, frames_per_chunk: u32, audio_enabled: bool) -> u64 {
    let mut n = 0x300u64 + 16 + 4 * max_frames as u64 + 4 * (max_frames as u64 / frames_per_chunk.max(1) as u64);
    if audio_enabled {
        n += 4 * max_frames as u64 + 12 * 3;
    }
    n
}

impl MovFileSink {
    pub fn new(
        mut file: File,
        template: Vec<mov::Node>,
        max_frames: u32,
        frames_per_chunk: u32,
        width: u16,
        height: u16,
        timescale: u32,
        frame_duration: u32,
        audio_enabled: bool,
    ) -> Result<MovFileSink, Error> {
        let start = data_start(max_frames, frames_per_chunk, audio_enabled);
        file.set_len(start)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(MovFileSink {
            file,
            template,
            frame_lengths: Vec::new(),
            width,
            height,
            timescale,
            frame_duration,
            frames_per_chunk,
            data_start: start,
            audio_channels: 0,
            audio_sample_rate: 0,
            audio_timescale: 0,
            audio_bytes_per_frame: 0,
            samples_to_chunk: SamplesToChunk::default(),
        })
    }

    /// Appends one PCM chunk produced by the (externally driven, spec
    /// section 1 non-goal) audio subsystem.
    pub fn write_audio_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.write_all(data)?;
        self.frame_lengths.push((data.len() as u32) | 0x8000_0000);
        Ok(())
    }
}

impl FormatSink for MovFileSink {
    fn write_packet(&mut self, packet: &Packet<'_>, _ts: FrameTimestamp, _port: usize) -> Result<(), Error> {
        let mut total = 0u32;
        for s in packet.slices() {
            self.file.write_all(s)?;
            total += s.len() as u32;
        }
        self.frame_lengths.push(total);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let unix_time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
        let mut ctx = MovCtx {
            width: self.width,
            height: self.height,
            timescale: self.timescale,
            frame_duration: self.frame_duration,
            frames_per_chunk: self.frames_per_chunk,
            frame_lengths: &self.frame_lengths,
            data_start: self.data_start,
            unix_time,
            audio_channels: self.audio_channels,
            audio_sample_rate: self.audio_sample_rate,
            audio_timescale: self.audio_timescale,
            audio_bytes_per_frame: self.audio_bytes_per_frame,
            samples_to_chunk: self.samples_to_chunk,
            header_size: 0,
        };
        let header = mov::build_header(&self.template, &mut ctx)?;
        if header.len() as u64 > self.data_start {
            return Err(base::format_err_t!(
                FrameOther,
                "mov header grew to {} bytes, exceeding the {}-byte reservation",
                header.len(),
                self.data_start
            ));
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::start_writer;
    use tempdir::TempDir;

    #[test]
    fn raw_device_sink_reports_live_ring_position() {
        let dir = TempDir::new("camogm-sink").unwrap();
        let path = format!("{}/ring", dir.path().display());
        let file = File::create(&path).unwrap();
        let (writer, handle) = start_writer(crate::writer::FileDevice::new(file));
        let mut raw = RawDeviceBuffer::new(2048, 2048 + 32);
        raw.advance(12);
        let mut sink = RawDeviceSink { align: AlignmentEngine::new(), raw, writer };

        let snap = sink.raw_snapshot().unwrap();
        assert_eq!(snap.lba_current, 2060);
        assert_eq!(snap.overruns, 0);
        assert!((snap.percent_done - 37.5).abs() < 0.01);

        FormatSink::finish(&mut sink).unwrap();
        sink.writer.request_exit();
        handle.join().unwrap();
    }

    #[test]
    fn jpeg_file_sink_names_files_from_timestamp() {
        let dir = TempDir::new("camogm-sink").unwrap();
        let prefix = format!("{}/f_", dir.path().display());
        let mut sink = JpegFileSink { prefix: prefix.clone() };
        let header = [0xffu8, 0xd8];
        let data = [0xaau8; 4];
        let packet = Packet::assemble(false, &header, None, &data, None);
        sink.write_packet(&packet, FrameTimestamp { sec: 1_700_000_000, usec: 123_456 }, 0).unwrap();
        let expected = format!("{}0_1700000000_123456.jpeg", prefix);
        let contents = std::fs::read(&expected).unwrap();
        assert_eq!(&contents[0..2], &[0xff, 0xd8]);
    }

    #[test]
    fn mov_data_start_matches_formula_without_audio() {
        let got = data_start(100, 10, false);
        let want = 0x300u64 + 16 + 4 * 100 + 4 * (100 / 10);
        assert_eq!(got, want);
    }

    #[test]
    fn mov_data_start_includes_audio_reservation() {
        let got = data_start(100, 10, true);
        let want = 0x300u64 + 16 + 4 * 100 + 4 * (100 / 10) + 4 * 100 + 12 * 3;
        assert_eq!(got, want);
    }
}
