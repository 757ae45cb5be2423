//! Frame-drain state machine & port selector (spec section 4.1). Grounded
//! on `camogm.c`'s main loop (`sendImageFrame`/`select_port`): `start`
//! resyncs every active port's pointer, `drain_tick` advances exactly one
//! port by one frame, `stop` finalises the active sink.

use crate::metadata::{FrameParams, FrameTimestamp};
use crate::packet::Packet;
use crate::ring::{CaptureRing, ExifDevice, JpegHeaderDevice, SeekOutcome};
use crate::session::{NUM_PORTS, Port, ProgState, Session, SessionConfig};
use crate::sink::FormatSink;
use base::{Error, ErrorKind};
use std::time::Duration;

const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-port device handles the drain engine reads from. Borrowed for the
/// engine's whole lifetime; owned by whatever wires up real devices or
/// [`crate::ring::sim::SimRing`] fakes.
pub struct Devices<'d> {
    pub rings: [&'d dyn CaptureRing; NUM_PORTS],
    pub headers: [&'d dyn JpegHeaderDevice; NUM_PORTS],
    pub exifs: [&'d dyn ExifDevice; NUM_PORTS],
}

/// Chooses which active port to drain next: the one with the least free
/// space remaining in its capture ring, ties broken by lowest index.
/// Ported 1:1 from `camogm.c`'s `select_port` — a strict `<` comparison,
/// so loop order (not a stable-sort) breaks ties.
pub fn select_port(ports: &[Port; NUM_PORTS], active_mask: u8, rings: &[&dyn CaptureRing; NUM_PORTS]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for i in 0..NUM_PORTS {
        if active_mask & (1 << i) == 0 {
            continue;
        }
        let p = &ports[i];
        if p.read_pointer < 0 {
            continue;
        }
        let free = rings[i].free_bytes(p.read_pointer as usize);
        match best {
            None => best = Some((i, free)),
            Some((_, best_free)) if free < best_free => best = Some((i, free)),
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}

/// Outcome of one `drain_tick`, distinguishing an emitted frame from a
/// frame silently dropped by the skip/time-lapse policy.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Wrote { port: usize },
    Skipped { port: usize },
}

pub struct DrainEngine<'d> {
    pub session: Session,
    devices: Devices<'d>,
    sink: Option<Box<dyn FormatSink>>,
}

impl<'d> DrainEngine<'d> {
    pub fn new(cfg: SessionConfig, devices: Devices<'d>) -> DrainEngine<'d> {
        DrainEngine { session: Session::new(cfg), devices, sink: None }
    }

    /// Live raw-device ring stats from the active sink, when it's a
    /// raw-device one (spec section 7's `raw_*` status fields).
    pub fn raw_snapshot(&self) -> Option<crate::sink::RawStatusSnapshot> {
        self.sink.as_ref().and_then(|s| s.raw_snapshot())
    }

    /// Resyncs every active port's pointer and primes `frame_period`,
    /// per spec section 4.1's `start` contract.
    pub fn start(&mut self, sink: Box<dyn FormatSink>) -> Result<(), Error> {
        self.session.set_state(ProgState::Starting);
        let greedy = self.session.cfg.greedy;
        let ignore_fps = self.session.cfg.ignore_fps;
        let active: Vec<usize> = self.session.active_port_indices().collect();
        for &i in &active {
            let ring = self.devices.rings[i];
            let outcome = if greedy { ring.seek_second_last() } else { ring.seek_last() };
            let pointer = match outcome {
                SeekOutcome::Ready(p) => p,
                SeekOutcome::NotReady => return Err(ErrorKind::FrameNotReady.into()),
                SeekOutcome::Invalid => return Err(ErrorKind::FrameBroken.into()),
            };

            let prev_pointer = if !ignore_fps {
                match ring.seek_prev(pointer) {
                    SeekOutcome::Ready(p) => Some(p),
                    _ => None,
                }
            } else {
                None
            };

            let this_params = self.read_frame_params(i, pointer)?;
            let frame_period_usec = match prev_pointer {
                Some(pp) => {
                    let prev_params = self.read_frame_params(i, pp)?;
                    let circ = ring.circ_size();
                    let prev_ts = self.read_timestamp(i, pp, &prev_params, circ);
                    let this_ts = self.read_timestamp(i, pointer, &this_params, circ);
                    let delta_sec = this_ts.sec as i64 - prev_ts.sec as i64;
                    let delta_usec = this_ts.usec as i64 - prev_ts.usec as i64;
                    delta_sec * 1_000_000 + delta_usec
                }
                None => 0,
            };

            let header = self.devices.headers[i].read_header(this_params.meta_index)?;
            let port = &mut self.session.ports[i];
            port.read_pointer = pointer as i64;
            port.circ_size = ring.circ_size();
            port.this_frame_params = Some(this_params);
            port.frame_params = Some(this_params);
            port.jpeg_header_bytes = header;
            port.frame_period_usec = frame_period_usec;
            ring.publish(pointer)?;
        }
        self.sink = Some(sink);
        self.session.set_state(ProgState::Running);
        Ok(())
    }

    fn read_frame_params(&self, port: usize, pointer: usize) -> Result<FrameParams, Error> {
        let ring = self.devices.rings[port];
        let circ = ring.circ_size();
        let meta_offset = (pointer + circ - crate::metadata::RECORD_LEN) % circ;
        let buf = ring.read_at(meta_offset, crate::metadata::RECORD_LEN);
        FrameParams::parse(&buf)
    }

    fn read_timestamp(&self, port: usize, pointer: usize, params: &FrameParams, circ: usize) -> FrameTimestamp {
        let ring = self.devices.rings[port];
        let meta_offset = (pointer + circ - crate::metadata::RECORD_LEN) % circ;
        let ts_offset = params.timestamp_offset(meta_offset, circ);
        let buf = ring.read_at(ts_offset, 8);
        FrameTimestamp::parse(&buf)
    }

    /// Advances exactly one port by one frame, applying the skip/pacing
    /// policy and segment-rotation checks from spec section 4.1.
    pub fn drain_tick(&mut self) -> Result<TickOutcome, Error> {
        let active_mask = self.session.cfg.active_ports;
        let rings = self.devices.rings;
        let port = select_port(&self.session.ports, active_mask, &rings).ok_or(ErrorKind::FrameNotReady)?;

        let ring = self.devices.rings[port];
        let pointer = self.session.ports[port].read_pointer;
        if pointer < 0 || !ring.is_valid(pointer as isize) {
            self.session.ports[port].invalidate();
            return Err(ErrorKind::FrameInvalid.into());
        }

        let outcome = ring.wait_next(pointer as usize, WAIT_TIMEOUT);
        let next_pointer = match outcome {
            SeekOutcome::Ready(p) => p,
            SeekOutcome::NotReady => return Err(ErrorKind::FrameNotReady.into()),
            SeekOutcome::Invalid => {
                self.session.ports[port].invalidate();
                return Err(ErrorKind::FrameBroken.into());
            }
        };

        let circ = ring.circ_size();
        let params = self.read_frame_params(port, next_pointer).map_err(|_| {
            self.session.ports[port].invalidate();
            Error::from(ErrorKind::FrameBroken)
        })?;
        let ts = self.read_timestamp(port, next_pointer, &params, circ);

        if !self.session.cfg.ignore_fps {
            match self.session.baseline_wh {
                None => self.session.baseline_wh = Some((params.width() as u32, params.height() as u32)),
                Some(baseline) if baseline != (params.width() as u32, params.height() as u32) => {
                    return Err(ErrorKind::FrameChanged.into());
                }
                _ => {}
            }
        }

        if self.session.cfg.start_after_timestamp > 0.0 {
            let current = ts.sec as f64 + ts.usec as f64 / 1_000_000.0;
            if current < self.session.cfg.start_after_timestamp {
                return Err(ErrorKind::TooEarly.into());
            }
        }

        self.session.ports[port].read_pointer = next_pointer as i64;
        self.session.ports[port].this_frame_params = Some(params);

        if self.should_skip(port, &ts) {
            return Ok(TickOutcome::Skipped { port });
        }

        self.check_rotation_triggers(ts.sec)?;

        let exif = if self.session.cfg.exif_enabled {
            Some(self.devices.exifs[port].read_exif(params.meta_index)?)
        } else {
            None
        };
        let header = self.session.ports[port].jpeg_header_bytes.clone();
        let (data0, data1) = ring.slice_wrapped(next_pointer, params.frame_length as usize);
        let for_ogm = matches!(self.session.cfg.format, crate::session::Format::Ogm);
        let packet = Packet::assemble(for_ogm, &header, exif.as_deref(), data0, if data1.is_empty() { None } else { Some(data1) });

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| base::format_err_t!(Internal, "drain_tick called with no active sink"))?;
        sink.write_packet(&packet, ts, port).map_err(|e| {
            self.session.last_error_code = -1;
            e
        })?;

        if self.session.first_frame_sec.is_none() {
            self.session.first_frame_sec = Some(ts.sec);
        }
        self.session.segment_bytes += packet.total_len() as u64;
        self.session.frame_lengths.push(packet.total_len() as u32);
        self.session.frame_index += 1;

        ring.publish(next_pointer)?;
        Ok(TickOutcome::Wrote { port })
    }

    /// Applies `frames_skip` per spec section 4.1. Returns `true` when
    /// this frame should be dropped rather than emitted.
    fn should_skip(&mut self, port: usize, ts: &FrameTimestamp) -> bool {
        let frames_skip = self.session.cfg.frames_skip;
        let p = &mut self.session.ports[port];
        if frames_skip > 0 {
            if p.skip_left > 0 {
                p.skip_left -= 1;
                true
            } else {
                p.skip_left = frames_skip;
                false
            }
        } else if frames_skip < 0 {
            let next_keep = p.skip_left;
            if (ts.sec as i64) < next_keep {
                true
            } else {
                p.skip_left = ts.sec as i64 + (-frames_skip);
                false
            }
        } else {
            false
        }
    }

    fn check_rotation_triggers(&self, current_ts_sec: u32) -> Result<(), Error> {
        let cfg = &self.session.cfg;
        if cfg.format != cfg.set_format {
            return Err(ErrorKind::FrameChanged.into());
        }
        if cfg.max_frames > 0 && self.session.frame_index >= cfg.max_frames {
            return Err(ErrorKind::FrameNextFile.into());
        }
        if cfg.segment_length_bytes > 0 && self.session.segment_bytes >= cfg.segment_length_bytes {
            return Err(ErrorKind::FrameNextFile.into());
        }
        if cfg.segment_duration_s > 0 {
            if let Some(first_sec) = self.session.first_frame_sec {
                if current_ts_sec.saturating_sub(first_sec) >= cfg.segment_duration_s {
                    return Err(ErrorKind::FrameNextFile.into());
                }
            }
        }
        Ok(())
    }

    /// Finalises the active sink and returns to `Stopped` (spec section
    /// 4.1's `stop` contract). Returns the sink's final raw-device ring
    /// position, if it had one, so the caller can persist it before the
    /// sink (and the `RawDeviceBuffer` it owns) is dropped.
    pub fn stop(&mut self) -> Result<Option<crate::sink::RawStatusSnapshot>, Error> {
        let mut raw = None;
        if let Some(mut sink) = self.sink.take() {
            sink.finish()?;
            raw = sink.raw_snapshot();
        }
        for port in self.session.ports.iter_mut() {
            port.invalidate();
        }
        self.session.first_frame_sec = None;
        self.session.segment_bytes = 0;
        self.session.frame_lengths.clear();
        self.session.frame_index = 0;
        self.session.set_state(ProgState::Stopped);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::sim::SimRing;
    use crate::sink::JpegFileSink;
    use tempdir::TempDir;

    fn meta_record(frame_length: u32, meta_index: u32) -> [u8; 32] {
        use byteorder::{ByteOrder, LittleEndian};
        let mut buf = [0u8; 32];
        LittleEndian::write_u32(&mut buf[0..4], frame_length);
        LittleEndian::write_u16(&mut buf[4..6], 640);
        LittleEndian::write_u16(&mut buf[6..8], 480);
        LittleEndian::write_u32(&mut buf[24..28], meta_index);
        LittleEndian::write_u16(&mut buf[28..30], crate::metadata::SIGNATURE);
        buf
    }

    struct NullHeaderDevice;
    impl JpegHeaderDevice for NullHeaderDevice {
        fn read_header(&self, _meta_index: u32) -> Result<Vec<u8>, Error> {
            Ok(vec![0xff, 0xd8])
        }
    }

    struct NullExifDevice;
    impl ExifDevice for NullExifDevice {
        fn read_exif(&self, _meta_index: u32) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn select_port_picks_lowest_free_space_breaking_ties_by_index() {
        let ports: [Port; NUM_PORTS] = Default::default();
        let mut ports = ports;
        for p in ports.iter_mut() {
            p.read_pointer = 0;
        }
        struct FakeRing(i64);
        impl CaptureRing for FakeRing {
            fn circ_size(&self) -> usize {
                1 << 16
            }
            fn read_at(&self, _o: usize, len: usize) -> Vec<u8> {
                vec![0u8; len]
            }
            fn slice(&self, _o: usize, _l: usize) -> Option<&[u8]> {
                None
            }
            fn slice_wrapped(&self, _o: usize, _l: usize) -> (&[u8], &[u8]) {
                (&[], &[])
            }
            fn is_valid(&self, p: isize) -> bool {
                p >= 0
            }
            fn is_ready(&self, _p: usize) -> bool {
                true
            }
            fn seek_last(&self) -> SeekOutcome {
                SeekOutcome::Ready(0)
            }
            fn seek_second_last(&self) -> SeekOutcome {
                SeekOutcome::Ready(0)
            }
            fn seek_prev(&self, _p: usize) -> SeekOutcome {
                SeekOutcome::Invalid
            }
            fn seek_next(&self, _p: usize) -> SeekOutcome {
                SeekOutcome::NotReady
            }
            fn wait_next(&self, _p: usize, _t: Duration) -> SeekOutcome {
                SeekOutcome::NotReady
            }
            fn free_bytes(&self, _p: usize) -> i64 {
                self.0
            }
            fn used_bytes(&self, _p: usize) -> i64 {
                0
            }
            fn publish(&self, _p: usize) -> Result<(), Error> {
                Ok(())
            }
            fn seek_to_write_head(&self) -> usize {
                0
            }
        }
        let r0 = FakeRing(500);
        let r1 = FakeRing(100);
        let r2 = FakeRing(100);
        let r3 = FakeRing(900);
        let rings: [&dyn CaptureRing; NUM_PORTS] = [&r0, &r1, &r2, &r3];
        let chosen = select_port(&ports, 0b1111, &rings).unwrap();
        assert_eq!(chosen, 1, "ports 1 and 2 tie on free_bytes; lowest index wins");
    }

    #[test]
    fn jpeg_session_writes_one_file_per_frame() {
        let ring = SimRing::new(1 << 20);
        ring.push(&meta_record(64, 0), &vec![0xabu8; 64]);
        ring.push(&meta_record(64, 1), &vec![0xcdu8; 64]);

        let headers = NullHeaderDevice;
        let exifs = NullExifDevice;
        let rings: [&dyn CaptureRing; NUM_PORTS] = [&ring, &ring, &ring, &ring];
        let header_devs: [&dyn JpegHeaderDevice; NUM_PORTS] = [&headers, &headers, &headers, &headers];
        let exif_devs: [&dyn ExifDevice; NUM_PORTS] = [&exifs, &exifs, &exifs, &exifs];
        let devices = Devices { rings, headers: header_devs, exifs: exif_devs };

        let mut cfg = SessionConfig::default();
        cfg.active_ports = 0b0001;
        cfg.ignore_fps = true;
        let mut engine = DrainEngine::new(cfg, devices);

        let dir = TempDir::new("camogm-drain").unwrap();
        let prefix = format!("{}/f_", dir.path().display());
        engine.start(Box::new(JpegFileSink { prefix })).unwrap();
        assert_eq!(engine.session.state(), ProgState::Running);
        engine.stop().unwrap();
        assert_eq!(engine.session.state(), ProgState::Stopped);
    }
}
