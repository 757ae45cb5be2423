//! The `camogmd` daemon: owns the per-port devices, the pending session
//! configuration, and the command-pipe dispatcher (spec section 6). Command
//! parsing is intentionally trivial glue (Non-goal: no parsing framework),
//! grounded on `camogm.c`'s own `key[=value]` dispatch in `parse_cmd`.

use base::{Error, ErrorKind};
use engine::drain::{DrainEngine, Devices};
use engine::ring::device::{DeviceRing, FileExifDevice, FileJpegHeaderDevice};
use engine::session::{Format, NUM_PORTS, ProgState, SessionConfig};
use engine::sink::{FormatSink, JpegFileSink, MovFileSink, OgmFileSink, RawDeviceSink, RawStatusSnapshot};
use engine::align::AlignmentEngine;
use engine::ogm::{OgmMuxer, StreamHeaderParams};
use engine::rawdev::{RawDeviceBuffer, LBA_SIZE};
use engine::statefile::DiskState;
use engine::writer::{start_writer, FileDevice, WriterChannel};
use std::convert::TryInto;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use crate::cli::DaemonOpt;
use crate::templates::DEFAULT_MOV_TEMPLATE;

const COMMAND_LOOP_DELAY: Duration = Duration::from_millis(500);

/// The three per-port device handles the daemon opens at startup and
/// borrows from for the rest of its life. A separate type from
/// [`Devices`] because the latter only borrows trait objects; this one
/// owns the concrete devices those references point at.
pub struct DaemonDevices {
    rings: [DeviceRing; NUM_PORTS],
    headers: [FileJpegHeaderDevice; NUM_PORTS],
    exifs: [FileExifDevice; NUM_PORTS],
}

impl DaemonDevices {
    pub fn open(opt: &DaemonOpt) -> Result<DaemonDevices, Error> {
        let ring_path = |i: usize| opt.circbuf.get(i).cloned().unwrap_or_else(|| engine::ring::CIRCBUF_DEVICE_PATHS[i].to_string());
        let head_path = |i: usize| opt.jpeghead.get(i).cloned().unwrap_or_else(|| engine::ring::JPEGHEAD_DEVICE_PATHS[i].to_string());
        let exif_path = |i: usize| opt.exif.get(i).cloned().unwrap_or_else(|| engine::ring::EXIF_DEVICE_PATHS[i].to_string());

        let mut rings = Vec::with_capacity(NUM_PORTS);
        let mut headers = Vec::with_capacity(NUM_PORTS);
        let mut exifs = Vec::with_capacity(NUM_PORTS);
        for i in 0..NUM_PORTS {
            rings.push(DeviceRing::open(&ring_path(i))?);
            headers.push(FileJpegHeaderDevice::new(head_path(i)));
            exifs.push(FileExifDevice::new(exif_path(i)));
        }
        Ok(DaemonDevices {
            rings: rings.try_into().unwrap_or_else(|_| panic!("NUM_PORTS rings expected")),
            headers: headers.try_into().unwrap_or_else(|_| panic!("NUM_PORTS headers expected")),
            exifs: exifs.try_into().unwrap_or_else(|_| panic!("NUM_PORTS exifs expected")),
        })
    }

    fn as_devices(&self) -> Devices<'_> {
        Devices {
            rings: [&self.rings[0], &self.rings[1], &self.rings[2], &self.rings[3]],
            headers: [&self.headers[0], &self.headers[1], &self.headers[2], &self.headers[3]],
            exifs: [&self.exifs[0], &self.exifs[1], &self.exifs[2], &self.exifs[3]],
        }
    }
}

/// Everything the command dispatcher mutates between `stop` and the next
/// `start` (spec section 3, "recording session"). Lives independently of
/// [`DrainEngine`]'s `Session` so config edits while stopped don't require
/// an engine instance.
#[derive(Clone, Default)]
struct PendingConfig {
    cfg: SessionConfig,
    state_file: Option<String>,
}

pub struct Daemon<'d> {
    devices: &'d DaemonDevices,
    pending: PendingConfig,
    engine: Option<DrainEngine<'d>>,
    writer: Option<(WriterChannel, thread::JoinHandle<()>)>,
    raw_geometry: Option<(u64, u64)>, // (lba_start, lba_end) of the currently open rawdev_path
}

impl<'d> Daemon<'d> {
    pub fn new(devices: &'d DaemonDevices, state_file: String) -> Daemon<'d> {
        let mut pending = PendingConfig::default();
        pending.cfg.active_ports = 0b0001;
        pending.state_file = Some(state_file);
        Daemon { devices, pending, engine: None, writer: None, raw_geometry: None }
    }

    pub fn state(&self) -> ProgState {
        self.engine.as_ref().map(|e| e.session.state()).unwrap_or(ProgState::Stopped)
    }

    /// Runs the blocking command loop, reading `key[=value]` commands
    /// separated by `;` or `\n` from `pipe` (spec section 6). Returns once
    /// an `exit` command is processed.
    pub fn run_command_loop(&mut self, pipe_path: &str) -> Result<(), Error> {
        use std::io::BufRead;
        ensure_fifo(pipe_path)?;
        info!("command pipe {} open for reading", pipe_path);
        loop {
            let f = File::open(pipe_path)?;
            let reader = std::io::BufReader::new(f);
            for line in reader.lines() {
                let line = line?;
                for cmd in split_commands(&line) {
                    match self.handle(cmd) {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(e) => warn!("command {:?} failed: {}", cmd, e),
                    }
                }
            }
            // A FIFO reader sees EOF whenever every writer closes; reopening
            // is what lets the daemon accept the next writer (mirrors
            // `camogm.c`'s reopen-on-EOF loop around `fopen(pipe_name, "r")`).
            thread::sleep(COMMAND_LOOP_DELAY);
        }
    }

    /// Dispatches one command. Returns `Ok(true)` on `exit`.
    fn handle(&mut self, cmd: &str) -> Result<bool, Error> {
        let (key, value) = match cmd.find('=') {
            Some(i) => (&cmd[..i], Some(&cmd[i + 1..])),
            None => (cmd, None),
        };
        match key {
            "start" => self.start()?,
            "stop" => self.stop()?,
            "reset" => self.reset()?,
            "exit" => {
                self.stop().ok();
                return Ok(true);
            }
            "format" => self.pending.cfg.set_format = parse_format(value.unwrap_or("none"))?,
            "prefix" => self.pending.cfg.path_prefix = value.map(str::to_string),
            "rawdev_path" => self.pending.cfg.rawdev_path = value.map(str::to_string),
            "duration" => self.pending.cfg.segment_duration_s = parse_num(value)?,
            "length" => self.pending.cfg.segment_length_bytes = parse_num(value)?,
            "max_frames" => self.pending.cfg.max_frames = parse_num(value)?,
            "frames_per_chunk" => self.pending.cfg.frames_per_chunk = parse_num(value)?,
            "exif" => self.pending.cfg.exif_enabled = parse_bool(value)?,
            "greedy" => self.pending.cfg.greedy = parse_bool(value)?,
            "ignore_fps" => self.pending.cfg.ignore_fps = parse_bool(value)?,
            "timescale" => self.pending.cfg.timescale = parse_f64(value)? as u32,
            "frameskip" => self.pending.cfg.frames_skip = parse_num::<i64>(value)?,
            "timelapse" => self.pending.cfg.frames_skip = -parse_num::<i64>(value)?,
            "port_enable" => self.pending.cfg.active_ports |= 1 << parse_num::<u32>(value)?,
            "port_disable" => self.pending.cfg.active_ports &= !(1 << parse_num::<u32>(value)?),
            "start_after_timestamp" => self.pending.cfg.start_after_timestamp = parse_f64(value)?,
            "reader_stop" => debug!("reader_stop accepted; the reader runs as a separate process in this build"),
            "status" => self.write_status(value, false)?,
            "xstatus" => self.write_status(value, true)?,
            other => base::bail_t!(InvalidArgument, "unrecognised command {:?}", other),
        }
        Ok(false)
    }

    /// Builds the sink for the pending configuration and starts the drain
    /// engine (spec section 4.1's `start`).
    fn start(&mut self) -> Result<(), Error> {
        if self.engine.is_some() {
            self.stop()?;
        }
        let mut cfg = self.pending.cfg.clone();
        cfg.format = cfg.set_format; // `format` takes effect only at start.
        let sink = self.build_sink(&cfg)?;
        let mut engine = DrainEngine::new(cfg, self.devices.as_devices());
        engine.start(sink)?;
        self.engine = Some(engine);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        let mut raw_snapshot = None;
        if let Some(mut engine) = self.engine.take() {
            raw_snapshot = engine.stop()?;
        }
        if let Some((writer, handle)) = self.writer.take() {
            writer.request_exit();
            let _ = handle.join();
        }
        if let (Some(state_file), Some((lba_start, lba_end))) = (&self.pending.state_file, self.raw_geometry) {
            if let Some(rawdev_path) = &self.pending.cfg.rawdev_path {
                // `raw_snapshot` is the sink's own `RawDeviceBuffer` position
                // at `finish()`, captured before the sink was dropped; when
                // there was no live session (e.g. `stop` with nothing
                // started) it falls back to the ring start.
                let lba_current = raw_snapshot.map(|s| s.lba_current).unwrap_or(lba_start);
                let state = DiskState { device: rawdev_path.clone(), lba_start, lba_current, lba_end };
                let _ = state.write_to(std::path::Path::new(state_file));
            }
        }
        Ok(())
    }

    /// Resets per-port pointers and counters without a full stop/start
    /// cycle (`SPEC_FULL.md` section 11's supplemented `reset` command).
    fn reset(&mut self) -> Result<(), Error> {
        if let Some(engine) = &mut self.engine {
            for port in engine.session.ports.iter_mut() {
                port.invalidate();
                port.buf_overruns = 0;
                port.buf_min = -1;
            }
            engine.session.last_error_code = 0;
        }
        Ok(())
    }

    fn build_sink(&mut self, cfg: &SessionConfig) -> Result<Box<dyn FormatSink>, Error> {
        if let Some(path) = &cfg.rawdev_path {
            return self.build_raw_sink(path);
        }
        let prefix = cfg.path_prefix.clone().unwrap_or_default();
        match cfg.format {
            Format::Jpeg => Ok(Box::new(JpegFileSink { prefix })),
            Format::Ogm => {
                let file = File::create(format!("{}.ogm", prefix))?;
                let muxer = OgmMuxer::new(1, cfg.timescale);
                let params = StreamHeaderParams { width: 0, height: 0, frame_period_usec: 0, timescale: cfg.timescale };
                Ok(Box::new(OgmFileSink::new(file, muxer, params)))
            }
            Format::Mov => {
                let file = File::create(format!("{}.mov", prefix))?;
                let template = engine::mov::parse_template(DEFAULT_MOV_TEMPLATE)?;
                let sink = MovFileSink::new(
                    file,
                    template,
                    cfg.max_frames.max(1),
                    cfg.frames_per_chunk.max(1),
                    0,
                    0,
                    cfg.timescale,
                    cfg.timescale / 25,
                    false,
                )?;
                Ok(Box::new(sink))
            }
            Format::None => base::bail_t!(InvalidArgument, "format must be set before start"),
        }
    }

    fn build_raw_sink(&mut self, path: &str) -> Result<Box<dyn FormatSink>, Error> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let size_bytes = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let lba_start = 0u64;
        let lba_end = size_bytes / LBA_SIZE;
        self.raw_geometry = Some((lba_start, lba_end));

        let resumed = self
            .pending
            .state_file
            .as_deref()
            .and_then(|p| DiskState::resume_if_matching(std::path::Path::new(p), path, lba_start, lba_end));
        let mut raw = RawDeviceBuffer::new(lba_start, lba_end);
        if let Some(lba_current) = resumed {
            raw.lba_current = lba_current;
        }

        let (writer, handle) = start_writer(FileDevice::new(file));
        self.writer = Some((writer.clone(), handle));
        Ok(Box::new(RawDeviceSink { align: AlignmentEngine::new(), raw, writer }))
    }

    fn write_status(&mut self, path: Option<&str>, xml: bool) -> Result<(), Error> {
        let text = if xml { self.render_xstatus() } else { self.render_status() };
        match path {
            None | Some("stdout") => print!("{}", text),
            Some("stderr") => eprint!("{}", text),
            Some(p) => {
                let mut f = File::create(p)?;
                f.write_all(text.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Plain-text status (spec section 7's field set, supplemented per
    /// `SPEC_FULL.md` section 11). Overrun counters and `last_error_code`
    /// reset to zero on read, matching `camogm_status`'s behavior.
    fn render_status(&mut self) -> String {
        let fields = self.collect_status_fields();
        let mut out = String::new();
        let _ = writeln!(out, "state={}", fields.state);
        let _ = writeln!(out, "format={}", fields.format);
        let _ = writeln!(out, "last_error_code={}", fields.last_error_code);
        let _ = writeln!(out, "prefix={}", fields.prefix);
        let _ = writeln!(out, "rawdev_path={}", fields.rawdev_path);
        let _ = writeln!(out, "max_frames={}", fields.max_frames);
        let _ = writeln!(out, "frames_per_chunk={}", fields.frames_per_chunk);
        let _ = writeln!(out, "timescale={}", fields.timescale);
        for p in &fields.ports {
            let _ = writeln!(
                out,
                "port{}: active={} buf_overruns={} buf_min={} frame_period_usec={}",
                p.index, p.active, p.buf_overruns, p.buf_min, p.frame_period_usec
            );
        }
        if let Some(raw) = &fields.raw {
            let _ = writeln!(out, "raw_overruns={} raw_lba_current={} raw_percent_done={:.2}", raw.overruns, raw.lba_current, raw.percent_done);
        }
        out
    }

    /// XML status (`xstatus`), same field set as [`Daemon::render_status`]
    /// in the `<camogm_state>` shape `camogm_status()` emits.
    fn render_xstatus(&mut self) -> String {
        let fields = self.collect_status_fields();
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\"?>\n<camogm_state>\n");
        let _ = writeln!(out, "  <state>\"{}\"</state>", fields.state);
        let _ = writeln!(out, "  <format>\"{}\"</format>", fields.format);
        let _ = writeln!(out, "  <last_error_code>{}</last_error_code>", fields.last_error_code);
        let _ = writeln!(out, "  <prefix>\"{}\"</prefix>", fields.prefix);
        let _ = writeln!(out, "  <max_frames>{}</max_frames>", fields.max_frames);
        let _ = writeln!(out, "  <frames_per_chunk>{}</frames_per_chunk>", fields.frames_per_chunk);
        let _ = writeln!(out, "  <timescale>{}</timescale>", fields.timescale);
        for p in &fields.ports {
            let _ = writeln!(out, "  <port index=\"{}\">", p.index);
            let _ = writeln!(out, "    <active>\"{}\"</active>", p.active);
            let _ = writeln!(out, "    <buffer_overruns>{}</buffer_overruns>", p.buf_overruns);
            let _ = writeln!(out, "    <buffer_minimal>{}</buffer_minimal>", p.buf_min);
            let _ = writeln!(out, "    <frame_period>{}</frame_period>", p.frame_period_usec);
            out.push_str("  </port>\n");
        }
        if let Some(raw) = &fields.raw {
            let _ = writeln!(out, "  <buffer_overruns_raw>{}</buffer_overruns_raw>", raw.overruns);
            let _ = writeln!(out, "  <circbuf_rp>{}</circbuf_rp>", raw.lba_current);
            let _ = writeln!(out, "  <percent_done>{:.2}</percent_done>", raw.percent_done);
        }
        out.push_str("</camogm_state>\n");
        out
    }

    /// Gathers the status field set and applies the reset-on-read
    /// semantics spec section 7 calls for (`buf_overruns`/`last_error_code`
    /// zeroed once reported).
    fn collect_status_fields(&mut self) -> StatusFields {
        let cfg = self.pending.cfg.clone();
        let (state, last_error_code, ports) = match &mut self.engine {
            Some(engine) => {
                let state = engine.session.state();
                let code = engine.session.last_error_code;
                engine.session.last_error_code = 0;
                let ports = engine
                    .session
                    .ports
                    .iter_mut()
                    .enumerate()
                    .map(|(index, p)| {
                        let snap = PortStatus {
                            index,
                            active: p.active,
                            buf_overruns: p.buf_overruns,
                            buf_min: p.buf_min,
                            frame_period_usec: p.frame_period_usec,
                        };
                        p.buf_overruns = 0;
                        p.buf_min = -1;
                        snap
                    })
                    .collect();
                (state, code, ports)
            }
            None => (ProgState::Stopped, 0, Vec::new()),
        };
        StatusFields {
            state: format!("{:?}", state).to_lowercase(),
            format: format!("{:?}", cfg.format).to_lowercase(),
            last_error_code,
            prefix: cfg.path_prefix.clone().unwrap_or_default(),
            rawdev_path: cfg.rawdev_path.clone().unwrap_or_default(),
            max_frames: cfg.max_frames,
            frames_per_chunk: cfg.frames_per_chunk,
            timescale: cfg.timescale,
            ports,
            raw: self
                .engine
                .as_ref()
                .and_then(|e| e.raw_snapshot())
                .or_else(|| self.raw_geometry.map(|(start, _)| RawStatusSnapshot { overruns: 0, lba_current: start, percent_done: 0.0 })),
        }
    }
}

struct PortStatus {
    index: usize,
    active: bool,
    buf_overruns: u64,
    buf_min: i64,
    frame_period_usec: i64,
}

struct StatusFields {
    state: String,
    format: String,
    last_error_code: i32,
    prefix: String,
    rawdev_path: String,
    max_frames: u32,
    frames_per_chunk: u32,
    timescale: u32,
    ports: Vec<PortStatus>,
    raw: Option<RawStatusSnapshot>,
}

fn ensure_fifo(path: &str) -> Result<(), Error> {
    use std::ffi::CString;
    if std::path::Path::new(path).exists() {
        return Ok(());
    }
    let c_path = CString::new(path).map_err(|_| base::format_err_t!(InvalidArgument, "pipe path contains a NUL byte"))?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if ret != 0 && std::io::Error::last_os_error().kind() != std::io::ErrorKind::AlreadyExists {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn split_commands(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c| c == ';' || c == '\n').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_format(s: &str) -> Result<Format, Error> {
    Ok(match s {
        "none" => Format::None,
        "jpeg" => Format::Jpeg,
        "ogm" => Format::Ogm,
        "mov" => Format::Mov,
        other => base::bail_t!(InvalidArgument, "unknown format {:?}", other),
    })
}

fn parse_num<T: std::str::FromStr>(value: Option<&str>) -> Result<T, Error> {
    value
        .ok_or_else(|| base::format_err_t!(InvalidArgument, "command requires a value"))?
        .parse()
        .map_err(|_| base::format_err_t!(InvalidArgument, "bad numeric value"))
}

fn parse_f64(value: Option<&str>) -> Result<f64, Error> {
    parse_num(value)
}

fn parse_bool(value: Option<&str>) -> Result<bool, Error> {
    match value {
        Some("0") => Ok(false),
        Some("1") => Ok(true),
        _ => base::bail_t!(InvalidArgument, "boolean command requires 0 or 1"),
    }
}
