//! Per-port and per-session state (spec section 3, "Data model").
//!
//! The C original keeps this as one file-scope `camogm_state` indexed by
//! parallel per-port arrays. Per spec section 9's "Global state ->
//! session-scoped struct" and "Per-port data as arrays-of-SoA" notes, we
//! group per-port fields into [`Port`] and hold `[Port; NUM_PORTS]`
//! inside a [`Session`] value that the daemon binary's command dispatcher
//! owns outright.

use crate::metadata::FrameParams;
use parking_lot::Mutex;

pub const NUM_PORTS: usize = 4;

/// Output container format (spec section 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    None,
    Ogm,
    Jpeg,
    Mov,
}

/// `prog_state` (spec section 3 and section 4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgState {
    Stopped,
    Starting,
    Running,
    Reading,
    Cancel,
}

/// One sensor port's recording-session state.
pub struct Port {
    pub active: bool,
    /// `-1` means invalid/must resync.
    pub read_pointer: i64,
    pub circ_size: usize,
    pub frame_params: Option<FrameParams>,
    pub this_frame_params: Option<FrameParams>,
    pub jpeg_header_bytes: Vec<u8>,
    pub buf_overruns: u64,
    pub buf_min: i64,
    pub frame_period_usec: i64,
    /// Frames-to-skip countdown (`frames_skip > 0`) or the next
    /// wall-clock second at/after which a frame should be kept
    /// (`frames_skip < 0`); unused when `frames_skip == 0`.
    pub skip_left: i64,
}

impl Default for Port {
    fn default() -> Port {
        Port {
            active: false,
            read_pointer: -1,
            circ_size: 0,
            frame_params: None,
            this_frame_params: None,
            jpeg_header_bytes: Vec::new(),
            buf_overruns: 0,
            buf_min: -1,
            frame_period_usec: 0,
            skip_left: 0,
        }
    }
}

impl Port {
    pub fn invalidate(&mut self) {
        self.read_pointer = -1;
        self.frame_params = None;
        self.this_frame_params = None;
    }
}

/// Configuration applied by `start(session_cfg)`; mutated live by the
/// command surface and latched in at the next `start` (spec section 3:
/// "`set_format` (pending, applied at next start)").
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub format: Format,
    pub set_format: Format,
    pub max_frames: u32,
    pub frames_per_chunk: u32,
    pub segment_duration_s: u32,
    pub segment_length_bytes: u64,
    pub timescale: u32,
    pub start_after_timestamp: f64,
    pub exif_enabled: bool,
    pub greedy: bool,
    pub ignore_fps: bool,
    pub active_ports: u8,
    pub path_prefix: Option<String>,
    pub rawdev_path: Option<String>,
    /// `> 0`: drop this many frames after each kept one (count-based).
    /// `< 0`: `-frames_skip` seconds between kept frames (time-lapse).
    /// `== 0`: keep all frames.
    pub frames_skip: i64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            format: Format::None,
            set_format: Format::None,
            max_frames: 0,
            frames_per_chunk: 1,
            segment_duration_s: 0,
            segment_length_bytes: 0,
            timescale: 10_000,
            start_after_timestamp: 0.0,
            exif_enabled: true,
            greedy: false,
            ignore_fps: false,
            active_ports: 0,
            path_prefix: None,
            rawdev_path: None,
            frames_skip: 0,
        }
    }
}

/// The mutable state of the one-at-a-time recording session: `prog_state`
/// plus the bookkeeping `drain_tick` needs to decide on segment rotation.
pub struct Session {
    pub cfg: SessionConfig,
    pub prog_state: Mutex<ProgState>,
    pub ports: [Port; NUM_PORTS],
    pub last_error_code: i32,
    /// First kept frame's `(sec)` timestamp this segment, for
    /// `segment_duration_s` rotation.
    pub first_frame_sec: Option<u32>,
    /// Total bytes written to the current segment, for
    /// `segment_length_bytes` rotation.
    pub segment_bytes: u64,
    /// Per-frame sizes for the current segment (MOV `stsz`/rawdev index).
    pub frame_lengths: Vec<u32>,
    pub frame_index: u32,
    /// Baseline width/height the session started with; a later frame at a
    /// different size triggers `FrameChanged` unless `ignore_fps`.
    pub baseline_wh: Option<(u32, u32)>,
}

impl Session {
    pub fn new(cfg: SessionConfig) -> Session {
        Session {
            cfg,
            prog_state: Mutex::new(ProgState::Stopped),
            ports: Default::default(),
            last_error_code: 0,
            first_frame_sec: None,
            segment_bytes: 0,
            frame_lengths: Vec::new(),
            frame_index: 0,
            baseline_wh: None,
        }
    }

    pub fn state(&self) -> ProgState {
        *self.prog_state.lock()
    }

    pub fn set_state(&self, s: ProgState) {
        *self.prog_state.lock() = s;
    }

    pub fn active_port_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_PORTS).filter(move |&i| self.cfg.active_ports & (1 << i) != 0)
    }
}
