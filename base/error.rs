// This file is part of Moonfire NVR, a security camera digital video recorder.
// Copyright (C) 2018 Scott Lamb <slamb@slamb.org>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// In addition, as a special exception, the copyright holders give
// permission to link the code of portions of this program with the
// OpenSSL library under certain conditions as described in each
// individual source file, and distribute linked combinations including
// the two.
//
// You must obey the GNU General Public License in all respects for all
// of the code used other than OpenSSL. If you modify file(s) with this
// exception, you may extend this exception to your version of the
// file(s), but you are not obligated to do so. If you do not wish to do
// so, delete this exception statement from your version. If you delete
// this exception statement from all source files in the program, then
// also delete it here.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Error type shared by every crate in the workspace.
//!
//! `ErrorKind` is the recording daemon's error taxonomy: every place that
//! the C original returned a negative `CAMOGM_FRAME_*` code now returns a
//! `Result<_, Error>` whose `kind()` is one of these variants, and the
//! drain loop matches on it to decide what to do next.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Write};

/// Returns a pretty, multi-line rendering of `e` including its cause chain.
pub fn prettify_failure(e: &failure::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    if e.backtrace().is_empty() {
        write!(
            &mut msg,
            "\n\n(set environment variable RUST_BACKTRACE=1 to see backtraces)"
        )
        .unwrap();
    } else {
        write!(&mut msg, "\n\nBacktrace:\n{}", e.backtrace()).unwrap();
    }
    msg
}

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        *self.inner.get_context()
    }

    pub fn compat(self) -> failure::Compat<Context<ErrorKind>> {
        self.inner.compat()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            inner: e.context(ErrorKind::FrameFileErr),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.cause() {
            None => fmt::Display::fmt(&self.kind(), f),
            Some(c) => write!(f, "{}: {}", self.kind(), c),
        }
    }
}

/// The error taxonomy from the frame-drain state machine's return path.
///
/// Each variant names both the trigger and (via the drain loop) the
/// recovery: `FrameNotReady` waits, `FrameBroken`/`FrameInvalid` resync,
/// `FrameChanged`/`FrameNextFile` rotate the segment, `FrameFileErr` logs
/// and keeps running, `FrameMalloc`/`NoSpace` abort the sink.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[fail(display = "frame not ready")] FrameNotReady,
    #[fail(display = "positional seek rejected the read pointer")] FrameInvalid,
    #[fail(display = "recording parameters changed")] FrameChanged,
    #[fail(display = "segment rotation requested")] FrameNextFile,
    #[fail(display = "metadata signature mismatch or ring overrun")] FrameBroken,
    #[fail(display = "sink I/O error")] FrameFileErr,
    #[fail(display = "allocation failed")] FrameMalloc,
    #[fail(display = "current timestamp precedes start_after_timestamp")] TooEarly,
    #[fail(display = "unclassified frame error")] FrameOther,
    #[fail(display = "raw device or filesystem exhausted")] NoSpace,
    #[fail(display = "invalid argument")] InvalidArgument,
    #[fail(display = "not found")] NotFound,
    #[fail(display = "internal error")] Internal,
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<failure::Error>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| e.into().context(k).into())
    }
}

/// Like `failure::bail!`, but the first argument specifies a type as an `ErrorKind`.
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err(failure::err_msg($e).context($crate::ErrorKind::$t).into());
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err(failure::err_msg(format!($fmt, $($arg)+)).context($crate::ErrorKind::$t).into());
    };
}

/// Like `failure::format_err!`, but the first argument specifies a type as an `ErrorKind`.
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        Into::<$crate::Error>::into(failure::err_msg($e).context($crate::ErrorKind::$t))
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        Into::<$crate::Error>::into(failure::err_msg(format!($fmt, $($arg)+))
                                    .context($crate::ErrorKind::$t))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_kind_roundtrips() {
        let e: Error = format_err_t!(FrameBroken, "signature {:#x} != 0xffff", 0u16);
        assert_eq!(e.kind(), ErrorKind::FrameBroken);
        assert!(e.to_string().starts_with("metadata signature mismatch"));
    }

    #[test]
    fn err_kind_maps_io_error() {
        let r: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "eio"));
        let e = r.err_kind(ErrorKind::FrameFileErr).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FrameFileErr);
    }
}
