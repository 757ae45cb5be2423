//! The recording engine: every algorithmic piece of the frame-drain
//! daemon that the root binary crate assembles into a running `Daemon`.
//! Split out as its own workspace member the way the teacher keeps its
//! SQLite-backed metadata store in `db/` — this crate plays that
//! structural role, but its job is the capture-to-sink pipeline rather
//! than a database.

#[macro_use]
extern crate log;

pub mod align;
pub mod drain;
pub mod index;
pub mod metadata;
pub mod mov;
pub mod ogm;
pub mod packet;
pub mod rawdev;
pub mod ring;
pub mod session;
pub mod sink;
pub mod statefile;
pub mod writer;
