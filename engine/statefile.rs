//! Raw-device state-file persistence (spec section 4.8): a single text
//! record recording where the write head was when the daemon last
//! stopped, so a restart can resume the ring instead of starting over.

use base::{bail_t, Error};
use std::fs;
use std::io::Write;
use std::path::Path;

const HEADER: &str = "Device\tStart LBA\tCurrent LBA\tEnd LBA\n";

/// The one record a state file holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskState {
    pub device: String,
    pub lba_start: u64,
    pub lba_current: u64,
    pub lba_end: u64,
}

impl DiskState {
    /// Writes the record, overwriting whatever was there. Matches "on
    /// raw-device stop, write a single-record text file" (spec section 4.8).
    pub fn write_to(&self, path: &Path) -> Result<(), Error> {
        let mut f = fs::File::create(path)?;
        f.write_all(HEADER.as_bytes())?;
        writeln!(f, "{}\t{}\t{}\t{}", self.device, self.lba_start, self.lba_current, self.lba_end)?;
        f.sync_all()?;
        Ok(())
    }

    /// Reads back the record written by [`DiskState::write_to`].
    pub fn read_from(path: &Path) -> Result<DiskState, Error> {
        let text = fs::read_to_string(path)?;
        let record = text
            .lines()
            .nth(1)
            .ok_or_else(|| base::format_err_t!(NotFound, "state file {} has no record line", path.display()))?;
        let fields: Vec<&str> = record.split('\t').collect();
        if fields.len() != 4 {
            bail_t!(InvalidArgument, "state file record has {} fields, want 4", fields.len());
        }
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| base::format_err_t!(InvalidArgument, "bad LBA field {:?}", s))
        };
        Ok(DiskState {
            device: fields[0].to_string(),
            lba_start: parse(fields[1])?,
            lba_current: parse(fields[2])?,
            lba_end: parse(fields[3])?,
        })
    }

    /// Resumes a ring only if the persisted geometry matches the live disk's;
    /// otherwise the caller should start fresh at `lba_start`.
    pub fn resume_if_matching(path: &Path, device: &str, lba_start: u64, lba_end: u64) -> Option<u64> {
        let state = DiskState::read_from(path).ok()?;
        if state.device == device && state.lba_start == lba_start && state.lba_end == lba_end {
            Some(state.lba_current)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn round_trips_matching_geometry() {
        let dir = TempDir::new("camogm-state").unwrap();
        let path = dir.path().join("state.txt");
        let state = DiskState {
            device: "/dev/sda2".to_string(),
            lba_start: 2048,
            lba_current: 12_345_678,
            lba_end: 9_765_625_000,
        };
        state.write_to(&path).unwrap();
        let read_back = DiskState::read_from(&path).unwrap();
        assert_eq!(read_back, state);
        let resumed = DiskState::resume_if_matching(&path, "/dev/sda2", 2048, 9_765_625_000);
        assert_eq!(resumed, Some(12_345_678));
    }

    #[test]
    fn mismatched_geometry_does_not_resume() {
        let dir = TempDir::new("camogm-state").unwrap();
        let path = dir.path().join("state.txt");
        let state = DiskState {
            device: "/dev/sda2".to_string(),
            lba_start: 2048,
            lba_current: 5000,
            lba_end: 9_765_625_000,
        };
        state.write_to(&path).unwrap();
        assert!(DiskState::resume_if_matching(&path, "/dev/sda2", 0, 9_765_625_000).is_none());
    }
}
