//! Access to the filesystem, indirected through a trait so the scanner and
//! builder can be driven against an in-memory disk in tests.

use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// The observed state of a file's timestamp.  `Unknown` means we have not
/// stat()ed yet; `Missing` means we looked and the file is absent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MTime {
    Unknown,
    Missing,
    Stamp(u64),
}

impl MTime {
    /// The raw timestamp, with missing files treated as older than anything.
    pub fn stamp(&self) -> u64 {
        match self {
            MTime::Stamp(t) => *t,
            _ => 0,
        }
    }
}

pub trait DiskInterface {
    /// stat() a path; never returns MTime::Unknown.
    fn stat(&self, path: &str) -> std::io::Result<MTime>;
    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn write_file(&mut self, path: &str, contents: &str) -> std::io::Result<()>;
    /// Create the directory containing `path`, and any parents.
    fn make_dirs_for(&mut self, path: &str) -> std::io::Result<()>;
    fn remove_file(&mut self, path: &str) -> std::io::Result<()>;
}

pub struct RealDisk;

impl DiskInterface for RealDisk {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                // Nanosecond stamps; second granularity is too coarse to
                // order a write against a build in the same second.
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                Ok(MTime::Stamp(mtime))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }

    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&mut self, path: &str, contents: &str) -> std::io::Result<()> {
        std::fs::write(path, contents)
    }

    fn make_dirs_for(&mut self, path: &str) -> std::io::Result<()> {
        match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)
            }
            _ => Ok(()),
        }
    }

    fn remove_file(&mut self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }
}
