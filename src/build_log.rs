//! The build log records, per output path, when its command last ran and a
//! hash of what was run, so the next scan can tell whether the command
//! changed.  On disk it is an append-only text file that rewrites itself
//! once enough entries are stale.

use crate::graph::{EdgeId, Graph};
use anyhow::anyhow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{Read, Write};

const SIGNATURE_PREFIX: &str = "# joist log v";
const CURRENT_VERSION: u32 = 4;

/// Entries are held in a fixed-size buffer while scanning; a line that
/// doesn't fit is dropped and scanning resumes at the next newline.
const LINE_BUF_SIZE: usize = 256 << 10;

const MIN_COMPACTION_ENTRIES: usize = 100;
const COMPACTION_RATIO: usize = 3;

pub fn hash_command(command: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(command.as_bytes());
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    /// Milliseconds from the start of the recording build.
    pub start_time: u32,
    pub end_time: u32,
    /// Input timestamp a restat rule was last clean against; 0 when unused.
    pub restat_mtime: u64,
}

pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    file: Option<File>,
    needs_recompaction: bool,
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog {
            entries: HashMap::new(),
            file: None,
            needs_recompaction: false,
        }
    }

    pub fn lookup_by_output(&self, path: &str) -> Option<&LogEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Read a log file, tolerating malformed content.  A missing file is an
    /// empty log; an individual bad line is skipped and schedules a
    /// rewrite; an old version loads but schedules an upgrade rewrite.
    pub fn load(&mut self, path: &str) -> anyhow::Result<()> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(anyhow!("open {}: {}", path, err)),
        };

        let mut version = 0;
        let mut total_entries = 0usize;
        let mut reader = LineReader::new(file);
        while let Some(line) = reader.read_line().map_err(|err| anyhow!("read {}: {}", path, err))? {
            let line = match line.strip_suffix(b"\r") {
                Some(l) => l,
                None => line,
            };
            if version == 0 {
                match parse_signature(line) {
                    Some(v) => {
                        version = v;
                        continue;
                    }
                    None => version = 1,
                }
            }
            if version > CURRENT_VERSION {
                // A future format; don't guess at its schema.
                break;
            }
            match parse_entry(line, version) {
                Some(entry) => {
                    total_entries += 1;
                    self.entries.insert(entry.output.clone(), entry);
                }
                None => {
                    self.needs_recompaction = true;
                }
            }
        }

        if version != CURRENT_VERSION
            || (total_entries > MIN_COMPACTION_ENTRIES
                && total_entries > self.entries.len() * COMPACTION_RATIO)
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    /// Open the log for appending, rewriting it first if a prior load
    /// flagged it.  Writes the version signature into an empty file.
    pub fn open_for_write(&mut self, path: &str) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path)?;
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path, err))?;
        if file.metadata()?.len() == 0 {
            let mut file = file;
            writeln!(file, "{}{}", SIGNATURE_PREFIX, CURRENT_VERSION)?;
            self.file = Some(file);
        } else {
            self.file = Some(file);
        }
        Ok(())
    }

    /// Record one entry per output of the edge, both in memory and in the
    /// open file.
    pub fn record_command(
        &mut self,
        graph: &Graph,
        id: EdgeId,
        start_time: u32,
        end_time: u32,
        restat_mtime: u64,
    ) -> anyhow::Result<()> {
        let command = graph.evaluate_command(id, true);
        let command_hash = hash_command(&command);
        for &out in &graph.edge(id).outs {
            let output = graph.node(out).path.clone();
            let entry = LogEntry {
                output: output.clone(),
                command_hash,
                start_time,
                end_time,
                restat_mtime,
            };
            if let Some(file) = &mut self.file {
                write_entry(file, &entry)?;
            }
            self.entries.insert(output, entry);
        }
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Rewrite the file to hold only the surviving entries: write a sibling
    /// `.recompact` file, then rename it over the original.
    fn recompact(&mut self, path: &str) -> anyhow::Result<()> {
        self.close();
        let temp_path = format!("{}.recompact", path);
        let mut f = File::create(&temp_path).map_err(|err| anyhow!("create {}: {}", temp_path, err))?;
        writeln!(f, "{}{}", SIGNATURE_PREFIX, CURRENT_VERSION)?;
        for entry in self.entries.values() {
            write_entry(&mut f, entry)?;
        }
        f.flush()?;
        drop(f);
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path, err))?;
        self.needs_recompaction = false;
        Ok(())
    }
}

fn parse_signature(line: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(line).ok()?;
    line.strip_prefix(SIGNATURE_PREFIX)?.trim().parse().ok()
}

/// Parse one entry line.  Version 4 is tab-separated with a hex command
/// hash; earlier versions were space-separated with the full command text,
/// which we hash on the way in.
fn parse_entry(line: &[u8], version: u32) -> Option<LogEntry> {
    let line = std::str::from_utf8(line).ok()?;
    let sep = if version >= 4 { '\t' } else { ' ' };
    let mut fields = line.splitn(5, sep);
    let start_time = fields.next()?.parse().ok()?;
    let end_time = fields.next()?.parse().ok()?;
    let restat_mtime = fields.next()?.parse().ok()?;
    let output = fields.next()?.to_owned();
    let last = fields.next()?;
    let command_hash = if version >= 4 {
        u64::from_str_radix(last, 16).ok()?
    } else {
        hash_command(last)
    };
    Some(LogEntry {
        output,
        command_hash,
        start_time,
        end_time,
        restat_mtime,
    })
}

fn write_entry(w: &mut File, entry: &LogEntry) -> std::io::Result<()> {
    writeln!(
        w,
        "{}\t{}\t{}\t{}\t{:016x}",
        entry.start_time, entry.end_time, entry.restat_mtime, entry.output, entry.command_hash
    )
}

/// Reads newline-terminated lines through a fixed-capacity buffer.  A
/// missing newline at EOF still yields the final line; a line longer than
/// the buffer is silently dropped.
struct LineReader<R: Read> {
    r: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    skipping: bool,
}

impl<R: Read> LineReader<R> {
    fn new(r: R) -> Self {
        LineReader {
            r,
            buf: vec![0; LINE_BUF_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            skipping: false,
        }
    }

    fn read_line(&mut self) -> std::io::Result<Option<&[u8]>> {
        loop {
            if let Some(pos) = self.buf[self.start..self.end]
                .iter()
                .position(|&c| c == b'\n')
            {
                let line_start = self.start;
                self.start += pos + 1;
                if self.skipping {
                    // This newline ends the dropped over-long line.
                    self.skipping = false;
                    continue;
                }
                return Ok(Some(&self.buf[line_start..line_start + pos]));
            }

            if self.skipping {
                self.start = 0;
                self.end = 0;
            } else if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }

            if self.end == self.buf.len() {
                // No newline fits in the whole buffer: drop this line.
                self.skipping = true;
                self.start = 0;
                self.end = 0;
            }

            let n = self.r.read(&mut self.buf[self.end..])?;
            if n == 0 {
                if self.skipping || self.start == self.end {
                    return Ok(None);
                }
                // Tolerate a missing newline at EOF.
                let line_start = self.start;
                let line_end = self.end;
                self.start = self.end;
                return Ok(Some(&self.buf[line_start..line_end]));
            }
            self.end += n;
        }
    }
}
