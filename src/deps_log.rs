//! The deps log persists implicit dependencies discovered from depfiles or
//! compiler output, keyed by output node, so later scans can skip
//! re-reading depfiles.  Records are binary: length-prefixed path records
//! that assign dense integer ids, and marked deps records referencing
//! those ids.

use crate::graph::{Graph, NodeId};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};

/// One stored deps record: the output's mtime at record time and its
/// discovered inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Deps {
    pub mtime: u64,
    pub nodes: Vec<NodeId>,
}

const DEPS_RECORD_MARK: u16 = 0b1000_0000_0000_0000;

pub struct DepsLog {
    /// Maps log id -> NodeId; position is the id.
    node_ids: Vec<NodeId>,
    /// Maps NodeId -> log id.
    ids: HashMap<NodeId, usize>,
    deps: HashMap<NodeId, Deps>,
    file: Option<File>,
}

impl DepsLog {
    /// An in-memory log with no backing file; used by tests and dry scans.
    pub fn new() -> Self {
        DepsLog {
            node_ids: Vec::new(),
            ids: HashMap::new(),
            deps: HashMap::new(),
            file: None,
        }
    }

    /// Open an on-disk log, loading its records into memory and keeping the
    /// handle for appends.  Referenced paths are interned into the graph.
    pub fn open(path: &str, graph: &mut Graph) -> anyhow::Result<DepsLog> {
        let mut log = DepsLog::new();
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
        {
            Ok(f) => f,
            Err(err) => return Err(anyhow!("open {}: {}", path, err)),
        };
        let valid_len = log
            .read(&file, graph)
            .map_err(|err| anyhow!("load {}: {}", path, err))?;
        if valid_len < file.metadata()?.len() {
            // Drop a partial trailing record so appends stay aligned.
            file.set_len(valid_len)?;
        }
        log.file = Some(file);
        Ok(log)
    }

    /// Load records, returning the byte length of the valid prefix.
    fn read(&mut self, file: &File, graph: &mut Graph) -> anyhow::Result<u64> {
        let mut r = BReader {
            r: BufReader::new(file),
        };
        let mut valid_len = 0u64;
        loop {
            let mark = match r.read_u16() {
                Ok(m) => m,
                // A partial trailing record (interrupted write) is dropped.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            };
            if mark & DEPS_RECORD_MARK == 0 {
                let name = match r.read_str(mark as usize) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                valid_len += 2 + mark as u64;
                let node = graph.get_or_create_node(name, 0);
                self.ids.insert(node, self.node_ids.len());
                self.node_ids.push(node);
            } else {
                let count = (mark & !DEPS_RECORD_MARK) as usize;
                let record = (|| -> std::io::Result<(u32, u64, Vec<u32>)> {
                    let out = r.read_u24()?;
                    let mtime = r.read_u64()?;
                    let mut dep_ids = Vec::with_capacity(count);
                    for _ in 0..count {
                        dep_ids.push(r.read_u24()?);
                    }
                    Ok((out, mtime, dep_ids))
                })();
                let (out, mtime, dep_ids) = match record {
                    Ok(r) => r,
                    Err(_) => break,
                };
                valid_len += 2 + 3 + 8 + 3 * count as u64;
                let out = match self.node_ids.get(out as usize) {
                    Some(&n) => n,
                    None => bail!("deps record references unknown id {}", out),
                };
                let mut nodes = Vec::with_capacity(dep_ids.len());
                for dep in dep_ids {
                    match self.node_ids.get(dep as usize) {
                        Some(&n) => nodes.push(n),
                        None => bail!("deps record references unknown id {}", dep),
                    }
                }
                self.deps.insert(out, Deps { mtime, nodes });
            }
        }
        Ok(valid_len)
    }

    pub fn get_deps(&self, node: NodeId) -> Option<&Deps> {
        self.deps.get(&node)
    }

    /// Append a deps record for an output.  An identical record is already
    /// current and is not rewritten.
    pub fn record_deps(
        &mut self,
        graph: &Graph,
        output: NodeId,
        mtime: u64,
        deps: &[NodeId],
    ) -> anyhow::Result<()> {
        if let Some(existing) = self.deps.get(&output) {
            if existing.mtime == mtime && existing.nodes == deps {
                return Ok(());
            }
        }

        let mut dep_ids = Vec::with_capacity(deps.len());
        for &dep in deps {
            dep_ids.push(self.ensure_id(graph, dep)?);
        }
        let out_id = self.ensure_id(graph, output)?;

        if let Some(file) = &mut self.file {
            if deps.len() >= DEPS_RECORD_MARK as usize {
                bail!("too many deps for one output");
            }
            let mark = deps.len() as u16 | DEPS_RECORD_MARK;
            file.write_all(&mark.to_be_bytes())?;
            write_u24(file, out_id)?;
            file.write_all(&mtime.to_be_bytes())?;
            for &dep in &dep_ids {
                write_u24(file, dep)?;
            }
            file.flush()?;
        }

        self.deps.insert(
            output,
            Deps {
                mtime,
                nodes: deps.to_vec(),
            },
        );
        Ok(())
    }

    fn ensure_id(&mut self, graph: &Graph, node: NodeId) -> anyhow::Result<usize> {
        if let Some(&id) = self.ids.get(&node) {
            return Ok(id);
        }
        let id = self.node_ids.len();
        let path = &graph.node(node).path;
        if let Some(file) = &mut self.file {
            if path.len() >= DEPS_RECORD_MARK as usize {
                bail!("path too long for deps log: {}", path);
            }
            file.write_all(&(path.len() as u16).to_be_bytes())?;
            file.write_all(path.as_bytes())?;
        }
        self.ids.insert(node, id);
        self.node_ids.push(node);
        Ok(id)
    }
}

fn write_u24(w: &mut File, id: usize) -> std::io::Result<()> {
    if id >= 1 << 24 {
        panic!("too many deps log ids");
    }
    let n = id as u32;
    w.write_all(&[(n >> 16) as u8, (n >> 8) as u8, n as u8])
}

/// Lower-level reads of the serialized records.
struct BReader<'a> {
    r: BufReader<&'a File>,
}

impl<'a> BReader<'a> {
    fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0u8; 2];
        self.r.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u24(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 3];
        self.r.read_exact(&mut buf)?;
        Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32))
    }

    fn read_u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_str(&mut self, len: usize) -> std::io::Result<String> {
        let mut buf = vec![0; len];
        self.r.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 path"))
    }
}
