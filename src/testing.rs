//! Test support: an in-memory filesystem with a fake clock, and a scene
//! harness that loads a manifest string into a scannable graph.

use crate::build_log::BuildLog;
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, MTime};
use crate::graph::{EdgeId, Graph, NodeId};
use crate::load;
use crate::scan::DependencyScan;
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind};

/// A memory-backed DiskInterface.  Every mutation advances a fake clock so
/// later writes are strictly newer.
pub struct VirtualDisk {
    files: HashMap<String, (u64, Vec<u8>)>,
    now: u64,
}

impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk {
            files: HashMap::new(),
            now: 1,
        }
    }

    /// Advance the clock without touching any file.
    pub fn tick(&mut self) -> u64 {
        self.now += 1;
        self.now
    }

    pub fn create(&mut self, path: &str, contents: &str) {
        self.now += 1;
        self.files
            .insert(path.to_owned(), (self.now, contents.as_bytes().to_vec()));
    }

    pub fn mtime_of(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|(mtime, _)| *mtime)
    }
}

impl DiskInterface for VirtualDisk {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        Ok(match self.files.get(path) {
            Some((mtime, _)) => MTime::Stamp(*mtime),
            None => MTime::Missing,
        })
    }

    fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        match self.files.get(path) {
            Some((_, contents)) => Ok(contents.clone()),
            None => Err(Error::from(ErrorKind::NotFound)),
        }
    }

    fn write_file(&mut self, path: &str, contents: &str) -> std::io::Result<()> {
        self.create(path, contents);
        Ok(())
    }

    fn make_dirs_for(&mut self, _path: &str) -> std::io::Result<()> {
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> std::io::Result<()> {
        match self.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::from(ErrorKind::NotFound)),
        }
    }
}

/// A loaded manifest plus the state a scan needs, all in memory.
pub struct TestScene {
    pub graph: Graph,
    pub disk: VirtualDisk,
    pub build_log: Option<BuildLog>,
    pub deps_log: DepsLog,
    pub defaults: Vec<NodeId>,
    scanned: HashSet<EdgeId>,
}

impl TestScene {
    pub fn new(manifest: &str) -> Self {
        let mut disk = VirtualDisk::new();
        disk.create("build.ninja", manifest);
        let loaded = load::read_manifest(&disk, "build.ninja").expect("manifest should load");
        TestScene {
            graph: loaded.graph,
            disk,
            build_log: None,
            deps_log: DepsLog::new(),
            defaults: loaded.defaults,
            scanned: HashSet::new(),
        }
    }

    pub fn node_for(&self, path: &str) -> NodeId {
        self.graph
            .lookup_node(path)
            .unwrap_or_else(|| panic!("no node for {:?}", path))
    }

    pub fn edge_for(&self, out: &str) -> EdgeId {
        self.graph
            .node(self.node_for(out))
            .in_edge
            .unwrap_or_else(|| panic!("no in-edge for {:?}", out))
    }

    pub fn mark_dirty(&mut self, path: &str) {
        let node = self.node_for(path);
        self.graph.node_mut(node).dirty = true;
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.graph.node(self.node_for(path)).dirty
    }

    /// Scan the edge producing `out`, as a build of that target would.
    pub fn scan(&mut self, out: &str) -> anyhow::Result<()> {
        let edge = self.edge_for(out);
        let mut scan = DependencyScan {
            graph: &mut self.graph,
            disk: &self.disk,
            build_log: self.build_log.as_ref(),
            deps_log: &self.deps_log,
            scanned: &mut self.scanned,
        };
        scan.recompute_dirty(edge)
    }

    /// Forget all stat results and dirty bits, like a fresh process would.
    pub fn reset(&mut self) {
        for node in self.graph.nodes.values_mut() {
            node.mtime = MTime::Unknown;
            node.dirty = false;
        }
        for edge in self.graph.edges.values_mut() {
            edge.outputs_ready = false;
            edge.deps_missing = false;
        }
        self.scanned.clear();
    }
}
