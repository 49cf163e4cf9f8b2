//! Dependency scanning: deciding which edges must re-run by examining
//! filesystem state, the build log, and implicit dep metadata from
//! depfiles and the deps log.

use crate::build_log::{self, BuildLog};
use crate::canon::canon_path_with_slash_bits;
use crate::depfile;
use crate::deps_log::DepsLog;
use crate::disk::DiskInterface;
use crate::explain;
use crate::graph::{Edge, EdgeId, Graph, NodeId, DEFAULT_POOL, PHONY_RULE, ROOT_SCOPE};
use crate::scanner::Scanner;
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::collections::HashSet;
use std::path::Path;

/// Walks the graph from requested targets updating every reachable node's
/// dirty bit and every edge's outputs_ready.
///
/// Recoverable conditions (a missing depfile, an absent or stale deps-log
/// entry) surface as Ok(false) from the loaders and mark the edge
/// deps_missing; hard failures (unreadable depfile, mismatched depfile
/// target) are Err.
pub struct DependencyScan<'a> {
    pub graph: &'a mut Graph,
    pub disk: &'a dyn DiskInterface,
    pub build_log: Option<&'a BuildLog>,
    pub deps_log: &'a DepsLog,
    /// Edges whose body has already run this scan; keeps diamond reachability
    /// linear and re-requested targets from splicing deps twice.
    pub scanned: &'a mut HashSet<EdgeId>,
}

impl<'a> DependencyScan<'a> {
    /// stat() a node unless a prior step already did.  Returns true when
    /// this call did the stat (i.e. the node was not yet visited).
    fn stat_if_necessary(&mut self, id: NodeId) -> anyhow::Result<bool> {
        if self.graph.node(id).status_known() {
            return Ok(false);
        }
        let mtime = {
            let path = &self.graph.node(id).path;
            self.disk
                .stat(path)
                .map_err(|err| anyhow!("stat {}: {}", path, err))?
        };
        self.graph.node_mut(id).mtime = mtime;
        Ok(true)
    }

    /// Recursively examine inputs, outputs, and command lines to judge
    /// whether `id` must re-run, updating outputs_ready and each output's
    /// dirty bit.
    pub fn recompute_dirty(&mut self, id: EdgeId) -> anyhow::Result<()> {
        if !self.scanned.insert(id) {
            return Ok(());
        }

        let mut dirty = false;
        {
            let edge = self.graph.edge_mut(id);
            edge.outputs_ready = true;
            edge.deps_missing = false;
        }

        if !self.load_deps(id)? {
            // Failed to load dependency info: rebuild to regenerate it.
            dirty = true;
            self.graph.edge_mut(id).deps_missing = true;
        }

        // Visit all inputs; we're dirty if any of them are.
        let mut most_recent_input: Option<NodeId> = None;
        for i in 0..self.graph.edge(id).ins.len() {
            let input = self.graph.edge(id).ins[i];
            if self.stat_if_necessary(input)? {
                if let Some(in_edge) = self.graph.node(input).in_edge {
                    self.recompute_dirty(in_edge)?;
                } else {
                    // Source file: dirty iff missing.
                    let exists = self.graph.node(input).exists();
                    if !exists {
                        explain!(
                            "{} has no in-edge and is missing",
                            self.graph.node(input).path
                        );
                    }
                    self.graph.node_mut(input).dirty = !exists;
                }
            }

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = self.graph.node(input).in_edge {
                if !self.graph.edge(in_edge).outputs_ready {
                    self.graph.edge_mut(id).outputs_ready = false;
                }
            }

            if !self.graph.edge(id).is_order_only(i) {
                if self.graph.node(input).dirty {
                    explain!("{} is dirty", self.graph.node(input).path);
                    dirty = true;
                } else {
                    let mtime = self.graph.node(input).mtime.stamp();
                    let newest = most_recent_input
                        .map(|m| self.graph.node(m).mtime.stamp())
                        .unwrap_or(0);
                    if most_recent_input.is_none() || mtime > newest {
                        most_recent_input = Some(input);
                    }
                }
            }
        }

        // We may also be dirty due to output state: missing or out of date
        // outputs, or a changed command.
        if !dirty {
            dirty = self.recompute_outputs_dirty(id, most_recent_input)?;
        }

        // Finally visit each output, marking it off and propagating dirt.
        for i in 0..self.graph.edge(id).outs.len() {
            let out = self.graph.edge(id).outs[i];
            self.stat_if_necessary(out)?;
            if dirty {
                self.graph.node_mut(out).dirty = true;
            }
        }

        // A dirty edge's outputs are not ready, with one exception: a phony
        // edge with no inputs has nothing to do.
        let edge = self.graph.edge(id);
        if dirty && !(edge.is_phony() && edge.ins.is_empty()) {
            self.graph.edge_mut(id).outputs_ready = false;
        }

        Ok(())
    }

    /// Whether any output of `id` is out of date relative to the newest
    /// input, the build log, and the expanded command.
    pub fn recompute_outputs_dirty(
        &mut self,
        id: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        let command = self.graph.evaluate_command(id, true);
        for i in 0..self.graph.edge(id).outs.len() {
            let out = self.graph.edge(id).outs[i];
            self.stat_if_necessary(out)?;
            if self.output_dirty(id, most_recent_input, &command, out) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn output_dirty(
        &self,
        id: EdgeId,
        most_recent_input: Option<NodeId>,
        command: &str,
        out: NodeId,
    ) -> bool {
        let edge = self.graph.edge(id);
        let output = self.graph.node(out);

        if edge.is_phony() {
            // Phony edges don't write output.  They're dirty only if they
            // have no inputs and the output is missing.
            return edge.ins.is_empty() && !output.exists();
        }

        if !output.exists() {
            explain!("output {} doesn't exist", output.path);
            return true;
        }

        let mut log_entry = None;
        if let Some(input) = most_recent_input {
            let input_mtime = self.graph.node(input).mtime.stamp();
            if output.mtime.stamp() < input_mtime {
                let mut output_mtime = output.mtime.stamp();

                // A restat rule may have cleaned this output on a prior run,
                // recording the input mtime it was clean against; compare
                // with that instead.
                let mut used_restat = false;
                if self.graph.edge_binding_bool(id, "restat") {
                    if let Some(log) = self.build_log {
                        if let Some(entry) = log.lookup_by_output(&output.path) {
                            output_mtime = entry.restat_mtime;
                            used_restat = true;
                            log_entry = Some(entry);
                        }
                    }
                }

                if output_mtime < input_mtime {
                    explain!(
                        "{}output {} older than most recent input {} ({} vs {})",
                        if used_restat { "restat of " } else { "" },
                        output.path,
                        self.graph.node(input).path,
                        output_mtime,
                        input_mtime
                    );
                    return true;
                }
            }
        }

        // The command changing since the last run also dirties us, except
        // for generator rules, which regenerate the manifest itself.
        if let Some(log) = self.build_log {
            if !self.graph.edge_binding_bool(id, "generator") {
                match log_entry.or_else(|| log.lookup_by_output(&output.path)) {
                    Some(entry) => {
                        if build_log::hash_command(command) != entry.command_hash {
                            explain!("command line changed for {}", output.path);
                            return true;
                        }
                    }
                    None => {
                        explain!("command line not found in log for {}", output.path);
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Augment the edge's inputs from its depfile or the deps log.
    /// Ok(false) means the info was missing or stale, which is not an
    /// error: the edge reruns and regenerates it.
    fn load_deps(&mut self, id: EdgeId) -> anyhow::Result<bool> {
        let deps_type = self.graph.edge_binding(id, "deps");
        if !deps_type.is_empty() {
            return self.load_deps_from_log(id);
        }

        let depfile = self.graph.unescaped_depfile(id);
        if !depfile.is_empty() {
            return self.load_depfile(id, &depfile);
        }

        // No deps to load.
        Ok(true)
    }

    fn load_depfile(&mut self, id: EdgeId, path: &str) -> anyhow::Result<bool> {
        let mut content = match self.disk.read_file(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                explain!("depfile '{}' is missing", path);
                return Ok(false);
            }
            Err(err) => bail!("loading '{}': {}", path, err),
        };
        if content.is_empty() {
            explain!("depfile '{}' is empty", path);
            return Ok(false);
        }
        content.push(0);

        let mut scanner = Scanner::new(&content);
        let parsed = depfile::parse(&mut scanner)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(path), err)))?;

        // The depfile must describe this edge's first output.
        let mut target = parsed.target.into_owned();
        canon_path_with_slash_bits(&mut target);
        let first_out = self.graph.edge(id).outs[0];
        if self.graph.node(first_out).path != target {
            bail!(
                "expected depfile '{}' to mention '{}', got '{}'",
                path,
                self.graph.node(first_out).path,
                target
            );
        }

        let mut nodes = Vec::with_capacity(parsed.deps.len());
        for dep in parsed.deps {
            let mut dep = dep.into_owned();
            if dep.is_empty() {
                continue;
            }
            let slash_bits = canon_path_with_slash_bits(&mut dep);
            nodes.push(self.graph.get_or_create_node(dep, slash_bits));
        }
        self.insert_implicit_deps(id, &nodes);
        Ok(true)
    }

    fn load_deps_from_log(&mut self, id: EdgeId) -> anyhow::Result<bool> {
        // Deps are only supported for single-output edges.
        let output = self.graph.edge(id).outs[0];
        self.stat_if_necessary(output)?;

        let deps_log = self.deps_log;
        let deps = match deps_log.get_deps(output) {
            Some(deps) => deps,
            None => {
                explain!("deps for '{}' are missing", self.graph.node(output).path);
                return Ok(false);
            }
        };

        // Deps are stale if the output is newer than the record.
        let output_mtime = self.graph.node(output).mtime.stamp();
        if output_mtime > deps.mtime {
            explain!(
                "stored deps info out of date for '{}' ({} vs {})",
                self.graph.node(output).path,
                deps.mtime,
                output_mtime
            );
            return Ok(false);
        }

        self.insert_implicit_deps(id, &deps.nodes);
        Ok(true)
    }

    /// Splice discovered deps into the input list ahead of the order-only
    /// segment, wiring consumer links and synthesizing phony producers for
    /// nodes nothing builds, so a deleted header causes a rebuild rather
    /// than an abort.
    fn insert_implicit_deps(&mut self, id: EdgeId, nodes: &[NodeId]) {
        for &node in nodes {
            self.create_phony_in_edge(node);
            self.graph.node_mut(node).out_edges.push(id);
        }
        let edge = self.graph.edge_mut(id);
        let splice_at = edge.ins.len() - edge.order_only_ins;
        edge.ins.splice(splice_at..splice_at, nodes.iter().copied());
        edge.implicit_ins += nodes.len();
    }

    fn create_phony_in_edge(&mut self, node: NodeId) {
        if self.graph.node(node).in_edge.is_some() {
            return;
        }
        let phony = self
            .graph
            .add_edge(Edge {
                rule: PHONY_RULE,
                pool: DEFAULT_POOL,
                scope: ROOT_SCOPE,
                ins: Vec::new(),
                implicit_ins: 0,
                order_only_ins: 0,
                outs: vec![node],
                bindings: SmallMap::default(),
                outputs_ready: false,
                deps_missing: false,
            })
            .expect("node verified to have no in-edge");
        // This edge's body may never run if the node was already stat()ed
        // by an earlier edge's scan; earlier scans saw the node as an
        // in-edge-less source and judged it ready, so keep it that way.
        self.graph.edge_mut(phony).outputs_ready = true;
    }
}
