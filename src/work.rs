//! Build orchestration: pumps ready edges from the plan into the command
//! runner and feeds results back into the plan and the persistent logs.

use crate::build_log::BuildLog;
use crate::canon::{canon_path, canon_path_with_slash_bits};
use crate::depfile;
use crate::deps_log::DepsLog;
use crate::disk::DiskInterface;
use crate::graph::{EdgeId, Graph, NodeId};
use crate::plan::Plan;
use crate::progress::Progress;
use crate::scan::DependencyScan;
use crate::scanner::Scanner;
use crate::signal;
use crate::task::{self, FinishedTask, Runner, Termination};
use crate::trace;
use anyhow::{anyhow, bail};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

/// Counts of command edges by their progress through the build, for
/// display.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StateCounts {
    /// Planned but not yet started.
    pub want: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.want + self.running + self.done + self.failed
    }

    pub fn finished(&self) -> usize {
        self.done + self.failed
    }
}

pub struct Options {
    pub parallelism: usize,
    /// How many failing commands to tolerate before giving up.
    pub failures_allowed: usize,
    /// If set, don't start new commands while the load average exceeds
    /// this.
    pub max_load_average: Option<f64>,
    /// Print full command lines instead of descriptions.
    pub verbose: bool,
}

const MSVC_DEPS_PREFIX: &str = "Note: including file: ";

/// Orchestrates one build: owns the graph, plan, logs, and disk, and
/// drives an externally provided progress sink.
pub struct Work<'a> {
    graph: Graph,
    plan: Plan,
    build_log: BuildLog,
    deps_log: DepsLog,
    disk: Box<dyn DiskInterface>,
    progress: &'a mut dyn Progress,
    options: Options,
    /// Edges already visited by dependency scanning this build.
    scanned: HashSet<EdgeId>,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: Graph,
        build_log: BuildLog,
        deps_log: DepsLog,
        disk: Box<dyn DiskInterface>,
        options: Options,
        progress: &'a mut dyn Progress,
    ) -> Self {
        Work {
            graph,
            plan: Plan::new(),
            build_log,
            deps_log,
            disk,
            options,
            progress,
            scanned: HashSet::new(),
        }
    }

    /// Look up a target path, tolerating non-canonical spellings.
    pub fn lookup_target(&self, name: &str) -> Option<NodeId> {
        if name.is_empty() {
            return None;
        }
        let mut path = name.to_owned();
        canon_path_with_slash_bits(&mut path);
        self.graph.lookup_node(&path)
    }

    /// The node for `path` if some edge produces it.
    pub fn is_build_target(&self, path: &str) -> Option<NodeId> {
        if path.is_empty() {
            return None;
        }
        self.graph
            .lookup_node(&canon_path(path))
            .filter(|&node| self.graph.node(node).in_edge.is_some())
    }

    pub fn want_file(&mut self, name: &str) -> anyhow::Result<()> {
        match self.lookup_target(name) {
            Some(node) => self.want_node(node),
            None => bail!("unknown target '{}'", name),
        }
    }

    /// Scan a requested target and absorb the result into the plan.
    pub fn want_node(&mut self, node: NodeId) -> anyhow::Result<()> {
        match self.graph.node(node).in_edge {
            Some(in_edge) => {
                let mut scan = DependencyScan {
                    graph: &mut self.graph,
                    disk: self.disk.as_ref(),
                    build_log: Some(&self.build_log),
                    deps_log: &self.deps_log,
                    scanned: &mut self.scanned,
                };
                scan.recompute_dirty(in_edge)?;
            }
            None => {
                // A source file: there is nothing to do unless it's gone.
                let mtime = {
                    let path = &self.graph.node(node).path;
                    self.disk
                        .stat(path)
                        .map_err(|err| anyhow!("stat {}: {}", path, err))?
                };
                let n = self.graph.node_mut(node);
                n.mtime = mtime;
                n.dirty = !n.exists();
            }
        }
        self.plan.add_target(&mut self.graph, node)
    }

    fn build_message(&self, id: EdgeId) -> String {
        if self.options.verbose {
            return self.graph.evaluate_command(id, false);
        }
        let description = self.graph.edge_binding(id, "description");
        if description.is_empty() {
            self.graph.evaluate_command(id, false)
        } else {
            description
        }
    }

    fn counts(&self, runner: &Runner, done: usize, failed: usize) -> StateCounts {
        let total = self.plan.command_edge_count();
        StateCounts {
            want: total.saturating_sub(done + failed + runner.running),
            running: runner.running,
            done,
            failed,
        }
    }

    fn load_too_high(&self, runner: &Runner) -> bool {
        // Only throttle when something is running, so we always make
        // progress eventually.
        match self.options.max_load_average {
            Some(max) if runner.is_running() => {
                task::current_load_average().map_or(false, |load| load > max)
            }
            _ => false,
        }
    }

    fn start_edge(&mut self, runner: &mut Runner, id: EdgeId) -> anyhow::Result<()> {
        let message = self.build_message(id);
        self.progress.task_started(id, &message);

        for i in 0..self.graph.edge(id).outs.len() {
            let out = self.graph.edge(id).outs[i];
            let path = self.graph.node(out).path.clone();
            self.disk
                .make_dirs_for(&path)
                .map_err(|err| anyhow!("mkdir for {}: {}", path, err))?;
        }

        let rspfile = self.graph.unescaped_rspfile(id);
        if !rspfile.is_empty() {
            let content = self.graph.edge_binding(id, "rspfile_content");
            self.disk
                .make_dirs_for(&rspfile)
                .map_err(|err| anyhow!("mkdir for {}: {}", rspfile, err))?;
            self.disk
                .write_file(&rspfile, &content)
                .map_err(|err| anyhow!("write {}: {}", rspfile, err))?;
        }

        let console = self.graph.edge(id).use_console();
        if console {
            self.progress.console_locked(true);
        }
        let command = self.graph.evaluate_command(id, false);
        runner.start(id, command, console);
        Ok(())
    }

    /// Read implicit deps the command emitted, either from a depfile
    /// (deleted after reading; the deps log supersedes it) or from
    /// compiler output lines.
    fn extract_deps(
        &mut self,
        id: EdgeId,
        deps_type: &str,
        output: &mut Vec<u8>,
    ) -> anyhow::Result<Vec<NodeId>> {
        match deps_type {
            "gcc" => {
                let depfile = self.graph.unescaped_depfile(id);
                if depfile.is_empty() {
                    bail!("deps = gcc requires a depfile");
                }
                let mut content = self
                    .disk
                    .read_file(&depfile)
                    .map_err(|err| anyhow!("read {}: {}", depfile, err))?;
                content.push(0);
                let mut scanner = Scanner::new(&content);
                let parsed = depfile::parse(&mut scanner)
                    .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(&depfile), err)))?;
                let mut nodes = Vec::with_capacity(parsed.deps.len());
                for dep in parsed.deps {
                    let mut dep = dep.into_owned();
                    if dep.is_empty() {
                        continue;
                    }
                    let slash_bits = canon_path_with_slash_bits(&mut dep);
                    nodes.push(self.graph.get_or_create_node(dep, slash_bits));
                }
                let _ = self.disk.remove_file(&depfile);
                Ok(nodes)
            }
            "msvc" => {
                let mut nodes = Vec::new();
                let mut filtered = Vec::with_capacity(output.len());
                for line in output.split_inclusive(|&c| c == b'\n') {
                    let text = String::from_utf8_lossy(line);
                    match text.trim_start().strip_prefix(MSVC_DEPS_PREFIX) {
                        Some(path) => {
                            let mut path = path.trim().to_owned();
                            if path.is_empty() {
                                continue;
                            }
                            let slash_bits = canon_path_with_slash_bits(&mut path);
                            nodes.push(self.graph.get_or_create_node(path, slash_bits));
                        }
                        None => filtered.extend_from_slice(line),
                    }
                }
                *output = filtered;
                Ok(nodes)
            }
            _ => bail!("unknown deps type '{}'", deps_type),
        }
    }

    /// Absorb a successful command: discovered deps, restat cleaning, plan
    /// bookkeeping, and the build and deps logs.
    fn finish_edge(
        &mut self,
        id: EdgeId,
        task: &mut FinishedTask,
        build_start: Instant,
    ) -> anyhow::Result<()> {
        let deps_type = self.graph.edge_binding(id, "deps");
        let deps_nodes = if !deps_type.is_empty() {
            Some(self.extract_deps(id, &deps_type, &mut task.result.output)?)
        } else {
            None
        };

        let mut restat_mtime = 0u64;
        if self.graph.edge_binding_bool(id, "restat") {
            let mut node_cleaned = false;
            let outs = self.graph.edge(id).outs.clone();
            for out in outs {
                let path = self.graph.node(out).path.clone();
                let new_mtime = self
                    .disk
                    .stat(&path)
                    .map_err(|err| anyhow!("stat {}: {}", path, err))?;
                if new_mtime == self.graph.node(out).mtime {
                    // The command did not touch this output; spread the
                    // clean state through the graph.  This also covers
                    // still-nonexistent outputs.
                    let mut scan = DependencyScan {
                        graph: &mut self.graph,
                        disk: self.disk.as_ref(),
                        build_log: Some(&self.build_log),
                        deps_log: &self.deps_log,
                        scanned: &mut self.scanned,
                    };
                    self.plan.clean_node(&mut scan, out)?;
                    node_cleaned = true;
                }
            }

            if node_cleaned {
                // Record the newest input the untouched outputs are clean
                // against; a missing input forces a conservative zero.
                let inputs = self.graph.edge(id).dirtying_ins().to_vec();
                for input in inputs {
                    let input_mtime = self.disk.stat(&self.graph.node(input).path)?.stamp();
                    if input_mtime == 0 {
                        restat_mtime = 0;
                        break;
                    }
                    if input_mtime > restat_mtime {
                        restat_mtime = input_mtime;
                    }
                }
                let depfile = self.graph.unescaped_depfile(id);
                if restat_mtime != 0 && !depfile.is_empty() {
                    let depfile_mtime = self.disk.stat(&depfile)?.stamp();
                    if depfile_mtime == 0 {
                        restat_mtime = 0;
                    } else if depfile_mtime > restat_mtime {
                        restat_mtime = depfile_mtime;
                    }
                }
            }
        }

        self.plan.edge_finished(&mut self.graph, id);

        let start_ms = task.span.0.duration_since(build_start).as_millis() as u32;
        let end_ms = task.span.1.duration_since(build_start).as_millis() as u32;
        self.build_log
            .record_command(&self.graph, id, start_ms, end_ms, restat_mtime)?;

        if let Some(nodes) = deps_nodes {
            let out = self.graph.edge(id).outs[0];
            let mtime = self.disk.stat(&self.graph.node(out).path)?.stamp();
            self.deps_log.record_deps(&self.graph, out, mtime, &nodes)?;
        }
        Ok(())
    }

    /// Remove whatever an aborted command had started writing.
    fn cleanup_edge(&mut self, id: EdgeId) {
        let outs = self.graph.edge(id).outs.clone();
        for out in outs {
            let path = self.graph.node(out).path.clone();
            if let Ok(new_mtime) = self.disk.stat(&path) {
                if new_mtime != self.graph.node(out).mtime {
                    let _ = self.disk.remove_file(&path);
                }
            }
        }
        let rspfile = self.graph.unescaped_rspfile(id);
        if !rspfile.is_empty() {
            let _ = self.disk.remove_file(&rspfile);
        }
        let depfile = self.graph.unescaped_depfile(id);
        if !depfile.is_empty() {
            let _ = self.disk.remove_file(&depfile);
        }
    }

    /// Run the build until the plan is satisfied.  Returns the number of
    /// tasks executed, or None if any command failed.
    pub fn run(&mut self) -> anyhow::Result<Option<usize>> {
        let mut runner = Runner::new(self.options.parallelism);
        let build_start = Instant::now();
        let mut tasks_done = 0usize;
        let mut tasks_failed = 0usize;
        let mut failures_left = self.options.failures_allowed;
        let mut interrupted_edges: Vec<EdgeId> = Vec::new();
        let mut interrupted = false;

        loop {
            interrupted = interrupted || signal::was_interrupted();

            if !self.plan.more_to_do() && !runner.is_running() {
                break;
            }

            // Start as many ready commands as the runner and load allow.
            if !interrupted && failures_left > 0 {
                while runner.can_start_more() && !self.load_too_high(&runner) {
                    let id = match self.plan.find_work() {
                        Some(id) => id,
                        None => break,
                    };
                    if self.graph.edge(id).is_phony() {
                        // Nothing to execute; completing it may unblock
                        // dependents.
                        self.plan.edge_finished(&mut self.graph, id);
                        continue;
                    }
                    self.start_edge(&mut runner, id)?;
                    let counts = self.counts(&runner, tasks_done, tasks_failed);
                    self.progress.update(&counts);
                }
            }

            if !runner.is_running() {
                if interrupted || tasks_failed > 0 {
                    // Failed edges leave their dependents permanently
                    // unready; nothing more can happen.
                    break;
                }
                if self.plan.more_to_do() {
                    bail!("stuck: plan incomplete but no work is ready [this is a bug]");
                }
                continue;
            }

            let mut task = runner.wait();
            let id = task.edge;
            if self.graph.edge(id).use_console() {
                self.progress.console_locked(false);
            }
            let message = self.build_message(id);
            trace::write_complete(&message, task.tid + 1, task.span.0, task.span.1);

            match task.result.termination {
                Termination::Success => match self.finish_edge(id, &mut task, build_start) {
                    Ok(()) => {
                        tasks_done += 1;
                        self.progress.task_finished(id, &message, &task.result);
                    }
                    Err(err) => {
                        // Bad deps output etc.; the command "succeeded" but
                        // the edge did not.
                        tasks_failed += 1;
                        failures_left = failures_left.saturating_sub(1);
                        self.progress.task_finished(id, &message, &task.result);
                        self.progress.log(&format!("error: {}", err));
                    }
                },
                Termination::Interrupted => {
                    interrupted = true;
                    interrupted_edges.push(id);
                    self.progress.task_finished(id, &message, &task.result);
                }
                Termination::Failure => {
                    tasks_failed += 1;
                    failures_left = failures_left.saturating_sub(1);
                    self.progress.task_finished(id, &message, &task.result);
                }
            }
            let counts = self.counts(&runner, tasks_done, tasks_failed);
            self.progress.update(&counts);
        }

        if interrupted {
            for id in interrupted_edges {
                self.cleanup_edge(id);
            }
            bail!("interrupted by user");
        }
        if tasks_failed > 0 {
            return Ok(None);
        }
        Ok(Some(tasks_done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_counts_totals() {
        let counts = StateCounts {
            want: 3,
            running: 2,
            done: 4,
            failed: 1,
        };
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.finished(), 5);
    }
}
