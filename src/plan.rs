//! The build plan: the set of edges we intend to run, and the subset whose
//! inputs are satisfied and whose pool admits them.

use crate::graph::{EdgeId, Graph, NodeId};
use crate::scan::DependencyScan;
use anyhow::bail;
use std::collections::{HashMap, HashSet};

pub struct Plan {
    /// Edges the build must visit.  An absent edge is not part of the
    /// build at all; false means we don't need to run it but may need to
    /// run a dependent; true means it must run.
    want: HashMap<EdgeId, bool>,

    /// Edges whose inputs are all ready and whose pool has admitted them.
    /// Deliberately unordered; callers get an arbitrary member.
    ready: HashSet<EdgeId>,

    /// Wanted-true edges not yet finished.
    wanted_edges: usize,
    /// Wanted-true edges with a real command (not phony).
    command_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan {
            want: HashMap::new(),
            ready: HashSet::new(),
            wanted_edges: 0,
            command_edges: 0,
        }
    }

    /// Add `node` and everything it transitively depends on to the plan.
    pub fn add_target(&mut self, graph: &mut Graph, node: NodeId) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        self.add_sub_target(graph, node, &mut stack)
    }

    fn add_sub_target(
        &mut self,
        graph: &mut Graph,
        node: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let edge_id = match graph.node(node).in_edge {
            None => {
                // Leaf node; a missing one cannot be rebuilt.
                if graph.node(node).dirty {
                    let referenced = match stack.last() {
                        Some(&parent) => format!(", needed by '{}',", graph.node(parent).path),
                        None => String::new(),
                    };
                    bail!(
                        "'{}'{} missing and no known rule to make it",
                        graph.node(node).path,
                        referenced
                    );
                }
                return Ok(());
            }
            Some(e) => e,
        };

        self.check_dependency_cycle(graph, node, stack)?;

        if graph.edge(edge_id).outputs_ready {
            return Ok(());
        }

        // First encounter of an edge enters it as not-wanted; the dirty
        // check below may immediately lift it.
        let first_encounter = !self.want.contains_key(&edge_id);
        if first_encounter {
            self.want.insert(edge_id, false);
        }

        if graph.node(node).dirty && !self.want[&edge_id] {
            self.want.insert(edge_id, true);
            self.wanted_edges += 1;
            if graph.all_inputs_ready(edge_id) {
                self.schedule_work(graph, edge_id);
            }
            if !graph.edge(edge_id).is_phony() {
                self.command_edges += 1;
            }
        }

        if !first_encounter {
            // Inputs were already traversed.
            return Ok(());
        }

        stack.push(node);
        for i in 0..graph.edge(edge_id).ins.len() {
            let input = graph.edge(edge_id).ins[i];
            self.add_sub_target(graph, input, stack)?;
        }
        stack.pop();
        Ok(())
    }

    fn check_dependency_cycle(
        &self,
        graph: &Graph,
        node: NodeId,
        stack: &[NodeId],
    ) -> anyhow::Result<()> {
        if let Some(pos) = stack.iter().position(|&n| n == node) {
            let mut msg = String::from("dependency cycle: ");
            for &n in &stack[pos..] {
                msg.push_str(&graph.node(n).path);
                msg.push_str(" -> ");
            }
            msg.push_str(&graph.node(node).path);
            bail!("{}", msg);
        }
        Ok(())
    }

    /// Pop an arbitrary ready edge, or None if nothing is ready right now.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        let id = *self.ready.iter().next()?;
        self.ready.remove(&id);
        Some(id)
    }

    /// True while there are edges left that run real commands.  A plan with
    /// only phony work left is vacuously done.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn wanted_edge_count(&self) -> usize {
        self.wanted_edges
    }

    /// Submit an edge whose inputs are ready.  The pool may admit it into
    /// the ready set now or hold it in its delay queue until capacity
    /// frees up.  Duplicate submissions are no-ops.
    fn schedule_work(&mut self, graph: &mut Graph, id: EdgeId) {
        let pool_id = graph.edge(id).pool;
        if graph.pools.get(pool_id).should_delay_edge() {
            // A node consumed twice by one edge can request its consumer
            // twice; it is already queued.
            if self.ready.contains(&id) {
                return;
            }
            let pool = graph.pools.get_mut(pool_id);
            pool.delay_edge(id);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            graph.pools.get_mut(pool_id).edge_scheduled();
            self.ready.insert(id);
        }
    }

    /// Mark an edge done: its outputs are now ready, its pool slot frees
    /// up, and consumers whose inputs are all satisfied get scheduled (or,
    /// for traverse-only edges, recursively finished).
    pub fn edge_finished(&mut self, graph: &mut Graph, id: EdgeId) {
        let was_wanted = self
            .want
            .remove(&id)
            .expect("finished edge must be in the plan");
        if was_wanted {
            self.wanted_edges -= 1;
        }
        graph.edge_mut(id).outputs_ready = true;

        // This may free up delayed jobs in the pool.
        let pool_id = graph.edge(id).pool;
        let pool = graph.pools.get_mut(pool_id);
        pool.edge_finished();
        pool.retrieve_ready_edges(&mut self.ready);

        // Check off any nodes we were waiting for with this edge.
        for i in 0..graph.edge(id).outs.len() {
            let out = graph.edge(id).outs[i];
            self.node_finished(graph, out);
        }
    }

    fn node_finished(&mut self, graph: &mut Graph, node: NodeId) {
        for i in 0..graph.node(node).out_edges.len() {
            let consumer = graph.node(node).out_edges[i];
            let want = match self.want.get(&consumer) {
                Some(&w) => w,
                None => continue,
            };
            if !graph.all_inputs_ready(consumer) {
                continue;
            }
            if want {
                self.schedule_work(graph, consumer);
            } else {
                // We don't need to run this edge, but a dependent may need
                // its readiness.
                self.edge_finished(graph, consumer);
            }
        }
    }

    /// Retroactively mark a node clean after a restat rule left it
    /// unchanged, demoting consumer edges whose outputs turn out to be up
    /// to date after all.
    pub fn clean_node(&mut self, scan: &mut DependencyScan, node: NodeId) -> anyhow::Result<()> {
        scan.graph.node_mut(node).dirty = false;

        for i in 0..scan.graph.node(node).out_edges.len() {
            let consumer = scan.graph.node(node).out_edges[i];
            match self.want.get(&consumer) {
                Some(&true) => {}
                _ => continue,
            }
            // An edge that failed to load deps must still run.
            if scan.graph.edge(consumer).deps_missing {
                continue;
            }

            // Only when every non-order-only input is now clean can the
            // outputs' dirty state have changed.
            let edge = scan.graph.edge(consumer);
            if edge
                .dirtying_ins()
                .iter()
                .any(|&input| scan.graph.node(input).dirty)
            {
                continue;
            }

            let mut most_recent_input: Option<NodeId> = None;
            for &input in scan.graph.edge(consumer).dirtying_ins() {
                let mtime = scan.graph.node(input).mtime.stamp();
                let newest = most_recent_input
                    .map(|m| scan.graph.node(m).mtime.stamp())
                    .unwrap_or(0);
                if most_recent_input.is_none() || mtime > newest {
                    most_recent_input = Some(input);
                }
            }

            if !scan.recompute_outputs_dirty(consumer, most_recent_input)? {
                let outs = scan.graph.edge(consumer).outs.clone();
                for out in outs {
                    self.clean_node(scan, out)?;
                }

                self.want.insert(consumer, false);
                self.wanted_edges -= 1;
                if !scan.graph.edge(consumer).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
        Ok(())
    }
}
