//! The in-memory dependency graph: interned file nodes, build edges, rules,
//! pools, and variable scopes.

use crate::densemap::{self, DenseMap};
use crate::disk::MTime;
use crate::eval::{Env, EvalString};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};

/// Id for a Node (a file path) in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// Id for an Edge (a build step) in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u32);
impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RuleId(u32);
impl densemap::Index for RuleId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for RuleId {
    fn from(u: usize) -> RuleId {
        RuleId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolId(u32);
impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScopeId(u32);
impl densemap::Index for ScopeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for ScopeId {
    fn from(u: usize) -> ScopeId {
        ScopeId(u as u32)
    }
}

/// The built-in rule backing `phony` build statements.
pub const PHONY_RULE: RuleId = RuleId(0);
/// The built-in pool used when an edge names no pool; depth 0 (unlimited).
pub const DEFAULT_POOL: PoolId = PoolId(0);
/// The built-in `console` pool, depth 1, which hands the terminal to the
/// running command.
pub const CONSOLE_POOL: PoolId = PoolId(1);
/// The outermost variable scope, holding top-level manifest bindings.
pub const ROOT_SCOPE: ScopeId = ScopeId(0);

/// A file referenced by the graph.
#[derive(Debug)]
pub struct Node {
    /// Canonical forward-slash path.
    pub path: String,
    /// Which separators were backslashes before canonicalization; display
    /// only.
    pub slash_bits: u64,
    pub mtime: MTime,
    pub dirty: bool,
    /// The edge producing this node, if any.
    pub in_edge: Option<EdgeId>,
    /// All edges consuming this node.
    pub out_edges: Vec<EdgeId>,
}

impl Node {
    /// True once stat() has run, whether or not the file exists.
    pub fn status_known(&self) -> bool {
        self.mtime != MTime::Unknown
    }

    pub fn exists(&self) -> bool {
        matches!(self.mtime, MTime::Stamp(_))
    }

    /// The path in its original spelling, with backslashes restored per
    /// slash_bits.  Only differs from `path` on Windows.
    pub fn path_decanonicalized(&self) -> String {
        let mut result = self.path.clone();
        if cfg!(windows) {
            let mut sep = 0;
            // Safety: '/' and '\\' are both ASCII.
            for c in unsafe { result.as_bytes_mut() } {
                if *c == b'/' {
                    if sep < 64 && self.slash_bits & (1 << sep) != 0 {
                        *c = b'\\';
                    }
                    sep += 1;
                }
            }
        }
        result
    }
}

/// A named bundle of un-evaluated binding templates, e.g. `command`.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub bindings: SmallMap<String, EvalString<String>>,
}

/// Binding names with engine-defined meaning; only these may appear in a
/// rule block.
pub const RESERVED_BINDINGS: [&str; 9] = [
    "command",
    "depfile",
    "description",
    "deps",
    "generator",
    "pool",
    "restat",
    "rspfile",
    "rspfile_content",
];

pub fn is_reserved_binding(var: &str) -> bool {
    RESERVED_BINDINGS.contains(&var)
}

/// A named counting semaphore bounding concurrently scheduled edges.
/// Depth 0 means unlimited.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
    current_use: usize,
    delayed: VecDeque<EdgeId>,
}

impl Pool {
    pub fn new(name: String, depth: usize) -> Self {
        Pool {
            name,
            depth,
            current_use: 0,
            delayed: VecDeque::new(),
        }
    }

    /// Whether scheduling through this pool must consider capacity at all.
    pub fn should_delay_edge(&self) -> bool {
        self.depth > 0
    }

    pub fn has_capacity(&self) -> bool {
        self.depth == 0 || self.current_use < self.depth
    }

    pub fn edge_scheduled(&mut self) {
        if self.depth > 0 {
            self.current_use += 1;
        }
    }

    pub fn edge_finished(&mut self) {
        if self.depth > 0 && self.current_use > 0 {
            self.current_use -= 1;
        }
    }

    pub fn delay_edge(&mut self, id: EdgeId) {
        if !self.delayed.contains(&id) {
            self.delayed.push_back(id);
        }
    }

    /// Move delayed edges into `ready` until capacity is reached.
    pub fn retrieve_ready_edges(&mut self, ready: &mut HashSet<EdgeId>) {
        while self.has_capacity() {
            match self.delayed.pop_front() {
                Some(id) => {
                    self.edge_scheduled();
                    ready.insert(id);
                }
                None => break,
            }
        }
    }
}

/// A build step: a rule applied to concrete inputs and outputs.
///
/// Inputs are stored in one Vec partitioned as
/// `[explicit | implicit | order-only]`, with counts of the latter two so
/// the slices can be recovered.
#[derive(Debug)]
pub struct Edge {
    pub rule: RuleId,
    pub pool: PoolId,
    pub scope: ScopeId,
    pub ins: Vec<NodeId>,
    pub implicit_ins: usize,
    pub order_only_ins: usize,
    pub outs: Vec<NodeId>,
    /// Variables bound on the build statement itself, already evaluated.
    pub bindings: SmallMap<String, String>,
    /// True when this edge's outputs exist and are consistent with its
    /// inputs at the current scan point.
    pub outputs_ready: bool,
    /// True when depfile/deps-log info was missing at scan time; the edge
    /// must run to regenerate it.
    pub deps_missing: bool,
}

impl Edge {
    pub fn is_phony(&self) -> bool {
        self.rule == PHONY_RULE
    }

    pub fn use_console(&self) -> bool {
        self.pool == CONSOLE_POOL
    }

    pub fn explicit_ins(&self) -> &[NodeId] {
        &self.ins[..self.ins.len() - self.implicit_ins - self.order_only_ins]
    }

    /// The inputs whose changes dirty this edge: explicit plus implicit.
    pub fn dirtying_ins(&self) -> &[NodeId] {
        &self.ins[..self.ins.len() - self.order_only_ins]
    }

    pub fn is_implicit(&self, i: usize) -> bool {
        i >= self.ins.len() - self.order_only_ins - self.implicit_ins && !self.is_order_only(i)
    }

    pub fn is_order_only(&self, i: usize) -> bool {
        i >= self.ins.len() - self.order_only_ins
    }
}

/// A variable scope: bindings plus an optional parent scope; lookup walks
/// parents.  `subninja` files get a child scope, `include`d files share
/// their includer's.
#[derive(Debug)]
pub struct Scope {
    pub vars: SmallMap<String, String>,
    pub parent: Option<ScopeId>,
}

/// The arena owning all nodes, edges, rules, pools, and scopes.  Nodes are
/// interned: two references to the same canonical path yield the same
/// NodeId.
#[derive(Debug)]
pub struct Graph {
    pub nodes: DenseMap<NodeId, Node>,
    pub edges: DenseMap<EdgeId, Edge>,
    pub rules: DenseMap<RuleId, Rule>,
    pub pools: DenseMap<PoolId, Pool>,
    pub scopes: DenseMap<ScopeId, Scope>,
    paths: hashbrown::HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        let mut rules = DenseMap::new();
        rules.push(Rule {
            name: "phony".to_owned(),
            bindings: SmallMap::default(),
        });
        let mut pools = DenseMap::new();
        pools.push(Pool::new(String::new(), 0));
        pools.push(Pool::new("console".to_owned(), 1));
        let mut scopes = DenseMap::new();
        scopes.push(Scope {
            vars: SmallMap::default(),
            parent: None,
        });
        Graph {
            nodes: DenseMap::new(),
            edges: DenseMap::new(),
            rules,
            pools,
            scopes,
            paths: hashbrown::HashMap::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    /// Intern a canonical path, creating its Node on first reference.
    pub fn get_or_create_node(&mut self, path: String, slash_bits: u64) -> NodeId {
        match self.paths.get(&path) {
            Some(&id) => id,
            None => {
                let id = self.nodes.push(Node {
                    path: path.clone(),
                    slash_bits,
                    mtime: MTime::Unknown,
                    dirty: false,
                    in_edge: None,
                    out_edges: Vec::new(),
                });
                self.paths.insert(path, id);
                id
            }
        }
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.paths.get(path).copied()
    }

    /// Register an edge, linking each output's in_edge back to it and
    /// adding it to each input's out_edges.
    pub fn add_edge(&mut self, edge: Edge) -> anyhow::Result<EdgeId> {
        let id = self.edges.next_id();
        let mut seen = HashSet::new();
        for &out in &edge.outs {
            if !seen.insert(out) {
                bail!(
                    "output {} is repeated in output list",
                    self.nodes.get(out).path
                );
            }
            let node = self.nodes.get_mut(out);
            if node.in_edge.is_some() {
                bail!("multiple rules generate {}", node.path);
            }
            node.in_edge = Some(id);
        }
        for &input in &edge.ins {
            self.nodes.get_mut(input).out_edges.push(id);
        }
        self.edges.push(edge);
        Ok(id)
    }

    /// True when every input's producing edge has finished (or the input is
    /// a source file).
    pub fn all_inputs_ready(&self, id: EdgeId) -> bool {
        self.edges.get(id).ins.iter().all(|&input| {
            match self.nodes.get(input).in_edge {
                Some(in_edge) => self.edges.get(in_edge).outputs_ready,
                None => true,
            }
        })
    }

    /// Walk a scope chain looking for a variable.
    pub fn lookup_scoped(&self, mut scope: ScopeId, var: &str) -> Option<&str> {
        loop {
            let s = self.scopes.get(scope);
            if let Some(val) = s.vars.get(var) {
                return Some(val);
            }
            match s.parent {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Expand a binding on an edge, with $in/$out shell-escaped.
    pub fn edge_binding(&self, id: EdgeId, key: &str) -> String {
        EdgeEnv::new(self, id, EscapeKind::ShellEscape).expand(key)
    }

    pub fn edge_binding_bool(&self, id: EdgeId, key: &str) -> bool {
        !self.edge_binding(id, key).is_empty()
    }

    /// Like edge_binding("depfile"), but without shell escaping.
    pub fn unescaped_depfile(&self, id: EdgeId) -> String {
        EdgeEnv::new(self, id, EscapeKind::DoNotEscape).expand("depfile")
    }

    /// Like edge_binding("rspfile"), but without shell escaping.
    pub fn unescaped_rspfile(&self, id: EdgeId) -> String {
        EdgeEnv::new(self, id, EscapeKind::DoNotEscape).expand("rspfile")
    }

    /// The full expanded command.  When incl_rspfile is set the rspfile
    /// content is folded in, so that the result changes whenever either
    /// does; this form feeds the build log hash.
    pub fn evaluate_command(&self, id: EdgeId, incl_rspfile: bool) -> String {
        let mut command = self.edge_binding(id, "command");
        if incl_rspfile {
            let rspfile_content = self.edge_binding(id, "rspfile_content");
            if !rspfile_content.is_empty() {
                command.push_str(";rspfile=");
                command.push_str(&rspfile_content);
            }
        }
        command
    }
}

#[derive(Copy, Clone, PartialEq)]
pub enum EscapeKind {
    ShellEscape,
    DoNotEscape,
}

/// An Env for expanding an edge's bindings: provides the computed $in,
/// $in_newline, and $out, then falls back to the edge's own bindings, the
/// rule's templates, and the enclosing scope, in that order.
pub struct EdgeEnv<'a> {
    graph: &'a Graph,
    id: EdgeId,
    escape: EscapeKind,
}

impl<'a> EdgeEnv<'a> {
    pub fn new(graph: &'a Graph, id: EdgeId, escape: EscapeKind) -> Self {
        EdgeEnv { graph, id, escape }
    }

    pub fn expand(&self, key: &str) -> String {
        match self.get_var(key) {
            Some(val) => val.into_owned(),
            None => String::new(),
        }
    }

    fn make_path_list(&self, ids: &[NodeId], sep: char) -> String {
        let mut result = String::new();
        for &id in ids {
            if !result.is_empty() {
                result.push(sep);
            }
            let node = self.graph.node(id);
            if cfg!(windows) {
                let path = node.path_decanonicalized();
                match self.escape {
                    EscapeKind::ShellEscape => win32_escape(&path, &mut result),
                    EscapeKind::DoNotEscape => result.push_str(&path),
                }
            } else {
                match self.escape {
                    EscapeKind::ShellEscape => shell_escape(&node.path, &mut result),
                    EscapeKind::DoNotEscape => result.push_str(&node.path),
                }
            }
        }
        result
    }
}

impl<'a> Env for EdgeEnv<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        let edge = self.graph.edge(self.id);
        match var {
            "in" => return Some(Cow::Owned(self.make_path_list(edge.explicit_ins(), ' '))),
            "in_newline" => {
                return Some(Cow::Owned(self.make_path_list(edge.explicit_ins(), '\n')))
            }
            "out" => return Some(Cow::Owned(self.make_path_list(&edge.outs, ' '))),
            _ => {}
        }
        if let Some(val) = edge.bindings.get(var) {
            return Some(Cow::Borrowed(val.as_str()));
        }
        // Rule templates evaluate against this same env, so e.g. a command
        // can reference $out and edge-level variables.  Reference cycles
        // among reserved bindings are rejected at load time.
        if let Some(template) = self.graph.rules.get(edge.rule).bindings.get(var) {
            return Some(Cow::Owned(template.evaluate(&[self])));
        }
        self.graph
            .lookup_scoped(edge.scope, var)
            .map(Cow::Borrowed)
    }
}

/// POSIX shell escaping: single-quote anything with characters the shell
/// treats specially, escaping interior quotes.  Bytes outside ASCII are
/// ordinary to the shell and stay unquoted.
pub fn shell_escape(path: &str, result: &mut String) {
    if !path.is_empty()
        && path.bytes().all(|c| {
            c.is_ascii_alphanumeric() || c >= 0x80 || matches!(c, b'_' | b'-' | b'+' | b'.' | b'/')
        })
    {
        result.push_str(path);
        return;
    }
    result.push('\'');
    for c in path.chars() {
        if c == '\'' {
            result.push_str("'\\''");
        } else {
            result.push(c);
        }
    }
    result.push('\'');
}

/// Windows cmd escaping: double-quote any path containing spaces or
/// quotes, doubling interior quotes.
pub fn win32_escape(path: &str, result: &mut String) {
    if !path.contains(' ') && !path.contains('"') {
        result.push_str(path);
        return;
    }
    result.push('"');
    for c in path.chars() {
        if c == '"' {
            result.push_str("\"\"");
        } else {
            result.push(c);
        }
    }
    result.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_edge(outs: Vec<NodeId>, ins: Vec<NodeId>) -> Edge {
        Edge {
            rule: PHONY_RULE,
            pool: DEFAULT_POOL,
            scope: ROOT_SCOPE,
            ins,
            implicit_ins: 0,
            order_only_ins: 0,
            outs,
            bindings: SmallMap::default(),
            outputs_ready: false,
            deps_missing: false,
        }
    }

    #[test]
    fn intern_nodes() {
        let mut graph = Graph::new();
        let a = graph.get_or_create_node("foo/bar".to_owned(), 0);
        let b = graph.get_or_create_node("foo/bar".to_owned(), 0);
        let c = graph.get_or_create_node("foo/baz".to_owned(), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn add_edge_links_outputs() {
        let mut graph = Graph::new();
        let out = graph.get_or_create_node("out".to_owned(), 0);
        let input = graph.get_or_create_node("in".to_owned(), 0);
        let edge = empty_edge(vec![out], vec![input]);
        let id = graph.add_edge(edge).unwrap();
        assert_eq!(graph.node(out).in_edge, Some(id));
        assert_eq!(graph.node(input).out_edges, vec![id]);
    }

    #[test]
    fn duplicate_output_within_edge() {
        let mut graph = Graph::new();
        let out = graph.get_or_create_node("dup".to_owned(), 0);
        let edge = empty_edge(vec![out, out], vec![]);
        let err = graph.add_edge(edge).unwrap_err();
        assert!(err.to_string().contains("is repeated in output list"));
    }

    #[test]
    fn duplicate_output_across_edges() {
        let mut graph = Graph::new();
        let out = graph.get_or_create_node("out".to_owned(), 0);
        graph
            .add_edge(empty_edge(vec![out], vec![]))
            .unwrap();
        let edge = empty_edge(vec![out], vec![]);
        let err = graph.add_edge(edge).unwrap_err();
        assert!(err.to_string().contains("multiple rules generate out"));
    }

    #[test]
    fn input_partition() {
        let mut graph = Graph::new();
        let outs = vec![graph.get_or_create_node("o".to_owned(), 0)];
        let ins: Vec<NodeId> = ["a", "b", "c", "d"]
            .iter()
            .map(|p| graph.get_or_create_node(p.to_string(), 0))
            .collect();
        let mut edge = empty_edge(outs, ins);
        edge.implicit_ins = 2;
        edge.order_only_ins = 1;
        assert_eq!(edge.explicit_ins().len(), 1);
        assert_eq!(edge.dirtying_ins().len(), 3);
        assert!(!edge.is_implicit(0));
        assert!(edge.is_implicit(1));
        assert!(edge.is_implicit(2));
        assert!(!edge.is_implicit(3));
        assert!(edge.is_order_only(3));
    }

    #[test]
    fn pool_admission() {
        let mut pool = Pool::new("p".to_owned(), 2);
        assert!(pool.should_delay_edge());
        assert!(pool.has_capacity());
        pool.edge_scheduled();
        pool.edge_scheduled();
        assert!(!pool.has_capacity());
        pool.delay_edge(EdgeId(1));
        pool.delay_edge(EdgeId(1)); // duplicate is a no-op
        pool.delay_edge(EdgeId(2));
        let mut ready = HashSet::new();
        pool.edge_finished();
        pool.retrieve_ready_edges(&mut ready);
        assert_eq!(ready.len(), 1);
        pool.edge_finished();
        pool.edge_finished();
        pool.retrieve_ready_edges(&mut ready);
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn unlimited_pool_never_delays() {
        let pool = Pool::new(String::new(), 0);
        assert!(!pool.should_delay_edge());
        assert!(pool.has_capacity());
    }

    #[test]
    fn shell_escaping() {
        let mut s = String::new();
        shell_escape("plain/path.o", &mut s);
        assert_eq!(s, "plain/path.o");
        s.clear();
        shell_escape("with space", &mut s);
        assert_eq!(s, "'with space'");
        s.clear();
        shell_escape("it's", &mut s);
        assert_eq!(s, "'it'\\''s'");
    }

    #[test]
    fn win32_escaping() {
        let mut s = String::new();
        win32_escape("plain\\path.obj", &mut s);
        assert_eq!(s, "plain\\path.obj");
        s.clear();
        win32_escape("with space", &mut s);
        assert_eq!(s, "\"with space\"");
        s.clear();
        win32_escape("say \"hi\"", &mut s);
        assert_eq!(s, "\"say \"\"hi\"\"\"");
    }
}
