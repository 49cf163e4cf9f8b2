//! Drives the parser over manifest files and assembles the build graph,
//! then attaches the persistent logs.

use crate::build_log::BuildLog;
use crate::canon::canon_path_with_slash_bits;
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, RealDisk};
use crate::eval::{Env, EvalString};
use crate::graph::{
    self, is_reserved_binding, Edge, Graph, NodeId, PoolId, RuleId, Scope, ScopeId,
    CONSOLE_POOL, DEFAULT_POOL, PHONY_RULE, ROOT_SCOPE,
};
use crate::parse::{Parser, Statement};
use crate::smallmap::SmallMap;
use crate::trace;
use anyhow::{anyhow, bail};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

pub const BUILD_LOG_FILENAME: &str = ".joist_log";
pub const DEPS_LOG_FILENAME: &str = ".joist_deps";

/// The manifest-derived parts of a build: graph plus default targets.
#[derive(Debug)]
pub struct Loaded {
    pub graph: Graph,
    pub defaults: Vec<NodeId>,
    pub builddir: Option<String>,
}

/// Everything needed to run a build.
pub struct State {
    pub graph: Graph,
    pub build_log: BuildLog,
    pub deps_log: DepsLog,
    pub defaults: Vec<NodeId>,
}

/// An Env over a scope chain in the graph.
struct ScopeEnv<'a> {
    graph: &'a Graph,
    id: ScopeId,
}

impl<'a> Env for ScopeEnv<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.graph.lookup_scoped(self.id, var).map(Cow::Borrowed)
    }
}

/// An Env that records which reserved binding names a value references,
/// for the rule-binding cycle check.
struct ReservedRefCollector {
    refs: RefCell<Vec<String>>,
}

impl Env for ReservedRefCollector {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        if is_reserved_binding(var) {
            self.refs.borrow_mut().push(var.to_owned());
        }
        None
    }
}

struct Loader<'d> {
    graph: Graph,
    disk: &'d dyn DiskInterface,
    rule_ids: HashMap<String, RuleId>,
    pool_ids: HashMap<String, PoolId>,
    defaults: Vec<NodeId>,
}

impl<'d> Loader<'d> {
    fn new(disk: &'d dyn DiskInterface) -> Self {
        let mut rule_ids = HashMap::new();
        rule_ids.insert("phony".to_owned(), PHONY_RULE);
        let mut pool_ids = HashMap::new();
        pool_ids.insert("console".to_owned(), CONSOLE_POOL);
        Loader {
            graph: Graph::new(),
            disk,
            rule_ids,
            pool_ids,
            defaults: Vec::new(),
        }
    }

    fn canon_node(&mut self, mut path: String) -> anyhow::Result<NodeId> {
        if path.is_empty() {
            bail!("empty path");
        }
        let slash_bits = canon_path_with_slash_bits(&mut path);
        Ok(self.graph.get_or_create_node(path, slash_bits))
    }

    fn read_file(&mut self, path: &str, scope: ScopeId) -> anyhow::Result<()> {
        let mut bytes = self
            .disk
            .read_file(path)
            .map_err(|err| anyhow!("read {}: {}", path, err))?;
        bytes.push(0);
        let mut parser = Parser::new(&bytes);
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(Path::new(path), err)))?
            {
                None => break,
                Some(s) => s,
            };
            match stmt {
                Statement::Let((name, val)) => {
                    let val = val.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        id: scope,
                    }]);
                    self.graph
                        .scopes
                        .get_mut(scope)
                        .vars
                        .insert(name.to_owned(), val);
                }
                Statement::Rule(rule) => self.add_rule(rule)?,
                Statement::Pool(pool) => self.add_pool(pool)?,
                Statement::Build(build) => self.add_build(scope, build)?,
                Statement::Default(paths) => {
                    for p in paths {
                        let path = p.evaluate(&[&ScopeEnv {
                            graph: &self.graph,
                            id: scope,
                        }]);
                        let node = self.canon_node(path)?;
                        if self.graph.node(node).in_edge.is_none()
                            && self.graph.node(node).out_edges.is_empty()
                        {
                            bail!("unknown target '{}'", self.graph.node(node).path);
                        }
                        self.defaults.push(node);
                    }
                }
                Statement::Include(p) => {
                    let file = p.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        id: scope,
                    }]);
                    self.read_file(&file, scope)?;
                }
                Statement::Subninja(p) => {
                    let file = p.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        id: scope,
                    }]);
                    let child = self.graph.scopes.push(Scope {
                        vars: SmallMap::default(),
                        parent: Some(scope),
                    });
                    self.read_file(&file, child)?;
                }
            }
        }
        Ok(())
    }

    fn add_rule(&mut self, rule: crate::parse::Rule) -> anyhow::Result<()> {
        if self.rule_ids.contains_key(rule.name) {
            bail!("duplicate rule '{}'", rule.name);
        }

        // Build up the reserved-binding reference graph as bindings arrive,
        // rejecting any addition that closes a cycle.  Bounded by the small
        // reserved-name set, so the repeated scan is fine.
        let mut references: SmallMap<String, Vec<String>> = SmallMap::default();
        for (key, val) in rule.vars.iter() {
            self.check_binding_cycle(key, val, &mut references)?;
        }

        if !rule.vars.contains_key("command") {
            bail!("expected 'command =' line in rule '{}'", rule.name);
        }
        if rule.vars.contains_key("rspfile") != rule.vars.contains_key("rspfile_content") {
            bail!("rspfile and rspfile_content need to be both specified");
        }

        let mut bindings: SmallMap<String, EvalString<String>> = SmallMap::default();
        for (key, val) in rule.vars.into_iter() {
            bindings.insert(key.to_owned(), val.into_owned());
        }
        let id = self.graph.rules.push(graph::Rule {
            name: rule.name.to_owned(),
            bindings,
        });
        self.rule_ids.insert(rule.name.to_owned(), id);
        Ok(())
    }

    fn check_binding_cycle(
        &self,
        key: &str,
        val: &EvalString<&str>,
        references: &mut SmallMap<String, Vec<String>>,
    ) -> anyhow::Result<()> {
        let collector = ReservedRefCollector {
            refs: RefCell::new(Vec::new()),
        };
        val.evaluate(&[&collector]);
        references.insert(key.to_owned(), collector.refs.into_inner());

        // The reference graph was acyclic before this binding was added, so
        // any new cycle must pass through it: search for a path from `key`
        // back to `key`.
        let mut visited = Vec::new();
        let mut path = Vec::new();
        if find_path(references, key, key, &mut visited, &mut path) {
            let mut cycle = path.join(" -> ");
            cycle.push_str(" -> ");
            cycle.push_str(key);
            bail!("found cycle {}", cycle);
        }
        Ok(())
    }

    fn add_pool(&mut self, pool: crate::parse::Pool) -> anyhow::Result<()> {
        if self.pool_ids.contains_key(pool.name) {
            bail!("duplicate pool '{}'", pool.name);
        }
        let id = self
            .graph
            .pools
            .push(graph::Pool::new(pool.name.to_owned(), pool.depth));
        self.pool_ids.insert(pool.name.to_owned(), id);
        Ok(())
    }

    fn add_build(&mut self, scope: ScopeId, build: crate::parse::Build) -> anyhow::Result<()> {
        let rule = match self.rule_ids.get(build.rule) {
            Some(&id) => id,
            None => bail!("unknown build rule '{}'", build.rule),
        };

        // Build variables evaluate against the enclosing scope only; they
        // do not see each other.
        let mut bindings: SmallMap<String, String> = SmallMap::default();
        for (key, val) in build.vars.iter() {
            let val = val.evaluate(&[&ScopeEnv {
                graph: &self.graph,
                id: scope,
            }]);
            bindings.insert((*key).to_owned(), val);
        }

        let mut outs = Vec::with_capacity(build.outs.len());
        for p in &build.outs {
            let path = {
                let scope_env = ScopeEnv {
                    graph: &self.graph,
                    id: scope,
                };
                p.evaluate(&[&bindings, &scope_env])
            };
            outs.push(self.canon_node(path)?);
        }
        let mut ins = Vec::with_capacity(build.ins.len());
        for p in &build.ins {
            let path = {
                let scope_env = ScopeEnv {
                    graph: &self.graph,
                    id: scope,
                };
                p.evaluate(&[&bindings, &scope_env])
            };
            ins.push(self.canon_node(path)?);
        }

        let pool = self.resolve_pool(scope, &bindings, rule)?;

        let deps = self.resolve_rule_binding(scope, &bindings, rule, "deps");
        if !deps.is_empty() && outs.len() > 1 {
            bail!("multiple outputs aren't supported with deps");
        }

        self.graph.add_edge(Edge {
            rule,
            pool,
            scope,
            ins,
            implicit_ins: build.implicit_ins,
            order_only_ins: build.order_only_ins,
            outs,
            bindings,
            outputs_ready: false,
            deps_missing: false,
        })?;
        Ok(())
    }

    /// Look up a reserved binding the way an edge would, but without the
    /// computed $in/$out; enough for load-time validation.
    fn resolve_rule_binding(
        &self,
        scope: ScopeId,
        bindings: &SmallMap<String, String>,
        rule: RuleId,
        key: &str,
    ) -> String {
        if let Some(val) = bindings.get(key) {
            return val.clone();
        }
        let scope_env = ScopeEnv {
            graph: &self.graph,
            id: scope,
        };
        match self.graph.rules.get(rule).bindings.get(key) {
            Some(template) => template.evaluate(&[bindings, &scope_env]),
            None => scope_env.get_var(key).map(Cow::into_owned).unwrap_or_default(),
        }
    }

    fn resolve_pool(
        &self,
        scope: ScopeId,
        bindings: &SmallMap<String, String>,
        rule: RuleId,
    ) -> anyhow::Result<PoolId> {
        let name = self.resolve_rule_binding(scope, bindings, rule, "pool");
        if name.is_empty() {
            return Ok(DEFAULT_POOL);
        }
        match self.pool_ids.get(&name) {
            Some(&id) => Ok(id),
            None => bail!("unknown pool name '{}'", name),
        }
    }
}

/// Depth-first search for a path of reserved-binding references from
/// `from` to `to`, accumulating the path taken.
fn find_path<'a>(
    references: &'a SmallMap<String, Vec<String>>,
    from: &'a str,
    to: &str,
    visited: &mut Vec<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    if visited.contains(&from) {
        return false;
    }
    visited.push(from);
    path.push(from);
    if let Some(refs) = references.get(from) {
        for r in refs {
            if r.as_str() == to || find_path(references, r, to, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

/// Parse the manifest (and anything it includes) into a graph.
pub fn read_manifest(disk: &dyn DiskInterface, build_filename: &str) -> anyhow::Result<Loaded> {
    let mut loader = Loader::new(disk);
    loader.read_file(build_filename, ROOT_SCOPE)?;
    let builddir = loader
        .graph
        .lookup_scoped(ROOT_SCOPE, "builddir")
        .filter(|d| !d.is_empty())
        .map(str::to_owned);
    Ok(Loaded {
        graph: loader.graph,
        defaults: loader.defaults,
        builddir,
    })
}

/// Load the manifest and open the persistent logs next to it (or under
/// `builddir` when set).
pub fn read(build_filename: &str) -> anyhow::Result<State> {
    let disk = RealDisk;
    let loaded = trace::scope("load manifest", || read_manifest(&disk, build_filename))?;
    let Loaded {
        mut graph,
        defaults,
        builddir,
    } = loaded;

    let prefix = match &builddir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|err| anyhow!("create builddir {}: {}", dir, err))?;
            format!("{}/", dir)
        }
        None => String::new(),
    };

    let log_path = format!("{}{}", prefix, BUILD_LOG_FILENAME);
    let mut build_log = BuildLog::new();
    trace::scope("load build log", || build_log.load(&log_path))?;
    build_log.open_for_write(&log_path)?;

    let deps_path = format!("{}{}", prefix, DEPS_LOG_FILENAME);
    let deps_log = trace::scope("load deps log", || DepsLog::open(&deps_path, &mut graph))?;

    Ok(State {
        graph,
        build_log,
        deps_log,
        defaults,
    })
}
