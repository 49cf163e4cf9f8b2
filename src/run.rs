//! Command-line entry point: flag parsing and top-level build driving.

use crate::disk::RealDisk;
use crate::explain;
use crate::graph::NodeId;
use crate::load;
use crate::progress::{DumbConsoleProgress, FancyConsoleProgress, Progress};
use crate::signal;
use crate::terminal;
use crate::trace;
use crate::work::{Options, Work};
use anyhow::{anyhow, bail};

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// joist, a parallel build engine driven by ninja-style manifests
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "String::from(\"build.ninja\")")]
    build_file: String,

    /// debugging tools; use -d list to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N commands fail (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// do not start new commands while the load average exceeds N
    #[argh(option, short = 'l')]
    max_load: Option<f64>,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> anyhow::Result<usize> {
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

fn build_options(opts: &Opts) -> anyhow::Result<Options> {
    Ok(Options {
        parallelism: match opts.parallelism {
            Some(p) => p,
            None => default_parallelism()?,
        },
        failures_allowed: if opts.keep_going == 0 {
            usize::MAX
        } else {
            opts.keep_going
        },
        max_load_average: opts.max_load,
        verbose: opts.verbose,
    })
}

/// Targets to build when none were requested: the manifest's defaults, or
/// failing that every root output (one no other edge consumes).
fn default_targets(state: &load::State) -> Vec<NodeId> {
    if !state.defaults.is_empty() {
        return state.defaults.clone();
    }
    let graph = &state.graph;
    graph
        .nodes
        .ids()
        .filter(|&id| {
            let node = graph.node(id);
            node.in_edge.is_some() && node.out_edges.is_empty()
        })
        .collect()
}

fn make_work<'a>(
    state: load::State,
    opts: &Opts,
    progress: &'a mut dyn Progress,
) -> anyhow::Result<Work<'a>> {
    Ok(Work::new(
        state.graph,
        state.build_log,
        state.deps_log,
        Box::new(RealDisk),
        build_options(opts)?,
        progress,
    ))
}

fn build(
    progress: &mut dyn Progress,
    opts: &Opts,
    state: load::State,
    check_regen: bool,
) -> anyhow::Result<Option<usize>> {
    let defaults = default_targets(&state);
    let mut work = make_work(state, opts, &mut *progress)?;

    // If we know how to regenerate the manifest, bring it up to date
    // before building anything against it.
    if check_regen {
        if let Some(manifest) = work.is_build_target(&opts.build_file) {
            work.want_node(manifest)?;
            match trace::scope("work.run", || work.run())? {
                None => return Ok(None),
                Some(0) => {
                    // Manifest already up to date; keep the scanned state.
                }
                Some(_) => {
                    // Regenerated the manifest; reload and start over.
                    drop(work);
                    let state = load::read(&opts.build_file)?;
                    return build(progress, opts, state, false);
                }
            }
        }
    }

    if !opts.targets.is_empty() {
        for name in &opts.targets {
            work.want_file(name)?;
        }
    } else {
        for node in defaults {
            work.want_node(node)?;
        }
    }

    trace::scope("work.run", || work.run())
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  explain  log why commands re-run");
                println!("  trace    generate json performance trace");
                return Ok(1);
            }
            "explain" => explain::enable(),
            "trace" => trace::open("trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register_sigint();

    let state = match load::read(&opts.build_file) {
        Ok(state) => state,
        Err(err) => {
            println!("joist: error: {}", err);
            return Ok(2);
        }
    };

    let mut progress: Box<dyn Progress> = if terminal::use_fancy() {
        Box::new(FancyConsoleProgress::new())
    } else {
        Box::new(DumbConsoleProgress::new())
    };

    let result = build(progress.as_mut(), &opts, state, true);
    progress.finish();
    match result? {
        None => {
            // The failing task's output is enough of a summary.
            Ok(1)
        }
        Some(0) => {
            println!("joist: no work to do");
            Ok(0)
        }
        Some(n) => {
            println!(
                "joist: ran {} task{}, now up to date",
                n,
                if n == 1 { "" } else { "s" }
            );
            Ok(0)
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}
