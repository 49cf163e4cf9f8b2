pub mod build_log;
pub mod canon;
pub mod densemap;
pub mod depfile;
pub mod deps_log;
pub mod disk;
pub mod eval;
pub mod explain;
pub mod graph;
pub mod load;
pub mod parse;
pub mod plan;
pub mod progress;
pub mod run;
pub mod scan;
pub mod scanner;
mod signal;
pub mod smallmap;
pub mod task;
mod terminal;
pub mod trace;
pub mod work;

#[cfg(test)]
pub mod testing;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
