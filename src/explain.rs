//! Debug logging of why the scanner decided an edge must re-run,
//! enabled with `-d explain`.

use std::sync::atomic::{AtomicBool, Ordering};

static EXPLAINING: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    EXPLAINING.store(true, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    EXPLAINING.load(Ordering::Relaxed)
}

/// Print a scanner decision to stderr when `-d explain` is on.
#[macro_export]
macro_rules! explain {
    ($($arg:tt)*) => {
        if $crate::explain::enabled() {
            eprintln!("explain: {}", format_args!($($arg)*));
        }
    };
}
