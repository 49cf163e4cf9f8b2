//! Build progress tracking and reporting, for the purpose of display to
//! the user.

use crate::graph::EdgeId;
use crate::task::{TaskResult, Termination};
use crate::terminal;
use crate::work::StateCounts;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as tasks progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a task starts.
    fn task_started(&mut self, id: EdgeId, message: &str);

    /// Called when a task completes.
    fn task_finished(&mut self, id: EdgeId, message: &str, result: &TaskResult);

    /// A console-pool task owns the terminal while it runs; any transient
    /// display must stay out of its way.
    fn console_locked(&mut self, locked: bool);

    /// Log a line of output without corrupting the progress display.
    /// The line persists beyond further progress updates, e.g. the output
    /// of a failing task.
    fn log(&mut self, msg: &str);

    /// Clear any transient display before returning to the shell.
    fn finish(&mut self);
}

/// Progress implementation for "dumb" console, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// The id of the last command printed, used to avoid printing it twice
    /// when we have two updates from the same command in a row.
    last_started: Option<EdgeId>,
}

impl DumbConsoleProgress {
    pub fn new() -> Self {
        Self { last_started: None }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn task_started(&mut self, id: EdgeId, message: &str) {
        self.log(message);
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: EdgeId, message: &str, result: &TaskResult) {
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Output is empty, or we just printed the command,
                    // don't print it again.
                } else {
                    self.log(message)
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", message)),
            Termination::Failure => self.log(&format!("failed: {}", message)),
        };
        if !result.output.is_empty() {
            std::io::stdout().write_all(&result.output).unwrap();
        }
    }

    fn console_locked(&mut self, _locked: bool) {
        // Nothing to hide.
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn finish(&mut self) {}
}

/// Progress implementation for "fancy" console, with a progress bar.
/// Each print clears from the cursor to the end of the console, prints the
/// status text, and then moves the cursor back up to the start position,
/// so on errors etc. we can clear any status by clearing the console too.
pub struct FancyConsoleProgress {
    state: Arc<Mutex<FancyState>>,
}

/// Screen updates happen after this duration passes, to reduce the amount
/// of printing in the case of rapid updates.  This helps with terminal
/// flicker.
const UPDATE_DELAY: Duration = Duration::from_millis(50);

impl FancyConsoleProgress {
    pub fn new() -> Self {
        let dirty_cond = Arc::new(Condvar::new());
        let state = Arc::new(Mutex::new(FancyState {
            done: false,
            dirty: false,
            dirty_cond: dirty_cond.clone(),
            paused: false,
            counts: StateCounts::default(),
            tasks: VecDeque::new(),
        }));

        // Thread to debounce status updates -- waits a bit, then prints
        // after any dirty state.
        std::thread::spawn({
            let state = state.clone();
            move || loop {
                // Wait to be notified of a display update, or timeout at
                // 500ms.  The timeout is for long-running build steps,
                // whose progress display shows how long they've been
                // running.
                {
                    let (state, _) = dirty_cond
                        .wait_timeout_while(
                            state.lock().unwrap(),
                            Duration::from_millis(500),
                            |state| !state.dirty,
                        )
                        .unwrap();
                    if state.done {
                        break;
                    }
                }

                // Delay a little bit in case more display updates come in.
                std::thread::sleep(UPDATE_DELAY);

                state.lock().unwrap().print_progress();
            }
        });

        FancyConsoleProgress { state }
    }
}

impl Progress for FancyConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.state.lock().unwrap().update(counts);
    }

    fn task_started(&mut self, id: EdgeId, message: &str) {
        self.state.lock().unwrap().task_started(id, message);
    }

    fn task_finished(&mut self, id: EdgeId, message: &str, result: &TaskResult) {
        self.state.lock().unwrap().task_finished(id, message, result);
    }

    fn console_locked(&mut self, locked: bool) {
        self.state.lock().unwrap().set_paused(locked);
    }

    fn log(&mut self, msg: &str) {
        self.state.lock().unwrap().log(msg);
    }

    fn finish(&mut self) {
        self.state.lock().unwrap().cleanup();
    }
}

impl Drop for FancyConsoleProgress {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Currently running build task, as tracked for progress updates.
struct Task {
    id: EdgeId,
    /// When the task started running.
    start: Instant,
    /// Build status message for the task.
    message: String,
}

struct FancyState {
    done: bool,
    dirty: bool,
    dirty_cond: Arc<Condvar>,
    /// True while a console task owns the terminal.
    paused: bool,

    /// Counts of tasks in each state.
    counts: StateCounts,
    /// Build tasks that are currently executing.
    /// Pushed to as tasks are started, so it's always in order of age.
    tasks: VecDeque<Task>,
}

impl FancyState {
    fn dirty(&mut self) {
        self.dirty = true;
        self.dirty_cond.notify_one();
    }

    fn update(&mut self, counts: &StateCounts) {
        self.counts = *counts;
        self.dirty();
    }

    fn task_started(&mut self, id: EdgeId, message: &str) {
        self.tasks.push_back(Task {
            id,
            start: Instant::now(),
            message: message.to_string(),
        });
        self.dirty();
    }

    fn task_finished(&mut self, id: EdgeId, message: &str, result: &TaskResult) {
        self.tasks
            .remove(self.tasks.iter().position(|t| t.id == id).unwrap());
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() {
                    // Common case: don't show anything.
                } else {
                    self.log(message)
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", message)),
            Termination::Failure => self.log(&format!("failed: {}", message)),
        };
        if !result.output.is_empty() {
            std::io::stdout().write_all(&result.output).unwrap();
        }
        self.dirty();
    }

    fn set_paused(&mut self, paused: bool) {
        if paused {
            self.clear_progress();
        }
        self.paused = paused;
        self.dirty();
    }

    fn log(&mut self, msg: &str) {
        self.clear_progress();
        println!("{}", msg);
        self.dirty();
    }

    fn cleanup(&mut self) {
        self.clear_progress();
        self.done = true;
        self.dirty(); // let thread quit
    }

    fn clear_progress(&self) {
        if self.paused {
            return;
        }
        // If the user hit ctl-c, it may have printed something on the
        // line.  So \r to go to first column first, then clear anything
        // below.
        std::io::stdout().write_all(b"\r\x1b[J").unwrap();
    }

    fn print_progress(&mut self) {
        if self.paused {
            self.dirty = false;
            return;
        }
        self.clear_progress();
        let mut progress_line = format!(
            "[{}] {}/{} done, ",
            progress_bar(&self.counts, 40),
            self.counts.finished(),
            self.counts.total()
        );
        if self.counts.failed > 0 {
            progress_line.push_str(&format!("{} failed, ", self.counts.failed));
        }
        progress_line.push_str(&format!(
            "{}/{} running",
            self.tasks.len(),
            self.counts.want + self.counts.running,
        ));
        println!("{}", progress_line);
        let mut lines = 1;

        let max_cols = terminal::get_cols().unwrap_or(80);
        let max_tasks = 8;
        let now = Instant::now();
        for task in self.tasks.iter().take(max_tasks) {
            let delta = now.duration_since(task.start).as_secs() as usize;
            println!("{}", task_message(&task.message, delta, max_cols));
            lines += 1;
        }

        if self.tasks.len() > max_tasks {
            let remaining = self.tasks.len() - max_tasks;
            println!("...and {} more", remaining);
            lines += 1;
        }

        // Move cursor up to the first printed line, for overprinting.
        print!("\x1b[{}A", lines);
        self.dirty = false;
    }
}

/// Format a task's status message to optionally include how long it has
/// been running and also to fit within a maximum number of terminal
/// columns.
fn task_message(message: &str, seconds: usize, max_cols: usize) -> String {
    let time_note = if seconds > 2 {
        format!(" ({}s)", seconds)
    } else {
        "".into()
    };
    let mut out = message.to_owned();
    if out.len() + time_note.len() >= max_cols {
        out.truncate(max_cols - time_note.len() - 3);
        out.push_str("...");
    }
    out.push_str(&time_note);
    out
}

/// Render a StateCounts as an ASCII progress bar.
fn progress_bar(counts: &StateCounts, bar_size: usize) -> String {
    let mut bar = String::with_capacity(bar_size);
    let mut sum: usize = 0;
    let total = counts.total();
    if total == 0 {
        return " ".repeat(bar_size);
    }
    for (count, ch) in [
        (counts.finished(), '='),
        (counts.running, '-'),
        (counts.want, ' '),
    ] {
        sum += count;
        let mut target_size = sum * bar_size / total;
        if count > 0 && target_size == bar.len() && target_size < bar_size {
            // Special case: for non-zero count, ensure we always get at
            // least one tick.
            target_size += 1;
        }
        while bar.len() < target_size {
            bar.push(ch);
        }
    }
    bar
}
