//! Runs build tasks, potentially in parallel.
//! Unaware of the build graph, pools, etc.; just command execution.

use crate::graph::EdgeId;
#[cfg(unix)]
use anyhow::bail;
use std::sync::mpsc;
use std::time::Instant;

#[cfg(unix)]
use std::io::Write;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished tasks in
    /// different tracks in a performance trace.
    pub tid: usize,
    pub edge: EdgeId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

#[derive(PartialEq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing a build step.
pub struct TaskResult {
    pub termination: Termination,
    /// Console output.
    pub output: Vec<u8>,
}

/// The one-minute load average, used for `-l` throttling; None when the
/// platform doesn't expose one.
#[cfg(unix)]
pub fn current_load_average() -> Option<f64> {
    let mut avgs: [f64; 3] = [0.0; 3];
    // Safety: getloadavg fills in at most the three slots handed to it.
    let n = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if n < 1 {
        return None;
    }
    Some(avgs[0])
}

#[cfg(not(unix))]
pub fn current_load_average() -> Option<f64> {
    None
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_str().unwrap());
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Spawn the command via /bin/sh with stdout and stderr fed into a single
/// pipe.  Console tasks skip the pipe so the child inherits the terminal.
#[cfg(unix)]
fn run_command(cmdline: &str, console: bool) -> anyhow::Result<TaskResult> {
    use std::io::Read;

    // We don't use std::process because we want both stdout and stderr
    // going to the same pipe, preserving interleaving.
    let (pid, pipe) = unsafe {
        use libc::c_int;
        use std::os::fd::FromRawFd;

        let mut actions = PosixSpawnFileActions::new()?;
        let mut pipe_fds: Option<[c_int; 2]> = None;
        if !console {
            let mut pipe: [c_int; 2] = std::mem::zeroed();
            check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;
            // stdout/stderr => pipe
            actions.adddup2(pipe[1], 1)?;
            actions.adddup2(pipe[1], 2)?;
            // close pipe in child
            actions.addclose(pipe[0])?;
            actions.addclose(pipe[1])?;
            pipe_fds = Some(pipe);
        }

        let mut pid: libc::pid_t = 0;
        let path = "/bin/sh\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] = [
            path,
            "-c\0".as_ptr() as *const libc::c_char,
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        let spawn_result = libc::posix_spawn(
            &mut pid,
            path,
            actions.as_ptr(),
            std::ptr::null(),
            argv.as_ptr() as *const *mut libc::c_char,
            std::ptr::null(),
        );
        check_posix("posix_spawn", spawn_result)?;

        let read_pipe = match pipe_fds {
            Some(fds) => {
                // Close our copy of the write end so EOF arrives.
                check_posix("close", libc::close(fds[1]))?;
                Some(std::fs::File::from_raw_fd(fds[0]))
            }
            None => None,
        };

        (pid, read_pipe)
    };

    let mut output = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut output)?;
    }

    let status = unsafe {
        let mut status: i32 = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted").unwrap();
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }

    Ok(TaskResult {
        termination,
        output,
    })
}

#[cfg(windows)]
fn run_command(cmdline: &str, console: bool) -> anyhow::Result<TaskResult> {
    use std::process::Command;

    let mut cmd = Command::new("cmd");
    cmd.arg("/c").arg(cmdline);
    if console {
        let status = cmd.status()?;
        let termination = if status.success() {
            Termination::Success
        } else {
            Termination::Failure
        };
        return Ok(TaskResult {
            termination,
            output: Vec::new(),
        });
    }
    let out = cmd.output()?;
    let mut output = out.stdout;
    output.extend_from_slice(&out.stderr);
    Ok(TaskResult {
        termination: if out.status.success() {
            Termination::Success
        } else {
            Termination::Failure
        },
        output,
    })
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::default(),
            parallelism,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(&mut self, edge: EdgeId, cmdline: String, console: bool) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = run_command(&cmdline, console).unwrap_or_else(|err| TaskResult {
                termination: Termination::Failure,
                output: err.to_string().into_bytes(),
            });
            let finish = Instant::now();

            let task = FinishedTask {
                tid,
                edge,
                span: (start, finish),
                result,
            };
            // The send will only fail if the receiver disappeared, e.g. due
            // to shutting down.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Wait for a task to complete.  May block for a long time.
    pub fn wait(&mut self) -> FinishedTask {
        let task = self.finished_recv.recv().unwrap();
        self.tids.release(task.tid);
        self.running -= 1;
        task
    }
}
