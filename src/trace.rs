//! Chrome trace output, enabled with `-d trace`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

static mut TRACE: Option<Trace> = None;

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }},\n",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros()
        )
    }

    fn scope<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.write_complete(name, 0, start, Instant::now()).unwrap();
        result
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", 0, start, Instant::now())?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

fn get() -> Option<&'static mut Trace> {
    // Safety: accessing global mut, not threadsafe; only touched from the
    // orchestrator thread.
    unsafe { (*std::ptr::addr_of_mut!(TRACE)).as_mut() }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    // Safety: accessing global mut, not threadsafe.
    unsafe {
        TRACE = Some(trace);
    }
    Ok(())
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    match get() {
        None => f(),
        Some(t) => t.scope(name, f),
    }
}

/// Record a completed task span on a given track.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    if let Some(t) = get() {
        t.write_complete(name, tid, start, end).unwrap();
    }
}

pub fn close() -> std::io::Result<()> {
    match get() {
        Some(t) => t.close(),
        None => Ok(()),
    }
}
