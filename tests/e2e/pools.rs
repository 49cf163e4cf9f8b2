//! Tests for pool-constrained builds at the binary level.  Scheduling
//! order itself is covered by the plan unit tests; here we check pooled
//! builds complete and respect serialization observably.

use crate::*;

#[cfg(unix)]
#[test]
fn depth_one_pool_serializes_appends() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // Each task appends a start marker, sleeps, then appends an end
    // marker.  Under a depth-1 pool the markers can never interleave.
    space.write(
        "build.ninja",
        "
pool serial
  depth = 1
rule mark
  command = echo start >> trace.txt && sleep 0.05 && echo end >> trace.txt && touch $out
  pool = serial
  description = mark $out
build a: mark
build b: mark
build c: mark
",
    )?;
    space.run_expect(&mut joist_command(vec!["-j", "8", "a", "b", "c"]))?;

    let trace = space.read("trace.txt")?;
    let lines: Vec<&str> = std::str::from_utf8(&trace)?.lines().collect();
    assert_eq!(lines.len(), 6);
    for pair in lines.chunks(2) {
        assert_eq!(pair, ["start", "end"]);
    }
    Ok(())
}

#[test]
fn console_pool_build_completes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "
rule note
  command = touch $out
  pool = console
  description = note $out
build out: note in
",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    space.read("out")?;
    Ok(())
}

#[test]
fn unknown_pool_is_manifest_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule r
  command = touch $out
  pool = nosuch
build out: r
",
    )?;
    let run = space.run(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "unknown pool name 'nosuch'");
    assert_eq!(run.status.code(), Some(2));
    Ok(())
}
