//! Tests for restat rules: commands that may leave their outputs
//! untouched, suppressing downstream rebuilds.

use crate::*;

#[cfg(unix)]
#[test]
fn unchanged_output_stops_cascade() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy_if_changed
  command = if ! cmp -s $in $out; then cp $in $out; fi
  restat = 1
  description = maybe-copy $out
rule copy
  command = cp $in $out
  description = copy $out
build mid: copy_if_changed in
build out: copy mid
",
    )?;
    space.write("in", "hello")?;

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 2 tasks");
    assert_eq!(space.read("out")?, b"hello");

    // Rewrite the input with identical content: the copy_if_changed step
    // runs but leaves mid alone, so the downstream copy is cleaned.
    space.write("in", "hello")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");

    // A third run has nothing to do at all: the restat mtime recorded in
    // the log covers the input's timestamp.
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "no work to do");

    // Actually changing the input flows all the way through.
    space.write("in", "goodbye")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 2 tasks");
    assert_eq!(space.read("out")?, b"goodbye");

    Ok(())
}
