//! Tests for behavior around missing files.

use crate::*;

#[test]
fn missing_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;

    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_output_contains(
        &out,
        "'in', needed by 'out', missing and no known rule to make it",
    );
    assert_eq!(out.status.code(), Some(1));

    Ok(())
}

#[test]
fn missing_generated() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            ECHO_RULE,
            "build mid: echo",      // never writes its output
            "build out: touch mid", // consumes the never-written output
            "",
        ]
        .join("\n"),
    )?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "echo mid");
    assert_output_contains(&out, "touch out");

    Ok(())
}

#[test]
fn missing_phony_order_only_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build order_only: phony",        // never writes its output
            "build out: touch || order_only", // orders against it anyway
            "",
        ]
        .join("\n"),
    )?;

    space.run_expect(&mut joist_command(vec!["out"]))?;
    space.read("out")?;

    Ok(())
}

#[test]
fn phony_output_on_disk() -> anyhow::Result<()> {
    // A phony rule targeting a real file marks "don't fail the build if
    // this file is missing"; it must not defeat up-to-date checking.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build out: touch | phony_file",
            "build phony_file: phony",
            "",
        ]
        .join("\n"),
    )?;

    // Despite being a target of a phony rule, the file exists on disk.
    space.write("phony_file", "")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_command_fails_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = false
  description = fail $out
build out: fail
",
    )?;
    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "failed: fail out");
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}

#[cfg(unix)]
#[test]
fn keep_going_runs_other_work() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "
rule fail
  command = false
  description = fail $out
build bad: fail
build good: touch
build all: phony bad good
",
        ]
        .join("\n"),
    )?;
    // With -k 2 the failure doesn't stop the independent target.
    let out = space.run(&mut joist_command(vec!["-k", "2", "-j", "1", "all"]))?;
    assert_output_contains(&out, "failed: fail bad");
    assert_eq!(out.status.code(), Some(1));
    space.read("good")?;
    Ok(())
}
