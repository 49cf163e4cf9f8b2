//! Tests for discovered dependencies: depfiles and the deps log.

use crate::*;

#[cfg(unix)]
const CC_RULE: &str = "
rule cc
  command = touch $out && echo \"$out: hdr\" > $out.d
  depfile = $out.d
  deps = gcc
  description = cc $out
";

#[cfg(unix)]
#[test]
fn depfile_feeds_deps_log() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", &[CC_RULE, "build out: cc src", ""].join("\n"))?;
    space.write("src", "")?;
    space.write("hdr", "")?;

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    // The depfile is consumed into the deps log and removed.
    assert!(space.read("out.d").is_err());

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "no work to do");

    // Touching the discovered header triggers a rebuild even though the
    // manifest never mentions it.
    space.write("hdr", "changed")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");

    Ok(())
}

#[cfg(unix)]
#[test]
fn missing_depfile_fails_edge() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = touch $out
  depfile = $out.d
  deps = gcc
build out: cc src
",
    )?;
    space.write("src", "")?;
    // The command claims deps = gcc but never writes the depfile.
    let run = space.run(&mut joist_command(vec!["out"]))?;
    assert_eq!(run.status.code(), Some(1));
    Ok(())
}

#[cfg(unix)]
#[test]
fn depfile_without_deps_log() -> anyhow::Result<()> {
    // depfile alone (no deps= line) is re-read by the scanner each run.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = touch $out && echo \"$out: hdr\" > $out.d
  depfile = $out.d
  description = cc $out
build out: cc src
",
    )?;
    space.write("src", "")?;
    space.write("hdr", "")?;

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    // The depfile survives, and a fresh run consults it.
    assert!(space.read("out.d").is_ok());
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "no work to do");

    space.write("hdr", "changed")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");

    Ok(())
}

#[cfg(unix)]
#[test]
fn depfile_mentioning_wrong_output_is_fatal() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = touch $out
  depfile = $out.d
build foo.o: cc src
",
    )?;
    space.write("src", "")?;
    space.write("foo.o", "")?;
    space.write("foo.o.d", "bar.o: a.h\n")?;

    let run = space.run(&mut joist_command(vec!["foo.o"]))?;
    assert_output_contains(&run, "expected depfile 'foo.o.d' to mention 'foo.o', got 'bar.o'");
    assert_eq!(run.status.code(), Some(1));
    Ok(())
}

#[cfg(unix)]
#[test]
fn msvc_style_includes_from_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule echoinc
  command = echo \"Note: including file: hdr\" && touch $out
  deps = msvc
  description = echoinc $out
build out: echoinc src
",
    )?;
    space.write("src", "")?;
    space.write("hdr", "")?;

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    // The include note is consumed, not echoed.
    assert_output_not_contains(&run, "Note: including file");

    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "no work to do");

    space.write("hdr", "changed")?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");

    Ok(())
}
