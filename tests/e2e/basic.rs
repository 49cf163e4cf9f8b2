use crate::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run(&mut joist_command(vec![]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "joist: no work to do\n");
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());

    // A second build has nothing left to do.
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    Ok(())
}

#[test]
fn default_targets_from_manifest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build a: touch", "build b: touch", "default b", ""].join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec![]))?;
    assert!(space.read("b").is_ok());
    assert!(space.read("a").is_err());
    Ok(())
}

#[test]
fn root_targets_when_no_default() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch mid", "build mid: touch", ""].join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec![]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // A build rule whose output needs its directory created first.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());

    Ok(())
}

#[test]
fn specify_build_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build_specified.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["-f", "build_specified.ninja", "out"]))?;
    assert!(space.read("out").is_ok());

    Ok(())
}

#[test]
fn repeated_out_is_manifest_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build dup dup: touch in",
            "build out: touch dup",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "is repeated in output list");
    assert_eq!(out.status.code(), Some(2));

    Ok(())
}

#[cfg(unix)]
#[test]
fn generate_rsp_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = 1 $in 2 $in_newline 3

rule litter
  command = cat make/me/${out}.rsp > ${out}
  rspfile = make/me/${out}.rsp
  rspfile_content = random stuff

rule touch
  command = touch $out

build main: cat foo bar baz in
build foo: litter bar
build bar: touch baz
build baz: touch in
",
    )?;
    space.write("in", "go!")?;

    let _ = space.run_expect(&mut joist_command(vec!["main"]))?;

    // The 'main' and 'foo' targets copy the contents of their rsp file to
    // their output.
    let main_rsp = space.read("main").unwrap();
    assert_eq!(main_rsp, b"1 foo bar baz in 2 foo\nbar\nbaz\nin 3");
    let foo_rsp = space.read("foo").unwrap();
    assert_eq!(foo_rsp, b"random stuff");

    // The 'make/me' directory was created when writing an rsp file.
    let meta = space.metadata("make/me").unwrap();
    assert!(meta.is_dir());

    // Run again: everything should be up to date.
    let out = space.run_expect(&mut joist_command(vec!["main"]))?;
    assert_output_contains(&out, "no work");

    Ok(())
}

#[cfg(unix)]
#[test]
fn command_changes_trigger_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule emit\n  command = echo one > $out\nbuild out: emit\n",
    )?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_eq!(space.read("out")?, b"one\n");

    space.write(
        "build.ninja",
        "rule emit\n  command = echo two > $out\nbuild out: emit\n",
    )?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    assert_eq!(space.read("out")?, b"two\n");

    Ok(())
}

#[cfg(unix)]
#[test]
fn explain_logs_reasons() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run(&mut joist_command(vec!["-d", "explain", "out"]))?;
    assert!(out.status.success());
    assert_stderr_contains(&out, "explain: output out doesn't exist");
    Ok(())
}

// Phony depending on phony still builds the real leaves.
#[test]
fn phony_depends() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "
build out1: touch
build out2: phony out1
build out3: phony out2
",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec!["out3"]))?;
    space.read("out1")?;
    Ok(())
}

// builddir controls where the logs are written.
#[test]
fn builddir() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "builddir = foo",
            TOUCH_RULE,
            "build $builddir/bar: touch",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec!["foo/bar"]))?;
    space.read("foo/.joist_log")?;
    space.read("foo/.joist_deps")?;
    Ok(())
}

#[test]
fn bad_rule_variable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule my_rule
    command = touch $out
    my_var = foo

build out: my_rule
",
    )?;

    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "unexpected variable \"my_var\"");
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}

#[cfg(unix)]
#[test]
fn deps_evaluate_build_bindings() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule touch
    command = touch $out
rule copy
    command = cp $in $out
build foo: copy ${my_dep}
    my_dep = bar
build bar: touch
",
    )?;
    space.run_expect(&mut joist_command(vec!["foo"]))?;
    space.read("foo")?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn looks_up_values_from_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule copy_rspfile
    command = cp $rspfile $out
    rspfile = $out.rsp
    rspfile_content = Hello, world!

build foo: copy_rspfile
",
    )?;
    space.run_expect(&mut joist_command(vec!["foo"]))?;
    assert_eq!(space.read("foo")?, b"Hello, world!");
    Ok(())
}

#[cfg(unix)]
#[test]
fn unicode_filename() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "
rule echo
  description = unicode variable: $in
  command = echo unicode command line: $in && touch $out
",
            "build out: echo reykjavík.md",
            "",
        ]
        .join("\n"),
    )?;
    space.write("reykjavík.md", "")?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "unicode variable: reykjavík.md");
    assert_output_contains(&out, "unicode command line: reykjavík.md");

    Ok(())
}

#[test]
fn dependency_cycle_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat $in > $out
build a: cat b
build b: cat c
build c: cat a
",
    )?;
    let out = space.run(&mut joist_command(vec!["a"]))?;
    assert_output_contains(&out, "dependency cycle: a -> b -> c -> a");
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}
