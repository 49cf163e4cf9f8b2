//! Tests for generator rules regenerating the manifest itself.

use crate::*;

#[cfg(unix)]
#[test]
fn generator_manifest_rebuilds_and_reloads() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "gen.sh",
        "
cat >build.ninja <<EOT
rule regen
  command = sh ./gen.sh
  generator = 1
  description = regen build.ninja
build build.ninja: regen gen.sh
rule touch
  command = touch \\$out
build out: touch
EOT
",
    )?;

    // Generate the initial build.ninja.
    space.run_expect(std::process::Command::new("sh").args(vec!["./gen.sh"]))?;

    // First build: the manifest is newer than its input, and generator
    // rules ignore the missing log entry, so only `out` runs.
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "ran 1 task");
    space.read("out")?;

    // Everything up to date now.
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "no work to do");

    // Touching the generator's input regenerates the manifest first, then
    // the requested target is checked against the fresh manifest.
    space.run_expect(std::process::Command::new("touch").args(vec!["gen.sh"]))?;
    let run = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&run, "regen build.ninja");

    Ok(())
}
