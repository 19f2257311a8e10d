use anyhow::{anyhow, Context, Result};
use log::*;
use std::ffi::OsString;

#[cfg(test)]
use mockall::automock;

/// Seam for every external program this tool runs. Production code goes
/// through [`SystemCommander`]; `--dry-run` swaps in [`DryRunCommander`];
/// tests mock the trait and assert exact argument vectors.
#[cfg_attr(test, automock)]
pub trait Commander {
    /// Runs a read-only command and returns captured stdout.
    fn run(&self, argv: Vec<OsString>) -> Result<String>;

    /// Runs a command that changes filesystem state. Same as [`run`] for the
    /// system implementation; skipped and logged under dry-run.
    fn run_mutating(&self, argv: Vec<OsString>) -> Result<String>;

    /// Streams stdout of `producer` into stdin of `consumer` without
    /// buffering the payload, and returns the combined stderr of both for
    /// log capture. Mutating by nature.
    fn run_piped(&self, producer: Vec<OsString>, consumer: Vec<OsString>) -> Result<Vec<u8>>;

    /// Whether mutating operations are being skipped.
    fn is_dry_run(&self) -> bool;
}

pub fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn duct_expression(argv: &[OsString]) -> Result<duct::Expression> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    Ok(duct::cmd(program.clone(), args.iter().cloned()))
}

/// Executes commands with `duct`, the same way the rest of the system shells
/// out to `btrfs`.
pub struct SystemCommander;

impl Commander for SystemCommander {
    fn run(&self, argv: Vec<OsString>) -> Result<String> {
        trace!("run: {}", display_argv(&argv));
        duct_expression(&argv)?
            .read()
            .context(format!("Failed to run `{}`.", display_argv(&argv)))
    }

    fn run_mutating(&self, argv: Vec<OsString>) -> Result<String> {
        self.run(argv)
    }

    fn run_piped(&self, producer: Vec<OsString>, consumer: Vec<OsString>) -> Result<Vec<u8>> {
        trace!(
            "run piped: {} | {}",
            display_argv(&producer),
            display_argv(&consumer)
        );
        let output = duct_expression(&producer)?
            .pipe(duct_expression(&consumer)?)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .context(format!(
                "Failed to spawn `{} | {}`.",
                display_argv(&producer),
                display_argv(&consumer)
            ))?;
        if output.status.success() {
            Ok(output.stderr)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(match stderr.trim().is_empty() {
                true => anyhow!(
                    "`{} | {}` exited non-zero without stderr output",
                    display_argv(&producer),
                    display_argv(&consumer)
                ),
                false => anyhow!("{}", stderr.trim()),
            })
        }
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Logs every mutating invocation instead of executing it. Read-only
/// commands still run so enumeration and preflight stay accurate.
pub struct DryRunCommander {
    inner: SystemCommander,
}

impl DryRunCommander {
    pub fn new() -> Self {
        Self {
            inner: SystemCommander,
        }
    }
}

impl Commander for DryRunCommander {
    fn run(&self, argv: Vec<OsString>) -> Result<String> {
        self.inner.run(argv)
    }

    fn run_mutating(&self, argv: Vec<OsString>) -> Result<String> {
        info!("DRY-RUN: {}", display_argv(&argv));
        Ok(String::new())
    }

    fn run_piped(&self, producer: Vec<OsString>, consumer: Vec<OsString>) -> Result<Vec<u8>> {
        info!(
            "DRY-RUN: {} | {}",
            display_argv(&producer),
            display_argv(&consumer)
        );
        Ok(Vec::new())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<OsString> {
        parts.iter().map(OsString::from).collect()
    }

    #[test]
    fn display_joins_arguments() {
        assert_eq!(
            display_argv(&argv(&["btrfs", "subvolume", "list"])),
            "btrfs subvolume list"
        );
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert!(SystemCommander.run(Vec::new()).is_err());
    }

    #[test]
    fn dry_run_skips_mutating_commands() {
        let commander = DryRunCommander::new();
        assert!(commander.is_dry_run());
        assert_eq!(
            commander
                .run_mutating(argv(&["btrfs", "subvolume", "delete", "/nope"]))
                .unwrap(),
            ""
        );
        assert!(commander
            .run_piped(
                argv(&["btrfs", "send", "/nope"]),
                argv(&["btrfs", "receive", "/nowhere"])
            )
            .unwrap()
            .is_empty());
    }
}
