//! Checked execution of external networking tools
//!
//! All kernel state mutations go through the stock userspace tools
//! (`iptables`/`ip6tables`, `ipset`, `ip`), driven as child processes. This
//! keeps the daemon portable across router firmwares that ship different
//! kernel/netlink feature sets but always carry the tools themselves.

use std::process::Output;

use tokio::process::Command;

use crate::error::NetfilterError;

/// Result of a finished child process
#[derive(Debug)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    fn from_output(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Run a tool to completion, capturing output
///
/// Only spawn failures surface as `Err`; a non-zero exit is reported in the
/// returned [`CmdOutput`] so callers can decide which exit conditions are
/// benign (e.g. `-C` probes, "already exists").
pub async fn run(program: &str, args: &[&str]) -> Result<CmdOutput, NetfilterError> {
    tracing::trace!(program, ?args, "exec");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| NetfilterError::Spawn {
            program: program.to_string(),
            source,
        })?;
    Ok(CmdOutput::from_output(output))
}

/// Run a tool and require a zero exit status
pub async fn run_checked(program: &str, args: &[&str]) -> Result<String, NetfilterError> {
    let out = run(program, args).await?;
    if out.success {
        Ok(out.stdout)
    } else {
        Err(command_error(program, args, &out))
    }
}

/// Build the error for a failed invocation
pub fn command_error(program: &str, args: &[&str], out: &CmdOutput) -> NetfilterError {
    NetfilterError::Command {
        program: program.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        stderr: out.stderr.trim().to_string(),
    }
}
