//! Process execution for the exec-backed collaborators.

use tokio::process::Command;
use tracing::debug;

use super::HostError;

/// Run a command and return its stdout, failing on a non-zero exit.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, HostError> {
    debug!(program, args = %args.join(" "), "Running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| HostError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HostError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command used as a predicate: exit 0 is true, any other exit is
/// false. Failing to spawn is still an error.
pub(crate) async fn succeeds(program: &str, args: &[&str]) -> Result<bool, HostError> {
    let status = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| HostError::Spawn {
            program: program.to_string(),
            source,
        })?
        .status;
    Ok(status.success())
}

/// Run `ip` in the root namespace or inside `netns`.
pub(crate) async fn run_ip(netns: Option<&str>, args: &[&str]) -> Result<String, HostError> {
    match netns {
        None => run("ip", args).await,
        Some(ns) => {
            let mut full = vec!["-n", ns];
            full.extend_from_slice(args);
            run("ip", &full).await
        }
    }
}

/// Run a program inside `netns` via `ip netns exec`, or directly.
pub(crate) async fn run_in(
    netns: Option<&str>,
    program: &str,
    args: &[&str],
) -> Result<String, HostError> {
    match netns {
        None => run(program, args).await,
        Some(ns) => {
            let mut full = vec!["netns", "exec", ns, program];
            full.extend_from_slice(args);
            run("ip", &full).await
        }
    }
}

/// Predicate form of [`run_in`].
pub(crate) async fn succeeds_in(
    netns: Option<&str>,
    program: &str,
    args: &[&str],
) -> Result<bool, HostError> {
    match netns {
        None => succeeds(program, args).await,
        Some(ns) => {
            let mut full = vec!["netns", "exec", ns, program];
            full.extend_from_slice(args);
            succeeds("ip", &full).await
        }
    }
}
