use anyhow::Result;
use sim_core::SimError;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Runs `cmd` to completion and returns its combined stdout and stderr.
/// A spawn failure or non-zero exit becomes `ExternalProcessFailure`
/// carrying whatever the process printed.
pub fn run_captured(mut cmd: Command) -> Result<String> {
    let program = describe(&cmd);
    debug!(command = %program, "running external process");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let output = match cmd.output() {
        Ok(output) => output,
        Err(err) => {
            return Err(SimError::ExternalProcessFailure {
                program,
                status: "not started".to_string(),
                output: err.to_string(),
            }
            .into())
        }
    };
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(SimError::ExternalProcessFailure {
            program,
            status: output.status.to_string(),
            output: text,
        }
        .into());
    }
    Ok(text)
}

/// `HEAD` of the git checkout containing `dir`, if any.
pub fn git_revision(dir: &Path) -> Option<String> {
    let dir = if dir.is_dir() { dir } else { dir.parent()? };
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if rev.is_empty() {
        None
    } else {
        Some(rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_process_surfaces_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo partial-output; echo boom >&2; exit 3"]);
        let err = run_captured(cmd).expect_err("exit 3");
        match err.downcast_ref::<SimError>() {
            Some(SimError::ExternalProcessFailure { output, status, .. }) => {
                assert!(output.contains("partial-output"));
                assert!(output.contains("boom"));
                assert!(status.contains('3'), "{}", status);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_program_is_external_failure() {
        let err = run_captured(Command::new("definitely-not-a-real-binary-xyz"))
            .expect_err("spawn fails");
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::ExternalProcessFailure { .. })
        ));
    }

    #[test]
    fn successful_process_returns_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        assert_eq!(run_captured(cmd).expect("run").trim(), "hello");
    }
}
