//! Shell sub-executor: runs a step's `run:` command in its own process
//! group, gives it a `GITHUB_OUTPUT`/`GITHUB_ENV` side channel the same way
//! GitHub Actions runners do, and polls for completion so a hung command
//! can be killed on timeout rather than blocking the job runner forever.

use std::fs;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::output::{ParsedSideChannel, ENV_SENTINEL, END_SENTINEL, OUTPUT_SENTINEL};
use flowrite_core::{FlowriteError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub side_channel: ParsedSideChannel,
    pub stderr: String,
}

impl ShellOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Builds the temp script the sub-executor runs: `set -e`, the two
/// side-channel temp files exported as `GITHUB_OUTPUT`/`GITHUB_ENV`, the
/// user's command, then the sentinel dump of both files.
fn build_script(command: &str, output_path: &std::path::Path, env_path: &std::path::Path) -> String {
    format!(
        "#!/bin/sh\nset -e\nexport GITHUB_OUTPUT=\"{output}\"\nexport GITHUB_ENV=\"{env}\"\n{command}\necho '{output_sentinel}'\ncat \"{output}\"\necho '{env_sentinel}'\ncat \"{env}\"\necho '{end_sentinel}'\n",
        output = output_path.display(),
        env = env_path.display(),
        command = command,
        output_sentinel = OUTPUT_SENTINEL,
        env_sentinel = ENV_SENTINEL,
        end_sentinel = END_SENTINEL,
    )
}

/// Runs `command` with a timeout, returning its side-channel outputs/env
/// and exit status. An empty or whitespace-only command is a no-op success
/// with nothing captured; it's never spawned.
pub fn execute(command: &str, timeout: Duration) -> Result<ShellOutcome> {
    if command.trim().is_empty() {
        return Ok(ShellOutcome {
            exit_code: Some(0),
            timed_out: false,
            side_channel: ParsedSideChannel::default(),
            stderr: String::new(),
        });
    }

    let output_file = tempfile::NamedTempFile::new().map_err(FlowriteError::Io)?;
    let env_file = tempfile::NamedTempFile::new().map_err(FlowriteError::Io)?;
    let output_path: PathBuf = output_file.path().to_path_buf();
    let env_path: PathBuf = env_file.path().to_path_buf();

    let script = build_script(command, &output_path, &env_path);
    let mut script_file = tempfile::NamedTempFile::new().map_err(FlowriteError::Io)?;
    script_file
        .write_all(script.as_bytes())
        .map_err(FlowriteError::Io)?;
    let script_path = script_file.path().to_path_buf();

    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script_path);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    // New process group, so a timeout kill takes any children the command
    // spawned down with it rather than leaving them orphaned.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(FlowriteError::Io)?;
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);

    let start = Instant::now();
    let timed_out = loop {
        match child.try_wait().map_err(FlowriteError::Io)? {
            Some(_) => break false,
            None => {
                if start.elapsed() >= timeout {
                    let _ = nix::sys::signal::killpg(pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = child.wait();
                    break true;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let output = child.wait_with_output().map_err(FlowriteError::Io)?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    let side_channel = crate::output::parse_sentinel_output(&stdout);
    let exit_code = if timed_out {
        None
    } else {
        output.status.code()
    };

    let _ = fs::remove_file(&output_path);
    let _ = fs::remove_file(&env_path);

    Ok(ShellOutcome {
        exit_code,
        timed_out,
        side_channel,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_simple_command_and_captures_stdout() {
        let outcome = execute("echo hello", Duration::from_secs(5)).unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.side_channel.user_stdout.trim(), "hello");
    }

    #[test]
    fn captures_github_output_assignments() {
        let outcome = execute(
            r#"echo "result=ok" >> "$GITHUB_OUTPUT""#,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(outcome.success());
        assert_eq!(
            outcome.side_channel.outputs.get("result"),
            Some(&"ok".to_string())
        );
    }

    #[test]
    fn captures_github_env_assignments() {
        let outcome = execute(
            r#"echo "STAGE=prod" >> "$GITHUB_ENV""#,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(outcome.success());
        assert_eq!(
            outcome.side_channel.env.get("STAGE"),
            Some(&"prod".to_string())
        );
    }

    #[test]
    fn nonzero_exit_is_reported_as_failure() {
        let outcome = execute("exit 3", Duration::from_secs(5)).unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[test]
    fn timeout_kills_the_command() {
        let outcome = execute("sleep 10", Duration::from_millis(200)).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[test]
    fn empty_command_is_a_no_op_success() {
        let outcome = execute("   ", Duration::from_secs(5)).unwrap();
        assert!(outcome.success());
    }
}
