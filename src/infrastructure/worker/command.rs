//! Worker CLI invocation assembly.
//!
//! The wire-level target is a tool-equipped assistant CLI invoked in
//! streaming print mode. The prompt is always passed after a `--`
//! terminator so it is never interpreted as a flag.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::domain::ports::worker::WorkerLaunch;

/// Build the command for spawning or resuming a worker session.
pub fn build_worker_command(binary: &str, launch: &WorkerLaunch, resume: bool) -> Command {
    let mut cmd = Command::new(binary);
    cmd.current_dir(&launch.working_dir);
    cmd.arg("--print")
        .arg("--verbose")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--include-partial-messages");

    if resume {
        cmd.arg("--resume").arg(launch.session_id.to_string());
    } else {
        cmd.arg("--session-id").arg(launch.session_id.to_string());
    }

    if let Some(ref system_prompt) = launch.system_prompt {
        cmd.arg("--append-system-prompt").arg(system_prompt);
    }
    if !launch.allowed_tools.is_empty() {
        cmd.arg("--allowedTools").arg(launch.allowed_tools.join(","));
    }
    if let Some(max_turns) = launch.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }
    for dir in &launch.additional_dirs {
        cmd.arg("--add-dir").arg(dir);
    }

    cmd.arg("--").arg(&launch.prompt);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Build a single-shot oracle command with tools disabled.
pub fn build_oracle_command(
    binary: &str,
    working_dir: &Path,
    system_prompt: Option<&str>,
    prompt: &str,
) -> Command {
    let mut cmd = Command::new(binary);
    cmd.current_dir(working_dir);
    cmd.arg("--print")
        .arg("--verbose")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--allowedTools")
        .arg("")
        .arg("--max-turns")
        .arg("1");

    if let Some(system_prompt) = system_prompt {
        cmd.arg("--append-system-prompt").arg(system_prompt);
    }

    cmd.arg("--").arg(prompt);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}
