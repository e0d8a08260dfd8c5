//! Child-process driving for the build driver.
//!
//! Compile and link invocations run as OS child processes, up to a fixed
//! number concurrently. The driver works in waves: it spawns until it hits
//! the cap, waits for the whole wave to close, then continues. Child stdio
//! is inherited so compiler diagnostics reach the user directly.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {executable}: {message}")]
    Spawn { executable: String, message: String },
    #[error("failed waiting for {executable}: {message}")]
    Wait { executable: String, message: String },
}

/// Outcome of one command: its exit code, or why it could not run.
pub type ProcessStatus = Result<i32, ProcessError>;

/// Runs every command, never keeping more than `max_concurrent` children
/// alive at once. Results are keyed by the caller-provided tag so waves can
/// be matched back to build objects regardless of completion order.
pub fn run_capped(
    commands: Vec<(usize, Command)>,
    max_concurrent: usize,
) -> Vec<(usize, ProcessStatus)> {
    assert!(max_concurrent > 0, "concurrency cap must be positive");

    let mut results = Vec::with_capacity(commands.len());
    let mut wave = Vec::new();

    for (tag, mut command) in commands {
        let executable = command.get_program().to_string_lossy().into_owned();
        debug!(target: "build_process", command = ?command, "spawning");
        match command.spawn() {
            Ok(child) => wave.push((tag, executable, child)),
            Err(error) => results.push((
                tag,
                Err(ProcessError::Spawn {
                    executable,
                    message: error.to_string(),
                }),
            )),
        }

        if wave.len() >= max_concurrent {
            drain_wave(&mut wave, &mut results);
        }
    }

    drain_wave(&mut wave, &mut results);
    results
}

fn drain_wave(
    wave: &mut Vec<(usize, String, std::process::Child)>,
    results: &mut Vec<(usize, ProcessStatus)>,
) {
    for (tag, executable, mut child) in wave.drain(..) {
        let status = match child.wait() {
            Ok(status) => Ok(status.code().unwrap_or(-1)),
            Err(error) => Err(ProcessError::Wait {
                executable,
                message: error.to_string(),
            }),
        };
        results.push((tag, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[cfg(unix)]
    #[test]
    fn every_command_completes_even_past_the_cap() {
        let commands: Vec<(usize, Command)> = (0..5).map(|tag| (tag, shell("exit 0"))).collect();
        let mut results = run_capped(commands, 2);
        results.sort_by_key(|(tag, _)| *tag);
        assert_eq!(results.len(), 5);
        for (_, status) in results {
            assert_eq!(status.unwrap(), 0);
        }
    }

    #[cfg(unix)]
    #[test]
    fn exit_codes_are_reported_per_command() {
        let commands = vec![(0, shell("exit 0")), (1, shell("exit 3"))];
        let mut results = run_capped(commands, 8);
        results.sort_by_key(|(tag, _)| *tag);
        assert_eq!(results[0].1.as_ref().unwrap(), &0);
        assert_eq!(results[1].1.as_ref().unwrap(), &3);
    }

    #[test]
    fn missing_executables_surface_as_spawn_errors() {
        let commands = vec![(0, Command::new("/nonexistent/definitely-not-a-compiler"))];
        let results = run_capped(commands, 1);
        assert!(matches!(
            results[0].1,
            Err(ProcessError::Spawn { .. })
        ));
    }
}
