/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! External command execution behind a trait so that the install flows can be
//! driven by a fake in tests.

use std::{
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use tracing::debug;

/// Captured result of a finished external command.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub success: bool,
    /// Output lines in the order they were produced.
    pub lines: Vec<String>,
}

/// Runs external helper scripts on behalf of an install session. All flows go
/// through this seam; nothing else in the crate spawns processes.
pub trait CommandExecutor {
    /// Run `command` with `dir` as the working directory and the given extra
    /// environment variables, capturing its output.
    fn run(&self, dir: &Path, command: &str, env: &[(&str, String)]) -> io::Result<CommandOutput>;

    /// Like [`CommandExecutor::run`], but stream `input` into the child's
    /// stdin while draining its output. Feeding and draining must progress
    /// independently or a child that interleaves reads and writes deadlocks
    /// once a pipe buffer fills.
    fn run_with_input(
        &self,
        dir: &Path,
        command: &str,
        env: &[(&str, String)],
        input: &mut (dyn Read + Send),
    ) -> io::Result<CommandOutput>;
}

/// [`CommandExecutor`] backed by a real shell.
#[derive(Clone, Debug)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/system/bin/sh"),
        }
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn command(&self, dir: &Path, command: &str, env: &[(&str, String)]) -> Command {
        debug!("Running command in {dir:?}: {command}");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(dir);

        for (key, value) in env {
            cmd.env(key, value);
        }

        cmd
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::to_owned)
        .collect()
}

impl CommandExecutor for ShellExecutor {
    fn run(&self, dir: &Path, command: &str, env: &[(&str, String)]) -> io::Result<CommandOutput> {
        let output = self.command(dir, command, env).output()?;

        let mut lines = split_lines(&output.stdout);
        lines.extend(split_lines(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            lines,
        })
    }

    fn run_with_input(
        &self,
        dir: &Path,
        command: &str,
        env: &[(&str, String)],
        input: &mut (dyn Read + Send),
    ) -> io::Result<CommandOutput> {
        let mut child = self
            .command(dir, command, env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Unwrapping is safe because all three pipes were requested.
        let mut stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut stderr = child.stderr.take().unwrap();

        let mut lines = Vec::new();

        let (feed_result, stderr_raw) = thread::scope(|scope| {
            let feeder = scope.spawn(move || {
                let result = io::copy(input, &mut stdin);
                // Dropping stdin closes the pipe so the child sees EOF.
                drop(stdin);
                result
            });
            let drainer = scope.spawn(move || {
                let mut raw = Vec::new();
                stderr.read_to_end(&mut raw).map(|_| raw)
            });

            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => lines.push(line),
                    Err(_) => break,
                }
            }

            (feeder.join().unwrap(), drainer.join().unwrap())
        });

        let status = child.wait()?;

        // A child may legitimately exit without consuming all of its input.
        if let Err(e) = feed_result {
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }

        if let Ok(raw) = stderr_raw {
            lines.extend(split_lines(&raw));
        }

        Ok(CommandOutput {
            success: status.success(),
            lines,
        })
    }
}
