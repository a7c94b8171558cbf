//! External tool invocation.
//!
//! Every stage runs its domain tool through the [`CommandExecutor`] trait:
//! one synchronous call with stdout/stderr redirected to per-stage log files
//! in the sample's output directory. Workers block for the tool's full
//! runtime; there is no timeout enforcement and no cancellation of a started
//! command. Tests substitute a scripted implementation of the trait.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

/// Errors that can occur while launching an external tool.
///
/// A tool that launches and exits nonzero is not an error at this layer;
/// the exit code is returned and failure policy is applied by the stage.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A stdout/stderr log file could not be opened.
    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The command could not be spawned or waited on.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A command line to execute: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Creates a command line for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument list.
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Where a command's stdout and stderr go.
///
/// Stage logs live next to the sample's other artifacts as
/// `<stage>.stdout` / `<stage>.stderr`. Multi-step stages append their later
/// steps to the same pair of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub append: bool,
}

impl Redirection {
    /// Log pair `<dir>/<stage>.stdout` / `<dir>/<stage>.stderr`, truncating
    /// any previous contents.
    pub fn truncate(dir: &Path, stage: &str) -> Self {
        Self {
            stdout: dir.join(format!("{stage}.stdout")),
            stderr: dir.join(format!("{stage}.stderr")),
            append: false,
        }
    }

    /// Same log pair, appending to existing contents.
    pub fn append(dir: &Path, stage: &str) -> Self {
        Self {
            append: true,
            ..Self::truncate(dir, stage)
        }
    }

    fn open(&self, path: &Path) -> Result<File, ExecError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!self.append)
            .append(self.append)
            .open(path)
            .map_err(|source| ExecError::LogFile {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Runs external commands with redirected stdio.
///
/// The single seam between the pipeline and the domain tools: stage workers
/// never touch `std::process` directly, so tests can drive the whole
/// pipeline with a scripted executor.
pub trait CommandExecutor: Send + Sync {
    /// Runs `cmd` synchronously with stdout/stderr redirected per `logs`,
    /// optionally in working directory `cwd`, and returns the exit code.
    ///
    /// A command terminated by a signal reports exit code -1.
    fn run(&self, cmd: &CommandLine, logs: &Redirection, cwd: Option<&Path>)
        -> Result<i32, ExecError>;
}

/// The production executor, backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(
        &self,
        cmd: &CommandLine,
        logs: &Redirection,
        cwd: Option<&Path>,
    ) -> Result<i32, ExecError> {
        let stdout = logs.open(&logs.stdout)?;
        let stderr = logs.open(&logs.stderr)?;

        let mut command = Command::new(cmd.program());
        command
            .args(cmd.arg_list())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let status = command.status().map_err(|source| ExecError::Spawn {
            program: cmd.program().to_string(),
            source,
        })?;

        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("p3-sra")
            .arg("--id")
            .arg("SRR0000001")
            .args(["--out", "/tmp/fq"]);
        assert_eq!(cmd.to_string(), "p3-sra --id SRR0000001 --out /tmp/fq");
        assert_eq!(cmd.program(), "p3-sra");
        assert_eq!(cmd.arg_list().len(), 4);
    }

    #[test]
    fn test_redirection_paths() {
        let r = Redirection::truncate(Path::new("/out"), "assemble");
        assert_eq!(r.stdout, Path::new("/out/assemble.stdout"));
        assert_eq!(r.stderr, Path::new("/out/assemble.stderr"));
        assert!(!r.append);

        let r = Redirection::append(Path::new("/out"), "annotate");
        assert!(r.append);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_captures_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let logs = Redirection::truncate(tmp.path(), "echo");
        let cmd = CommandLine::new("sh").args(["-c", "echo out; echo err >&2"]);

        let code = SystemExecutor.run(&cmd, &logs, None).expect("run");
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(&logs.stdout).expect("stdout"), "out\n");
        assert_eq!(fs::read_to_string(&logs.stderr).expect("stderr"), "err\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_append_mode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let first = Redirection::truncate(tmp.path(), "step");
        let second = Redirection::append(tmp.path(), "step");

        let one = CommandLine::new("sh").args(["-c", "echo one"]);
        let two = CommandLine::new("sh").args(["-c", "echo two"]);
        SystemExecutor.run(&one, &first, None).expect("first");
        SystemExecutor.run(&two, &second, None).expect("second");

        assert_eq!(
            fs::read_to_string(&first.stdout).expect("stdout"),
            "one\ntwo\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_nonzero_exit() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let logs = Redirection::truncate(tmp.path(), "fail");
        let cmd = CommandLine::new("sh").args(["-c", "exit 3"]);

        let code = SystemExecutor.run(&cmd, &logs, None).expect("run");
        assert_eq!(code, 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_respects_cwd() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let logs = Redirection::truncate(tmp.path(), "pwd");
        let cmd = CommandLine::new("sh").args(["-c", "touch here"]);

        SystemExecutor
            .run(&cmd, &logs, Some(tmp.path()))
            .expect("run");
        assert!(tmp.path().join("here").exists());
    }

    #[test]
    fn test_system_executor_missing_program() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let logs = Redirection::truncate(tmp.path(), "none");
        let cmd = CommandLine::new("definitely-not-a-real-tool-xyz");

        let err = SystemExecutor.run(&cmd, &logs, None).expect_err("spawn fails");
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }
}
