//! External command execution for steps.
//!
//! Commands run synchronously. There is no timeout: a hung tool stalls the
//! chain until it exits.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::{Error, Result};

/// Captured result of [`Cmd::output`].
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder around [`std::process::Command`] that reports failures as
/// [`Error::CommandFailed`] attributed to a step.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    step: String,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            step: String::from("<host>"),
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Append `flag value` only when `value` is present.
    pub fn opt_arg(self, flag: &str, value: Option<impl AsRef<OsStr>>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub(crate) fn for_step(mut self, step: &str) -> Self {
        self.step = step.to_string();
        self
    }

    /// Return the output instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Rendered command line, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run with inherited stdio; the tool's own output goes to the terminal.
    pub fn run(self) -> Result<ExitStatus> {
        let mut command = self.build()?;
        tracing::debug!(step = %self.step, command = %self.display(), "running");
        let status = command
            .stdin(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(e))?;
        self.check(status)?;
        Ok(status)
    }

    /// Run with captured stdout/stderr.
    pub fn output(self) -> Result<CmdOutput> {
        let mut command = self.build()?;
        tracing::debug!(step = %self.step, command = %self.display(), "running (captured)");
        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;
        self.check(output.status)?;
        Ok(CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn build(&self) -> Result<Command> {
        let program = which::which(&self.program).map_err(|_| {
            Error::execution(
                &self.step,
                format!(
                    "command '{}' not found in PATH",
                    self.program.to_string_lossy()
                ),
            )
        })?;

        let mut command = Command::new(program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        Ok(command)
    }

    fn check(&self, status: ExitStatus) -> Result<()> {
        if status.success() || self.allow_fail {
            return Ok(());
        }
        Err(Error::CommandFailed {
            step: self.step.clone(),
            command: self.display(),
            status,
        })
    }

    fn spawn_error(&self, err: std::io::Error) -> Error {
        Error::execution(
            &self.step,
            format!("failed to spawn `{}`: {err}", self.display()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn successful_command_runs_in_cwd() {
        let temp = TempDir::new().unwrap();
        Cmd::new("touch")
            .arg("marker")
            .current_dir(temp.path())
            .run()
            .unwrap();
        assert!(temp.path().join("marker").is_file());
    }

    #[test]
    fn non_zero_exit_carries_status() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 3"])
            .for_step("initrd/booster")
            .run()
            .unwrap_err();
        match err {
            Error::CommandFailed { step, status, .. } => {
                assert_eq!(step, "initrd/booster");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn allow_fail_returns_output() {
        let out = Cmd::new("sh")
            .args(["-c", "echo nope >&2; exit 1"])
            .allow_fail()
            .output()
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "nope");
    }

    #[test]
    fn missing_program_is_execution_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::ModuleExecution { .. }));
    }

    #[test]
    fn opt_arg_skips_absent_values() {
        let cmd = Cmd::new("mkinitcpio")
            .opt_arg("-c", Some("/etc/mkinitcpio.conf"))
            .opt_arg("-D", None::<&str>);
        assert_eq!(cmd.display(), "mkinitcpio -c /etc/mkinitcpio.conf");
    }
}
