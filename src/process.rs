//! Thin wrapper for running the external tools the backends drive.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr if there is any, otherwise stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_owned();
        }
        let stdout = self.stdout_lossy();
        let stdout = stdout.trim();
        if stdout.is_empty() {
            "no additional output".to_owned()
        } else {
            stdout.to_owned()
        }
    }
}

enum Arg {
    Plain(OsString),
    Secret(OsString),
}

/// A command line plus optional stdin payload. Secret arguments are passed
/// through to the process but never logged.
pub struct Invocation<'a> {
    program: PathBuf,
    args: Vec<Arg>,
    envs: Vec<(OsString, OsString)>,
    input: Option<&'a [u8]>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg::Plain(arg.as_ref().to_owned()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn secret_arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(Arg::Secret(arg.as_ref().to_owned()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.input = Some(input);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs to completion. A non-zero exit is not an error here; callers
    /// classify [`Output::status`] themselves.
    pub fn run(self) -> io::Result<Output> {
        log::debug!("running {}", self);

        let mut command = Command::new(&self.program);
        command.args(self.args.iter().map(|arg| match arg {
            Arg::Plain(arg) | Arg::Secret(arg) => arg,
        }));
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(match self.input {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        });

        let mut child = command.spawn()?;
        if let Some(payload) = self.input {
            if let Some(mut stdin) = child.stdin.take() {
                // The child may exit without draining stdin.
                match stdin.write_all(payload) {
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
        }

        let output = child.wait_with_output()?;
        let status = output.status.code().unwrap_or(-1);
        log::debug!("{} exited with {}", self.program.display(), status);
        Ok(Output {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status,
        })
    }
}

impl fmt::Display for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            match arg {
                Arg::Plain(arg) => write!(f, " {}", arg.to_string_lossy())?,
                Arg::Secret(_) => f.write_str(" <redacted>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn display_redacts_secrets() {
        let invocation = Invocation::new("tpm2_unseal")
            .args(["-c", "0x81010001", "-p"])
            .secret_arg("hex:31323334");
        assert_eq!(
            invocation.to_string(),
            "tpm2_unseal -c 0x81010001 -p <redacted>"
        );
    }

    #[test]
    fn captures_stdout_and_status() -> Result<()> {
        let out = Invocation::new("sh")
            .args(["-c", "cat; echo oops >&2; exit 3"])
            .stdin(b"payload")
            .run()?;
        assert_eq!(out.stdout, b"payload");
        assert_eq!(out.status, 3);
        assert_eq!(out.diagnostic(), "oops");
        Ok(())
    }
}
