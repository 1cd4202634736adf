//! External command execution
//!
//! Every collaborator reaches the host through a `CommandRunner`. The real
//! runner (`SystemRunner`) is the only place in the crate that spawns
//! processes; tests substitute a recording fake so step logic can be
//! exercised without snap, juju or root.
//!
//! # Execution Rules
//!
//! - Tools run in their own process group and are registered with
//!   `ChildRegistry` so an interrupt stops them
//! - `privileged` commands are prefixed with `sudo` unless we already are root
//! - In dry-run mode, `mutating` commands are logged and reported as
//!   successful without running; queries still execute so the plan is real

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// Description of one external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin
    pub stdin: Option<String>,
    /// Needs root; run through sudo when we are not root
    pub privileged: bool,
    /// Changes host state; skipped in dry-run mode
    pub mutating: bool,
    /// Let stdout reach the operator's terminal instead of capturing it
    pub streaming: bool,
    /// Arguments carry secrets; `Display` masks the value of `key=value` args
    pub sensitive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            f.write_str("sudo ")?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            if self.sensitive {
                if let Some((key, _)) = arg.split_once('=') {
                    write!(f, " {}=***", key)?;
                    continue;
                }
            }
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by a signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Return an error describing the failure if the command did not succeed.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let code = self
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let detail = match self.stderr.trim() {
            "" => self.stdout.trim(),
            stderr => stderr,
        };
        anyhow::bail!("{} failed (exit {}): {}", context, code, detail)
    }

    /// Stdout of a successful command.
    pub fn into_stdout(self, context: &str) -> Result<String> {
        self.ensure_success(context)?;
        Ok(self.stdout)
    }
}

/// Runs external commands.
pub trait CommandRunner {
    /// Run `spec` to completion.
    ///
    /// A non-zero exit is reported in `CommandOutput`, not as `Err`; `Err`
    /// means the command could not be started or awaited at all.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(spec)
    }
}

/// Runner that spawns real processes on the host.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    dry_run: bool,
    is_root: bool,
}

impl SystemRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            is_root: nix::unistd::geteuid().is_root(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut cmd = if spec.privileged && !self.is_root {
            let mut sudo = Command::new("sudo");
            sudo.arg(&spec.program);
            sudo
        } else {
            Command::new(&spec.program)
        };

        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if spec.streaming {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .stderr(Stdio::piped())
            .in_new_process_group();
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.dry_run && spec.mutating {
            info!("[dry-run] would run: {}", spec);
            return Ok(CommandOutput::ok(""));
        }

        debug!("Running: {}", spec);
        let mut child = self
            .build(spec)
            .spawn()
            .with_context(|| format!("Failed to start `{}`", spec.program))?;
        let pid = child.id();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        // Feed stdin while stdout/stderr drain; the pipe closes when the
        // feeder drops its handle
        let stdin = child.stdin.take();
        let (fed, waited) = std::thread::scope(|scope| {
            let feeder = match (spec.stdin.as_deref(), stdin) {
                (Some(input), Some(mut pipe)) => {
                    Some(scope.spawn(move || pipe.write_all(input.as_bytes())))
                }
                _ => None,
            };
            let waited = child.wait_with_output();
            let fed = match feeder {
                Some(handle) => handle.join().unwrap_or_else(|_| {
                    Err(std::io::Error::other("stdin writer thread panicked"))
                }),
                None => Ok(()),
            };
            (fed, waited)
        });

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        fed.with_context(|| format!("Failed to write stdin of `{}`", spec.program))?;
        let output = waited.with_context(|| format!("Failed waiting for `{}`", spec.program))?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        debug!("`{}` exited with {:?}", spec.program, result.exit_code);
        Ok(result)
    }
}
