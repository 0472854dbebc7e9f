//! Starting rr replay processes

use crate::replay::error::ControllerError;
use crate::replay::session::{Session, TeardownPolicy};
use crate::replay::types::RrConfig;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Something that can turn a trace directory into a running session
pub trait Launcher: Send + Sync {
    fn launch(&self, trace_dir: &Path) -> Result<Session, ControllerError>;
}

/// Launches `rr replay` in MI mode
pub struct RrLauncher {
    config: RrConfig,
}

impl RrLauncher {
    pub fn new(config: RrConfig) -> Self {
        Self { config }
    }

    fn command(&self, trace_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.rr_path);
        cmd.args(&self.config.rr_args)
            .arg(trace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd
    }
}

impl Launcher for RrLauncher {
    fn launch(&self, trace_dir: &Path) -> Result<Session, ControllerError> {
        if !trace_dir.is_dir() {
            return Err(ControllerError::LaunchFailure(format!(
                "trace directory {} does not exist",
                trace_dir.display()
            )));
        }

        info!(
            "Starting {} {} {}",
            self.config.rr_path,
            self.config.rr_args.join(" "),
            trace_dir.display()
        );

        let child = self.command(trace_dir).spawn().map_err(|e| {
            ControllerError::LaunchFailure(match e.kind() {
                ErrorKind::NotFound => format!("rr executable not found: {}", self.config.rr_path),
                _ => format!("failed to spawn {}: {}", self.config.rr_path, e),
            })
        })?;

        Session::attach(
            child,
            trace_dir,
            TeardownPolicy {
                exit_command: self.config.exit_command.clone(),
                exit_grace: self.config.exit_grace,
                stderr_tail_lines: self.config.stderr_tail_lines,
            },
        )
    }
}
