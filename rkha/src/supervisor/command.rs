use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::error::{CleanupError, LaunchError};
use crate::supervisor::{ProcessSupervisor, ServiceProcess};

/// Runs commands as child processes of the controller. Service output goes
/// to the controller's own stdout/stderr.
#[derive(Debug, Default, Clone)]
pub struct CommandSupervisor;

impl CommandSupervisor {
    pub fn new() -> Self {
        Self
    }
}

fn exit_code(command: &str, status: ExitStatus) -> Result<i32, LaunchError> {
    status.code().ok_or_else(|| LaunchError::Terminated {
        command: command.to_string(),
        status: status.to_string(),
    })
}

#[async_trait]
impl ProcessSupervisor for CommandSupervisor {
    fn start(&self, command: &str, args: &[String]) -> Result<ServiceProcess, LaunchError> {
        // kill_on_drop stays off: the service outlives its handle
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: command.to_string(),
                source: Arc::new(e),
            })?;

        let pid = child.id();
        info!("Started {command} {args:?} (pid {pid:?})");

        let (reporter, process) = ServiceProcess::channel(command, pid);
        let command = command.to_string();
        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) => exit_code(&command, status),
                Err(e) => Err(LaunchError::Wait {
                    command: command.clone(),
                    source: Arc::new(e),
                }),
            };
            debug!("{command} finished: {result:?}");
            reporter.report(result);
        });
        Ok(process)
    }

    async fn run_sync(&self, command: &str) -> Result<(), CleanupError> {
        info!("Running {command}");
        let status = Command::new(command)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| CleanupError::Spawn {
                command: command.to_string(),
                source: e,
            })?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(CleanupError::ExitCode {
                command: command.to_string(),
                code,
            }),
            None => Err(CleanupError::Terminated {
                command: command.to_string(),
                status: status.to_string(),
            }),
        }
    }
}
