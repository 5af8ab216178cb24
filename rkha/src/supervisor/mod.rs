//! Launching and watching the externally owned service process.

pub mod command;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{CleanupError, LaunchError};

pub use command::CommandSupervisor;

/// Result of polling a [`ServiceProcess`].
#[derive(Debug, Clone)]
pub enum ProcessStatus {
    Pending,
    Completed(i32),
    Failed(LaunchError),
}

impl ProcessStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProcessStatus::Pending)
    }
}

/// Sending half of a [`ServiceProcess`], owned by whatever waits on the
/// real child.
#[derive(Debug)]
pub struct ProcessReporter {
    tx: oneshot::Sender<Result<i32, LaunchError>>,
}

impl ProcessReporter {
    pub fn report(self, result: Result<i32, LaunchError>) {
        // the receiver may already be gone; the result is simply unobserved
        let _ = self.tx.send(result);
    }
}

/// Handle to a launched service. It has no way to stop the process: dropping
/// it only stops observing.
#[derive(Debug)]
pub struct ServiceProcess {
    command: String,
    pid: Option<u32>,
    rx: Option<oneshot::Receiver<Result<i32, LaunchError>>>,
    outcome: Option<ProcessStatus>,
}

impl ServiceProcess {
    pub fn channel(command: impl Into<String>, pid: Option<u32>) -> (ProcessReporter, Self) {
        let (tx, rx) = oneshot::channel();
        (
            ProcessReporter { tx },
            Self {
                command: command.into(),
                pid,
                rx: Some(rx),
                outcome: None,
            },
        )
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    /// Non-blocking; once a result is known it is returned on every call.
    pub fn poll(&mut self) -> ProcessStatus {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(rx) = self.rx.as_mut() else {
            return ProcessStatus::Pending;
        };
        match rx.try_recv() {
            Ok(result) => self.settle(result),
            Err(TryRecvError::Empty) => ProcessStatus::Pending,
            Err(TryRecvError::Closed) => self.settle(Err(LaunchError::Lost {
                command: self.command.clone(),
            })),
        }
    }

    /// Waits for the result. Cancel safe.
    pub async fn completed(&mut self) -> ProcessStatus {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let result = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                Err(LaunchError::Lost {
                    command: self.command.clone(),
                })
            }),
            None => return std::future::pending().await,
        };
        self.settle(result)
    }

    fn settle(&mut self, result: Result<i32, LaunchError>) -> ProcessStatus {
        let status = match result {
            Ok(code) => ProcessStatus::Completed(code),
            Err(e) => ProcessStatus::Failed(e),
        };
        self.rx = None;
        self.outcome = Some(status.clone());
        status
    }
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Launches `command` without waiting for it. Spawn failures are returned
    /// immediately.
    fn start(&self, command: &str, args: &[String]) -> Result<ServiceProcess, LaunchError>;

    fn poll(&self, process: &mut ServiceProcess) -> ProcessStatus {
        process.poll()
    }

    /// Runs `command` with no arguments and waits for it to exit.
    async fn run_sync(&self, command: &str) -> Result<(), CleanupError>;
}
