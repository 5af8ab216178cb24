use std::sync::Arc;

/// Required keys are absent, so this iteration skips lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required config keys: {}", missing.join(", "))]
pub struct ConfigIncomplete {
    pub missing: Vec<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no coordination endpoints configured")]
    NoEndpoints,
    #[error("coordination service at {endpoints} unreachable after {attempts} attempts: {reason}")]
    Exhausted {
        endpoints: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("session lost while waiting for lock {path}")]
    SessionLost { path: String },
    #[error("session keep-alive stream closed")]
    KeepAliveClosed,
    #[error("coordination request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for LockError {
    fn from(e: etcd_client::Error) -> Self {
        LockError::Xline(Box::new(e))
    }
}

/// Failure to start or track the supervised service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("{command} ended without an exit code ({status})")]
    Terminated { command: String, status: String },
    #[error("lost track of {command}")]
    Lost { command: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to run cleanup command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cleanup command {command} exited with code {code}")]
    ExitCode { command: String, code: i32 },
    #[error("cleanup command {command} ended without an exit code ({status})")]
    Terminated { command: String, status: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error(transparent)]
    Config(#[from] ConfigIncomplete),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}
