//! The active/standby state machine.
//!
//! One controller runs one loop: wait for the group lock, start the service,
//! watch both the lock and the service, and demote when either goes away.
//! Every primary episode ends with exactly one run of the down command, no
//! matter how it ended. Nothing inside the loop is fatal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::{FailoverConfig, FailoverPlan};
use crate::coordinator::{LockCoordinator, LockHandle};
use crate::error::{ConfigIncomplete, FailoverError};
use crate::supervisor::{ProcessStatus, ProcessSupervisor, ServiceProcess};

/// Upper bound on how long lock loss or service exit goes unnoticed.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    Acquiring,
    Primary,
    Cleaning,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverState::Idle => "idle",
            FailoverState::Acquiring => "acquiring",
            FailoverState::Primary => "primary",
            FailoverState::Cleaning => "cleaning",
        };
        f.write_str(name)
    }
}

/// Why a primary episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryExit {
    /// The service exited with this code while the lock was still held.
    Completed(i32),
    /// The service could not be started or its exit could not be observed.
    Failed,
    LockLost,
    Shutdown,
}

/// What one pass through the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Required keys are missing; no lock was requested.
    Skipped(ConfigIncomplete),
    /// The lock was not obtained (shutdown or coordinator error).
    NotAcquired,
    /// The lock was granted but already gone before the service started.
    LostBeforePrimary,
    Primary(PrimaryExit),
}

/// Logs an error that must not stop the loop.
pub fn report(err: &FailoverError) {
    match err {
        FailoverError::Config(e) => warn!("Lock acquisition disabled: {e}"),
        FailoverError::Connection(e) => error!("{e}"),
        FailoverError::Lock(e) => warn!("Lock request failed: {e}"),
        FailoverError::Launch(e) => error!("Service execution failed: {e}"),
        FailoverError::Cleanup(e) => error!("Cleanup failed: {e}"),
    }
}

pub struct FailoverController<L, S> {
    config: Arc<FailoverConfig>,
    coordinator: L,
    supervisor: S,
    poll_interval: Duration,
    state: watch::Sender<FailoverState>,
    incomplete_reported: bool,
}

impl<L, S> FailoverController<L, S>
where
    L: LockCoordinator,
    S: ProcessSupervisor,
{
    pub fn new(config: Arc<FailoverConfig>, coordinator: L, supervisor: S) -> Self {
        let (state, _) = watch::channel(FailoverState::Idle);
        Self {
            config,
            coordinator,
            supervisor,
            poll_interval: POLL_INTERVAL,
            state,
            incomplete_reported: false,
        }
    }

    pub fn state(&self) -> FailoverState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FailoverState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: FailoverState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Failover state {prev} -> {next}");
        }
    }

    /// Loops until `shutdown` is cancelled. A primary episode in progress at
    /// that point is still cleaned up.
    pub async fn run(mut self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            self.run_once(&shutdown).await;
        }
        info!("Failover controller stopped");
    }

    /// One pass: Idle, then Acquiring, Primary and Cleaning if the config
    /// allows it, and back to Idle.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Iteration {
        let plan = match self.config.plan() {
            Ok(plan) => plan,
            Err(incomplete) => {
                if !self.incomplete_reported {
                    report(&FailoverError::Config(incomplete.clone()));
                    self.incomplete_reported = true;
                }
                // keep spinning without a lock, but let other tasks run
                tokio::task::yield_now().await;
                return Iteration::Skipped(incomplete);
            }
        };

        self.set_state(FailoverState::Acquiring);
        let acquired = tokio::select! {
            res = self.coordinator.acquire(&plan.lock_path) => Some(res),
            _ = shutdown.cancelled() => None,
        };
        let mut handle = match acquired {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                report(&FailoverError::from(e));
                self.set_state(FailoverState::Idle);
                return Iteration::NotAcquired;
            }
            None => {
                self.set_state(FailoverState::Idle);
                return Iteration::NotAcquired;
            }
        };

        if !self.coordinator.is_held(&handle) {
            warn!("Lock {} was lost before the service started", plan.lock_path);
            self.set_state(FailoverState::Idle);
            return Iteration::LostBeforePrimary;
        }

        self.set_state(FailoverState::Primary);
        info!("Lock {} acquired, starting {}", plan.lock_path, plan.up_command);
        let exit = match self.supervisor.start(&plan.up_command, &plan.up_args) {
            Ok(process) => self.watch_primary(&plan, &handle, process, shutdown).await,
            Err(e) => {
                report(&FailoverError::from(e));
                PrimaryExit::Failed
            }
        };

        self.set_state(FailoverState::Cleaning);
        self.demote(&plan, &mut handle, exit).await;
        self.set_state(FailoverState::Idle);
        Iteration::Primary(exit)
    }

    /// Waits until the lock is lost or the service reports a result, checking
    /// both on every tick and on every change notification.
    async fn watch_primary(
        &self,
        plan: &FailoverPlan,
        handle: &LockHandle,
        mut process: ServiceProcess,
        shutdown: &CancellationToken,
    ) -> PrimaryExit {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lock_status = handle.status();
        let mut status_closed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = lock_status.changed(), if !status_closed => {
                    status_closed = changed.is_err();
                }
                _ = process.completed() => {}
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested while primary");
                    return PrimaryExit::Shutdown;
                }
            }

            match self.supervisor.poll(&mut process) {
                ProcessStatus::Pending => {}
                ProcessStatus::Completed(0) => {
                    info!("{} execution complete, exit code = 0", plan.up_command);
                    return PrimaryExit::Completed(0);
                }
                ProcessStatus::Completed(code) => {
                    error!("{} execution failed, exit code = {code}", plan.up_command);
                    return PrimaryExit::Completed(code);
                }
                ProcessStatus::Failed(e) => {
                    report(&FailoverError::from(e));
                    return PrimaryExit::Failed;
                }
            }

            if status_closed || !self.coordinator.is_held(handle) {
                // the service keeps running; the down command deals with it
                warn!(
                    "Lock {} was lost while {} is still running",
                    plan.lock_path, plan.up_command
                );
                return PrimaryExit::LockLost;
            }
        }
    }

    async fn demote(&self, plan: &FailoverPlan, handle: &mut LockHandle, exit: PrimaryExit) {
        info!("Leaving primary ({exit:?}), running cleanup {}", plan.down_command);
        if let Err(e) = self.supervisor.run_sync(&plan.down_command).await {
            report(&FailoverError::from(e));
        }
        if self.coordinator.is_held(handle) {
            self.coordinator.release(handle).await;
        }
    }
}
