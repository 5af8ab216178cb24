#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rkha::config::FailoverConfig;
use rkha::coordinator::{LockCoordinator, LockHandle, LockPath};
use rkha::error::{CleanupError, LaunchError, LockError};
use rkha::supervisor::{ProcessReporter, ProcessSupervisor, ServiceProcess};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared, timestamped record of what the fakes were asked to do.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap()
            .push((Instant::now(), event.into()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Time of the first event starting with `prefix`.
    pub fn first_at(&self, prefix: &str) -> Option<Instant> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, e)| e.starts_with(prefix))
            .map(|(at, _)| *at)
    }
}

pub fn scenario_config() -> FailoverConfig {
    FailoverConfig {
        coordination_endpoints: vec!["http://127.0.0.1:2379".to_string()],
        session_timeout: 10_000,
        root_path: Some("/ems".to_string()),
        group_root_path: Some("ft".to_string()),
        instance_name: Some("broker1".to_string()),
        up_command: Some("/bin/start.sh".to_string()),
        down_command: Some("/bin/stop.sh".to_string()),
        failover_delay: Some("5".to_string()),
        username: None,
        password: None,
    }
}

#[derive(Default)]
struct LockTable {
    next_session: u64,
    // lock path -> (owning session, status sender)
    holders: HashMap<String, (u64, watch::Sender<bool>)>,
}

/// In-process stand-in for the coordination service: one owner per path,
/// waiters are woken on every release or revocation.
#[derive(Default)]
pub struct MemoryLockService {
    table: Mutex<LockTable>,
    released: Notify,
}

impl MemoryLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn try_take(&self, path: &LockPath) -> Option<LockHandle> {
        let mut table = self.table.lock().unwrap();
        if table.holders.contains_key(path.as_str()) {
            return None;
        }
        table.next_session += 1;
        let session_id = table.next_session;
        let (tx, rx) = watch::channel(true);
        table
            .holders
            .insert(path.as_str().to_string(), (session_id, tx));
        let key = format!("{path}/{session_id:x}").into_bytes();
        Some(LockHandle::new(
            path.clone(),
            key,
            session_id as i64,
            rx,
            CancellationToken::new(),
        ))
    }

    /// Simulates session expiry: the owner loses the lock without asking.
    pub fn revoke(&self, path: &str) -> bool {
        let removed = self.table.lock().unwrap().holders.remove(path);
        match removed {
            Some((_, tx)) => {
                tx.send_replace(false);
                self.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn holder(&self, path: &str) -> Option<i64> {
        self.table
            .lock()
            .unwrap()
            .holders
            .get(path)
            .map(|(id, _)| *id as i64)
    }

    fn release(&self, path: &str, session_id: i64) {
        let mut table = self.table.lock().unwrap();
        let owned = matches!(table.holders.get(path), Some((id, _)) if *id as i64 == session_id);
        if owned {
            if let Some((_, tx)) = table.holders.remove(path) {
                tx.send_replace(false);
            }
            drop(table);
            self.released.notify_waiters();
        }
    }
}

pub struct MemoryLockCoordinator {
    service: Arc<MemoryLockService>,
    log: EventLog,
    acquires: Arc<AtomicUsize>,
    // revoke right after granting, before the caller sees the handle
    lose_on_grant: bool,
}

impl MemoryLockCoordinator {
    pub fn new(service: Arc<MemoryLockService>, log: EventLog) -> Self {
        Self {
            service,
            log,
            acquires: Arc::new(AtomicUsize::new(0)),
            lose_on_grant: false,
        }
    }

    pub fn losing_on_grant(mut self) -> Self {
        self.lose_on_grant = true;
        self
    }

    pub fn acquire_calls(&self) -> Arc<AtomicUsize> {
        self.acquires.clone()
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockCoordinator {
    async fn acquire(&self, path: &LockPath) -> Result<LockHandle, LockError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("acquire {path}"));
        loop {
            let released = self.service.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(handle) = self.service.try_take(path) {
                if self.lose_on_grant {
                    self.service.revoke(path.as_str());
                }
                self.log.push(format!("granted {path}"));
                return Ok(handle);
            }
            released.await;
        }
    }

    async fn release(&self, handle: &mut LockHandle) {
        self.log.push(format!("release {}", handle.path()));
        if handle.mark_released() {
            self.service
                .release(handle.path().as_str(), handle.lease_id());
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum UpBehavior {
    ExitAfter(Duration, i32),
    RunForever,
    FailToLaunch,
    FailWhileRunning(Duration),
}

/// Counts concurrently "active" services across every supervisor sharing it.
#[derive(Clone, Default)]
pub struct ActiveGauge {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ActiveGauge {
    fn up(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn down(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Supervisor that pretends to run the up command according to `UpBehavior`.
/// A service counts as active from `start` until the next down command.
pub struct FakeSupervisor {
    log: EventLog,
    up: UpBehavior,
    down_fails: bool,
    gauge: ActiveGauge,
    running: Arc<Mutex<Vec<ProcessReporter>>>,
}

impl FakeSupervisor {
    pub fn new(log: EventLog, up: UpBehavior) -> Self {
        Self {
            log,
            up,
            down_fails: false,
            gauge: ActiveGauge::default(),
            running: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_gauge(mut self, gauge: ActiveGauge) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn failing_down(mut self) -> Self {
        self.down_fails = true;
        self
    }

    /// Services started with `RunForever` that nobody has stopped.
    pub fn still_running(&self) -> Arc<Mutex<Vec<ProcessReporter>>> {
        self.running.clone()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    fn start(&self, command: &str, args: &[String]) -> Result<ServiceProcess, LaunchError> {
        self.log.push(format!("start {command} {}", args.join(" ")).trim_end().to_string());
        if let UpBehavior::FailToLaunch = self.up {
            return Err(LaunchError::Spawn {
                command: command.to_string(),
                source: Arc::new(std::io::Error::from(std::io::ErrorKind::NotFound)),
            });
        }
        self.gauge.up();

        let (reporter, process) = ServiceProcess::channel(command, Some(4242));
        match self.up {
            UpBehavior::ExitAfter(after, code) => {
                let log = self.log.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    log.push(format!("exited {code}"));
                    reporter.report(Ok(code));
                });
            }
            UpBehavior::FailWhileRunning(after) => {
                let command = command.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    reporter.report(Err(LaunchError::Terminated {
                        command,
                        status: "signal: 9 (SIGKILL)".to_string(),
                    }));
                });
            }
            UpBehavior::RunForever => self.running.lock().unwrap().push(reporter),
            UpBehavior::FailToLaunch => {}
        }
        Ok(process)
    }

    async fn run_sync(&self, command: &str) -> Result<(), CleanupError> {
        self.log.push(format!("run {command}"));
        self.gauge.down();
        if self.down_fails {
            return Err(CleanupError::ExitCode {
                command: command.to_string(),
                code: 1,
            });
        }
        Ok(())
    }
}
