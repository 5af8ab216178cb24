use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, LeaseKeepAliveStream, LeaseKeeper,
    LockOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::config::FailoverConfig;
use crate::coordinator::backoff::Backoff;
use crate::coordinator::{LockCoordinator, LockHandle, LockPath};
use crate::error::{ConnectionError, LockError};

/// Lock coordinator backed by the Xline/etcd v3 `Lock` API.
///
/// Every lock attempt opens its own lease (the "session"). The lease is kept
/// alive by a background task for as long as the handle lives; a second task
/// watches the granted lock key so an external delete is noticed at once.
pub struct XlineLockCoordinator {
    client: Client,
    session_ttl: i64,
    wait_backoff: Backoff,
}

impl XlineLockCoordinator {
    pub async fn connect(config: &FailoverConfig) -> Result<Self, ConnectionError> {
        Self::connect_with(config, Backoff::connect_policy()).await
    }

    pub async fn connect_with(
        config: &FailoverConfig,
        policy: Backoff,
    ) -> Result<Self, ConnectionError> {
        if config.coordination_endpoints.is_empty() {
            return Err(ConnectionError::NoEndpoints);
        }
        let endpoints = config.coordination_endpoints.join(",");

        let mut attempt = 0;
        loop {
            match Self::open_client(config).await {
                Ok(client) => {
                    info!("Connected to coordination service at {endpoints}");
                    return Ok(Self {
                        client,
                        session_ttl: config.session_ttl_secs(),
                        wait_backoff: Backoff::lock_wait_policy(),
                    });
                }
                Err(e) => match policy.delay(attempt) {
                    Some(delay) => {
                        warn!("Coordination service at {endpoints} not reachable ({e}), retrying in {delay:?}");
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(ConnectionError::Exhausted {
                            endpoints,
                            attempts: attempt + 1,
                            reason: e,
                        });
                    }
                },
            }
        }
    }

    async fn open_client(config: &FailoverConfig) -> Result<Client, String> {
        let limit = Duration::from_millis(config.session_timeout.max(1000));
        let mut opts = ConnectOptions::new().with_connect_timeout(limit);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts = opts.with_user(user.clone(), pass.clone());
        }

        // the channel is lazy and requests on it wait for a ready endpoint;
        // make one bounded round trip so an unreachable cluster shows up here
        let probe = async move {
            let mut client =
                Client::connect(config.coordination_endpoints.clone(), Some(opts)).await?;
            client.status().await?;
            Ok::<_, etcd_client::Error>(client)
        };
        match timeout(limit, probe).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {limit:?}")),
        }
    }

    /// Creates empty marker keys for every missing parent of `path`.
    async fn ensure_parents(client: &mut Client, path: &LockPath) -> Result<(), LockError> {
        for parent in path.ancestors() {
            let txn = Txn::new()
                .when([Compare::version(parent.clone(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(parent.clone(), Vec::new(), None)]);
            if client.txn(txn).await?.succeeded() {
                debug!("Created coordination node {parent}");
            }
        }
        Ok(())
    }

    async fn try_acquire(&self, path: &LockPath) -> Result<LockHandle, LockError> {
        let mut client = self.client.clone();
        Self::ensure_parents(&mut client, path).await?;

        let granted_at = Instant::now();
        let lease_id = client.lease_grant(self.session_ttl, None).await?.id();
        let ttl = Duration::from_secs(self.session_ttl.unsigned_abs());

        let (status_tx, status_rx) = watch::channel(true);
        let status_tx = Arc::new(status_tx);
        let session = CancellationToken::new();
        tokio::spawn(keep_session(
            SessionKeeper::new(client.clone(), lease_id),
            ttl,
            granted_at,
            status_tx.clone(),
            session.clone(),
        ));

        debug!("Waiting for lock {path} with lease {lease_id:x}");
        let mut lost = status_rx.clone();
        let locked = within_session(&session, async {
            tokio::select! {
                resp = client.lock(path.as_str(), Some(LockOptions::new().with_lease(lease_id))) => {
                    resp.map_err(LockError::from)
                }
                _ = lost.wait_for(|held| !*held) => Err(LockError::SessionLost {
                    path: path.to_string(),
                }),
            }
        })
        .await;
        let resp = match locked {
            Ok(resp) => resp,
            Err(e) => {
                let _ = timeout(ttl, client.lease_revoke(lease_id)).await;
                return Err(e);
            }
        };

        let key = resp.key().to_vec();
        let since = resp.header().map(|h| h.revision() + 1).unwrap_or(0);
        tokio::spawn(watch_lock_key(
            client,
            key.clone(),
            since,
            status_tx,
            session.clone(),
        ));

        info!("Acquired lock {path} (lease {lease_id:x})");
        Ok(LockHandle::new(path.clone(), key, lease_id, status_rx, session))
    }
}

#[async_trait]
impl LockCoordinator for XlineLockCoordinator {
    async fn acquire(&self, path: &LockPath) -> Result<LockHandle, LockError> {
        let mut attempt = 0u32;
        loop {
            match self.try_acquire(path).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    let delay = self
                        .wait_backoff
                        .delay(attempt)
                        .unwrap_or(Duration::from_secs(5));
                    warn!("Lock attempt on {path} failed: {e}; retrying in {delay:?}");
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn release(&self, handle: &mut LockHandle) {
        if !handle.mark_released() {
            return;
        }
        let mut client = self.client.clone();
        let limit = Duration::from_secs(self.session_ttl.unsigned_abs());
        match timeout(limit, client.unlock(handle.key().to_vec())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Unlock of {} failed, ignoring: {e}", handle.path()),
            Err(_) => warn!("Unlock of {} timed out, ignoring", handle.path()),
        }
        // revoking also drops any key still bound to the lease
        if let Ok(Err(e)) = timeout(limit, client.lease_revoke(handle.lease_id())).await {
            debug!("Revoking lease {:x} failed: {e}", handle.lease_id());
        }
        info!("Released lock {}", handle.path());
    }
}

/// Runs `grant` on behalf of `session`. If `grant` fails, or the returned
/// future is dropped before it finishes, the session is cancelled so its
/// background tasks stop keeping the lease alive.
async fn within_session<F, T>(session: &CancellationToken, grant: F) -> Result<T, LockError>
where
    F: Future<Output = Result<T, LockError>>,
{
    let guard = session.clone().drop_guard();
    let result = grant.await;
    if result.is_ok() {
        guard.disarm();
    }
    result
}

/// One keep-alive round trip for a session lease.
#[async_trait]
trait SessionRefresh: Send {
    fn lease_id(&self) -> i64;

    /// Sends one keep-alive and returns the TTL the server now reports.
    async fn refresh(&mut self) -> Result<i64, LockError>;
}

struct SessionKeeper {
    client: Client,
    lease_id: i64,
    channel: Option<(LeaseKeeper, LeaseKeepAliveStream)>,
}

impl SessionKeeper {
    fn new(client: Client, lease_id: i64) -> Self {
        Self {
            client,
            lease_id,
            channel: None,
        }
    }
}

#[async_trait]
impl SessionRefresh for SessionKeeper {
    fn lease_id(&self) -> i64 {
        self.lease_id
    }

    /// The keep-alive stream is reopened on the next call after any failure.
    async fn refresh(&mut self) -> Result<i64, LockError> {
        let (mut keeper, mut stream) = match self.channel.take() {
            Some(channel) => channel,
            None => self.client.lease_keep_alive(self.lease_id).await?,
        };
        keeper.keep_alive().await?;
        let ttl = match stream.message().await? {
            Some(resp) => resp.ttl(),
            None => return Err(LockError::KeepAliveClosed),
        };
        self.channel = Some((keeper, stream));
        Ok(ttl)
    }
}

fn refresh_period(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(300))
}

/// How long before the server-side expiry the lock is already given up.
fn expiry_margin(ttl: Duration) -> Duration {
    (ttl / 10).min(Duration::from_millis(500))
}

/// Keeps the lease alive until `session` is cancelled.
///
/// The server counts the TTL from when it receives a keep-alive, so the
/// local deadline runs from when the last successful one was sent, less a
/// margin. Once the deadline passes without a newer confirmation the lock is
/// reported lost, whether or not a request is still in flight.
async fn keep_session<R: SessionRefresh>(
    mut keeper: R,
    ttl: Duration,
    granted_at: Instant,
    status: Arc<watch::Sender<bool>>,
    session: CancellationToken,
) {
    let lease_id = keeper.lease_id();
    let lifetime = ttl.saturating_sub(expiry_margin(ttl));
    let mut deadline = granted_at + lifetime;
    let mut ticker = interval(refresh_period(ttl));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = sleep_until(deadline) => {
                error!("Session lease {lease_id:x} unconfirmed for {ttl:?}, lock considered lost");
                break;
            }
            _ = ticker.tick() => {}
        }

        let sent_at = Instant::now();
        let refreshed = tokio::select! {
            _ = session.cancelled() => return,
            res = timeout_at(deadline, keeper.refresh()) => res,
        };
        match refreshed {
            Ok(Ok(remaining)) if remaining > 0 => deadline = sent_at + lifetime,
            Ok(Ok(_)) => {
                warn!("Session lease {lease_id:x} expired");
                break;
            }
            Ok(Err(e)) => warn!("Failed to refresh session lease {lease_id:x}: {e}"),
            Err(_) => {
                error!("Session lease {lease_id:x} unconfirmed for {ttl:?}, lock considered lost");
                break;
            }
        }
    }
    status.send_replace(false);
}

/// Reports the lock lost when its key is deleted (unlock by another client,
/// manual removal, or lease revocation).
async fn watch_lock_key(
    mut client: Client,
    key: Vec<u8>,
    since: i64,
    status: Arc<watch::Sender<bool>>,
    session: CancellationToken,
) {
    let name = String::from_utf8_lossy(&key).into_owned();
    let opts = WatchOptions::new().with_start_revision(since);
    let (_watcher, mut stream) = match client.watch(key, Some(opts)).await {
        Ok(watch_pair) => watch_pair,
        Err(e) => {
            warn!("Failed to watch lock key {name}, relying on lease refresh only: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            msg = stream.next() => match msg {
                Some(Ok(resp)) => {
                    if resp.events().iter().any(|ev| ev.event_type() == EventType::Delete) {
                        warn!("Lock key {name} was deleted");
                        break;
                    }
                    if resp.canceled() {
                        warn!("Watch on lock key {name} cancelled, relying on lease refresh only");
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!("Watch on lock key {name} failed, relying on lease refresh only: {e}");
                    return;
                }
                None => return,
            }
        }
    }
    status.send_replace(false);
}
