//! Distributed mutual exclusion over a hierarchical coordination path.
//!
//! A [`LockCoordinator`] hands out at most one [`LockHandle`] per lock path
//! across the whole group. Holding a handle does not guarantee the lock is
//! still owned: the session behind it can expire, or the lock key can be
//! removed by somebody else. [`LockHandle::is_held`] reports that without
//! blocking, and [`LockHandle::status`] lets callers await the change.

pub mod backoff;
pub mod xline;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

pub use backoff::Backoff;
pub use xline::XlineLockCoordinator;

/// Normalised lock path: always starts with `/`, no empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockPath(String);

impl LockPath {
    /// Joins `segments` with `/`. A segment may itself contain slashes.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = String::new();
        for segment in segments {
            for part in segment.as_ref().split('/').filter(|p| !p.trim().is_empty()) {
                path.push('/');
                path.push_str(part.trim());
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        LockPath(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Proper ancestors, outermost first: `/a/b/c` gives `/a`, `/a/b`.
    pub fn ancestors(&self) -> Vec<String> {
        self.0
            .match_indices('/')
            .skip(1)
            .map(|(idx, _)| self.0[..idx].to_string())
            .collect()
    }
}

impl fmt::Display for LockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A granted lock. Dropping it stops the session keep-alive but does not
/// release the lock explicitly; the session then expires on its own.
#[derive(Debug)]
pub struct LockHandle {
    path: LockPath,
    key: Vec<u8>,
    lease_id: i64,
    status: watch::Receiver<bool>,
    session: CancellationToken,
    released: bool,
}

impl LockHandle {
    /// `status` carries `true` while the lock is owned; whoever maintains the
    /// session flips it to `false` on loss. `session` is cancelled when the
    /// handle is released or dropped.
    pub fn new(
        path: LockPath,
        key: Vec<u8>,
        lease_id: i64,
        status: watch::Receiver<bool>,
        session: CancellationToken,
    ) -> Self {
        Self {
            path,
            key,
            lease_id,
            status,
            session,
            released: false,
        }
    }

    pub fn path(&self) -> &LockPath {
        &self.path
    }

    /// Key under which the coordination service records ownership.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    pub fn is_held(&self) -> bool {
        !self.released && *self.status.borrow()
    }

    /// A receiver that changes when the lock is lost.
    pub fn status(&self) -> watch::Receiver<bool> {
        self.status.clone()
    }

    /// Marks the handle released and stops its session. Returns `false` if
    /// it was already released.
    pub fn mark_released(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.session.cancel();
        true
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Blocks until the lock at `path` is owned. Missing parent nodes are
    /// created on the way.
    async fn acquire(&self, path: &LockPath) -> Result<LockHandle, LockError>;

    /// Non-blocking ownership check.
    fn is_held(&self, handle: &LockHandle) -> bool {
        handle.is_held()
    }

    /// Best-effort release. Calling it on a released or lost handle is a no-op
    /// as far as the caller is concerned.
    async fn release(&self, handle: &mut LockHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_normalisation() {
        assert_eq!(
            LockPath::from_segments(["/ems", "ft", "broker1"]).as_str(),
            "/ems/ft/broker1"
        );
        assert_eq!(
            LockPath::from_segments(["ems/", "/ft//", "broker1"]).as_str(),
            "/ems/ft/broker1"
        );
        assert_eq!(
            LockPath::from_segments(["/root/sub", "group", "name"]).as_str(),
            "/root/sub/group/name"
        );
        assert_eq!(LockPath::from_segments(Vec::<String>::new()).as_str(), "/");
    }

    #[test]
    fn test_lock_path_ancestors() {
        let path = LockPath::from_segments(["/ems", "ft", "broker1"]);
        assert_eq!(path.ancestors(), vec!["/ems", "/ems/ft"]);
        assert!(LockPath::from_segments(["single"]).ancestors().is_empty());
    }

    #[test]
    fn test_handle_tracks_status_and_release() {
        let (tx, rx) = watch::channel(true);
        let session = CancellationToken::new();
        let mut handle = LockHandle::new(
            LockPath::from_segments(["a"]),
            b"/a/1".to_vec(),
            1,
            rx,
            session.clone(),
        );
        assert!(handle.is_held());

        tx.send_replace(false);
        assert!(!handle.is_held());

        tx.send_replace(true);
        assert!(handle.mark_released());
        assert!(!handle.mark_released());
        assert!(!handle.is_held());
        assert!(session.is_cancelled());
    }

    #[test]
    fn test_drop_stops_session() {
        let (_tx, rx) = watch::channel(true);
        let session = CancellationToken::new();
        let handle = LockHandle::new(LockPath::from_segments(["a"]), Vec::new(), 0, rx, session.clone());
        drop(handle);
        assert!(session.is_cancelled());
    }
}
