//! Lock-arbitrated active/standby failover for a single external service.
//!
//! Peers in a group compete for one Xline/etcd lock. The winner runs the
//! group's up command and stays primary until the service exits or the lock
//! is lost; it then runs the down command, releases the lock and queues up
//! again.

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod supervisor;

pub use config::{FailoverConfig, FailoverPlan, load_config};
pub use controller::{FailoverController, FailoverState, Iteration, PrimaryExit};
pub use coordinator::{LockCoordinator, LockHandle, LockPath, XlineLockCoordinator};
pub use error::FailoverError;
pub use supervisor::{CommandSupervisor, ProcessStatus, ProcessSupervisor, ServiceProcess};
