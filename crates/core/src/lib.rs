//! Topology, spawning and supervision for multi-process training jobs.
//!
//! A job is described by a [`LaunchConfig`]. The topology builders in
//! [`collective`], [`ps`] and [`cloud`] turn it into the same [`Cluster`] on
//! every node; [`launch`] starts this node's share of it, [`watch`] supervises
//! it and [`terminate`] tears it down.

pub mod clock;
pub mod cloud;
pub mod collective;
pub mod config;
pub mod devices;
pub mod env;
pub mod error;
pub mod job;
pub mod launch;
pub mod net;
pub mod ports;
pub mod process;
pub mod ps;
pub mod rendezvous;
pub mod terminate;
pub mod testing;
pub mod topology;
pub mod watch;

pub use clock::{Clock, SystemClock};
pub use config::{DistributedMode, JobKind, LaunchConfig};
pub use error::{FailedProcess, LaunchError, Result};
pub use job::{build_topology, launch, JobContext};
pub use net::DefaultIpResolver;
pub use process::{LaunchCommand, OsSpawner};
pub use topology::{Cluster, Endpoint, Pod, Role, RoleProcess};
