//! PaxBoot: bootstrap launcher for a cluster of Paxos-replicated key-value
//! server processes.
//!
//! Allocates every replica a client-facing and a peer-peer address, encodes
//! each replica's view of its peers into its command line, and starts the
//! replicas one by one.

#[macro_use]
mod utils;

mod launcher;
mod payload;
mod topology;

pub use launcher::{
    LaunchPlan, Launcher, LauncherConfig, ProcessSpawner, ReplicaSpawner,
};
pub use payload::{PayloadFormat, ReplicaConfig};
pub use topology::{PeerPolicy, ReplicaAddrs, ReplicaId, Topology};
pub use utils::{logger_init, me_init, PaxbootError, ME};
