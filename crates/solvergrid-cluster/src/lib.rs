//! solvergrid-cluster — group membership and coordination for SolverGrid.
//!
//! Provides the channel every node uses to talk to the rest of the group,
//! an in-process fabric implementing it, cluster-wide named locks, and
//! leader election for the coordinator roles.
//!
//! # Architecture
//!
//! ```text
//! InProcessFabric
//!   ├── MembershipManager
//!   │   ├── Orders members by join time (oldest = view coordinator)
//!   │   └── Suspects and reaps members that missed heartbeats
//!   └── FabricEndpoint (one per node, implements ClusterChannel)
//!       ├── call() / broadcast() → registered RpcHandler per service
//!       └── subscribe_view() → watch of View
//!
//! LockService ("lock" service)
//!   ├── Coordinator: lock table, rebuilt from member snapshots on fail-over
//!   └── Member: lock / lock_interruptibly / try_lock / unlock / holder
//!
//! LeaderElector
//!   └── Blocks on the role lock ("master", "updater") until stopped
//! ```

pub mod channel;
pub mod election;
pub mod error;
pub mod fabric;
pub mod lock;
pub mod membership;

pub use channel::{Address, CallMode, ClusterChannel, RpcHandler, View, broadcast_typed, call_typed};
pub use election::{CoordinatorRole, ElectionHandle, LeaderElector, LeadershipState};
pub use error::{ClusterError, ClusterResult};
pub use fabric::{FabricEndpoint, InProcessFabric};
pub use lock::LockService;
pub use membership::MembershipManager;
