//! cosimd: runs one rank of the rig/terrain co-simulation.
//!
//! The channel moves frames, the participant runs each role's half of the
//! protocol, the coordinator owns the step loop, and `launch` wires a
//! process (or a test) to all three.

pub mod channel;
pub mod coordinator;
pub mod launch;
pub mod participant;

pub use channel::{ChannelError, MemoryTransport, SyncChannel, TcpTransport, Transport};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorState, RunPlan, RunSummary};
pub use launch::{assign_role, preflight, run_dir, run_process, run_rank, spawn_children};
pub use participant::Participant;
