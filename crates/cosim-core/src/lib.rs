//! cosim-core: shared types for the rig/terrain co-simulation.
//! Wire framing, exchange payloads, variant tags, checkpoint format and
//! configuration. Every other crate in the workspace depends on this one.

pub mod checkpoint;
pub mod config;
pub mod payload;
pub mod variant;
pub mod wire;

pub use payload::{Message, RigInit, RigState, TerrainInit, TerrainResponse};
pub use variant::{Role, TerrainType, TireType};
