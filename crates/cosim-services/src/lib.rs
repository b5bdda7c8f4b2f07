//! cosim-services: node logic for the rig/terrain co-simulation.
//!
//! The daemon owns the step loop and the channel; everything that happens
//! inside a node (tire dynamics, terrain backends, settling, checkpoints,
//! output) lives here, behind the `RigNode` / `TerrainNode` traits.

pub mod checkpoint_store;
pub mod diagnostics;
pub mod node;
pub mod output;
pub mod registry;
pub mod rig;
pub mod settling;
pub mod terrain;

pub use checkpoint_store::CheckpointStore;
pub use diagnostics::ClampDiagnostics;
pub use node::{CosimError, CosimNode, NodeContext, NodeTimer, PrepareReport, RigNode, TerrainNode};
pub use output::OutputDir;
pub use registry::{build_rig, build_terrain, ensure_available};
