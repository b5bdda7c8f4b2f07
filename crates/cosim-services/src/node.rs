//! Node traits: the contract between the coordinator (which owns the step
//! loop and the channel) and the rig/terrain logic (which owns the physics).
//!
//! The coordinator never looks inside a node. It hands the node payloads
//! received from the peer and asks it for payloads to send back.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cosim_core::checkpoint::{CheckpointError, CheckpointRecord};
use cosim_core::config::{ConfigError, CosimConfig};
use cosim_core::{RigInit, RigState, Role, TerrainInit, TerrainResponse, TerrainType, TireType};

use crate::diagnostics::ClampDiagnostics;

/// Per-node settings derived from the run configuration.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub role: Role,
    pub step_size: f64,
    /// `<run dir>/<NODE_NAME>`.
    pub node_dir: PathBuf,
    pub verbose: bool,
    pub output: bool,
    pub threads: u32,
    pub use_checkpoint: bool,
    pub seed: u64,
}

impl NodeContext {
    pub fn new(role: Role, config: &CosimConfig, run_dir: &Path) -> Self {
        let threads = match role {
            Role::Rig => config.rig.threads,
            Role::Terrain => config.terrain.threads,
        };
        Self {
            role,
            step_size: config.run.step_size,
            node_dir: run_dir.join(role.node_name()),
            verbose: config.run.verbose,
            output: config.run.output,
            threads: threads.max(1),
            use_checkpoint: config.run.use_checkpoint,
            seed: config.run.seed,
        }
    }
}

/// Wall-clock time spent inside `Advance`.
#[derive(Debug, Clone, Default)]
pub struct NodeTimer {
    cumulative: Duration,
    last: Duration,
}

impl NodeTimer {
    /// Charge the time elapsed since `start` to this node.
    pub fn record(&mut self, start: Instant) {
        self.last = start.elapsed();
        self.cumulative += self.last;
    }

    /// Seconds spent in all `Advance` calls so far.
    pub fn cumulative_sim_time(&self) -> f64 {
        self.cumulative.as_secs_f64()
    }

    /// Seconds spent in the most recent `Advance` call.
    pub fn last_step_sim_time(&self) -> f64 {
        self.last.as_secs_f64()
    }
}

/// What terrain preparation did before the rig handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareReport {
    /// Settling ran and `checkpoint_settled` was written.
    pub settled: bool,
    /// Label of the checkpoint the state was restored from.
    pub restored_from: Option<String>,
    pub description: String,
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// Lifecycle shared by both roles.
pub trait CosimNode: Send {
    fn role(&self) -> Role;

    fn step_size(&self) -> f64;

    fn node_dir(&self) -> &Path;

    /// Integrate by exactly `dt`. Never blocks on the peer.
    fn advance(&mut self, dt: f64) -> Result<(), CosimError>;

    /// Write frame `frame` to the node directory. Writing the same frame
    /// twice overwrites it.
    fn output_data(&mut self, frame: u64) -> Result<(), CosimError>;

    fn write_checkpoint(&mut self, label: &str) -> Result<(), CosimError>;

    fn timer(&self) -> &NodeTimer;

    fn name(&self) -> &'static str {
        self.role().node_name()
    }
}

/// Vehicle side: builds the tire, publishes contact state, applies reactions.
pub trait RigNode: CosimNode {
    fn tire_type(&self) -> TireType;

    /// Contact geometry and material sent once at initialization.
    fn init_payload(&mut self) -> Result<RigInit, CosimError>;

    /// Terrain acknowledgement. Fails if the terrain cannot serve this tire.
    fn on_terrain_init(&mut self, init: &TerrainInit) -> Result<(), CosimError>;

    fn contact_state(&mut self, step: u64, time: f64) -> Result<RigState, CosimError>;

    fn apply_response(&mut self, response: TerrainResponse) -> Result<(), CosimError>;
}

/// Ground side: prepares the terrain, answers contact queries.
pub trait TerrainNode: CosimNode {
    fn terrain_type(&self) -> TerrainType;

    /// Settle or load a checkpoint. Must complete before `accept_rig`.
    fn prepare(&mut self) -> Result<PrepareReport, CosimError>;

    /// Validate the rig's initial payload and build the acknowledgement.
    fn accept_rig(&mut self, init: RigInit) -> Result<TerrainInit, CosimError>;

    /// Reactions for the rig state of `step`, one-to-one with the rig nodes.
    fn respond(
        &mut self,
        step: u64,
        time: f64,
        state: RigState,
    ) -> Result<TerrainResponse, CosimError>;

    fn diagnostics(&self) -> &ClampDiagnostics;

    /// Current terrain state as a checkpoint record.
    fn snapshot(&self, label: &str) -> CheckpointRecord;
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CosimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("checkpoint {label}: {source}")]
    Checkpoint {
        label: String,
        source: CheckpointError,
    },

    #[error("checkpoint {label} was written by {found} terrain, expected {expected}")]
    CheckpointVariant {
        label: String,
        expected: TerrainType,
        found: TerrainType,
    },

    #[error("checkpoint state does not fit this terrain: {0}")]
    CheckpointShape(String),

    #[error("{tire} tire cannot run on {terrain} terrain")]
    IncompatibleTerrain { tire: TireType, terrain: TerrainType },

    #[error("{terrain} terrain does not serve {geometry} contact")]
    UnsupportedGeometry {
        terrain: TerrainType,
        geometry: &'static str,
    },

    #[error("invalid mesh topology: {0}")]
    InvalidTopology(String),

    #[error("step {step}: rig sent {got} vertices, topology has {expected}")]
    TopologyMismatch { step: u64, expected: usize, got: usize },

    #[error("unexpected {got} payload, expected {expected}")]
    PayloadMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("granular terrain has not finished settling")]
    NotSettled,

    #[error("node used out of order: {0}")]
    Lifecycle(&'static str),

    #[error("SPH parameter file {path}: {reason}")]
    SphParameters { path: PathBuf, reason: String },
}
