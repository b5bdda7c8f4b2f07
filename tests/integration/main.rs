//! Co-simulation integration tests.
//!
//! Both ranks run inside the test process, joined with `tokio::join!`, over
//! the in-memory transport or TCP loopback. Every test works in its own
//! directory under the system temp dir and removes it when done.
//!
//!   cargo test --test integration

mod failures;
mod scenarios;
mod transport;

use std::path::{Path, PathBuf};

use cosim_core::config::{CosimConfig, SamplingMethod};
use cosim_core::{Role, TerrainType, TireType};
use cosimd::{run_dir, run_rank, CoordinatorError, MemoryTransport, RunSummary};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Output root removed on drop.
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    pub fn new(test: &str) -> Self {
        let root = std::env::temp_dir().join(format!("cosim-it-{}-{}", std::process::id(), test));
        let _ = std::fs::remove_dir_all(&root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// A short, quiet run: 10 steps of 1 ms, one frame every 5 steps.
pub fn quick_config(scratch: &Scratch, tire: TireType, terrain: TerrainType) -> CosimConfig {
    let mut config = CosimConfig::default();
    config.run.out_dir = scratch.root().to_path_buf();
    config.run.step_size = 1e-3;
    config.run.sim_time = 0.01;
    config.run.output_fps = 200.0;
    config.run.verbose = false;
    config.rig.tire = tire;
    config.terrain.kind = terrain;
    config
}

/// Small granular bed that settles in a handful of steps.
pub fn small_granular(config: &mut CosimConfig) {
    config.terrain.patch_length = Some(1.0);
    config.terrain.patch_width = Some(0.4);
    config.terrain.threads = 2;
    let g = &mut config.terrain.granular;
    g.radius = 0.02;
    g.init_height = 0.1;
    g.sampling = SamplingMethod::RegularGrid;
    g.settling_time = 0.01;
    g.settling_output_fps = 500.0;
}

pub fn node_dir(config: &CosimConfig, role: Role) -> PathBuf {
    run_dir(config).join(role.node_name())
}

pub type RankResult = Result<RunSummary, CoordinatorError>;

/// Run both ranks over an in-memory channel.
pub async fn run_pair(config: &CosimConfig) -> (RankResult, RankResult) {
    let (rig_end, terrain_end) = MemoryTransport::pair();
    tokio::join!(
        run_rank(config, Role::Rig, rig_end),
        run_rank(config, Role::Terrain, terrain_end),
    )
}
