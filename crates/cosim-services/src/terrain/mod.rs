//! Terrain node: one lifecycle, five backends.
//!
//! `Terrain<M>` owns everything the variants share: the patch bounds and the
//! out-of-bounds clamp, topology validation, checkpoint load/store, output
//! frames and the advance timer. The backend model `M` only computes
//! reactions and integrates its own state.
//!
//! Lifecycle: created → prepared (settled or restored) → bound to the rig's
//! geometry → stepped. Contact queries before the rig is bound are refused.

pub mod granular;
pub mod grid;
pub mod rigid;
pub mod scm;
pub mod sph;

use std::path::Path;
use std::time::Instant;

use serde_json::json;

use cosim_core::checkpoint::{CheckpointRecord, TerrainState, SETTLED_LABEL};
use cosim_core::config::PatchSettings;
use cosim_core::payload::{ContactGeometry, Footprint, TerrainSample, Vec3};
use cosim_core::{RigInit, RigState, Role, TerrainInit, TerrainResponse, TerrainType, TireType};

use crate::checkpoint_store::CheckpointStore;
use crate::diagnostics::ClampDiagnostics;
use crate::node::{CosimError, CosimNode, NodeContext, NodeTimer, PrepareReport, TerrainNode};
use crate::output::OutputDir;

/// What a model may use while building its initial state.
pub struct PrepareEnv<'a> {
    pub output: &'a OutputDir,
    pub step_size: f64,
    pub verbose: bool,
    /// Whether output files are written at all.
    pub output_enabled: bool,
    pub seed: u64,
}

/// A terrain backend.
pub trait TerrainModel: Send {
    fn kind(&self) -> TerrainType;

    /// Whether the model answers footprint (scalar sample) queries.
    fn serves_footprint(&self) -> bool {
        false
    }

    /// Checkpoint loaded instead of `initialize` when checkpoints are enabled.
    fn restart_label(&self) -> Option<&'static str> {
        None
    }

    /// Build the initial state. Returns true when settling ran, in which case
    /// the settled state is checkpointed.
    fn initialize(&mut self, env: &PrepareEnv<'_>) -> Result<bool, CosimError>;

    fn surface_height(&self) -> f64;

    fn sample(&mut self, footprint: &Footprint) -> Result<TerrainSample, CosimError> {
        let _ = footprint;
        Err(CosimError::UnsupportedGeometry {
            terrain: self.kind(),
            geometry: "footprint",
        })
    }

    /// Reaction force on each contact sphere, in input order.
    fn node_forces(&mut self, positions: &[Vec3], velocities: &[Vec3], radius: f64) -> Vec<Vec3>;

    fn step(&mut self, dt: f64);

    fn state(&self) -> TerrainState;

    fn restore(&mut self, state: TerrainState) -> Result<(), CosimError>;

    fn frame(&self) -> serde_json::Value;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Prepared,
    Bound,
}

/// Contact geometry accepted from the rig.
#[derive(Debug, Clone, Copy)]
enum Binding {
    Footprint,
    Mesh { vertices: usize },
}

impl Binding {
    fn name(self) -> &'static str {
        match self {
            Binding::Footprint => "footprint",
            Binding::Mesh { .. } => "mesh",
        }
    }
}

pub struct Terrain<M: TerrainModel> {
    ctx: NodeContext,
    patch: PatchSettings,
    model: M,
    store: CheckpointStore,
    output: OutputDir,
    timer: NodeTimer,
    diagnostics: ClampDiagnostics,
    phase: Phase,
    binding: Option<Binding>,
    tire: Option<TireType>,
    time: f64,
}

impl<M: TerrainModel> Terrain<M> {
    pub fn new(ctx: NodeContext, patch: PatchSettings, model: M) -> Result<Self, CosimError> {
        let output = OutputDir::new(&ctx.node_dir)?;
        let store = CheckpointStore::new(&ctx.node_dir)?;
        let diagnostics = ClampDiagnostics::new(ctx.verbose);

        tracing::info!(
            terrain = %model.kind(),
            patch_length = patch.bounds.length(),
            patch_width = patch.bounds.width(),
            threads = ctx.threads,
            "terrain node created"
        );

        Ok(Self {
            ctx,
            patch,
            model,
            store,
            output,
            timer: NodeTimer::default(),
            diagnostics,
            phase: Phase::Created,
            binding: None,
            tire: None,
            time: 0.0,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn not_ready(&self) -> CosimError {
        if self.model.kind().is_granular() && self.phase == Phase::Created {
            CosimError::NotSettled
        } else {
            CosimError::Lifecycle("terrain queried before the rig handshake")
        }
    }

    fn validate_geometry(&self, init: &RigInit) -> Result<Binding, CosimError> {
        match &init.geometry {
            ContactGeometry::Footprint { contact_radius } => {
                if !(contact_radius.is_finite() && *contact_radius > 0.0) {
                    return Err(CosimError::InvalidTopology(format!(
                        "footprint contact radius {contact_radius}"
                    )));
                }
                Ok(Binding::Footprint)
            }
            ContactGeometry::Mesh(mesh) => {
                let n = mesh.vertex_count();
                if n == 0 {
                    return Err(CosimError::InvalidTopology("mesh has no vertices".into()));
                }
                let bad_vertex =
                    mesh.vertices.iter().position(|v| v.iter().any(|c| !c.is_finite()));
                if let Some(v) = bad_vertex {
                    return Err(CosimError::InvalidTopology(format!("vertex {v} is not finite")));
                }
                let bad_face = mesh.faces.iter().position(|f| f.iter().any(|&i| i as usize >= n));
                if let Some(f) = bad_face {
                    return Err(CosimError::InvalidTopology(format!(
                        "face {f} indexes past {n} vertices"
                    )));
                }
                Ok(Binding::Mesh { vertices: n })
            }
        }
    }

    fn respond_footprint(
        &mut self,
        step: u64,
        fp: Footprint,
    ) -> Result<TerrainResponse, CosimError> {
        let [x, y, _] = fp.position;
        let sample = if self.patch.bounds.contains(x, y) {
            self.model.sample(&fp)?
        } else {
            self.diagnostics.record(step, 0, self.patch.bounds.excursion(x, y));
            TerrainSample::no_contact(self.model.surface_height())
        };
        Ok(TerrainResponse::Sample(sample))
    }

    fn respond_mesh(
        &mut self,
        step: u64,
        expected: usize,
        positions: Vec<Vec3>,
        velocities: Vec<Vec3>,
    ) -> Result<TerrainResponse, CosimError> {
        let got = if positions.len() != expected {
            positions.len()
        } else {
            velocities.len()
        };
        if got != expected {
            return Err(CosimError::TopologyMismatch { step, expected, got });
        }

        let mut inside = Vec::with_capacity(expected);
        for (k, p) in positions.iter().enumerate() {
            if self.patch.bounds.contains(p[0], p[1]) {
                inside.push(k);
            } else {
                self.diagnostics.record(step, k, self.patch.bounds.excursion(p[0], p[1]));
            }
        }

        let mut forces = vec![[0.0; 3]; expected];
        if !inside.is_empty() {
            let pos: Vec<Vec3> = inside.iter().map(|&k| positions[k]).collect();
            let vel: Vec<Vec3> = inside.iter().map(|&k| velocities[k]).collect();
            let reactions = self.model.node_forces(&pos, &vel, self.patch.proxy_contact_radius);
            for (&k, f) in inside.iter().zip(reactions) {
                forces[k] = f;
            }
        }
        Ok(TerrainResponse::NodeForces(forces))
    }
}

impl<M: TerrainModel> CosimNode for Terrain<M> {
    fn role(&self) -> Role {
        Role::Terrain
    }

    fn step_size(&self) -> f64 {
        self.ctx.step_size
    }

    fn node_dir(&self) -> &Path {
        &self.ctx.node_dir
    }

    fn advance(&mut self, dt: f64) -> Result<(), CosimError> {
        if self.phase != Phase::Bound {
            return Err(self.not_ready());
        }
        let start = Instant::now();
        self.model.step(dt);
        self.time += dt;
        self.timer.record(start);
        Ok(())
    }

    fn output_data(&mut self, frame: u64) -> Result<(), CosimError> {
        if !self.ctx.output {
            return Ok(());
        }
        let value = json!({
            "frame": frame,
            "time": self.time,
            "terrain": self.model.kind(),
            "model": self.model.frame(),
            "clamped_points": self.diagnostics.total(),
            "sim_time": {
                "last": self.timer.last_step_sim_time(),
                "cumulative": self.timer.cumulative_sim_time(),
            },
        });
        self.output.write_frame(frame, &value)?;
        Ok(())
    }

    fn write_checkpoint(&mut self, label: &str) -> Result<(), CosimError> {
        let record = self.snapshot(label);
        self.store.write(&record)?;
        Ok(())
    }

    fn timer(&self) -> &NodeTimer {
        &self.timer
    }
}

impl<M: TerrainModel> TerrainNode for Terrain<M> {
    fn terrain_type(&self) -> TerrainType {
        self.model.kind()
    }

    fn prepare(&mut self) -> Result<PrepareReport, CosimError> {
        if self.phase != Phase::Created {
            return Err(CosimError::Lifecycle("terrain prepared twice"));
        }
        let kind = self.model.kind();

        let report = match self.model.restart_label().filter(|_| self.ctx.use_checkpoint) {
            Some(label) => {
                let record = self.store.load(label)?;
                if record.terrain != kind {
                    return Err(CosimError::CheckpointVariant {
                        label: label.to_string(),
                        expected: kind,
                        found: record.terrain,
                    });
                }
                self.model.restore(record.state)?;
                PrepareReport {
                    settled: false,
                    restored_from: Some(label.to_string()),
                    description: self.model.describe(),
                }
            }
            None => {
                if self.ctx.use_checkpoint {
                    tracing::debug!(
                        terrain = %kind,
                        "terrain has no restart checkpoint, building fresh"
                    );
                }
                let env = PrepareEnv {
                    output: &self.output,
                    step_size: self.ctx.step_size,
                    verbose: self.ctx.verbose,
                    output_enabled: self.ctx.output,
                    seed: self.ctx.seed,
                };
                let settled = self.model.initialize(&env)?;
                if settled {
                    let record = self.snapshot(SETTLED_LABEL);
                    self.store.write(&record)?;
                }
                PrepareReport {
                    settled,
                    restored_from: None,
                    description: self.model.describe(),
                }
            }
        };

        tracing::info!(
            terrain = %kind,
            settled = report.settled,
            restored_from = report.restored_from.as_deref().unwrap_or("-"),
            state = %report.description,
            "terrain prepared"
        );
        self.phase = Phase::Prepared;
        Ok(report)
    }

    fn accept_rig(&mut self, init: RigInit) -> Result<TerrainInit, CosimError> {
        match self.phase {
            Phase::Created => return Err(self.not_ready()),
            Phase::Bound => return Err(CosimError::Lifecycle("rig accepted twice")),
            Phase::Prepared => {}
        }
        let binding = self.validate_geometry(&init)?;
        let kind = self.model.kind();

        let footprint_refused =
            matches!(binding, Binding::Footprint) && !self.model.serves_footprint();
        if !init.tire.supports(kind) || footprint_refused {
            tracing::error!(
                tire = %init.tire,
                terrain = %kind,
                geometry = binding.name(),
                "rig contact geometry is not served by this terrain"
            );
        }
        if let Binding::Mesh { vertices } = binding {
            tracing::info!(vertices, "rig mesh topology accepted");
        }

        self.binding = Some(binding);
        self.tire = Some(init.tire);
        self.phase = Phase::Bound;
        Ok(TerrainInit {
            terrain: kind,
            patch: self.patch.bounds,
            surface_height: self.model.surface_height(),
        })
    }

    fn respond(
        &mut self,
        step: u64,
        _time: f64,
        state: RigState,
    ) -> Result<TerrainResponse, CosimError> {
        let binding = match (self.phase, self.binding) {
            (Phase::Bound, Some(b)) => b,
            _ => return Err(self.not_ready()),
        };
        if let Some(tire) = self.tire {
            if !tire.supports(self.model.kind()) {
                return Err(CosimError::IncompatibleTerrain {
                    tire,
                    terrain: self.model.kind(),
                });
            }
        }

        let response = match (binding, state) {
            (Binding::Footprint, RigState::Footprint(fp)) => self.respond_footprint(step, fp),
            (Binding::Mesh { vertices }, RigState::Mesh(mesh)) => {
                self.respond_mesh(step, vertices, mesh.positions, mesh.velocities)
            }
            (binding, RigState::Footprint(_)) => Err(CosimError::PayloadMismatch {
                expected: binding.name(),
                got: "footprint",
            }),
            (binding, RigState::Mesh(_)) => Err(CosimError::PayloadMismatch {
                expected: binding.name(),
                got: "mesh",
            }),
        };
        self.diagnostics.flush_step();
        response
    }

    fn diagnostics(&self) -> &ClampDiagnostics {
        &self.diagnostics
    }

    fn snapshot(&self, label: &str) -> CheckpointRecord {
        CheckpointRecord {
            label: label.to_string(),
            terrain: self.model.kind(),
            time: self.time,
            state: self.model.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::config::CosimConfig;
    use cosim_core::payload::{MeshState, MeshTopology};
    use cosim_core::TireType;

    use crate::terrain::rigid::RigidPlane;

    fn terrain(name: &str) -> Terrain<RigidPlane> {
        let config = CosimConfig::default();
        let run_dir =
            std::env::temp_dir().join(format!("cosim-terrain-{}-{}", std::process::id(), name));
        let ctx = NodeContext::new(Role::Terrain, &config, &run_dir);
        let variant = config.terrain.variant();
        let patch = variant.patch().clone();
        let model = RigidPlane::new(&patch);
        Terrain::new(ctx, patch, model).unwrap()
    }

    fn cleanup(t: &Terrain<RigidPlane>) {
        if let Some(run_dir) = t.node_dir().parent() {
            let _ = std::fs::remove_dir_all(run_dir);
        }
    }

    fn mesh_init(vertices: Vec<Vec3>, faces: Vec<[u32; 3]>) -> RigInit {
        RigInit {
            tire: TireType::Flexible,
            tire_radius: 0.5,
            tire_width: 0.2,
            load_mass: 100.0,
            material: Default::default(),
            geometry: ContactGeometry::Mesh(MeshTopology { vertices, faces }),
        }
    }

    #[test]
    fn queries_before_handshake_are_refused() {
        let mut t = terrain("refused");
        let state = RigState::Mesh(MeshState {
            positions: vec![],
            velocities: vec![],
        });
        assert!(matches!(t.respond(0, 0.0, state), Err(CosimError::Lifecycle(_))));
        assert!(t.accept_rig(mesh_init(vec![[0.0; 3]], vec![])).is_err());
        cleanup(&t);
    }

    #[test]
    fn invalid_topology_is_rejected() {
        let mut t = terrain("topology");
        t.prepare().unwrap();
        let err = t
            .accept_rig(mesh_init(vec![[0.0; 3], [1.0, 0.0, 0.0]], vec![[0, 1, 2]]))
            .unwrap_err();
        assert!(matches!(err, CosimError::InvalidTopology(_)));
        let err = t.accept_rig(mesh_init(vec![], vec![])).unwrap_err();
        assert!(matches!(err, CosimError::InvalidTopology(_)));
        let err = t
            .accept_rig(mesh_init(vec![[f64::NAN, 0.0, 0.0]], vec![]))
            .unwrap_err();
        assert!(matches!(err, CosimError::InvalidTopology(_)));
        cleanup(&t);
    }

    #[test]
    fn out_of_bounds_nodes_get_exactly_zero_force() {
        let mut t = terrain("clamp");
        t.prepare().unwrap();
        // both nodes penetrate the plane; the second is outside the 10 x 1 patch
        let vertices = vec![[0.0, 0.0, 0.0], [7.0, 0.0, 0.0]];
        t.accept_rig(mesh_init(vertices.clone(), vec![])).unwrap();

        let state = RigState::Mesh(MeshState {
            positions: vec![[0.0, 0.0, 0.0], [7.0, 0.0, 0.0]],
            velocities: vec![[0.0; 3]; 2],
        });
        match t.respond(3, 0.0, state).unwrap() {
            TerrainResponse::NodeForces(f) => {
                assert_eq!(f.len(), 2);
                assert!(f[0][2] > 0.0);
                assert_eq!(f[1], [0.0, 0.0, 0.0]);
            }
            other => panic!("expected node forces, got {other:?}"),
        }
        assert_eq!(t.diagnostics().total(), 1);
        cleanup(&t);
    }

    #[test]
    fn vertex_count_change_is_fatal() {
        let mut t = terrain("count");
        t.prepare().unwrap();
        t.accept_rig(mesh_init(vec![[0.0; 3]; 3], vec![[0, 1, 2]])).unwrap();
        let state = RigState::Mesh(MeshState {
            positions: vec![[0.0; 3]; 2],
            velocities: vec![[0.0; 3]; 2],
        });
        let err = t.respond(5, 0.0, state).unwrap_err();
        assert!(matches!(
            err,
            CosimError::TopologyMismatch { step: 5, expected: 3, got: 2 }
        ));
        cleanup(&t);
    }
}
