//! Rig node: a single wheel on a test rig, driven at a prescribed forward
//! velocity and spin, free to move vertically under gravity and contact.
//!
//! `Rig<T>` owns the shared lifecycle (bodies, prescribed motion, drawbar-pull
//! filter, output). The tire model `T` decides what is exported to the
//! terrain: a footprint for a rigid tire, a surface mesh for a flexible one.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;

use cosim_core::config::{ceil_ratio, RigConfig};
use cosim_core::payload::{
    ContactGeometry, Footprint, MeshState, MeshTopology, TerrainSample, Vec3,
};
use cosim_core::{RigInit, RigState, Role, TerrainInit, TerrainResponse, TireType};

use crate::node::{CosimError, CosimNode, NodeContext, NodeTimer, RigNode};
use crate::output::OutputDir;

pub const GRAVITY: f64 = 9.81;

/// Slip velocity (m/s) over which friction ramps to its full value.
const SLIP_SMOOTHING: f64 = 1e-2;

/// Fraction of the remaining deflection error closed per exchange.
const DEFLECTION_RELAXATION: f64 = 0.05;

/// Largest radial deflection, as a fraction of the tire radius.
const MAX_DEFLECTION: f64 = 0.3;

// ── Wheel kinematics ──────────────────────────────────────────────────────────

/// Wheel center state in the world frame.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WheelState {
    pub center: Vec3,
    pub velocity: Vec3,
    /// Spin rate about +y (rad/s). Positive rolls the wheel toward +x.
    pub omega: f64,
    /// Accumulated spin angle (rad).
    pub angle: f64,
}

/// Spin rate for forward speed `v` at longitudinal slip `slip`.
pub fn wheel_omega(v: f64, radius: f64, slip: f64) -> f64 {
    v / (radius * (1.0 - slip))
}

/// Moving average over a fixed number of steps.
#[derive(Debug, Clone)]
pub struct DbpFilter {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl DbpFilter {
    /// Window of `window_time` seconds at step `step_size`.
    pub fn new(window_time: f64, step_size: f64) -> Self {
        let window = (ceil_ratio(window_time, step_size) as usize).max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) -> f64 {
        self.samples.push_back(value);
        self.sum += value;
        if self.samples.len() > self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

// ── Tire models ───────────────────────────────────────────────────────────────

/// What a tire variant exports and how it turns terrain reactions into a
/// net force on the wheel.
pub trait TireModel: Send {
    const TYPE: TireType;

    fn geometry(&self) -> ContactGeometry;

    fn contact_state(&self, wheel: &WheelState, normal_load: f64) -> RigState;

    /// Apply the terrain response; returns the net force on the wheel center.
    fn apply(
        &mut self,
        wheel: &WheelState,
        response: TerrainResponse,
        step: u64,
    ) -> Result<Vec3, CosimError>;

    fn frame(&self) -> serde_json::Value;
}

/// Rigid tire exchanging a single contact footprint.
#[derive(Debug, Clone)]
pub struct RigidTire {
    radius: f64,
    contact_radius: f64,
    friction: f64,
    last_sample: Option<TerrainSample>,
}

impl RigidTire {
    pub fn new(settings: &RigConfig) -> Self {
        Self {
            radius: settings.tire_model.radius,
            contact_radius: settings.tire_model.contact_radius,
            friction: settings.material.friction as f64,
            last_sample: None,
        }
    }
}

impl TireModel for RigidTire {
    const TYPE: TireType = TireType::Rigid;

    fn geometry(&self) -> ContactGeometry {
        ContactGeometry::Footprint {
            contact_radius: self.contact_radius,
        }
    }

    fn contact_state(&self, wheel: &WheelState, normal_load: f64) -> RigState {
        let [x, y, z] = wheel.center;
        RigState::Footprint(Footprint {
            position: [x, y, z - self.radius],
            velocity: wheel.velocity,
            normal_load,
            contact_radius: self.contact_radius,
        })
    }

    fn apply(
        &mut self,
        wheel: &WheelState,
        response: TerrainResponse,
        _step: u64,
    ) -> Result<Vec3, CosimError> {
        let sample = match response {
            TerrainResponse::Sample(s) => s,
            TerrainResponse::NodeForces(_) => {
                return Err(CosimError::PayloadMismatch {
                    expected: "sample",
                    got: "node forces",
                })
            }
        };
        self.last_sample = Some(sample);

        let bottom = wheel.center[2] - self.radius;
        let penetration = sample.height - bottom;
        let fz = if penetration > 0.0 && sample.stiffness > 0.0 {
            (sample.stiffness * penetration - sample.damping * wheel.velocity[2]).max(0.0)
        } else {
            0.0
        };
        let slip_velocity = wheel.velocity[0] - wheel.omega * self.radius;
        let fx = -self.friction * fz * (slip_velocity / SLIP_SMOOTHING).tanh();
        Ok([fx, 0.0, fz])
    }

    fn frame(&self) -> serde_json::Value {
        json!({ "sample": self.last_sample })
    }
}

/// Deformable tire exchanging its full surface mesh.
///
/// The carcass is a cylinder of `circ x width` nodes. Each node deflects
/// radially against a stiffness made of the structural part plus, when
/// pressure is enabled, `pressure * width`.
#[derive(Debug, Clone)]
pub struct FlexibleTire {
    radius: f64,
    topology: MeshTopology,
    /// (sin, cos) of each node's rest angle, and its lateral offset.
    layout: Vec<(f64, f64, f64)>,
    node_stiffness: f64,
    deflection: Vec<f64>,
    forces: Vec<Vec3>,
}

impl FlexibleTire {
    pub fn new(settings: &RigConfig) -> Self {
        let tm = &settings.tire_model;
        let nc = tm.mesh_divisions_circ as usize;
        let nw = tm.mesh_divisions_width as usize;

        let mut layout = Vec::with_capacity(nc * nw);
        let mut vertices = Vec::with_capacity(nc * nw);
        for i in 0..nc {
            let phi = 2.0 * PI * i as f64 / nc as f64;
            let (s, c) = phi.sin_cos();
            for j in 0..nw {
                let y = if nw > 1 {
                    -tm.width / 2.0 + tm.width * j as f64 / (nw - 1) as f64
                } else {
                    0.0
                };
                layout.push((s, c, y));
                vertices.push([tm.radius * s, y, -tm.radius * c]);
            }
        }

        let mut faces = Vec::with_capacity(2 * nc * nw.saturating_sub(1));
        let idx = |i: usize, j: usize| ((i % nc) * nw + j) as u32;
        for i in 0..nc {
            for j in 0..nw.saturating_sub(1) {
                faces.push([idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]);
                faces.push([idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]);
            }
        }

        let pressure = if tm.pressure_enabled {
            tm.pressure * tm.width
        } else {
            0.0
        };
        let node_stiffness = (tm.structural_stiffness + pressure) / nw as f64;

        Self {
            radius: tm.radius,
            topology: MeshTopology { vertices, faces },
            layout,
            node_stiffness,
            deflection: vec![0.0; nc * nw],
            forces: vec![[0.0; 3]; nc * nw],
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.layout.len()
    }

    /// Outward radial unit vector and lateral offset of node `k` at spin
    /// angle `angle`.
    fn radial(&self, k: usize, angle: f64) -> (Vec3, f64) {
        let (s, c, y) = self.layout[k];
        let (sa, ca) = angle.sin_cos();
        // rest angle phi rotated back by the spin angle
        let sin = s * ca - c * sa;
        let cos = c * ca + s * sa;
        ([sin, 0.0, -cos], y)
    }
}

impl TireModel for FlexibleTire {
    const TYPE: TireType = TireType::Flexible;

    fn geometry(&self) -> ContactGeometry {
        ContactGeometry::Mesh(self.topology.clone())
    }

    fn contact_state(&self, wheel: &WheelState, _normal_load: f64) -> RigState {
        let n = self.vertex_count();
        let mut positions = Vec::with_capacity(n);
        let mut velocities = Vec::with_capacity(n);
        for k in 0..n {
            let (u, y) = self.radial(k, wheel.angle);
            let r = self.radius - self.deflection[k];
            let rel = [r * u[0], y, r * u[2]];
            positions.push([
                wheel.center[0] + rel[0],
                wheel.center[1] + rel[1],
                wheel.center[2] + rel[2],
            ]);
            // omega about +y: w x p = (w p_z, 0, -w p_x)
            velocities.push([
                wheel.velocity[0] + wheel.omega * rel[2],
                wheel.velocity[1],
                wheel.velocity[2] - wheel.omega * rel[0],
            ]);
        }
        RigState::Mesh(MeshState {
            positions,
            velocities,
        })
    }

    fn apply(
        &mut self,
        wheel: &WheelState,
        response: TerrainResponse,
        step: u64,
    ) -> Result<Vec3, CosimError> {
        let forces = match response {
            TerrainResponse::NodeForces(f) => f,
            TerrainResponse::Sample(_) => {
                return Err(CosimError::PayloadMismatch {
                    expected: "node forces",
                    got: "sample",
                })
            }
        };
        if forces.len() != self.vertex_count() {
            return Err(CosimError::TopologyMismatch {
                step,
                expected: self.vertex_count(),
                got: forces.len(),
            });
        }

        let mut total = [0.0; 3];
        for (k, f) in forces.iter().enumerate() {
            total[0] += f[0];
            total[1] += f[1];
            total[2] += f[2];

            let (u, _) = self.radial(k, wheel.angle);
            let inward = -(f[0] * u[0] + f[2] * u[2]);
            let target = (inward / self.node_stiffness).clamp(0.0, MAX_DEFLECTION * self.radius);
            self.deflection[k] += DEFLECTION_RELAXATION * (target - self.deflection[k]);
        }
        self.forces = forces;
        Ok(total)
    }

    fn frame(&self) -> serde_json::Value {
        let max_deflection = self.deflection.iter().cloned().fold(0.0, f64::max);
        let loaded = self.forces.iter().filter(|f| f.iter().any(|c| *c != 0.0)).count();
        json!({
            "vertices": self.vertex_count(),
            "loaded_nodes": loaded,
            "max_deflection": max_deflection,
        })
    }
}

// ── Rig node ──────────────────────────────────────────────────────────────────

pub type RigidTireNode = Rig<RigidTire>;
pub type FlexibleTireNode = Rig<FlexibleTire>;

pub struct Rig<T: TireModel> {
    ctx: NodeContext,
    settings: RigConfig,
    tire: T,
    output: OutputDir,
    timer: NodeTimer,
    wheel: WheelState,
    /// Everything carried by the wheel (kg).
    load_mass: f64,
    force: Vec3,
    drawbar_pull: DbpFilter,
    terrain: Option<TerrainInit>,
    awaiting_response: bool,
    step: u64,
    time: f64,
}

impl<T: TireModel> Rig<T> {
    pub fn new(ctx: NodeContext, settings: RigConfig, tire: T) -> Result<Self, CosimError> {
        let output = OutputDir::new(&ctx.node_dir)?;
        let m = settings.body_masses;
        let load_mass = m.chassis + m.set_toe + m.carrier + m.rim + settings.tire_model.mass;
        let drawbar_pull = DbpFilter::new(settings.dbp_filter_window, ctx.step_size);

        tracing::info!(
            tire = %T::TYPE,
            model = %settings.tire_model.name,
            load_mass,
            threads = ctx.threads,
            init_vel = settings.init_vel,
            slip = settings.slip,
            "rig node created"
        );

        Ok(Self {
            ctx,
            settings,
            tire,
            output,
            timer: NodeTimer::default(),
            wheel: WheelState::default(),
            load_mass,
            force: [0.0; 3],
            drawbar_pull,
            terrain: None,
            awaiting_response: false,
            step: 0,
            time: 0.0,
        })
    }

    pub fn wheel(&self) -> &WheelState {
        &self.wheel
    }

    pub fn tire(&self) -> &T {
        &self.tire
    }

    pub fn load_mass(&self) -> f64 {
        self.load_mass
    }

    /// Filtered longitudinal terrain force on the wheel.
    pub fn drawbar_pull(&self) -> f64 {
        self.drawbar_pull.value()
    }

    fn bound(&self) -> Result<&TerrainInit, CosimError> {
        self.terrain
            .as_ref()
            .ok_or(CosimError::Lifecycle("rig used before terrain acknowledgement"))
    }

    fn integrate(&mut self, dt: f64) {
        let w = &mut self.wheel;
        w.velocity[2] += (self.force[2] / self.load_mass - GRAVITY) * dt;
        w.center[0] += w.velocity[0] * dt;
        w.center[1] += w.velocity[1] * dt;
        w.center[2] += w.velocity[2] * dt;
        w.angle += w.omega * dt;
        self.drawbar_pull.push(self.force[0]);
        self.time += dt;
    }
}

impl<T: TireModel> CosimNode for Rig<T> {
    fn role(&self) -> Role {
        Role::Rig
    }

    fn step_size(&self) -> f64 {
        self.ctx.step_size
    }

    fn node_dir(&self) -> &Path {
        &self.ctx.node_dir
    }

    fn advance(&mut self, dt: f64) -> Result<(), CosimError> {
        self.bound()?;
        let start = Instant::now();
        self.integrate(dt);
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
            "wheel": self.wheel,
            "force": self.force,
            "drawbar_pull": self.drawbar_pull.value(),
            "tire": self.tire.frame(),
            "sim_time": {
                "last": self.timer.last_step_sim_time(),
                "cumulative": self.timer.cumulative_sim_time(),
            },
        });
        self.output.write_frame(frame, &value)?;
        Ok(())
    }

    fn write_checkpoint(&mut self, label: &str) -> Result<(), CosimError> {
        tracing::debug!(label, "rig node keeps no checkpoint state");
        Ok(())
    }

    fn timer(&self) -> &NodeTimer {
        &self.timer
    }
}

impl<T: TireModel> RigNode for Rig<T> {
    fn tire_type(&self) -> TireType {
        T::TYPE
    }

    fn init_payload(&mut self) -> Result<RigInit, CosimError> {
        Ok(RigInit {
            tire: T::TYPE,
            tire_radius: self.settings.tire_model.radius,
            tire_width: self.settings.tire_model.width,
            load_mass: self.load_mass,
            material: self.settings.material,
            geometry: self.tire.geometry(),
        })
    }

    fn on_terrain_init(&mut self, init: &TerrainInit) -> Result<(), CosimError> {
        if !T::TYPE.supports(init.terrain) {
            return Err(CosimError::IncompatibleTerrain {
                tire: T::TYPE,
                terrain: init.terrain,
            });
        }

        let radius = self.settings.tire_model.radius;
        let v = self.settings.init_vel;
        self.wheel = WheelState {
            center: [0.0, 0.0, init.surface_height + radius],
            velocity: [v, 0.0, 0.0],
            omega: wheel_omega(v, radius, self.settings.slip),
            angle: 0.0,
        };
        tracing::info!(
            terrain = %init.terrain,
            surface_height = init.surface_height,
            patch_length = init.patch.length(),
            patch_width = init.patch.width(),
            omega = self.wheel.omega,
            "terrain acknowledged, wheel placed"
        );
        self.terrain = Some(init.clone());
        Ok(())
    }

    fn contact_state(&mut self, step: u64, _time: f64) -> Result<RigState, CosimError> {
        self.bound()?;
        self.step = step;
        self.awaiting_response = true;
        Ok(self.tire.contact_state(&self.wheel, self.force[2]))
    }

    fn apply_response(&mut self, response: TerrainResponse) -> Result<(), CosimError> {
        self.bound()?;
        if !self.awaiting_response {
            return Err(CosimError::Lifecycle("terrain response without a published state"));
        }
        self.force = self.tire.apply(&self.wheel, response, self.step)?;
        self.awaiting_response = false;
        if self.ctx.verbose {
            tracing::trace!(
                step = self.step,
                fz = self.force[2],
                fx = self.force[0],
                "contact force"
            );
        }
        Ok(())
    }
}
