//! Granular terrain: discrete spheres in an open-top container.
//!
//! Contacts are linear spring-dashpots with Coulomb-capped tangential damping
//! and constant adhesion `π r² p` from the cohesion pressure. Damping
//! coefficients are mass-specific (1/s). Broad phase is a uniform grid with
//! cells one particle diameter wide.
//!
//! Rig nodes are kinematic spheres. Their reaction on the bed is held and
//! applied over the next `step`.
//!
//! The CPU and GPU backends share the solver. The CPU backend splits force
//! evaluation across scoped worker threads; every particle sums its own
//! contacts, so results do not depend on the thread count.

use std::f64::consts::PI;

use serde_json::json;

use cosim_core::checkpoint::{TerrainState, SETTLED_LABEL};
use cosim_core::config::{GranularSettings, PatchSettings};
use cosim_core::payload::{ContactMaterial, PatchBounds, Vec3};
use cosim_core::TerrainType;

use super::grid::{axpy, dot, norm, sub, SpatialGrid};
use super::{PrepareEnv, TerrainModel};
use crate::node::CosimError;
use crate::rig::GRAVITY;
use crate::settling::{self, Settle, SettlingPlan};

/// Fraction of the contact oscillation period used as the substep.
const SUBSTEP_FRACTION: f64 = 0.3;

/// Where force evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GranularBackend {
    Cpu { threads: usize },
    Gpu,
}

impl GranularBackend {
    fn kind(self) -> TerrainType {
        match self {
            GranularBackend::Cpu { .. } => TerrainType::GranularCpu,
            GranularBackend::Gpu => TerrainType::GranularGpu,
        }
    }

    fn threads(self) -> usize {
        match self {
            GranularBackend::Cpu { threads } => threads.max(1),
            GranularBackend::Gpu => 1,
        }
    }
}

/// Contact constants derived once from the settings.
#[derive(Debug, Clone, Copy)]
struct ContactLaw {
    radius: f64,
    mass: f64,
    kn: f64,
    gn: f64,
    gt: f64,
    friction: f64,
    adhesion: f64,
}

impl ContactLaw {
    fn new(settings: &GranularSettings) -> Self {
        let r = settings.radius;
        let m: &ContactMaterial = &settings.material;
        Self {
            radius: r,
            mass: settings.density * 4.0 / 3.0 * PI * r * r * r,
            kn: m.kn as f64,
            gn: m.gn as f64,
            gt: m.gt as f64,
            friction: m.friction as f64,
            adhesion: PI * r * r * settings.coh_pressure,
        }
    }

    /// Force on a body at relative position `d` (from the other body) with
    /// overlap `overlap` and relative velocity `v`. `m_eff` scales damping.
    fn contact(
        &self,
        d: &Vec3,
        dist: f64,
        overlap: f64,
        v: &Vec3,
        m_eff: f64,
        adhesive: bool,
    ) -> Vec3 {
        let n = [d[0] / dist, d[1] / dist, d[2] / dist];
        let vn = dot(v, &n);
        let spring = (self.kn * overlap - self.gn * m_eff * vn).max(0.0);
        let normal = if adhesive { spring - self.adhesion } else { spring };

        let mut f = [normal * n[0], normal * n[1], normal * n[2]];
        let vt = [v[0] - vn * n[0], v[1] - vn * n[1], v[2] - vn * n[2]];
        let speed = norm(&vt);
        if speed > 0.0 {
            let ft = (self.gt * m_eff * speed).min(self.friction * spring);
            axpy(&mut f, -ft / speed, &vt);
        }
        f
    }

    fn substep(&self) -> f64 {
        SUBSTEP_FRACTION * (0.5 * self.mass / self.kn).sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct GranularBed {
    backend: GranularBackend,
    settings: GranularSettings,
    law: ContactLaw,
    bounds: PatchBounds,
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    /// Rig reactions held for the next step, per particle.
    external: Vec<Vec3>,
    rig_contacts: usize,
    settled: bool,
}

impl GranularBed {
    pub fn new(
        backend: GranularBackend,
        patch: &PatchSettings,
        settings: GranularSettings,
    ) -> Self {
        Self {
            backend,
            law: ContactLaw::new(&settings),
            settings,
            bounds: patch.bounds,
            positions: Vec::new(),
            velocities: Vec::new(),
            external: Vec::new(),
            rig_contacts: 0,
            settled: false,
        }
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    fn set_particles(&mut self, positions: Vec<Vec3>, velocities: Vec<Vec3>) {
        self.external = vec![[0.0; 3]; positions.len()];
        self.positions = positions;
        self.velocities = velocities;
    }

    /// Container walls (floor and four sides) acting on a particle.
    fn wall_force(&self, p: &Vec3, v: &Vec3) -> Vec3 {
        let r = self.law.radius;
        let t = self.settings.wall_thickness;
        let b = &self.bounds;
        let m = self.law.mass;
        let mut f = [0.0; 3];
        let walls: [(f64, Vec3); 5] = [
            (p[2], [0.0, 0.0, 1.0]),
            (p[0] - b.x_min, [1.0, 0.0, 0.0]),
            (b.x_max - p[0], [-1.0, 0.0, 0.0]),
            (p[1] - b.y_min, [0.0, 1.0, 0.0]),
            (b.y_max - p[1], [0.0, -1.0, 0.0]),
        ];
        for (gap, n) in walls {
            // inside the wall slab, not past its far face
            if gap < r && gap > -t {
                let c = self.law.contact(&n, 1.0, r - gap, v, m, false);
                axpy(&mut f, 1.0, &c);
            }
        }
        f
    }

    /// Total force on each particle in `range`.
    fn forces_for(&self, grid: &SpatialGrid, range: std::ops::Range<usize>, out: &mut [Vec3]) {
        let r2 = 2.0 * self.law.radius;
        let m_eff = 0.5 * self.law.mass;
        for (slot, i) in out.iter_mut().zip(range) {
            let p = &self.positions[i];
            let v = &self.velocities[i];
            let mut f = [0.0, 0.0, -GRAVITY * self.law.mass];
            axpy(&mut f, 1.0, &self.external[i]);
            axpy(&mut f, 1.0, &self.wall_force(p, v));
            grid.for_each_near(p, |j| {
                if j == i {
                    return;
                }
                let d = sub(p, &self.positions[j]);
                let dist = norm(&d);
                if dist >= r2 || dist == 0.0 {
                    return;
                }
                let rel = sub(v, &self.velocities[j]);
                let c = self.law.contact(&d, dist, r2 - dist, &rel, m_eff, true);
                axpy(&mut f, 1.0, &c);
            });
            *slot = f;
        }
    }

    fn compute_forces(&self) -> Vec<Vec3> {
        let n = self.positions.len();
        let grid = SpatialGrid::build(&self.positions, 2.0 * self.law.radius);
        let mut forces = vec![[0.0; 3]; n];
        let threads = self.backend.threads();
        if threads <= 1 || n < 2 * threads {
            self.forces_for(&grid, 0..n, &mut forces);
            return forces;
        }
        let chunk = n.div_ceil(threads);
        std::thread::scope(|scope| {
            for (c, out) in forces.chunks_mut(chunk).enumerate() {
                let grid = &grid;
                let start = c * chunk;
                let end = start + out.len();
                scope.spawn(move || self.forces_for(grid, start..end, out));
            }
        });
        forces
    }

    fn integrate(&mut self, dt: f64) {
        if self.positions.is_empty() {
            return;
        }
        let substeps = (dt / self.law.substep()).ceil().max(1.0) as usize;
        let h = dt / substeps as f64;
        for _ in 0..substeps {
            let forces = self.compute_forces();
            let inv_m = 1.0 / self.law.mass;
            let particles = self.positions.iter_mut().zip(self.velocities.iter_mut());
            for ((p, v), f) in particles.zip(&forces) {
                axpy(v, h * inv_m, f);
                let vel = *v;
                axpy(p, h, &vel);
            }
        }
        self.external.iter_mut().for_each(|e| *e = [0.0; 3]);
    }
}

impl Settle for GranularBed {
    fn settle_step(&mut self, dt: f64) {
        self.integrate(dt);
    }

    fn snapshot(&self) -> serde_json::Value {
        json!({
            "radius": self.law.radius,
            "positions": self.positions,
        })
    }

    fn particle_count(&self) -> usize {
        self.positions.len()
    }
}

impl TerrainModel for GranularBed {
    fn kind(&self) -> TerrainType {
        self.backend.kind()
    }

    fn restart_label(&self) -> Option<&'static str> {
        Some(SETTLED_LABEL)
    }

    fn initialize(&mut self, env: &PrepareEnv<'_>) -> Result<bool, CosimError> {
        let s = &self.settings;
        let positions = settling::generate(
            s.sampling,
            &self.bounds,
            s.radius,
            s.init_height,
            s.in_layers,
            env.seed,
        );
        let velocities = vec![[0.0; 3]; positions.len()];
        tracing::info!(
            particles = positions.len(),
            sampling = ?s.sampling,
            backend = ?self.backend,
            "granular bed generated"
        );
        self.set_particles(positions, velocities);

        let plan = SettlingPlan::new(&self.settings, env.step_size, env.output_enabled);
        settling::settle(self, plan, env)?;
        self.settled = true;
        Ok(true)
    }

    fn surface_height(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p[2] + self.law.radius)
            .fold(0.0, f64::max)
    }

    fn node_forces(&mut self, positions: &[Vec3], velocities: &[Vec3], radius: f64) -> Vec<Vec3> {
        let reach = self.law.radius + radius;
        let grid = SpatialGrid::build(&self.positions, reach.max(2.0 * self.law.radius));
        let m_eff = self.law.mass;
        self.rig_contacts = 0;

        let mut forces = Vec::with_capacity(positions.len());
        for (p, v) in positions.iter().zip(velocities) {
            let mut f = [0.0; 3];
            let mut hits = Vec::new();
            grid.for_each_near(p, |j| {
                let d = sub(p, &self.positions[j]);
                let dist = norm(&d);
                if dist < reach && dist > 0.0 {
                    hits.push((j, d, dist));
                }
            });
            for (j, d, dist) in hits {
                let rel = sub(v, &self.velocities[j]);
                let c = self.law.contact(&d, dist, reach - dist, &rel, m_eff, false);
                axpy(&mut f, 1.0, &c);
                axpy(&mut self.external[j], -1.0, &c);
                self.rig_contacts += 1;
            }
            forces.push(f);
        }
        forces
    }

    fn step(&mut self, dt: f64) {
        self.integrate(dt);
    }

    fn state(&self) -> TerrainState {
        TerrainState::Particles {
            radius: self.law.radius,
            positions: self.positions.clone(),
            velocities: self.velocities.clone(),
        }
    }

    fn restore(&mut self, state: TerrainState) -> Result<(), CosimError> {
        match state {
            TerrainState::Particles {
                radius,
                positions,
                velocities,
            } if radius == self.law.radius && positions.len() == velocities.len() => {
                self.set_particles(positions, velocities);
                self.settled = true;
                Ok(())
            }
            other => Err(CosimError::CheckpointShape(format!(
                "granular bed of radius {} cannot load {}",
                self.law.radius,
                other.describe()
            ))),
        }
    }

    fn frame(&self) -> serde_json::Value {
        json!({
            "particles": self.positions.len(),
            "surface_height": self.surface_height(),
            "rig_contacts": self.rig_contacts,
        })
    }

    fn describe(&self) -> String {
        format!("{} particles of radius {}", self.positions.len(), self.law.radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::config::{SamplingMethod, TerrainConfig};

    fn bed(backend: GranularBackend) -> GranularBed {
        let mut config = TerrainConfig::default();
        config.patch_length = Some(0.3);
        config.patch_width = Some(0.2);
        config.granular.sampling = SamplingMethod::RegularGrid;
        config.granular.init_height = 0.09;
        let variant = config.variant();
        GranularBed::new(backend, variant.patch(), config.granular.clone())
    }

    fn fill(b: &mut GranularBed) {
        let s = b.settings.clone();
        let positions =
            settling::generate(s.sampling, &b.bounds, s.radius, s.init_height, s.in_layers, 1);
        let velocities = vec![[0.0; 3]; positions.len()];
        b.set_particles(positions, velocities);
    }

    #[test]
    fn bed_falls_and_stays_in_container() {
        let mut b = bed(GranularBackend::Cpu { threads: 1 });
        fill(&mut b);
        let top_before = b.surface_height();
        for _ in 0..200 {
            b.step(1e-4);
        }
        assert!(b.surface_height() <= top_before);
        assert!(b.positions().iter().all(|p| p[2] > 0.0 && p.iter().all(|c| c.is_finite())));
    }

    #[test]
    fn thread_count_does_not_change_results() {
        let mut single = bed(GranularBackend::Cpu { threads: 1 });
        let mut multi = bed(GranularBackend::Cpu { threads: 3 });
        fill(&mut single);
        fill(&mut multi);
        for _ in 0..20 {
            single.step(1e-4);
            multi.step(1e-4);
        }
        assert_eq!(single.state(), multi.state());
    }

    #[test]
    fn rig_node_reaction_is_equal_and_opposite() {
        let mut b = bed(GranularBackend::Gpu);
        b.set_particles(vec![[0.0, 0.0, 0.02]], vec![[0.0; 3]]);
        let f = b.node_forces(&[[0.0, 0.0, 0.041]], &[[0.0; 3]], 0.002);
        assert!(f[0][2] > 0.0);
        assert_eq!(b.external[0][2], -f[0][2]);
        assert_eq!(b.kind(), TerrainType::GranularGpu);
    }

    #[test]
    fn restore_rejects_other_radius() {
        let mut b = bed(GranularBackend::Cpu { threads: 1 });
        let state = TerrainState::Particles {
            radius: 0.5,
            positions: vec![],
            velocities: vec![],
        };
        assert!(b.restore(state).is_err());
    }
}
