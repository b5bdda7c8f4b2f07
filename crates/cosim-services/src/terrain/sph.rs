//! Smoothed-particle granular terrain.
//!
//! Weakly compressible SPH with the cubic spline kernel: density by
//! summation, linear equation of state clamped at zero (no tension), and
//! Monaghan artificial viscosity. The bed is a lattice of particles filling
//! the patch to the configured depth; the floor and side walls are hard
//! boundaries.
//!
//! Rig nodes act as boundary particles: each feels the pressure of the fluid
//! particles within the kernel support, and the reaction is applied to those
//! particles over the next `step`.
//!
//! Numerical parameters come from a JSON file loaded once at construction.

use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use cosim_core::checkpoint::TerrainState;
use cosim_core::config::{PatchSettings, SphSettings};
use cosim_core::payload::{PatchBounds, Vec3};
use cosim_core::TerrainType;

use super::grid::{axpy, dot, norm, sub, SpatialGrid};
use super::{PrepareEnv, TerrainModel};
use crate::node::CosimError;
use crate::rig::GRAVITY;

/// Numerical SPH parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphParameters {
    /// Smoothing length over initial particle spacing.
    pub smoothing_ratio: f64,
    /// Numerical speed of sound (m/s).
    pub sound_speed: f64,
    /// Monaghan viscosity coefficient.
    pub viscosity: f64,
    /// Courant number for the substep.
    pub cfl: f64,
}

impl Default for SphParameters {
    fn default() -> Self {
        Self {
            smoothing_ratio: 1.3,
            sound_speed: 10.0,
            viscosity: 0.1,
            cfl: 0.25,
        }
    }
}

impl SphParameters {
    pub fn load(path: &Path) -> Result<Self, CosimError> {
        let text = std::fs::read_to_string(path).map_err(|e| CosimError::SphParameters {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let params: SphParameters =
            serde_json::from_str(&text).map_err(|e| CosimError::SphParameters {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !(params.smoothing_ratio > 0.0 && params.sound_speed > 0.0 && params.cfl > 0.0) {
            return Err(CosimError::SphParameters {
                path: path.to_path_buf(),
                reason: "smoothing_ratio, sound_speed and cfl must be positive".into(),
            });
        }
        Ok(params)
    }
}

/// Cubic spline kernel in 3D with support radius `2h`.
#[derive(Debug, Clone, Copy)]
pub struct CubicSpline {
    h: f64,
    sigma: f64,
}

impl CubicSpline {
    pub fn new(h: f64) -> Self {
        Self {
            h,
            sigma: 1.0 / (PI * h * h * h),
        }
    }

    pub fn support(&self) -> f64 {
        2.0 * self.h
    }

    pub fn w(&self, r: f64) -> f64 {
        let q = r / self.h;
        if q < 1.0 {
            self.sigma * (1.0 - 1.5 * q * q + 0.75 * q * q * q)
        } else if q < 2.0 {
            self.sigma * 0.25 * (2.0 - q).powi(3)
        } else {
            0.0
        }
    }

    /// dW/dr.
    pub fn dw(&self, r: f64) -> f64 {
        let q = r / self.h;
        if q < 1.0 {
            self.sigma / self.h * (-3.0 * q + 2.25 * q * q)
        } else if q < 2.0 {
            -self.sigma / self.h * 0.75 * (2.0 - q).powi(2)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct SphBed {
    params: Arc<SphParameters>,
    settings: SphSettings,
    bounds: PatchBounds,
    kernel: CubicSpline,
    spacing: f64,
    mass: f64,
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    densities: Vec<f64>,
    pressures: Vec<f64>,
    external: Vec<Vec3>,
}

impl SphBed {
    pub fn new(patch: &PatchSettings, settings: SphSettings, params: Arc<SphParameters>) -> Self {
        let spacing = 2.0 * settings.radius;
        let kernel = CubicSpline::new(params.smoothing_ratio * spacing);

        // mass that gives rest density at an interior lattice point
        let reach = (kernel.support() / spacing).ceil() as i64;
        let mut sum = 0.0;
        for i in -reach..=reach {
            for j in -reach..=reach {
                for k in -reach..=reach {
                    let r = spacing * ((i * i + j * j + k * k) as f64).sqrt();
                    sum += kernel.w(r);
                }
            }
        }
        let mass = settings.density / sum;

        Self {
            params,
            settings,
            bounds: patch.bounds,
            kernel,
            spacing,
            mass,
            positions: Vec::new(),
            velocities: Vec::new(),
            densities: Vec::new(),
            pressures: Vec::new(),
            external: Vec::new(),
        }
    }

    pub fn particle_count(&self) -> usize {
        self.positions.len()
    }

    pub fn parameters(&self) -> &SphParameters {
        &self.params
    }

    fn set_particles(&mut self, positions: Vec<Vec3>, velocities: Vec<Vec3>) {
        let n = positions.len();
        self.positions = positions;
        self.velocities = velocities;
        self.densities = vec![self.settings.density; n];
        self.pressures = vec![0.0; n];
        self.external = vec![[0.0; 3]; n];
    }

    fn lattice(&self) -> Vec<Vec3> {
        let s = self.spacing;
        let b = &self.bounds;
        let nx = (b.length() / s + 1e-9).floor() as usize;
        let ny = (b.width() / s + 1e-9).floor() as usize;
        let nz = (self.settings.depth / s + 1e-9).floor() as usize;
        let mut points = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    points.push([
                        b.x_min + (i as f64 + 0.5) * s,
                        b.y_min + (j as f64 + 0.5) * s,
                        (k as f64 + 0.5) * s,
                    ]);
                }
            }
        }
        points
    }

    fn update_pressure(&mut self, grid: &SpatialGrid) {
        let c2 = self.params.sound_speed * self.params.sound_speed;
        let rho0 = self.settings.density;
        for i in 0..self.positions.len() {
            let p = self.positions[i];
            let mut rho = 0.0;
            grid.for_each_near(&p, |j| {
                rho += self.mass * self.kernel.w(norm(&sub(&p, &self.positions[j])));
            });
            self.densities[i] = rho;
            self.pressures[i] = (c2 * (rho - rho0)).max(0.0);
        }
    }

    fn accelerations(&self, grid: &SpatialGrid) -> Vec<Vec3> {
        let h = self.kernel.h;
        let c = self.params.sound_speed;
        let alpha = self.params.viscosity;
        let m = self.mass;

        (0..self.positions.len())
            .map(|i| {
                let pi = &self.positions[i];
                let vi = &self.velocities[i];
                let term_i = self.pressures[i] / (self.densities[i] * self.densities[i]);
                let mut a = [0.0, 0.0, -GRAVITY];
                axpy(&mut a, 1.0 / m, &self.external[i]);
                grid.for_each_near(pi, |j| {
                    if j == i {
                        return;
                    }
                    let d = sub(pi, &self.positions[j]);
                    let r = norm(&d);
                    if r == 0.0 || r >= self.kernel.support() {
                        return;
                    }
                    let grad = self.kernel.dw(r) / r;
                    let term_j = self.pressures[j] / (self.densities[j] * self.densities[j]);
                    let v = sub(vi, &self.velocities[j]);
                    let vr = dot(&v, &d);
                    let visc = if vr < 0.0 {
                        let mu = h * vr / (r * r + 0.01 * h * h);
                        let rho_bar = 0.5 * (self.densities[i] + self.densities[j]);
                        -alpha * c * mu / rho_bar
                    } else {
                        0.0
                    };
                    axpy(&mut a, -m * (term_i + term_j + visc) * grad, &d);
                });
                a
            })
            .collect()
    }

    /// Hard floor and side walls.
    fn enforce_boundaries(&mut self) {
        let r = 0.5 * self.spacing;
        let b = self.bounds;
        let lo = [b.x_min + r, b.y_min + r, r];
        let hi = [b.x_max - r, b.y_max - r, f64::INFINITY];
        for (p, v) in self.positions.iter_mut().zip(self.velocities.iter_mut()) {
            for k in 0..3 {
                if p[k] < lo[k] {
                    p[k] = lo[k];
                    v[k] = v[k].max(0.0);
                } else if p[k] > hi[k] {
                    p[k] = hi[k];
                    v[k] = v[k].min(0.0);
                }
            }
        }
    }

    fn integrate(&mut self, dt: f64) {
        if self.positions.is_empty() {
            return;
        }
        let limit = self.params.cfl * self.kernel.h / self.params.sound_speed;
        let substeps = (dt / limit).ceil().max(1.0) as usize;
        let h = dt / substeps as f64;
        for _ in 0..substeps {
            let grid = SpatialGrid::build(&self.positions, self.kernel.support());
            self.update_pressure(&grid);
            let acc = self.accelerations(&grid);
            for ((p, v), a) in self.positions.iter_mut().zip(self.velocities.iter_mut()).zip(&acc) {
                axpy(v, h, a);
                let vel = *v;
                axpy(p, h, &vel);
            }
            self.enforce_boundaries();
        }
        self.external.iter_mut().for_each(|e| *e = [0.0; 3]);
    }
}

impl TerrainModel for SphBed {
    fn kind(&self) -> TerrainType {
        TerrainType::GranularSph
    }

    fn initialize(&mut self, _env: &PrepareEnv<'_>) -> Result<bool, CosimError> {
        let positions = self.lattice();
        let velocities = vec![[0.0; 3]; positions.len()];
        tracing::info!(
            particles = positions.len(),
            depth = self.settings.depth,
            smoothing_length = self.kernel.h,
            "SPH bed generated"
        );
        self.set_particles(positions, velocities);
        Ok(false)
    }

    fn surface_height(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p[2] + 0.5 * self.spacing)
            .fold(0.0, f64::max)
    }

    fn node_forces(&mut self, positions: &[Vec3], _velocities: &[Vec3], _radius: f64) -> Vec<Vec3> {
        let grid = SpatialGrid::build(&self.positions, self.kernel.support());
        let m = self.mass;
        let mut forces = Vec::with_capacity(positions.len());
        for p in positions {
            let mut f = [0.0; 3];
            let mut hits = Vec::new();
            grid.for_each_near(p, |j| {
                let d = sub(p, &self.positions[j]);
                let r = norm(&d);
                if r > 0.0 && r < self.kernel.support() && self.pressures[j] > 0.0 {
                    let term = self.pressures[j] / (self.densities[j] * self.densities[j]);
                    let scale = -m * m * term * self.kernel.dw(r) / r;
                    hits.push((j, [scale * d[0], scale * d[1], scale * d[2]]));
                }
            });
            for (j, c) in hits {
                axpy(&mut f, 1.0, &c);
                axpy(&mut self.external[j], -1.0, &c);
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
            radius: 0.5 * self.spacing,
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
            } if radius == 0.5 * self.spacing && positions.len() == velocities.len() => {
                self.set_particles(positions, velocities);
                Ok(())
            }
            other => Err(CosimError::CheckpointShape(format!(
                "SPH bed at spacing {} cannot load {}",
                self.spacing,
                other.describe()
            ))),
        }
    }

    fn frame(&self) -> serde_json::Value {
        let max_density = self.densities.iter().cloned().fold(0.0, f64::max);
        json!({
            "particles": self.positions.len(),
            "surface_height": self.surface_height(),
            "max_density": max_density,
        })
    }

    fn describe(&self) -> String {
        format!("{} SPH particles at spacing {}", self.positions.len(), self.spacing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::config::TerrainConfig;
    use crate::output::OutputDir;

    fn bed() -> SphBed {
        let mut config = TerrainConfig::default();
        config.patch_length = Some(0.2);
        config.patch_width = Some(0.12);
        config.sph.depth = 0.08;
        let variant = config.variant();
        SphBed::new(variant.patch(), config.sph.clone(), Arc::new(SphParameters::default()))
    }

    #[test]
    fn kernel_is_normalized_and_decreasing() {
        let k = CubicSpline::new(0.1);
        // integrate W over the support radially
        let n = 2000;
        let dr = k.support() / n as f64;
        let integral: f64 = (0..n)
            .map(|i| {
                let r = (i as f64 + 0.5) * dr;
                4.0 * PI * r * r * k.w(r) * dr
            })
            .sum();
        assert!((integral - 1.0).abs() < 1e-3);
        assert!(k.dw(0.05) < 0.0 && k.dw(0.15) < 0.0);
        assert_eq!(k.w(0.2), 0.0);
    }

    #[test]
    fn lattice_fills_patch_to_depth() {
        let root = std::env::temp_dir().join(format!("cosim-sph-{}", std::process::id()));
        let output = OutputDir::new(&root).unwrap();
        let env = PrepareEnv {
            output: &output,
            step_size: 1e-4,
            verbose: false,
            output_enabled: false,
            seed: 0,
        };
        let mut b = bed();
        assert!(!b.initialize(&env).unwrap());
        // 0.2 x 0.12 x 0.08 at 4 cm spacing
        assert_eq!(b.particle_count(), 5 * 3 * 2);
        assert!((b.surface_height() - 0.08).abs() < 1e-12);
        for _ in 0..10 {
            b.step(1e-4);
        }
        assert!(b.positions.iter().flatten().all(|c| c.is_finite()));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn restore_rejects_uneven_particle_arrays() {
        let mut b = bed();
        let radius = 0.5 * b.spacing;
        let uneven = TerrainState::Particles {
            radius,
            positions: vec![[0.0, 0.0, 0.02]; 3],
            velocities: vec![[0.0; 3]; 2],
        };
        assert!(matches!(b.restore(uneven), Err(CosimError::CheckpointShape(_))));

        let even = TerrainState::Particles {
            radius,
            positions: vec![[-0.04, 0.0, 0.02], [0.0, 0.0, 0.02], [0.04, 0.0, 0.02]],
            velocities: vec![[0.0; 3]; 3],
        };
        b.restore(even).unwrap();
        assert_eq!(b.particle_count(), 3);
        b.step(1e-4);
    }

    #[test]
    fn parameter_file_loads_with_defaults_and_rejects_garbage() {
        let dir = std::env::temp_dir().join(format!("cosim-sph-params-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("good.json");
        std::fs::write(&good, r#"{ "sound_speed": 20.0 }"#).unwrap();
        let params = SphParameters::load(&good).unwrap();
        assert_eq!(params.sound_speed, 20.0);
        assert_eq!(params.smoothing_ratio, 1.3);

        let bad = dir.join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(matches!(SphParameters::load(&bad), Err(CosimError::SphParameters { .. })));
        assert!(SphParameters::load(&dir.join("missing.json")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
