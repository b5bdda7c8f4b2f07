//! Soil Contact Model: deformable soil on a regular height grid.
//!
//! Each grid node carries a committed plastic sinkage. A contact query loads
//! the soil elastically from the committed surface until the Bekker
//! pressure-sinkage limit is reached; beyond it the soil yields and the
//! excess becomes a tentative sinkage. Tentative sinkage is always recomputed
//! from committed state, so re-querying within a step gives the same answer,
//! and it is only committed by `step`.
//!
//! Shear follows Mohr-Coulomb with Janosi-Hanamoto mobilization.

use std::collections::HashMap;
use std::f64::consts::PI;

use serde_json::json;

use cosim_core::checkpoint::{TerrainState, END_LABEL};
use cosim_core::config::{PatchSettings, ScmSettings};
use cosim_core::payload::{Footprint, PatchBounds, TerrainSample, Vec3};
use cosim_core::TerrainType;

use super::grid::norm;
use super::{PrepareEnv, TerrainModel};
use crate::node::CosimError;

/// Pressure and plastic sinkage from one contact evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Loading {
    pressure: f64,
    sinkage: f64,
}

#[derive(Debug, Clone)]
pub struct ScmSoil {
    soil: ScmSettings,
    bounds: PatchBounds,
    nx: usize,
    ny: usize,
    sinkage: Vec<f64>,
    pending: HashMap<usize, f64>,
    step_size: f64,
}

impl ScmSoil {
    pub fn new(patch: &PatchSettings, soil: ScmSettings, step_size: f64) -> Self {
        let bounds = patch.bounds;
        let nx = (bounds.length() / soil.grid_spacing).round() as usize + 1;
        let ny = (bounds.width() / soil.grid_spacing).round() as usize + 1;
        Self {
            soil,
            bounds,
            nx,
            ny,
            sinkage: vec![0.0; nx * ny],
            pending: HashMap::new(),
            step_size,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    /// Committed sinkage at the grid node nearest (x, y).
    pub fn sinkage_at(&self, x: f64, y: f64) -> f64 {
        self.nearest(x, y).map(|i| self.sinkage[i]).unwrap_or(0.0)
    }

    pub fn pending_cells(&self) -> usize {
        self.pending.len()
    }

    fn nearest(&self, x: f64, y: f64) -> Option<usize> {
        let i = ((x - self.bounds.x_min) / self.soil.grid_spacing).round();
        let j = ((y - self.bounds.y_min) / self.soil.grid_spacing).round();
        if i < 0.0 || j < 0.0 || i as usize >= self.nx || j as usize >= self.ny {
            return None;
        }
        Some(j as usize * self.nx + i as usize)
    }

    /// Grid nodes within `radius` of (x, y); at least the nearest one.
    fn cells_within(&self, x: f64, y: f64, radius: f64) -> Vec<usize> {
        let h = self.soil.grid_spacing;
        let reach = (radius / h).ceil() as i64;
        let ci = ((x - self.bounds.x_min) / h).round() as i64;
        let cj = ((y - self.bounds.y_min) / h).round() as i64;
        let mut cells = Vec::new();
        for j in (cj - reach)..=(cj + reach) {
            for i in (ci - reach)..=(ci + reach) {
                if i < 0 || j < 0 || i as usize >= self.nx || j as usize >= self.ny {
                    continue;
                }
                let gx = self.bounds.x_min + i as f64 * h;
                let gy = self.bounds.y_min + j as f64 * h;
                if (gx - x).powi(2) + (gy - y).powi(2) <= radius * radius {
                    cells.push(j as usize * self.nx + i as usize);
                }
            }
        }
        if cells.is_empty() {
            cells.extend(self.nearest(x, y));
        }
        cells
    }

    /// Load the soil at committed sinkage `s` by a contact whose lowest point
    /// is at `z`. `width` is the Bekker contact width.
    fn load(&self, s: f64, z: f64, vz: f64, width: f64) -> Loading {
        let penetration = -s - z;
        if penetration <= 0.0 {
            return Loading { pressure: 0.0, sinkage: s };
        }
        let soil = &self.soil;
        let bekker =
            (soil.bekker_kc / width + soil.bekker_kphi) * (s + penetration).powf(soil.bekker_n);
        let elastic = soil.elastic_stiffness * penetration;
        let (pressure, sinkage) = if elastic > bekker {
            (bekker, s + penetration - bekker / soil.elastic_stiffness)
        } else {
            (elastic, s)
        };
        Loading {
            pressure: pressure + soil.damping * (-vz).max(0.0),
            sinkage,
        }
    }

    /// Shear stress opposing tangential velocity `vt` at normal pressure `p`.
    fn shear(&self, pressure: f64, speed: f64) -> f64 {
        let tau_max =
            self.soil.mohr_cohesion + pressure * self.soil.mohr_friction.to_radians().tan();
        let displacement = speed * self.step_size;
        tau_max * (1.0 - (-displacement / self.soil.janosi_shear).exp())
    }

    fn stage(&mut self, cell: usize, sinkage: f64) {
        if sinkage > self.sinkage[cell] {
            let entry = self.pending.entry(cell).or_insert(sinkage);
            *entry = entry.max(sinkage);
        }
    }
}

impl TerrainModel for ScmSoil {
    fn kind(&self) -> TerrainType {
        TerrainType::Scm
    }

    fn serves_footprint(&self) -> bool {
        true
    }

    fn restart_label(&self) -> Option<&'static str> {
        Some(END_LABEL)
    }

    fn initialize(&mut self, _env: &PrepareEnv<'_>) -> Result<bool, CosimError> {
        Ok(false)
    }

    fn surface_height(&self) -> f64 {
        0.0
    }

    fn sample(&mut self, fp: &Footprint) -> Result<TerrainSample, CosimError> {
        let [x, y, z] = fp.position;
        let cells = self.cells_within(x, y, fp.contact_radius);
        let area = PI * fp.contact_radius * fp.contact_radius;
        let width = 2.0 * fp.contact_radius;

        let total: f64 = cells.iter().map(|&c| self.sinkage[c]).sum();
        let mean_sinkage = total / cells.len().max(1) as f64;
        let height = -mean_sinkage;
        let loading = self.load(mean_sinkage, z, 0.0, width);
        for &c in &cells {
            let staged = self.load(self.sinkage[c], z, 0.0, width).sinkage;
            self.stage(c, staged);
        }

        let penetration = height - z;
        let stiffness = if penetration > 0.0 {
            area * loading.pressure / penetration
        } else {
            area * self.soil.elastic_stiffness
        };
        Ok(TerrainSample {
            height,
            stiffness,
            damping: area * self.soil.damping,
        })
    }

    fn node_forces(&mut self, positions: &[Vec3], velocities: &[Vec3], radius: f64) -> Vec<Vec3> {
        let h = self.soil.grid_spacing;
        let area = h * h;
        positions
            .iter()
            .zip(velocities)
            .map(|(p, v)| {
                let Some(cell) = self.nearest(p[0], p[1]) else {
                    return [0.0; 3];
                };
                let loading = self.load(self.sinkage[cell], p[2] - radius, v[2], h);
                if loading.pressure <= 0.0 {
                    return [0.0; 3];
                }
                self.stage(cell, loading.sinkage);

                let normal = loading.pressure * area;
                let vt = [v[0], v[1], 0.0];
                let speed = norm(&vt);
                if speed == 0.0 {
                    return [0.0, 0.0, normal];
                }
                let tangential = self.shear(loading.pressure, speed) * area;
                [-tangential * vt[0] / speed, -tangential * vt[1] / speed, normal]
            })
            .collect()
    }

    fn step(&mut self, _dt: f64) {
        for (cell, s) in self.pending.drain() {
            if s > self.sinkage[cell] {
                self.sinkage[cell] = s;
            }
        }
    }

    fn state(&self) -> TerrainState {
        TerrainState::HeightField {
            nx: self.nx as u32,
            ny: self.ny as u32,
            spacing: self.soil.grid_spacing,
            origin: [self.bounds.x_min, self.bounds.y_min],
            values: self.sinkage.clone(),
        }
    }

    fn restore(&mut self, state: TerrainState) -> Result<(), CosimError> {
        match state {
            TerrainState::HeightField {
                nx,
                ny,
                spacing,
                values,
                ..
            } if nx as usize == self.nx
                && ny as usize == self.ny
                && spacing == self.soil.grid_spacing
                && values.len() == self.nx * self.ny =>
            {
                self.sinkage = values;
                self.pending.clear();
                Ok(())
            }
            other => Err(CosimError::CheckpointShape(format!(
                "SCM grid is {}x{} at {}, checkpoint holds {}",
                self.nx,
                self.ny,
                self.soil.grid_spacing,
                other.describe()
            ))),
        }
    }

    fn frame(&self) -> serde_json::Value {
        let max = self.sinkage.iter().cloned().fold(0.0, f64::max);
        let deformed = self.sinkage.iter().filter(|s| **s > 0.0).count();
        json!({
            "grid": [self.nx, self.ny],
            "max_sinkage": max,
            "deformed_nodes": deformed,
        })
    }

    fn describe(&self) -> String {
        format!("SCM grid {}x{}", self.nx, self.ny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::config::TerrainConfig;

    fn soil() -> ScmSoil {
        let config = TerrainConfig::default();
        ScmSoil::new(config.variant().patch(), config.scm, 1e-4)
    }

    #[test]
    fn grid_covers_patch() {
        let s = soil();
        // 10 m x 1 m at 5 cm
        assert_eq!(s.dims(), (201, 21));
    }

    #[test]
    fn requery_within_step_is_idempotent() {
        let mut s = soil();
        let positions = [[0.0, 0.0, -0.02]];
        let velocities = [[0.0, 0.0, -0.1]];
        let first = s.node_forces(&positions, &velocities, 0.0);
        let staged = s.pending.clone();
        let second = s.node_forces(&positions, &velocities, 0.0);
        assert_eq!(first, second);
        assert_eq!(staged, s.pending);
        assert!(first[0][2] > 0.0);
        // nothing committed until the step
        assert_eq!(s.sinkage_at(0.0, 0.0), 0.0);
        s.step(1e-4);
        assert!(s.sinkage_at(0.0, 0.0) > 0.0);
        assert_eq!(s.pending_cells(), 0);
    }

    #[test]
    fn yielded_soil_keeps_plastic_sinkage() {
        let mut s = soil();
        s.node_forces(&[[0.0, 0.0, -0.05]], &[[0.0; 3]], 0.0);
        s.step(1e-4);
        let sunk = s.sinkage_at(0.0, 0.0);
        assert!(sunk > 0.0 && sunk < 0.05);
        // unloaded contact above the new surface feels nothing
        let f = s.node_forces(&[[0.0, 0.0, -sunk + 0.001]], &[[0.0; 3]], 0.0);
        assert_eq!(f[0], [0.0; 3]);
    }

    #[test]
    fn state_restores_only_into_matching_grid() {
        let mut s = soil();
        s.node_forces(&[[1.0, 0.2, -0.03]], &[[0.0; 3]], 0.0);
        s.step(1e-4);
        let state = s.state();

        let mut fresh = soil();
        fresh.restore(state.clone()).unwrap();
        assert_eq!(fresh.state(), state);

        let wrong = TerrainState::HeightField {
            nx: 2,
            ny: 2,
            spacing: 0.05,
            origin: [0.0, 0.0],
            values: vec![0.0; 4],
        };
        assert!(fresh.restore(wrong).is_err());
    }

    #[test]
    fn truncated_height_field_is_rejected() {
        let mut s = soil();
        let TerrainState::HeightField { nx, ny, spacing, origin, mut values } = s.state() else {
            panic!("SCM state is a height field");
        };
        values.pop();
        let short = TerrainState::HeightField { nx, ny, spacing, origin, values };
        assert!(matches!(s.restore(short), Err(CosimError::CheckpointShape(_))));
        // the grid is untouched and still answers queries
        assert_eq!(s.state(), soil().state());
        s.node_forces(&[[1.0, 0.2, -0.03]], &[[0.0; 3]], 0.0);
    }
}
