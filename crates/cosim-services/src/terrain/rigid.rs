//! Rigid terrain: a flat, non-deforming plane with penalty contact.

use serde_json::json;

use cosim_core::checkpoint::TerrainState;
use cosim_core::config::PatchSettings;
use cosim_core::payload::{ContactMaterial, Footprint, TerrainSample, Vec3};
use cosim_core::TerrainType;

use super::grid::norm;
use super::{PrepareEnv, TerrainModel};
use crate::node::CosimError;

/// Tangential speed (m/s) over which Coulomb friction ramps in.
const FRICTION_RAMP: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct RigidPlane {
    material: ContactMaterial,
    height: f64,
    contacts: usize,
}

impl RigidPlane {
    pub fn new(patch: &PatchSettings) -> Self {
        Self {
            material: patch.material,
            height: 0.0,
            contacts: 0,
        }
    }
}

impl TerrainModel for RigidPlane {
    fn kind(&self) -> TerrainType {
        TerrainType::Rigid
    }

    fn serves_footprint(&self) -> bool {
        true
    }

    fn initialize(&mut self, _env: &PrepareEnv<'_>) -> Result<bool, CosimError> {
        Ok(false)
    }

    fn surface_height(&self) -> f64 {
        self.height
    }

    fn sample(&mut self, _footprint: &Footprint) -> Result<TerrainSample, CosimError> {
        Ok(TerrainSample {
            height: self.height,
            stiffness: self.material.kn as f64,
            damping: self.material.gn as f64,
        })
    }

    fn node_forces(&mut self, positions: &[Vec3], velocities: &[Vec3], radius: f64) -> Vec<Vec3> {
        let kn = self.material.kn as f64;
        let gn = self.material.gn as f64;
        let mu = self.material.friction as f64;
        self.contacts = 0;

        positions
            .iter()
            .zip(velocities)
            .map(|(p, v)| {
                let penetration = self.height + radius - p[2];
                if penetration <= 0.0 {
                    return [0.0; 3];
                }
                self.contacts += 1;
                let fn_ = (kn * penetration - gn * v[2]).max(0.0);
                let vt = [v[0], v[1], 0.0];
                let speed = norm(&vt);
                if speed == 0.0 {
                    return [0.0, 0.0, fn_];
                }
                let ft = mu * fn_ * (speed / FRICTION_RAMP).tanh();
                [-ft * vt[0] / speed, -ft * vt[1] / speed, fn_]
            })
            .collect()
    }

    fn step(&mut self, _dt: f64) {}

    fn state(&self) -> TerrainState {
        TerrainState::Empty
    }

    fn restore(&mut self, state: TerrainState) -> Result<(), CosimError> {
        match state {
            TerrainState::Empty => Ok(()),
            other => Err(CosimError::CheckpointShape(format!(
                "rigid terrain has no state, got {}",
                other.describe()
            ))),
        }
    }

    fn frame(&self) -> serde_json::Value {
        json!({ "height": self.height, "contacts": self.contacts })
    }

    fn describe(&self) -> String {
        format!("flat plane at z = {}", self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::config::TerrainConfig;

    fn plane() -> RigidPlane {
        RigidPlane::new(TerrainConfig::default().variant().patch())
    }

    #[test]
    fn penetrating_node_is_pushed_up_and_dragged_back() {
        let mut p = plane();
        let f = p.node_forces(&[[0.0, 0.0, 0.001]], &[[1.0, 0.0, 0.0]], 0.002);
        assert!((f[0][2] - 1.0e6 * 0.001).abs() < 1e-6);
        assert!(f[0][0] < 0.0);
        assert_eq!(f[0][1], 0.0);
    }

    #[test]
    fn separated_node_feels_nothing() {
        let mut p = plane();
        let f = p.node_forces(&[[0.0, 0.0, 0.01]], &[[0.0; 3]], 0.002);
        assert_eq!(f[0], [0.0; 3]);
    }

    #[test]
    fn only_empty_state_restores() {
        let mut p = plane();
        assert!(p.restore(TerrainState::Empty).is_ok());
        let particles = TerrainState::Particles {
            radius: 0.01,
            positions: vec![],
            velocities: vec![],
        };
        assert!(matches!(p.restore(particles), Err(CosimError::CheckpointShape(_))));
    }
}
