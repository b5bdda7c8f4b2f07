//! Exchange payloads: the data that crosses the rig/terrain boundary.
//!
//! Rig → terrain: contact geometry (footprint or mesh) once at initialization,
//! then contact state every step. Terrain → rig: its init record, then either
//! a scalar sample or one force vector per rig mesh node every step.
//!
//! Payloads travel as the JSON body of a frame (see `wire`). The frame kind in
//! the header must agree with the payload variant.

use serde::{Deserialize, Serialize};

use crate::variant::{Role, TerrainType, TireType};
use crate::wire::FrameKind;

pub type Vec3 = [f64; 3];

// ── Contact material ──────────────────────────────────────────────────────────

/// Surface contact material shared by the rig tire and the terrain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactMaterial {
    pub friction: f32,
    pub restitution: f32,
    pub young_modulus: f32,
    pub poisson_ratio: f32,
    /// Normal stiffness (N/m).
    pub kn: f32,
    /// Normal damping (N·s/m).
    pub gn: f32,
    /// Tangential stiffness (N/m).
    pub kt: f32,
    /// Tangential damping (N·s/m).
    pub gt: f32,
}

impl Default for ContactMaterial {
    fn default() -> Self {
        Self {
            friction: 0.9,
            restitution: 0.0,
            young_modulus: 8e5,
            poisson_ratio: 0.3,
            kn: 1.0e6,
            gn: 6.0e1,
            kt: 4.0e5,
            gt: 4.0e1,
        }
    }
}

// ── Rig → terrain: initialization ─────────────────────────────────────────────

/// Mesh topology sent once by a flexible tire.
///
/// Vertices are in the wheel frame (undeformed). Faces index into `vertices`.
/// The vertex count is fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshTopology {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<[u32; 3]>,
}

impl MeshTopology {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

/// Contact geometry declared by the rig at initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ContactGeometry {
    /// Simplified patch contact around a single point.
    Footprint { contact_radius: f64 },
    /// Full surface mesh.
    Mesh(MeshTopology),
}

impl ContactGeometry {
    pub fn is_mesh(&self) -> bool {
        matches!(self, ContactGeometry::Mesh(_))
    }
}

/// The rig's initial payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigInit {
    pub tire: TireType,
    pub tire_radius: f64,
    pub tire_width: f64,
    /// Total mass carried by the wheel (kg).
    pub load_mass: f64,
    pub material: ContactMaterial,
    pub geometry: ContactGeometry,
}

// ── Terrain → rig: initialization ─────────────────────────────────────────────

/// Bounded terrain region over which contact is defined (world x/y, metres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl PatchBounds {
    /// Patch of the given length (x) and width (y) centred on the origin.
    pub fn centered(length: f64, width: f64) -> Self {
        Self {
            x_min: -length / 2.0,
            x_max: length / 2.0,
            y_min: -width / 2.0,
            y_max: width / 2.0,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Distance from (x, y) to the patch in the horizontal plane, zero inside.
    pub fn excursion(&self, x: f64, y: f64) -> f64 {
        let dx = (self.x_min - x).max(0.0).max(x - self.x_max);
        let dy = (self.y_min - y).max(0.0).max(y - self.y_max);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn length(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn width(&self) -> f64 {
        self.y_max - self.y_min
    }
}

/// The terrain's acknowledgement of the rig's initial payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainInit {
    pub terrain: TerrainType,
    pub patch: PatchBounds,
    /// Terrain surface height at initialization (after settling, if any).
    pub surface_height: f64,
}

// ── Per-step state and response ───────────────────────────────────────────────

/// Footprint contact state of a rigid tire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    /// Lowest point of the tire (world frame).
    pub position: Vec3,
    pub velocity: Vec3,
    /// Normal load currently carried by the tire (N).
    pub normal_load: f64,
    pub contact_radius: f64,
}

/// Mesh vertex state of a flexible tire, world frame, in topology order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshState {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
}

/// Rig contact state published at `Synchronize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RigState {
    Footprint(Footprint),
    Mesh(MeshState),
}

/// Scalar terrain sample returned for footprint exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerrainSample {
    pub height: f64,
    /// Contact stiffness at the footprint (N/m). Zero means no contact.
    pub stiffness: f64,
    /// Contact damping at the footprint (N·s/m).
    pub damping: f64,
}

impl TerrainSample {
    /// Sample reported for a footprint outside the patch.
    pub fn no_contact(height: f64) -> Self {
        Self {
            height,
            stiffness: 0.0,
            damping: 0.0,
        }
    }
}

/// Terrain reaction returned at `Synchronize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TerrainResponse {
    Sample(TerrainSample),
    /// One force per rig mesh node, same order as the rig's topology.
    NodeForces(Vec<Vec3>),
}

/// Explicit abort notification carrying a role-tagged diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub role: Role,
    pub reason: String,
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Every non-barrier frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RigInit(RigInit),
    TerrainInit(TerrainInit),
    RigState(RigState),
    TerrainResponse(TerrainResponse),
    Abort(Abort),
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::RigInit(_) => FrameKind::RigInit,
            Message::TerrainInit(_) => FrameKind::TerrainInit,
            Message::RigState(_) => FrameKind::RigState,
            Message::TerrainResponse(_) => FrameKind::TerrainResponse,
            Message::Abort(_) => FrameKind::Abort,
        }
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_contains_edges_and_measures_excursion() {
        let patch = PatchBounds::centered(10.0, 1.0);
        assert!(patch.contains(5.0, 0.5));
        assert!(patch.contains(-5.0, -0.5));
        assert!(!patch.contains(5.01, 0.0));
        assert_eq!(patch.excursion(0.0, 0.0), 0.0);
        assert!((patch.excursion(6.0, 0.0) - 1.0).abs() < 1e-12);
        assert!((patch.excursion(8.0, 4.5) - 5.0).abs() < 1e-12);
        assert_eq!(patch.length(), 10.0);
        assert_eq!(patch.width(), 1.0);
    }

    #[test]
    fn message_kind_follows_variant() {
        let msg = Message::TerrainResponse(TerrainResponse::NodeForces(vec![[0.0; 3]; 4]));
        assert_eq!(msg.kind(), FrameKind::TerrainResponse);
        let abort = Message::Abort(Abort {
            role: Role::Terrain,
            reason: "boom".into(),
        });
        assert_eq!(abort.kind(), FrameKind::Abort);
    }

    #[test]
    fn rig_state_json_is_tagged() {
        let state = RigState::Mesh(MeshState {
            positions: vec![[1.0, 2.0, 3.0]],
            velocities: vec![[0.0; 3]],
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"kind\":\"mesh\""));
    }
}
