//! Variant tags: process roles, tire variants and terrain backends.
//!
//! These tags are selected once at startup and never change for the run.
//! Their string forms name the output directory and their byte forms are
//! written into frame and checkpoint headers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical rank of the rig process.
pub const RIG_NODE_RANK: u8 = 0;

/// Logical rank of the terrain process.
pub const TERRAIN_NODE_RANK: u8 = 1;

/// Number of processes a co-simulation run requires.
pub const REQUIRED_PROCESSES: u32 = 2;

// ── Role ──────────────────────────────────────────────────────────────────────

/// Which side of the co-simulation a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rig,
    Terrain,
}

impl Role {
    /// Map a rank to its role. The caller must already have checked the
    /// world size; ranks other than 0 and 1 have no role.
    pub fn from_rank(rank: u32) -> Option<Self> {
        match rank {
            r if r == RIG_NODE_RANK as u32 => Some(Role::Rig),
            r if r == TERRAIN_NODE_RANK as u32 => Some(Role::Terrain),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Role::Rig => RIG_NODE_RANK,
            Role::Terrain => TERRAIN_NODE_RANK,
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Rig => Role::Terrain,
            Role::Terrain => Role::Rig,
        }
    }

    /// Node directory name below the run directory.
    pub fn node_name(self) -> &'static str {
        match self {
            Role::Rig => "RIG",
            Role::Terrain => "TERRAIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Rig => f.write_str("Rig node"),
            Role::Terrain => f.write_str("Terrain node"),
        }
    }
}

// ── Tire ──────────────────────────────────────────────────────────────────────

/// Rig tire variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TireType {
    /// Rigid tire; exports a simplified contact footprint.
    Rigid,
    /// Deformable tire; exports its full surface mesh.
    Flexible,
}

impl TireType {
    pub fn as_str(self) -> &'static str {
        match self {
            TireType::Rigid => "RIGID",
            TireType::Flexible => "FLEXIBLE",
        }
    }

    /// Whether a terrain backend can serve this tire's contact exchange.
    ///
    /// Footprint exchange is only served by the rigid and SCM backends;
    /// mesh exchange is served by every backend.
    pub fn supports(self, terrain: TerrainType) -> bool {
        match self {
            TireType::Flexible => true,
            TireType::Rigid => matches!(terrain, TerrainType::Rigid | TerrainType::Scm),
        }
    }
}

impl fmt::Display for TireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TireType {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rigid" | "0" => Ok(TireType::Rigid),
            "flexible" | "1" => Ok(TireType::Flexible),
            _ => Err(VariantError::UnknownTire(s.to_string())),
        }
    }
}

// ── Terrain ───────────────────────────────────────────────────────────────────

/// Terrain backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TerrainType {
    /// Flat plane. Single-threaded and always built; needs no `multicore`.
    Rigid = 0,
    /// Soil Contact Model height grid. Always built.
    Scm = 1,
    /// Particle bed on CPU worker threads. Needs `multicore`.
    GranularCpu = 2,
    /// Particle bed on the GPU backend. Needs `gpu`.
    GranularGpu = 3,
    /// Smoothed-particle bed. Needs `sph`.
    GranularSph = 4,
}

impl TerrainType {
    pub const ALL: [TerrainType; 5] = [
        TerrainType::Rigid,
        TerrainType::Scm,
        TerrainType::GranularCpu,
        TerrainType::GranularGpu,
        TerrainType::GranularSph,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TerrainType::Rigid => "RIGID",
            TerrainType::Scm => "SCM",
            TerrainType::GranularCpu => "GRANULAR_CPU",
            TerrainType::GranularGpu => "GRANULAR_GPU",
            TerrainType::GranularSph => "GRANULAR_SPH",
        }
    }

    /// Granular variants settle before any rig interaction.
    pub fn is_granular(self) -> bool {
        matches!(self, TerrainType::GranularCpu | TerrainType::GranularGpu)
    }
}

impl TryFrom<u8> for TerrainType {
    type Error = VariantError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TerrainType::Rigid),
            1 => Ok(TerrainType::Scm),
            2 => Ok(TerrainType::GranularCpu),
            3 => Ok(TerrainType::GranularGpu),
            4 => Ok(TerrainType::GranularSph),
            other => Err(VariantError::UnknownTerrainTag(other)),
        }
    }
}

impl From<TerrainType> for u8 {
    fn from(t: TerrainType) -> u8 {
        t as u8
    }
}

impl fmt::Display for TerrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerrainType {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(tag) = s.parse::<u8>() {
            return TerrainType::try_from(tag);
        }
        match s.to_ascii_lowercase().as_str() {
            "rigid" => Ok(TerrainType::Rigid),
            "scm" | "deformable_scm" => Ok(TerrainType::Scm),
            "granular_cpu" | "granular_omp" => Ok(TerrainType::GranularCpu),
            "granular_gpu" => Ok(TerrainType::GranularGpu),
            "granular_sph" => Ok(TerrainType::GranularSph),
            _ => Err(VariantError::UnknownTerrain(s.to_string())),
        }
    }
}

/// Run directory name: `<tireType>_<terrainType>[_<suffix>]`.
pub fn run_dir_name(tire: TireType, terrain: TerrainType, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("{}_{}", tire.as_str(), terrain.as_str())
    } else {
        format!("{}_{}_{}", tire.as_str(), terrain.as_str(), suffix)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariantError {
    #[error("unknown tire type: {0}")]
    UnknownTire(String),

    #[error("unknown terrain type: {0}")]
    UnknownTerrain(String),

    #[error("unknown terrain tag: {0}")]
    UnknownTerrainTag(u8),
}
