//! Configuration system for the co-simulation.
//!
//! Resolution order: command line → environment variables → config file → defaults.
//!
//! Config file location:
//!   1. explicit path (`--config`)
//!   2. $COSIM_CONFIG
//!   3. $XDG_CONFIG_HOME/rig-cosim/config.toml
//!   4. ~/.config/rig-cosim/config.toml
//!
//! Both processes of a run must load the same configuration; each validates it
//! independently before any node is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::payload::{ContactMaterial, PatchBounds};
use crate::variant::{TerrainType, TireType};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CosimConfig {
    pub run: RunConfig,
    pub transport: TransportConfig,
    pub rig: RigConfig,
    pub terrain: TerrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Integration step size shared by both nodes (s).
    pub step_size: f64,
    /// Simulated time after settling (s).
    pub sim_time: f64,
    /// Write per-frame result files.
    pub output: bool,
    pub output_fps: f64,
    /// Runtime visualization request. No renderer ships with this build.
    pub render: bool,
    pub render_fps: f64,
    pub verbose: bool,
    /// Initialize terrain from a checkpoint instead of settling.
    pub use_checkpoint: bool,
    /// Output root. The run directory is `<out_dir>/RIG_COSIM/...`.
    pub out_dir: PathBuf,
    /// Appended to the run directory name when non-empty.
    pub suffix: String,
    /// Seed for particle sampling.
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Rig rank listens here, terrain rank connects here.
    pub addr: String,
    /// Startup connection attempts by the terrain rank.
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub tire: TireType,
    pub threads: u32,
    /// Prescribed forward velocity (m/s).
    pub init_vel: f64,
    /// Prescribed longitudinal slip.
    pub slip: f64,
    pub body_masses: BodyMasses,
    pub tire_model: TireModel,
    /// Drawbar-pull moving-average window (s).
    pub dbp_filter_window: f64,
    pub material: ContactMaterial,
}

/// Rig body masses (kg).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyMasses {
    pub chassis: f64,
    pub set_toe: f64,
    /// Wheel carrier ("sys_mass").
    pub carrier: f64,
    pub rim: f64,
}

/// Tire model reference: geometry, stiffness and mesh resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TireModel {
    pub name: String,
    pub radius: f64,
    pub width: f64,
    pub mass: f64,
    /// Radial stiffness of the carcass without inflation (N/m).
    pub structural_stiffness: f64,
    /// Include inflation pressure in the radial stiffness.
    pub pressure_enabled: bool,
    /// Inflation pressure (Pa).
    pub pressure: f64,
    pub mesh_divisions_circ: u32,
    pub mesh_divisions_width: u32,
    /// Footprint contact radius for rigid tires (m).
    pub contact_radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub kind: TerrainType,
    pub threads: u32,
    /// Patch length along x (m). Unset means the backend default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_length: Option<f64>,
    /// Patch width along y (m). Unset means the backend default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_width: Option<f64>,
    /// Rig proxies are kinematic (not integrated by the terrain).
    pub proxy_fixed: bool,
    pub proxy_contact_radius: f64,
    pub material: ContactMaterial,
    pub scm: ScmSettings,
    pub granular: GranularSettings,
    pub sph: SphSettings,
}

/// Soil Contact Model parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScmSettings {
    pub grid_spacing: f64,
    pub bekker_kphi: f64,
    pub bekker_kc: f64,
    pub bekker_n: f64,
    /// Mohr cohesive limit (Pa).
    pub mohr_cohesion: f64,
    /// Mohr friction limit (degrees).
    pub mohr_friction: f64,
    /// Janosi shear coefficient (m).
    pub janosi_shear: f64,
    /// Elastic stiffness before plastic yield (Pa/m). Must exceed Kphi.
    pub elastic_stiffness: f64,
    /// Damping proportional to negative vertical speed (Pa·s/m).
    pub damping: f64,
}

/// Particle generation strategy for granular beds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    PoissonDisk,
    HcpPack,
    RegularGrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularSettings {
    pub radius: f64,
    pub density: f64,
    pub sampling: SamplingMethod,
    /// Height of the initial particle column (m).
    pub init_height: f64,
    /// Generate particles layer by layer.
    pub in_layers: bool,
    pub settling_time: f64,
    pub settling_output: bool,
    pub settling_output_fps: f64,
    /// Cohesion pressure (Pa); adhesion force is π r² p.
    pub coh_pressure: f64,
    pub wall_thickness: f64,
    pub material: ContactMaterial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SphSettings {
    /// JSON parameter file, loaded once at construction.
    pub param_file: Option<PathBuf>,
    /// Depth of the granular layer (m).
    pub depth: f64,
    pub radius: f64,
    pub density: f64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_size: 1e-4,
            sim_time: 10.0,
            output: true,
            output_fps: 100.0,
            render: false,
            render_fps: 100.0,
            verbose: true,
            use_checkpoint: false,
            out_dir: data_dir(),
            suffix: String::new(),
            seed: 42,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:47600".to_string(),
            connect_attempts: 100,
            connect_backoff_ms: 100,
        }
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            tire: TireType::Rigid,
            threads: 1,
            init_vel: 0.5,
            slip: 0.0,
            body_masses: BodyMasses::default(),
            tire_model: TireModel::default(),
            dbp_filter_window: 0.2,
            material: ContactMaterial::default(),
        }
    }
}

impl Default for BodyMasses {
    fn default() -> Self {
        Self {
            chassis: 1.0,
            set_toe: 1.0,
            carrier: 200.0,
            rim: 15.0,
        }
    }
}

impl Default for TireModel {
    fn default() -> Self {
        Self {
            name: "HMMWV".to_string(),
            radius: 0.47,
            width: 0.25,
            mass: 37.6,
            structural_stiffness: 2.0e5,
            pressure_enabled: true,
            pressure: 200e3,
            mesh_divisions_circ: 40,
            mesh_divisions_width: 4,
            contact_radius: 0.05,
        }
    }
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            kind: TerrainType::Rigid,
            threads: 1,
            patch_length: None,
            patch_width: None,
            proxy_fixed: true,
            proxy_contact_radius: 0.002,
            material: ContactMaterial::default(),
            scm: ScmSettings::default(),
            granular: GranularSettings::default(),
            sph: SphSettings::default(),
        }
    }
}

impl Default for ScmSettings {
    fn default() -> Self {
        Self {
            grid_spacing: 5e-2,
            bekker_kphi: 0.2e6,
            bekker_kc: 0.0,
            bekker_n: 1.1,
            mohr_cohesion: 0.0,
            mohr_friction: 30.0,
            janosi_shear: 0.01,
            elastic_stiffness: 4e7,
            damping: 3e4,
        }
    }
}

impl Default for GranularSettings {
    fn default() -> Self {
        Self {
            radius: 0.02,
            density: 2500.0,
            sampling: SamplingMethod::PoissonDisk,
            init_height: 0.5,
            in_layers: true,
            settling_time: 0.4,
            settling_output: true,
            settling_output_fps: 100.0,
            coh_pressure: 0.0,
            wall_thickness: 0.1,
            material: ContactMaterial {
                kn: 1.0e7,
                gn: 1.0e4,
                kt: 1.0e7,
                gt: 1.0e4,
                ..ContactMaterial::default()
            },
        }
    }
}

impl Default for SphSettings {
    fn default() -> Self {
        Self {
            param_file: None,
            depth: 0.5,
            radius: 0.02,
            density: 2500.0,
        }
    }
}

// ── Variants ──────────────────────────────────────────────────────────────────

/// Terrain parameters shared by every backend.
#[derive(Debug, Clone)]
pub struct PatchSettings {
    pub bounds: PatchBounds,
    pub threads: u32,
    pub proxy_fixed: bool,
    pub proxy_contact_radius: f64,
    pub material: ContactMaterial,
}

/// The selected terrain backend with its model configuration.
#[derive(Debug, Clone)]
pub enum TerrainVariant {
    Rigid { patch: PatchSettings },
    Scm { patch: PatchSettings, scm: ScmSettings },
    GranularCpu { patch: PatchSettings, granular: GranularSettings },
    GranularGpu { patch: PatchSettings, granular: GranularSettings },
    GranularSph { patch: PatchSettings, sph: SphSettings },
}

impl TerrainVariant {
    pub fn kind(&self) -> TerrainType {
        match self {
            TerrainVariant::Rigid { .. } => TerrainType::Rigid,
            TerrainVariant::Scm { .. } => TerrainType::Scm,
            TerrainVariant::GranularCpu { .. } => TerrainType::GranularCpu,
            TerrainVariant::GranularGpu { .. } => TerrainType::GranularGpu,
            TerrainVariant::GranularSph { .. } => TerrainType::GranularSph,
        }
    }

    pub fn patch(&self) -> &PatchSettings {
        match self {
            TerrainVariant::Rigid { patch }
            | TerrainVariant::Scm { patch, .. }
            | TerrainVariant::GranularCpu { patch, .. }
            | TerrainVariant::GranularGpu { patch, .. }
            | TerrainVariant::GranularSph { patch, .. } => patch,
        }
    }
}

/// The selected rig variant with its tire and body configuration.
#[derive(Debug, Clone)]
pub enum RigVariant {
    RigidTire(RigConfig),
    FlexibleTire(RigConfig),
}

impl RigVariant {
    pub fn tire(&self) -> TireType {
        match self {
            RigVariant::RigidTire(_) => TireType::Rigid,
            RigVariant::FlexibleTire(_) => TireType::Flexible,
        }
    }

    pub fn settings(&self) -> &RigConfig {
        match self {
            RigVariant::RigidTire(c) | RigVariant::FlexibleTire(c) => c,
        }
    }
}

/// Patch size (length, width) used when none is configured. Particle beds
/// get a smaller container than the plane and soil backends.
pub fn default_patch(kind: TerrainType) -> (f64, f64) {
    match kind {
        TerrainType::Rigid | TerrainType::Scm => (10.0, 1.0),
        TerrainType::GranularCpu | TerrainType::GranularGpu | TerrainType::GranularSph => {
            (2.0, 0.6)
        }
    }
}

impl TerrainConfig {
    /// Configured patch size, falling back to the backend default.
    pub fn patch_size(&self) -> (f64, f64) {
        let (length, width) = default_patch(self.kind);
        (self.patch_length.unwrap_or(length), self.patch_width.unwrap_or(width))
    }

    pub fn variant(&self) -> TerrainVariant {
        let (length, width) = self.patch_size();
        let patch = PatchSettings {
            bounds: PatchBounds::centered(length, width),
            threads: self.threads.max(1),
            proxy_fixed: self.proxy_fixed,
            proxy_contact_radius: self.proxy_contact_radius,
            material: self.material,
        };
        match self.kind {
            TerrainType::Rigid => TerrainVariant::Rigid { patch },
            TerrainType::Scm => TerrainVariant::Scm { patch, scm: self.scm },
            TerrainType::GranularCpu => TerrainVariant::GranularCpu {
                patch,
                granular: self.granular.clone(),
            },
            TerrainType::GranularGpu => TerrainVariant::GranularGpu {
                patch,
                granular: self.granular.clone(),
            },
            TerrainType::GranularSph => TerrainVariant::GranularSph {
                patch,
                sph: self.sph.clone(),
            },
        }
    }
}

impl RigConfig {
    pub fn variant(&self) -> RigVariant {
        match self.tire {
            TireType::Rigid => RigVariant::RigidTire(self.clone()),
            TireType::Flexible => RigVariant::FlexibleTire(self.clone()),
        }
    }
}

// ── Run plan ──────────────────────────────────────────────────────────────────

/// `ceil(a / b)` that does not round 10.000000000000002 up to 11.
pub fn ceil_ratio(a: f64, b: f64) -> u64 {
    let ratio = a / b;
    let nearest = ratio.round();
    if (ratio - nearest).abs() <= 1e-9 * nearest.max(1.0) {
        nearest.max(0.0) as u64
    } else {
        ratio.ceil().max(0.0) as u64
    }
}

impl RunConfig {
    /// Number of co-simulation steps: `ceil(sim_time / step_size)`.
    pub fn sim_steps(&self) -> u64 {
        ceil_ratio(self.sim_time, self.step_size)
    }

    /// Steps between output frames: `ceil(1 / (output_fps * step_size))`.
    pub fn output_steps(&self) -> u64 {
        ceil_ratio(1.0, self.output_fps * self.step_size).max(1)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("rig-cosim")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("rig-cosim")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("co-simulation requires exactly 2 processes, got {0}")]
    ProcessCount(u32),
    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: u32, world_size: u32 },
    #[error("{terrain} terrain is not available in this build (enable the `{feature}` feature)")]
    BackendUnavailable { terrain: TerrainType, feature: &'static str },
    #[error("failed to create output directory {0}: {1}")]
    OutputDir(PathBuf, std::io::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CosimConfig {
    /// Load config: env vars → file → defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::file_path);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CosimConfig::default()
        };
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COSIM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::file_path);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CosimConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply COSIM_* overrides from (name, value) pairs.
    ///
    /// Config keys are `COSIM_<SECTION>__<FIELD>`; an unknown one is an
    /// error. Process keys without a section (`COSIM_RANK`, `COSIM_CONFIG`)
    /// and unrelated variables are skipped.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        fn flag(field: &'static str, v: &str) -> Result<bool, ConfigError> {
            match v {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(invalid(field, format!("not a flag: {v}"))),
            }
        }
        fn number<T: std::str::FromStr>(field: &'static str, v: &str) -> Result<T, ConfigError> {
            v.parse().map_err(|_| invalid(field, format!("not a number: {v}")))
        }

        for (key, v) in vars {
            let Some(name) = key.strip_prefix("COSIM_") else {
                continue;
            };
            if !name.contains("__") {
                continue;
            }
            match name {
                "RUN__STEP_SIZE" => self.run.step_size = number("run.step_size", &v)?,
                "RUN__SIM_TIME" => self.run.sim_time = number("run.sim_time", &v)?,
                "RUN__OUTPUT" => self.run.output = flag("run.output", &v)?,
                "RUN__OUTPUT_FPS" => self.run.output_fps = number("run.output_fps", &v)?,
                "RUN__RENDER" => self.run.render = flag("run.render", &v)?,
                "RUN__RENDER_FPS" => self.run.render_fps = number("run.render_fps", &v)?,
                "RUN__VERBOSE" => self.run.verbose = flag("run.verbose", &v)?,
                "RUN__USE_CHECKPOINT" => {
                    self.run.use_checkpoint = flag("run.use_checkpoint", &v)?
                }
                "RUN__OUT_DIR" => self.run.out_dir = PathBuf::from(v),
                "RUN__SUFFIX" => self.run.suffix = v,
                "RUN__SEED" => self.run.seed = number("run.seed", &v)?,
                "TRANSPORT__ADDR" => self.transport.addr = v,
                "RIG__TIRE" => {
                    self.rig.tire = v.parse().map_err(|e| invalid("rig.tire", format!("{e}")))?
                }
                "RIG__THREADS" => self.rig.threads = number("rig.threads", &v)?,
                "RIG__INIT_VEL" => self.rig.init_vel = number("rig.init_vel", &v)?,
                "RIG__SLIP" => self.rig.slip = number("rig.slip", &v)?,
                "RIG__CARRIER_MASS" => {
                    self.rig.body_masses.carrier = number("rig.body_masses.carrier", &v)?
                }
                "TERRAIN__KIND" => {
                    self.terrain.kind =
                        v.parse().map_err(|e| invalid("terrain.kind", format!("{e}")))?
                }
                "TERRAIN__THREADS" => self.terrain.threads = number("terrain.threads", &v)?,
                "TERRAIN__PATCH_LENGTH" => {
                    self.terrain.patch_length = Some(number("terrain.patch_length", &v)?)
                }
                "TERRAIN__PATCH_WIDTH" => {
                    self.terrain.patch_width = Some(number("terrain.patch_width", &v)?)
                }
                "TERRAIN__SCM__MOHR_COHESION" => {
                    self.terrain.scm.mohr_cohesion = number("terrain.scm.mohr_cohesion", &v)?
                }
                "TERRAIN__GRANULAR__COH_PRESSURE" => {
                    self.terrain.granular.coh_pressure =
                        number("terrain.granular.coh_pressure", &v)?
                }
                "TERRAIN__SPH__PARAM_FILE" => self.terrain.sph.param_file = Some(PathBuf::from(v)),
                _ => return Err(invalid("overrides", format!("unknown config key {key}"))),
            }
        }
        Ok(())
    }

    /// Reject values no run can start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if !(run.step_size > 0.0) {
            return Err(invalid("run.step_size", "must be positive"));
        }
        if !(run.sim_time >= 0.0) {
            return Err(invalid("run.sim_time", "must not be negative"));
        }
        if !(run.output_fps > 0.0) {
            return Err(invalid("run.output_fps", "must be positive"));
        }
        if !(self.rig.slip.abs() < 1.0) {
            return Err(invalid("rig.slip", "must lie in (-1, 1)"));
        }
        let tm = &self.rig.tire_model;
        if !(tm.radius > 0.0 && tm.width > 0.0) {
            return Err(invalid("rig.tire_model", "radius and width must be positive"));
        }
        if tm.mesh_divisions_circ < 3 || tm.mesh_divisions_width < 2 {
            return Err(invalid("rig.tire_model", "mesh needs at least 3x2 divisions"));
        }
        let t = &self.terrain;
        let (length, width) = t.patch_size();
        if !(length > 0.0 && width > 0.0) {
            return Err(invalid("terrain.patch", "dimensions must be positive"));
        }
        match t.kind {
            TerrainType::GranularCpu | TerrainType::GranularGpu => {
                let g = &t.granular;
                if !(g.radius > 0.0 && g.density > 0.0) {
                    return Err(invalid("terrain.granular", "radius and density must be positive"));
                }
                if !(g.settling_time >= 0.0) {
                    return Err(invalid("terrain.granular.settling_time", "must not be negative"));
                }
            }
            TerrainType::GranularSph => {
                if !(t.sph.radius > 0.0 && t.sph.density > 0.0) {
                    return Err(invalid("terrain.sph", "radius and density must be positive"));
                }
            }
            TerrainType::Scm => {
                if !(t.scm.grid_spacing > 0.0) {
                    return Err(invalid("terrain.scm.grid_spacing", "must be positive"));
                }
                if t.scm.elastic_stiffness <= t.scm.bekker_kphi {
                    return Err(invalid("terrain.scm.elastic_stiffness", "must exceed bekker_kphi"));
                }
            }
            TerrainType::Rigid => {}
        }
        Ok(())
    }
}
