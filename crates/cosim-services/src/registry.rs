//! Variant registry: builds the rig and terrain nodes named in the config.
//!
//! Terrain backends behind cargo features are checked here, before any
//! directory is created or any peer is contacted.

use std::sync::Arc;

use cosim_core::config::{ConfigError, CosimConfig, RigVariant, TerrainVariant};
use cosim_core::TerrainType;

use crate::node::{CosimError, NodeContext, RigNode, TerrainNode};
use crate::rig::{FlexibleTire, FlexibleTireNode, RigidTire, RigidTireNode};
use crate::terrain::granular::{GranularBackend, GranularBed};
use crate::terrain::rigid::RigidPlane;
use crate::terrain::scm::ScmSoil;
use crate::terrain::sph::{SphBed, SphParameters};
use crate::terrain::Terrain;

/// Fail if `terrain` needs a backend this build was compiled without.
pub fn ensure_available(terrain: TerrainType) -> Result<(), ConfigError> {
    let feature = match terrain {
        // the plane and the soil grid run on the coordinating thread
        TerrainType::Rigid | TerrainType::Scm => return Ok(()),
        TerrainType::GranularCpu => ("multicore", cfg!(feature = "multicore")),
        TerrainType::GranularGpu => ("gpu", cfg!(feature = "gpu")),
        TerrainType::GranularSph => ("sph", cfg!(feature = "sph")),
    };
    match feature {
        (_, true) => Ok(()),
        (name, false) => Err(ConfigError::BackendUnavailable {
            terrain,
            feature: name,
        }),
    }
}

pub fn build_terrain(
    config: &CosimConfig,
    ctx: NodeContext,
) -> Result<Box<dyn TerrainNode>, CosimError> {
    let variant = config.terrain.variant();
    ensure_available(variant.kind())?;

    let node: Box<dyn TerrainNode> = match variant {
        TerrainVariant::Rigid { mut patch } => {
            if patch.threads > 1 {
                tracing::warn!(threads = patch.threads, "rigid terrain runs single-threaded");
            }
            patch.threads = 1;
            let mut ctx = ctx;
            ctx.threads = 1;
            let model = RigidPlane::new(&patch);
            Box::new(Terrain::new(ctx, patch, model)?)
        }
        TerrainVariant::Scm { patch, scm } => {
            let model = ScmSoil::new(&patch, scm, ctx.step_size);
            Box::new(Terrain::new(ctx, patch, model)?)
        }
        TerrainVariant::GranularCpu { patch, granular } => {
            let backend = GranularBackend::Cpu {
                threads: ctx.threads as usize,
            };
            let model = GranularBed::new(backend, &patch, granular);
            Box::new(Terrain::new(ctx, patch, model)?)
        }
        TerrainVariant::GranularGpu { patch, granular } => {
            let model = GranularBed::new(GranularBackend::Gpu, &patch, granular);
            Box::new(Terrain::new(ctx, patch, model)?)
        }
        TerrainVariant::GranularSph { patch, sph } => {
            let params = match &sph.param_file {
                Some(path) => SphParameters::load(path)?,
                None => SphParameters::default(),
            };
            let model = SphBed::new(&patch, sph, Arc::new(params));
            Box::new(Terrain::new(ctx, patch, model)?)
        }
    };
    Ok(node)
}

pub fn build_rig(config: &CosimConfig, ctx: NodeContext) -> Result<Box<dyn RigNode>, CosimError> {
    let node: Box<dyn RigNode> = match config.rig.variant() {
        RigVariant::RigidTire(settings) => {
            let tire = RigidTire::new(&settings);
            Box::new(RigidTireNode::new(ctx, settings, tire)?)
        }
        RigVariant::FlexibleTire(settings) => {
            let tire = FlexibleTire::new(&settings);
            Box::new(FlexibleTireNode::new(ctx, settings, tire)?)
        }
    };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::{Role, TireType};

    fn context(role: Role, config: &CosimConfig, tag: &str) -> NodeContext {
        let run = std::env::temp_dir().join(format!("cosim-registry-{tag}-{}", std::process::id()));
        NodeContext::new(role, config, &run)
    }

    #[test]
    fn builtin_terrains_are_always_available() {
        assert!(ensure_available(TerrainType::Rigid).is_ok());
        assert!(ensure_available(TerrainType::Scm).is_ok());
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_terrain_is_refused_without_the_feature() {
        let err = ensure_available(TerrainType::GranularGpu).unwrap_err();
        assert!(matches!(err, ConfigError::BackendUnavailable { feature: "gpu", .. }));

        let mut config = CosimConfig::default();
        config.terrain.kind = TerrainType::GranularGpu;
        let ctx = context(Role::Terrain, &config, "gpu");
        let node_dir = ctx.node_dir.clone();
        assert!(matches!(
            build_terrain(&config, ctx),
            Err(CosimError::Config(ConfigError::BackendUnavailable { .. }))
        ));
        assert!(!node_dir.exists());
    }

    #[test]
    fn builds_requested_variants() {
        let mut config = CosimConfig::default();
        config.terrain.kind = TerrainType::Scm;
        config.rig.tire = TireType::Flexible;

        let ctx = context(Role::Terrain, &config, "scm");
        let dir = ctx.node_dir.parent().map(|p| p.to_path_buf());
        let terrain = build_terrain(&config, ctx).unwrap();
        assert_eq!(terrain.terrain_type(), TerrainType::Scm);
        assert_eq!(terrain.name(), "TERRAIN");

        let rig = build_rig(&config, context(Role::Rig, &config, "scm")).unwrap();
        assert_eq!(rig.tire_type(), TireType::Flexible);
        assert_eq!(rig.name(), "RIG");

        if let Some(dir) = dir {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn missing_sph_parameter_file_fails_construction() {
        let mut config = CosimConfig::default();
        config.terrain.kind = TerrainType::GranularSph;
        config.terrain.sph.param_file = Some("/nonexistent/sph.json".into());
        let ctx = context(Role::Terrain, &config, "sph");
        let err = build_terrain(&config, ctx);
        assert!(matches!(err, Err(CosimError::SphParameters { .. }) | Err(CosimError::Config(_))));
    }
}
