//! cosimd: rig/terrain co-simulation daemon.
//!
//! ```bash
//! # spawn both ranks locally
//! cosimd launch --terrain granular_cpu --tire flexible
//!
//! # or start each rank by hand
//! cosimd run --rank 0 --world-size 2 --config run.toml
//! cosimd run --rank 1 --world-size 2 --config run.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cosim_core::config::CosimConfig;
use cosimd::{run_process, spawn_children};

#[derive(Parser, Debug)]
#[command(name = "cosimd", version, about = "Rig/terrain co-simulation")]
struct Cli {
    /// Config file (TOML). Defaults to $COSIM_CONFIG or the XDG config path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one rank.
    Run {
        #[arg(long, env = "COSIM_RANK")]
        rank: u32,

        #[arg(long, env = "COSIM_WORLD_SIZE", default_value_t = 2)]
        world_size: u32,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Spawn every rank as a child process and wait for them.
    Launch {
        #[arg(long, default_value_t = 2)]
        ranks: u32,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Write the default config file if none exists.
    InitConfig,
}

/// Command-line overrides, applied on top of env vars and the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Terrain variant (rigid, scm, granular_cpu, granular_gpu, granular_sph).
    #[arg(long)]
    terrain: Option<String>,

    /// Tire variant (rigid, flexible).
    #[arg(long)]
    tire: Option<String>,

    #[arg(long)]
    step_size: Option<f64>,

    #[arg(long)]
    sim_time: Option<f64>,

    #[arg(long)]
    init_vel: Option<f64>,

    #[arg(long)]
    slip: Option<f64>,

    /// Worker threads for the rig node.
    #[arg(long)]
    threads_rig: Option<u32>,

    /// Worker threads for the terrain node.
    #[arg(long)]
    threads_terrain: Option<u32>,

    /// Wheel carrier mass (kg).
    #[arg(long)]
    sys_mass: Option<f64>,

    /// Soil cohesion pressure (Pa), for both SCM and granular terrain.
    #[arg(long)]
    coh_pressure: Option<f64>,

    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long)]
    suffix: Option<String>,

    /// Start from a saved checkpoint instead of settling.
    #[arg(long)]
    use_checkpoint: bool,

    /// Skip per-frame output files.
    #[arg(long)]
    no_output: bool,

    /// Request run-time visualization.
    #[arg(long)]
    render: bool,

    #[arg(long)]
    quiet: bool,
}

impl Overrides {
    /// The overrides as `COSIM_*` variables, so children of `launch` see
    /// the same values.
    fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                vars.push((key.to_string(), v));
            }
        };
        push("COSIM_TERRAIN__KIND", self.terrain.clone());
        push("COSIM_RIG__TIRE", self.tire.clone());
        push("COSIM_RUN__STEP_SIZE", self.step_size.map(|v| v.to_string()));
        push("COSIM_RUN__SIM_TIME", self.sim_time.map(|v| v.to_string()));
        push("COSIM_RIG__INIT_VEL", self.init_vel.map(|v| v.to_string()));
        push("COSIM_RIG__SLIP", self.slip.map(|v| v.to_string()));
        push("COSIM_RIG__THREADS", self.threads_rig.map(|v| v.to_string()));
        push("COSIM_TERRAIN__THREADS", self.threads_terrain.map(|v| v.to_string()));
        push("COSIM_RIG__CARRIER_MASS", self.sys_mass.map(|v| v.to_string()));
        push("COSIM_TERRAIN__SCM__MOHR_COHESION", self.coh_pressure.map(|v| v.to_string()));
        push(
            "COSIM_TERRAIN__GRANULAR__COH_PRESSURE",
            self.coh_pressure.map(|v| v.to_string()),
        );
        push("COSIM_RUN__OUT_DIR", self.out_dir.as_ref().map(|p| p.display().to_string()));
        push("COSIM_RUN__SUFFIX", self.suffix.clone());
        push("COSIM_RUN__USE_CHECKPOINT", self.use_checkpoint.then(|| "true".to_string()));
        push("COSIM_RUN__OUTPUT", self.no_output.then(|| "false".to_string()));
        push("COSIM_RUN__RENDER", self.render.then(|| "true".to_string()));
        push("COSIM_RUN__VERBOSE", self.quiet.then(|| "false".to_string()));
        vars
    }
}

fn load_config(path: Option<&PathBuf>, overrides: &Overrides) -> Result<CosimConfig> {
    let mut config =
        CosimConfig::load(path.map(PathBuf::as_path)).context("failed to load config")?;
    config
        .apply_overrides(overrides.to_env())
        .context("invalid command-line override")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            rank,
            world_size,
            overrides,
        } => {
            let config = load_config(cli.config.as_ref(), &overrides)?;
            let summary = run_process(&config, rank, world_size).await.map_err(|e| {
                tracing::error!(rank, error = %format!("{e:#}"), "rank failed");
                e
            })?;
            tracing::info!(role = %summary.role, steps = summary.steps, "rank finished");
        }
        Command::Launch { ranks, overrides } => {
            // fail fast on a bad config before spawning anything
            load_config(cli.config.as_ref(), &overrides)?;
            spawn_children(cli.config.as_deref(), &overrides.to_env(), ranks).await?;
            tracing::info!("co-simulation finished");
        }
        Command::InitConfig => {
            let path = CosimConfig::write_default_if_missing(cli.config.as_deref())?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_reach_the_config() {
        let cli = Cli::try_parse_from([
            "cosimd",
            "run",
            "--rank",
            "0",
            "--threads-rig",
            "2",
            "--threads-terrain",
            "6",
            "--sys-mass",
            "120",
            "--coh-pressure",
            "300",
            "--no-output",
            "--render",
        ])
        .unwrap();
        let Command::Run { overrides, .. } = cli.command else {
            panic!("expected the run subcommand");
        };

        let mut config = CosimConfig::default();
        config.apply_overrides(overrides.to_env()).unwrap();
        assert_eq!(config.rig.threads, 2);
        assert_eq!(config.terrain.threads, 6);
        assert_eq!(config.rig.body_masses.carrier, 120.0);
        assert_eq!(config.terrain.scm.mohr_cohesion, 300.0);
        assert_eq!(config.terrain.granular.coh_pressure, 300.0);
        assert!(!config.run.output);
        assert!(config.run.render);
    }
}
