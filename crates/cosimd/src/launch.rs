//! Process startup: role assignment, run directory, transport, node
//! construction, and the `launch` supervisor that spawns both ranks.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::Instrument;

use cosim_core::config::{ConfigError, CosimConfig};
use cosim_core::variant::{run_dir_name, REQUIRED_PROCESSES};
use cosim_core::wire::STARTUP_STEP;
use cosim_core::Role;
use cosim_services::{build_rig, build_terrain, ensure_available, NodeContext};

use crate::channel::{SyncChannel, TcpTransport, Transport};
use crate::coordinator::{Coordinator, CoordinatorError, RunPlan, RunSummary};
use crate::participant::Participant;

/// Top-level directory under `out_dir` holding every run.
pub const RUNS_DIR: &str = "RIG_COSIM";

/// Map a process rank to its role. Anything but exactly two processes is a
/// configuration error.
pub fn assign_role(rank: u32, world_size: u32) -> Result<Role, ConfigError> {
    if world_size != REQUIRED_PROCESSES {
        return Err(ConfigError::ProcessCount(world_size));
    }
    Role::from_rank(rank).ok_or(ConfigError::RankOutOfRange { rank, world_size })
}

/// `<out_dir>/RIG_COSIM/<tire>_<terrain>[_<suffix>]`.
pub fn run_dir(config: &CosimConfig) -> PathBuf {
    config
        .run
        .out_dir
        .join(RUNS_DIR)
        .join(run_dir_name(config.rig.tire, config.terrain.kind, &config.run.suffix))
}

fn create_run_dir(path: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(path).map_err(|e| ConfigError::OutputDir(path.to_path_buf(), e))
}

/// Checks that need no peer: valid values and an available backend.
pub fn preflight(config: &CosimConfig) -> Result<(), ConfigError> {
    config.validate()?;
    ensure_available(config.terrain.kind)
}

/// Everything between the connected transport and a built node. Rank 0
/// creates the run directory before the startup barrier; both ranks build
/// their node after it.
async fn startup<T: Transport>(
    config: &CosimConfig,
    role: Role,
    channel: &mut SyncChannel<T>,
) -> Result<Participant, CoordinatorError> {
    preflight(config)?;
    let dir = run_dir(config);
    if role == Role::Rig {
        create_run_dir(&dir)?;
        tracing::info!(dir = %dir.display(), "run directory ready");
    }
    channel.barrier(STARTUP_STEP).await?;

    if config.run.render {
        tracing::warn!(
            fps = config.run.render_fps,
            "rendering requested but no renderer is available"
        );
    }

    let ctx = NodeContext::new(role, config, &dir);
    let participant = match role {
        Role::Rig => Participant::Rig(build_rig(config, ctx)?),
        Role::Terrain => Participant::Terrain(build_terrain(config, ctx)?),
    };
    tracing::info!(node = participant.name(), "node constructed");
    Ok(participant)
}

/// Run one rank to completion over an already connected transport.
pub async fn run_rank<T: Transport>(
    config: &CosimConfig,
    role: Role,
    transport: T,
) -> Result<RunSummary, CoordinatorError> {
    let mut channel = SyncChannel::new(transport, role);
    match startup(config, role, &mut channel).await {
        Ok(participant) => {
            let plan = RunPlan::from_config(&config.run);
            Coordinator::new(participant, channel, plan).execute().await
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            if !matches!(e, CoordinatorError::Channel(_)) {
                channel.abort(&e.to_string()).await;
            }
            Err(e)
        }
    }
}

/// Assign the role, connect over TCP and run. The role is assigned before
/// anything touches the filesystem or the network.
pub async fn run_process(config: &CosimConfig, rank: u32, world_size: u32) -> Result<RunSummary> {
    let role = assign_role(rank, world_size)?;
    let span = tracing::info_span!("cosim", role = %role, rank);
    connect_and_run(config, role)
        .instrument(span)
        .await
        .with_context(|| format!("{role} rank {rank} failed"))
}

async fn connect_and_run(config: &CosimConfig, role: Role) -> Result<RunSummary> {
    preflight(config)?;
    let transport = match role {
        Role::Rig => {
            let listener = TcpTransport::listen(&config.transport.addr).await?;
            TcpTransport::accept(&listener).await?
        }
        Role::Terrain => {
            let backoff = Duration::from_millis(config.transport.connect_backoff_ms);
            let attempts = config.transport.connect_attempts;
            TcpTransport::connect(&config.transport.addr, attempts, backoff).await?
        }
    };
    Ok(run_rank(config, role, transport).await?)
}

// ── Supervisor ────────────────────────────────────────────────────────────────

fn spawn_rank(
    exe: &Path,
    config_path: Option<&Path>,
    env: &[(String, String)],
    rank: u32,
    world_size: u32,
) -> Result<Child> {
    let mut cmd = Command::new(exe);
    cmd.arg("run")
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("COSIM_RANK", rank.to_string())
        .env("COSIM_WORLD_SIZE", world_size.to_string())
        .kill_on_drop(true);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.spawn().with_context(|| format!("failed to spawn rank {rank}"))
}

/// Spawn `world_size` copies of this binary and wait for all of them. `env`
/// is passed to every child as config overrides. If any rank exits non-zero
/// the survivors are killed.
pub async fn spawn_children(
    config_path: Option<&Path>,
    env: &[(String, String)],
    world_size: u32,
) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut children = Vec::new();
    for rank in 0..world_size {
        children.push((rank, Some(spawn_rank(&exe, config_path, env, rank, world_size)?)));
    }
    tracing::info!(world_size, "ranks spawned");

    let mut failed: Option<(u32, ExitStatus)> = None;
    while children.iter().any(|(_, c)| c.is_some()) {
        for (rank, slot) in children.iter_mut() {
            let Some(child) = slot else { continue };
            if let Some(status) = child.try_wait()? {
                tracing::info!(rank = *rank, %status, "rank exited");
                if !status.success() && failed.is_none() {
                    failed = Some((*rank, status));
                }
                *slot = None;
            }
        }
        if failed.is_some() {
            for (rank, slot) in children.iter_mut() {
                if let Some(mut child) = slot.take() {
                    tracing::warn!(rank = *rank, "killing surviving rank");
                    let _ = child.kill().await;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match failed {
        Some((rank, status)) => bail!("rank {rank} failed with {status}"),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_two_processes_are_accepted() {
        assert_eq!(assign_role(0, 2).unwrap(), Role::Rig);
        assert_eq!(assign_role(1, 2).unwrap(), Role::Terrain);
        assert!(matches!(assign_role(0, 1), Err(ConfigError::ProcessCount(1))));
        assert!(matches!(assign_role(0, 3), Err(ConfigError::ProcessCount(3))));
        assert!(matches!(assign_role(2, 2), Err(ConfigError::RankOutOfRange { rank: 2, .. })));
    }

    #[test]
    fn run_dir_follows_variants_and_suffix() {
        let mut config = CosimConfig::default();
        config.run.out_dir = PathBuf::from("/data");
        config.run.suffix = "trial".into();
        let dir = run_dir(&config);
        assert!(dir.starts_with("/data/RIG_COSIM"));
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.ends_with("_trial"));
    }

    #[test]
    fn preflight_rejects_bad_values() {
        let mut config = CosimConfig::default();
        config.run.step_size = 0.0;
        assert!(preflight(&config).is_err());
    }
}
