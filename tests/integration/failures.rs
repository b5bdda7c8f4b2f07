//! Fatal paths: bad configuration, incompatible variants, protocol misuse.

use cosim_core::config::ConfigError;
use cosim_core::{Role, TerrainType, TireType};
use cosim_services::node::NodeContext;
use cosim_services::{build_rig, ensure_available, CosimError};
use cosimd::{
    run_process, ChannelError, Coordinator, CoordinatorState, Participant, RunPlan, SyncChannel,
};

use crate::*;

fn is_peer_abort(result: &RankResult, from: Role) -> bool {
    matches!(
        result,
        Err(CoordinatorError::Channel(ChannelError::PeerAborted { role, .. })) if *role == from
    )
}

// ══════════════════════════════════════════════════════════════════════════════
//  Wrong process count
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn wrong_process_count_fails_before_any_node_exists() {
    let scratch = Scratch::new("process-count");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);

    for (rank, world_size) in [(0, 1), (0, 3), (2, 3)] {
        let err = run_process(&config, rank, world_size).await.unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<ConfigError>(),
                Some(ConfigError::ProcessCount(n)) if *n == world_size
            ),
            "unexpected error: {err:#}"
        );
    }
    assert!(!scratch.root().exists());
}

// ══════════════════════════════════════════════════════════════════════════════
//  Configuration
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invalid_config_fails_both_ranks() {
    let scratch = Scratch::new("bad-config");
    let mut config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);
    config.run.step_size = 0.0;

    let (rig, terrain) = run_pair(&config).await;
    assert!(rig.is_err());
    assert!(terrain.is_err());
    assert!(!run_dir(&config).exists());
}

#[tokio::test]
async fn unavailable_backend_fails_before_directories() {
    if ensure_available(TerrainType::GranularGpu).is_ok() {
        eprintln!("SKIP: built with the gpu feature");
        return;
    }
    let scratch = Scratch::new("no-gpu");
    let config = quick_config(&scratch, TireType::Flexible, TerrainType::GranularGpu);

    let (rig, terrain) = run_pair(&config).await;
    for result in [&rig, &terrain] {
        assert!(matches!(
            result,
            Err(CoordinatorError::Node(CosimError::Config(ConfigError::BackendUnavailable { .. })))
        ));
    }
    assert!(!run_dir(&config).exists());
}

#[tokio::test]
async fn unwritable_output_dir_aborts_the_terrain() {
    let scratch = Scratch::new("bad-outdir");
    std::fs::create_dir_all(scratch.root()).unwrap();
    let blocker = scratch.root().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let mut config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);
    config.run.out_dir = blocker;

    let (rig, terrain) = run_pair(&config).await;
    assert!(matches!(
        rig,
        Err(CoordinatorError::Node(CosimError::Config(ConfigError::OutputDir(..))))
    ));
    assert!(is_peer_abort(&terrain, Role::Rig));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Variant compatibility
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rigid_tire_on_particle_terrain_aborts_both_ranks() {
    let scratch = Scratch::new("incompatible");
    let mut config = quick_config(&scratch, TireType::Rigid, TerrainType::GranularSph);
    config.terrain.patch_length = Some(0.4);
    config.terrain.patch_width = Some(0.2);
    config.terrain.sph.depth = 0.1;

    let (rig, terrain) = run_pair(&config).await;
    assert!(matches!(
        rig,
        Err(CoordinatorError::Node(CosimError::IncompatibleTerrain {
            tire: TireType::Rigid,
            terrain: TerrainType::GranularSph,
        }))
    ));
    assert!(is_peer_abort(&terrain, Role::Rig));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Ordering guards
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn advance_before_synchronize_is_refused() {
    let scratch = Scratch::new("ordering");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);
    let ctx = NodeContext::new(Role::Rig, &config, &run_dir(&config));
    let mut node = Participant::Rig(build_rig(&config, ctx).unwrap()).guarded();

    assert!(matches!(node.advance(0, 1e-3), Err(CoordinatorError::Ordering(_))));

    let (a, _b) = MemoryTransport::pair();
    let mut channel = SyncChannel::new(a, Role::Rig);
    // step 3 cannot be synchronized before the handshake
    assert!(matches!(
        node.synchronize(&mut channel, 3, 0.0).await,
        Err(CoordinatorError::Ordering(_))
    ));
}

#[tokio::test]
async fn run_before_initialize_is_refused() {
    let scratch = Scratch::new("state");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);
    let ctx = NodeContext::new(Role::Rig, &config, &run_dir(&config));
    let participant = Participant::Rig(build_rig(&config, ctx).unwrap());

    let (a, _b) = MemoryTransport::pair();
    let plan = RunPlan::from_config(&config.run);
    let mut coordinator = Coordinator::new(participant, SyncChannel::new(a, Role::Rig), plan);
    assert_eq!(coordinator.state(), CoordinatorState::Ready);
    assert!(matches!(
        coordinator.run().await,
        Err(CoordinatorError::State {
            expected: CoordinatorState::Running,
            found: CoordinatorState::Ready,
        })
    ));
    assert_eq!(coordinator.state(), CoordinatorState::Ready);
}
