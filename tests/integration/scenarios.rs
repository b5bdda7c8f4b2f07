//! End-to-end runs of both ranks over the in-memory channel.

use cosim_core::checkpoint::{END_LABEL, SETTLED_LABEL};
use cosim_core::payload::MeshState;
use cosim_core::{RigState, Role, TerrainResponse, TerrainType, TireType};
use cosim_services::node::{CosimNode, NodeContext, RigNode, TerrainNode};
use cosim_services::{build_rig, build_terrain, CheckpointStore};
use cosimd::run_dir;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Rigid tire on rigid terrain
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rigid_pair_runs_ten_steps_and_checkpoints() {
    let scratch = Scratch::new("rigid-pair");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);

    let (rig, terrain) = run_pair(&config).await;
    let rig = rig.expect("rig rank failed");
    let terrain = terrain.expect("terrain rank failed");

    assert_eq!(rig.steps, 10);
    assert_eq!(terrain.steps, 10);
    assert_eq!(rig.role, Role::Rig);
    assert_eq!(terrain.role, Role::Terrain);
    // frames at steps 0 and 5
    assert_eq!(rig.frames, 2);
    assert_eq!(terrain.clamped_nodes, Some(0));

    let terrain_dir = node_dir(&config, Role::Terrain);
    assert!(terrain_dir.join("checkpoint_end.dat").exists());
    let end = CheckpointStore::new(&terrain_dir).unwrap().load(END_LABEL).unwrap();
    assert_eq!(end.terrain, TerrainType::Rigid);
    assert!((end.time - 0.01).abs() < 1e-12);

    let rig_dir = node_dir(&config, Role::Rig);
    assert!(rig_dir.join("frame_00000.json").exists());
    assert!(rig_dir.join("frame_00001.json").exists());
    assert!(!rig_dir.join("frame_00002.json").exists());
}

// ══════════════════════════════════════════════════════════════════════════════
//  Granular settling, then restart from the settled checkpoint
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn granular_settles_then_restarts_from_checkpoint() {
    let scratch = Scratch::new("settle-restart");
    let mut config = quick_config(&scratch, TireType::Flexible, TerrainType::GranularCpu);
    small_granular(&mut config);

    let (rig, terrain) = run_pair(&config).await;
    rig.expect("rig rank failed");
    terrain.expect("terrain rank failed");

    let terrain_dir = node_dir(&config, Role::Terrain);
    assert!(terrain_dir.join("checkpoint_settled.dat").exists());
    assert!(terrain_dir.join("checkpoint_end.dat").exists());
    let settling = terrain_dir.join("settling");
    assert!(settling.join("settling_00000.json").exists());

    let store = CheckpointStore::new(&terrain_dir).unwrap();
    let settled = store.load(SETTLED_LABEL).unwrap();
    assert_eq!(settled.terrain, TerrainType::GranularCpu);

    // restart: no settling, state bit-identical to the checkpoint
    std::fs::remove_dir_all(&settling).unwrap();
    config.run.use_checkpoint = true;

    let ctx = NodeContext::new(Role::Terrain, &config, &run_dir(&config));
    let mut node = build_terrain(&config, ctx).unwrap();
    let report = node.prepare().unwrap();
    assert!(!report.settled);
    assert_eq!(report.restored_from.as_deref(), Some(SETTLED_LABEL));
    assert_eq!(node.snapshot(SETTLED_LABEL).state, settled.state);
    drop(node);

    let (rig, terrain) = run_pair(&config).await;
    rig.expect("rig rank failed on restart");
    terrain.expect("terrain rank failed on restart");
    assert!(!settling.exists());
    // the settled checkpoint is read, never rewritten
    assert_eq!(store.load(SETTLED_LABEL).unwrap(), settled);
}

#[tokio::test]
async fn restart_without_checkpoint_fails_both_ranks() {
    let scratch = Scratch::new("missing-checkpoint");
    let mut config = quick_config(&scratch, TireType::Flexible, TerrainType::GranularCpu);
    small_granular(&mut config);
    config.run.use_checkpoint = true;

    let (rig, terrain) = run_pair(&config).await;
    assert!(terrain.is_err());
    assert!(matches!(
        rig,
        Err(CoordinatorError::Channel(cosimd::ChannelError::PeerAborted {
            role: Role::Terrain,
            ..
        }))
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Flexible mesh: one force per vertex, in index order
// ══════════════════════════════════════════════════════════════════════════════

struct Bound {
    rig: Box<dyn RigNode>,
    terrain: Box<dyn TerrainNode>,
}

fn bind_flexible_on(scratch: &Scratch, terrain: TerrainType) -> Bound {
    let config = quick_config(scratch, TireType::Flexible, terrain);
    let dir = run_dir(&config);
    let mut rig = build_rig(&config, NodeContext::new(Role::Rig, &config, &dir)).unwrap();
    let mut node = build_terrain(&config, NodeContext::new(Role::Terrain, &config, &dir)).unwrap();
    node.prepare().unwrap();
    let ack = node.accept_rig(rig.init_payload().unwrap()).unwrap();
    rig.on_terrain_init(&ack).unwrap();
    Bound { rig, terrain: node }
}

#[tokio::test]
async fn flexible_pair_runs_to_completion() {
    let scratch = Scratch::new("flexible-run");
    let config = quick_config(&scratch, TireType::Flexible, TerrainType::Scm);
    let (rig, terrain) = run_pair(&config).await;
    assert_eq!(rig.expect("rig rank failed").steps, 10);
    assert_eq!(terrain.expect("terrain rank failed").steps, 10);
    assert!(node_dir(&config, Role::Terrain).join("checkpoint_end.dat").exists());
}

#[test]
fn every_synchronize_returns_one_force_per_vertex() {
    let scratch = Scratch::new("flexible-count");
    let mut bound = bind_flexible_on(&scratch, TerrainType::Rigid);

    for step in 0..5 {
        let state = bound.rig.contact_state(step, step as f64 * 1e-3).unwrap();
        let n = match &state {
            RigState::Mesh(mesh) => mesh.positions.len(),
            RigState::Footprint(_) => panic!("flexible tire sent a footprint"),
        };
        assert!(n > 0);
        let response = bound.terrain.respond(step, 0.0, state).unwrap();
        match &response {
            TerrainResponse::NodeForces(forces) => assert_eq!(forces.len(), n),
            TerrainResponse::Sample(_) => panic!("mesh answered with a sample"),
        }
        bound.rig.apply_response(response).unwrap();
        bound.rig.advance(1e-3).unwrap();
        bound.terrain.advance(1e-3).unwrap();
    }
}

#[test]
fn forces_follow_vertex_order_and_clamp_out_of_bounds() {
    let scratch = Scratch::new("flexible-order");
    let mut bound = bind_flexible_on(&scratch, TerrainType::Rigid);
    let n = match bound.rig.contact_state(0, 0.0).unwrap() {
        RigState::Mesh(mesh) => mesh.positions.len(),
        RigState::Footprint(_) => unreachable!(),
    };

    // everything hovers except vertex `k`, which presses into the ground;
    // the last vertex sits far outside the patch
    let k = n / 3;
    let mut positions = vec![[0.0, 0.0, 1.0]; n];
    positions[k] = [0.1, 0.0, -0.001];
    positions[n - 1] = [100.0, 0.0, -0.5];
    let state = RigState::Mesh(MeshState {
        positions,
        velocities: vec![[0.0; 3]; n],
    });

    let forces = match bound.terrain.respond(0, 0.0, state).unwrap() {
        TerrainResponse::NodeForces(forces) => forces,
        TerrainResponse::Sample(_) => unreachable!(),
    };
    for (i, f) in forces.iter().enumerate() {
        if i == k {
            assert!(f[2] > 0.0, "pressed vertex got no reaction");
        } else {
            assert_eq!(*f, [0.0; 3], "vertex {i} should feel nothing");
        }
    }
    assert_eq!(bound.terrain.diagnostics().total(), 1);
}

#[test]
fn changed_vertex_count_is_fatal() {
    let scratch = Scratch::new("flexible-mismatch");
    let mut bound = bind_flexible_on(&scratch, TerrainType::Rigid);
    let state = RigState::Mesh(MeshState {
        positions: vec![[0.0, 0.0, 1.0]; 3],
        velocities: vec![[0.0; 3]; 3],
    });
    let err = bound.terrain.respond(0, 0.0, state).unwrap_err();
    assert!(matches!(err, cosim_services::CosimError::TopologyMismatch { step: 0, got: 3, .. }));
}
