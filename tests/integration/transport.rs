//! Both ranks over TCP loopback.

use std::time::Duration;

use cosim_core::{Role, TerrainType, TireType};
use cosimd::{ChannelError, TcpTransport};

use crate::*;

#[tokio::test]
async fn rigid_pair_over_tcp_loopback() {
    let scratch = Scratch::new("tcp-run");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Scm);

    let listener = TcpTransport::listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (rig, terrain) = tokio::join!(
        async {
            let transport = TcpTransport::accept(&listener).await.unwrap();
            run_rank(&config, Role::Rig, transport).await
        },
        async {
            let transport =
                TcpTransport::connect(&addr, 50, Duration::from_millis(10)).await.unwrap();
            run_rank(&config, Role::Terrain, transport).await
        },
    );
    assert_eq!(rig.expect("rig rank failed").steps, 10);
    assert_eq!(terrain.expect("terrain rank failed").steps, 10);
    assert!(node_dir(&config, Role::Terrain).join("checkpoint_end.dat").exists());
}

#[tokio::test]
async fn vanished_peer_is_a_channel_error() {
    let scratch = Scratch::new("tcp-vanish");
    let config = quick_config(&scratch, TireType::Rigid, TerrainType::Rigid);

    let listener = TcpTransport::listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (rig, _) = tokio::join!(
        async {
            let transport = TcpTransport::accept(&listener).await.unwrap();
            run_rank(&config, Role::Rig, transport).await
        },
        async {
            // connect and hang up without a word
            let transport =
                TcpTransport::connect(&addr, 50, Duration::from_millis(10)).await.unwrap();
            drop(transport);
        },
    );
    assert!(matches!(
        rig,
        Err(CoordinatorError::Channel(ChannelError::Disconnected | ChannelError::Io(_)))
    ));
}
