//! Synchronization channel between the rig and terrain processes.
//!
//! A `Transport` moves whole, hash-verified frames. `SyncChannel` sits on
//! top and enforces the protocol: fixed sender rank, gap-free per-direction
//! sequence numbers, matching step indices and expected frame kinds. Nothing
//! is retried; any violation is fatal for the run.

pub mod memory;
pub mod tcp;

use std::future::Future;

use bytes::Bytes;

use cosim_core::payload::Abort;
use cosim_core::wire::{encode_barrier, encode_message, Frame, FrameKind, WireError, STARTUP_STEP};
use cosim_core::{Message, Role};

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Moves encoded frames between the two processes, in order.
pub trait Transport: Send {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Next frame from the peer, header and body verified.
    fn recv(&mut self) -> impl Future<Output = Result<Frame, ChannelError>> + Send;
}

fn step_label(step: u64) -> String {
    if step == STARTUP_STEP {
        "startup".to_string()
    } else {
        step.to_string()
    }
}

pub struct SyncChannel<T: Transport> {
    transport: T,
    role: Role,
    send_seq: u32,
    recv_seq: u32,
    aborted: bool,
}

impl<T: Transport> SyncChannel<T> {
    pub fn new(transport: T, role: Role) -> Self {
        Self {
            transport,
            role,
            send_seq: 0,
            recv_seq: 0,
            aborted: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Both sides agree they are at `step`.
    pub async fn barrier(&mut self, step: u64) -> Result<(), ChannelError> {
        let frame = encode_barrier(self.role.rank(), step, self.send_seq)?;
        self.transport.send(frame).await?;
        self.send_seq = self.send_seq.wrapping_add(1);

        let frame = self.next_frame(step).await?;
        if frame.kind != FrameKind::Barrier {
            return Err(ChannelError::UnexpectedFrame {
                expected: FrameKind::Barrier.name(),
                got: frame.kind.name(),
            });
        }
        tracing::trace!(step = %step_label(step), "barrier passed");
        Ok(())
    }

    pub async fn send(&mut self, step: u64, msg: &Message) -> Result<(), ChannelError> {
        let frame = encode_message(self.role.rank(), step, self.send_seq, msg)?;
        self.transport.send(frame).await?;
        self.send_seq = self.send_seq.wrapping_add(1);
        Ok(())
    }

    pub async fn recv(&mut self, step: u64) -> Result<Message, ChannelError> {
        let frame = self.next_frame(step).await?;
        if frame.kind == FrameKind::Barrier {
            return Err(ChannelError::UnexpectedFrame {
                expected: "message",
                got: frame.kind.name(),
            });
        }
        Ok(frame.message()?)
    }

    /// Send `msg` for `step` and wait for the peer's reply.
    pub async fn exchange(&mut self, step: u64, msg: &Message) -> Result<Message, ChannelError> {
        self.send(step, msg).await?;
        self.recv(step).await
    }

    /// Best-effort abort notification. Errors are logged, not returned.
    pub async fn abort(&mut self, reason: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        let msg = Message::Abort(Abort {
            role: self.role,
            reason: reason.to_string(),
        });
        if let Err(e) = self.send(STARTUP_STEP, &msg).await {
            tracing::debug!(error = %e, "abort notification not delivered");
        }
    }

    /// Receive and check sender, sequence and step. An abort frame from the
    /// peer is turned into `PeerAborted` wherever it shows up.
    async fn next_frame(&mut self, step: u64) -> Result<Frame, ChannelError> {
        let frame = self.transport.recv().await?;

        let peer = self.role.peer().rank();
        if frame.sender != peer {
            return Err(ChannelError::UnexpectedSender {
                expected: peer,
                got: frame.sender,
            });
        }
        if frame.kind == FrameKind::Abort {
            self.aborted = true;
            return match frame.message()? {
                Message::Abort(abort) => Err(ChannelError::PeerAborted {
                    role: abort.role,
                    reason: abort.reason,
                }),
                other => Err(ChannelError::UnexpectedFrame {
                    expected: FrameKind::Abort.name(),
                    got: other.name(),
                }),
            };
        }
        if frame.sequence != self.recv_seq {
            return Err(ChannelError::Sequence {
                expected: self.recv_seq,
                got: frame.sequence,
            });
        }
        self.recv_seq = self.recv_seq.wrapping_add(1);
        if frame.step != step {
            return Err(ChannelError::StepMismatch {
                expected: step_label(step),
                got: step_label(frame.step),
            });
        }
        Ok(frame)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("could not reach peer at {addr} after {attempts} attempts")]
    Connect { addr: String, attempts: u32 },

    #[error("frame from rank {got}, expected rank {expected}")]
    UnexpectedSender { expected: u8, got: u8 },

    #[error("sequence {got}, expected {expected} (frame lost or duplicated)")]
    Sequence { expected: u32, got: u32 },

    #[error("frame for step {got} while at step {expected}")]
    StepMismatch { expected: String, got: String },

    #[error("unexpected {got} frame, expected {expected}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("{role} aborted: {reason}")]
    PeerAborted { role: Role, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosim_core::payload::{TerrainResponse, TerrainSample};

    fn pair() -> (SyncChannel<MemoryTransport>, SyncChannel<MemoryTransport>) {
        let (a, b) = MemoryTransport::pair();
        (SyncChannel::new(a, Role::Rig), SyncChannel::new(b, Role::Terrain))
    }

    fn response() -> Message {
        Message::TerrainResponse(TerrainResponse::Sample(TerrainSample {
            height: 0.0,
            stiffness: 1.0e6,
            damping: 10.0,
        }))
    }

    #[tokio::test]
    async fn barrier_and_exchange_in_lock_step() {
        let (mut rig, mut terrain) = pair();
        for step in 0..3u64 {
            let (a, b) = tokio::join!(rig.barrier(step), terrain.barrier(step));
            a.unwrap();
            b.unwrap();
            terrain.send(step, &response()).await.unwrap();
            assert_eq!(rig.recv(step).await.unwrap(), response());
        }
    }

    #[tokio::test]
    async fn duplicated_frame_is_fatal() {
        let (mut raw, b) = MemoryTransport::pair();
        let mut terrain = SyncChannel::new(b, Role::Terrain);
        raw.send(encode_barrier(0, 0, 0).unwrap()).await.unwrap();
        raw.send(encode_barrier(0, 0, 0).unwrap()).await.unwrap();
        terrain.next_frame(0).await.unwrap();
        assert!(matches!(
            terrain.next_frame(0).await,
            Err(ChannelError::Sequence { expected: 1, got: 0 })
        ));
    }

    #[tokio::test]
    async fn stale_step_and_wrong_sender_are_fatal() {
        let (mut raw, b) = MemoryTransport::pair();
        let mut terrain = SyncChannel::new(b, Role::Terrain);
        raw.send(encode_barrier(0, 4, 0).unwrap()).await.unwrap();
        assert!(matches!(terrain.barrier(5).await, Err(ChannelError::StepMismatch { .. })));

        let (mut raw, b) = MemoryTransport::pair();
        let mut terrain = SyncChannel::new(b, Role::Terrain);
        raw.send(encode_barrier(1, 0, 0).unwrap()).await.unwrap();
        assert!(matches!(
            terrain.barrier(0).await,
            Err(ChannelError::UnexpectedSender { expected: 0, got: 1 })
        ));
    }

    #[tokio::test]
    async fn abort_reaches_the_peer_once() {
        let (mut rig, mut terrain) = pair();
        rig.abort("boom").await;
        rig.abort("again").await;
        match terrain.barrier(0).await {
            Err(ChannelError::PeerAborted { role, reason }) => {
                assert_eq!(role, Role::Rig);
                assert_eq!(reason, "boom");
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_peer_is_disconnect() {
        let (rig, mut terrain) = pair();
        drop(rig);
        assert!(matches!(terrain.barrier(0).await, Err(ChannelError::Disconnected)));
    }
}
