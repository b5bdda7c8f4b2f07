//! In-process transport: both ranks in one process, frames over mpsc.

use bytes::Bytes;
use tokio::sync::mpsc;

use cosim_core::wire::{decode_frame, Frame};

use super::{ChannelError, Transport};

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        self.tx.send(frame).map_err(|_| ChannelError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Frame, ChannelError> {
        let bytes = self.rx.recv().await.ok_or(ChannelError::Disconnected)?;
        Ok(decode_frame(bytes)?)
    }
}
