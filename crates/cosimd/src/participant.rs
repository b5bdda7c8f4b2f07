//! The node owned by one process, seen from the step loop.
//!
//! `Participant` runs the per-role half of each protocol exchange and
//! refuses to advance a step that has not been synchronized.

use cosim_core::wire::STARTUP_STEP;
use cosim_core::{Message, Role};
use cosim_services::node::{CosimNode, NodeTimer, PrepareReport};
use cosim_services::{CosimError, RigNode, TerrainNode};

use crate::channel::{SyncChannel, Transport};
use crate::coordinator::CoordinatorError;

pub enum Participant {
    Rig(Box<dyn RigNode>),
    Terrain(Box<dyn TerrainNode>),
}

/// Last protocol milestone reached, for the ordering guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Created,
    Initialized,
    Synchronized(u64),
    Advanced(u64),
}

pub struct Guarded {
    participant: Participant,
    progress: Progress,
}

macro_rules! with_node {
    ($participant:expr, $node:ident => $body:expr) => {
        match $participant {
            Participant::Rig($node) => $body,
            Participant::Terrain($node) => $body,
        }
    };
}

impl Participant {
    pub fn role(&self) -> Role {
        with_node!(self, n => n.role())
    }

    pub fn name(&self) -> &'static str {
        with_node!(self, n => n.name())
    }

    pub fn guarded(self) -> Guarded {
        Guarded {
            participant: self,
            progress: Progress::Created,
        }
    }
}

fn unexpected(expected: &'static str, got: &Message) -> CoordinatorError {
    CoordinatorError::Node(CosimError::PayloadMismatch {
        expected,
        got: got.name(),
    })
}

impl Guarded {
    pub fn role(&self) -> Role {
        self.participant.role()
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn timer(&self) -> &NodeTimer {
        with_node!(&self.participant, n => n.timer())
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// One-time handshake. The terrain prepares (settles or restores)
    /// before it reads the rig's payload.
    pub async fn initialize<T: Transport>(
        &mut self,
        channel: &mut SyncChannel<T>,
    ) -> Result<(), CoordinatorError> {
        if self.progress != Progress::Created {
            return Err(CoordinatorError::Ordering("initialize called twice"));
        }
        match &mut self.participant {
            Participant::Rig(rig) => {
                let init = rig.init_payload()?;
                let reply = channel.exchange(STARTUP_STEP, &Message::RigInit(init)).await?;
                match reply {
                    Message::TerrainInit(ack) => {
                        tracing::info!(
                            terrain = %ack.terrain,
                            surface_height = ack.surface_height,
                            "terrain acknowledged"
                        );
                        rig.on_terrain_init(&ack)?;
                    }
                    other => return Err(unexpected("terrain_init", &other)),
                }
            }
            Participant::Terrain(terrain) => {
                let PrepareReport {
                    settled,
                    restored_from,
                    description,
                } = terrain.prepare()?;
                tracing::info!(
                    settled,
                    restored_from = ?restored_from,
                    %description,
                    "terrain prepared"
                );
                let init = match channel.recv(STARTUP_STEP).await? {
                    Message::RigInit(init) => init,
                    other => return Err(unexpected("rig_init", &other)),
                };
                let ack = terrain.accept_rig(init)?;
                channel.send(STARTUP_STEP, &Message::TerrainInit(ack)).await?;
            }
        }
        self.progress = Progress::Initialized;
        Ok(())
    }

    /// Exchange contact state and reactions for `step`. Both directions
    /// complete before this returns.
    pub async fn synchronize<T: Transport>(
        &mut self,
        channel: &mut SyncChannel<T>,
        step: u64,
        time: f64,
    ) -> Result<(), CoordinatorError> {
        let ready = match self.progress {
            Progress::Initialized => step == 0,
            Progress::Advanced(prev) => step == prev + 1,
            _ => false,
        };
        if !ready {
            return Err(CoordinatorError::Ordering("synchronize out of order"));
        }
        match &mut self.participant {
            Participant::Rig(rig) => {
                let state = rig.contact_state(step, time)?;
                match channel.exchange(step, &Message::RigState(state)).await? {
                    Message::TerrainResponse(response) => rig.apply_response(response)?,
                    other => return Err(unexpected("terrain_response", &other)),
                }
            }
            Participant::Terrain(terrain) => {
                let state = match channel.recv(step).await? {
                    Message::RigState(state) => state,
                    other => return Err(unexpected("rig_state", &other)),
                };
                let response = terrain.respond(step, time, state)?;
                channel.send(step, &Message::TerrainResponse(response)).await?;
            }
        }
        self.progress = Progress::Synchronized(step);
        Ok(())
    }

    pub fn advance(&mut self, step: u64, dt: f64) -> Result<(), CoordinatorError> {
        if self.progress != Progress::Synchronized(step) {
            return Err(CoordinatorError::Ordering("advance before synchronize"));
        }
        with_node!(&mut self.participant, n => n.advance(dt))?;
        self.progress = Progress::Advanced(step);
        Ok(())
    }

    pub fn output(&mut self, frame: u64) -> Result<(), CoordinatorError> {
        Ok(with_node!(&mut self.participant, n => n.output_data(frame))?)
    }

    pub fn write_checkpoint(&mut self, label: &str) -> Result<(), CoordinatorError> {
        Ok(with_node!(&mut self.participant, n => n.write_checkpoint(label))?)
    }

    /// Out-of-bounds clamp events, terrain only.
    pub fn clamped_nodes(&self) -> Option<u64> {
        match &self.participant {
            Participant::Terrain(t) => Some(t.diagnostics().total()),
            Participant::Rig(_) => None,
        }
    }

    pub fn log_diagnostics(&self) {
        if let Participant::Terrain(t) = &self.participant {
            t.diagnostics().log_summary();
        }
    }
}
