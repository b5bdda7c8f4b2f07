//! Step loop of one rank.
//!
//! UNINITIALIZED → READY (role and variant selected) → RUNNING (handshake
//! done) → DONE (end checkpoint written). Each step is barrier,
//! synchronize, advance, then an output frame every `output_every` steps.
//! After the last step the end checkpoint is written unconditionally. Any
//! error on the way sends an abort frame to the peer before it is returned.

use cosim_core::checkpoint::END_LABEL;
use cosim_core::config::RunConfig;
use cosim_core::Role;
use cosim_services::CosimError;

use crate::channel::{ChannelError, SyncChannel, Transport};
use crate::participant::{Guarded, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No node built yet; a `Coordinator` always starts past this.
    Uninitialized,
    Ready,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunPlan {
    pub steps: u64,
    pub step_size: f64,
    /// Steps between output frames; `None` disables output.
    pub output_every: Option<u64>,
    pub verbose: bool,
}

impl RunPlan {
    pub fn from_config(run: &RunConfig) -> Self {
        Self {
            steps: run.sim_steps(),
            step_size: run.step_size,
            output_every: run.output.then(|| run.output_steps()),
            verbose: run.verbose,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub role: Role,
    pub steps: u64,
    pub frames: u64,
    /// Wall-clock seconds spent in `advance`.
    pub cumulative_sim_time: f64,
    /// Terrain only.
    pub clamped_nodes: Option<u64>,
}

pub struct Coordinator<T: Transport> {
    state: CoordinatorState,
    node: Guarded,
    channel: SyncChannel<T>,
    plan: RunPlan,
    frames: u64,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(participant: Participant, channel: SyncChannel<T>, plan: RunPlan) -> Self {
        Self {
            state: CoordinatorState::Ready,
            node: participant.guarded(),
            channel,
            plan,
            frames: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Initialize and run to completion, aborting the peer on failure.
    pub async fn execute(mut self) -> Result<RunSummary, CoordinatorError> {
        let result = match self.initialize().await {
            Ok(()) => self.run().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::error!(error = %e, "co-simulation failed");
            if !matches!(e, CoordinatorError::Channel(ChannelError::PeerAborted { .. })) {
                self.channel.abort(&e.to_string()).await;
            }
        }
        result
    }

    pub async fn initialize(&mut self) -> Result<(), CoordinatorError> {
        self.expect(CoordinatorState::Ready)?;
        self.node.initialize(&mut self.channel).await?;
        self.state = CoordinatorState::Running;
        tracing::info!(
            steps = self.plan.steps,
            step_size = self.plan.step_size,
            "initialized"
        );
        Ok(())
    }

    pub async fn run(&mut self) -> Result<RunSummary, CoordinatorError> {
        self.expect(CoordinatorState::Running)?;

        for step in 0..self.plan.steps {
            let time = step as f64 * self.plan.step_size;
            self.channel.barrier(step).await?;
            self.node.synchronize(&mut self.channel, step, time).await?;
            self.node.advance(step, self.plan.step_size)?;

            if self.plan.verbose {
                let timer = self.node.timer();
                tracing::info!(
                    step,
                    time,
                    step_sim_time = timer.last_step_sim_time(),
                    cumulative_sim_time = timer.cumulative_sim_time(),
                    "step complete"
                );
            }
            if let Some(every) = self.plan.output_every {
                if step % every == 0 {
                    self.node.output(self.frames)?;
                    tracing::debug!(step, frame = self.frames, "frame written");
                    self.frames += 1;
                }
            }
        }

        self.node.write_checkpoint(END_LABEL)?;
        self.state = CoordinatorState::Done;

        let summary = RunSummary {
            role: self.node.role(),
            steps: self.plan.steps,
            frames: self.frames,
            cumulative_sim_time: self.node.timer().cumulative_sim_time(),
            clamped_nodes: self.node.clamped_nodes(),
        };
        self.node.log_diagnostics();
        tracing::info!(
            steps = summary.steps,
            frames = summary.frames,
            cumulative_sim_time = summary.cumulative_sim_time,
            clamped_nodes = summary.clamped_nodes,
            "run complete"
        );
        Ok(summary)
    }

    fn expect(&self, state: CoordinatorState) -> Result<(), CoordinatorError> {
        if self.state != state {
            return Err(CoordinatorError::State {
                expected: state,
                found: self.state,
            });
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Node(#[from] CosimError),

    #[error("coordinator is {found:?}, expected {expected:?}")]
    State {
        expected: CoordinatorState,
        found: CoordinatorState,
    },

    #[error("protocol ordering violated: {0}")]
    Ordering(&'static str),
}

impl From<cosim_core::config::ConfigError> for CoordinatorError {
    fn from(e: cosim_core::config::ConfigError) -> Self {
        CoordinatorError::Node(CosimError::Config(e))
    }
}
