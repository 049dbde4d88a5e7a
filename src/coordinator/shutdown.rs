//! Controlled fleet shutdown
//!
//! The fleet shuts down through an ordered sequence of stages driven by
//! messages from the persistence service (or whichever upstream component
//! initiated it). INFORM fans out to every host at once behind a reply
//! barrier; PERFORM walks the hosts one at a time because each host's
//! disconnect-then-stop step depends on coordinator state that must not
//! change mid-flight.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;

use super::rpc::GameTime;

/// Stages of the controlled shutdown protocol, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    None,
    /// Elect an upstream component to start the REQUEST stage.
    Trigger,
    Request,
    Inform,
    Perform,
    /// Per-host sub-stage of PERFORM.
    DisconnectProxies,
}

impl Default for ShutdownStage {
    fn default() -> Self {
        ShutdownStage::None
    }
}

impl std::fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutdownStage::None => "none",
            ShutdownStage::Trigger => "trigger",
            ShutdownStage::Request => "request",
            ShutdownStage::Inform => "inform",
            ShutdownStage::Perform => "perform",
            ShutdownStage::DisconnectProxies => "disconnect_proxies",
        };
        write!(f, "{}", s)
    }
}

/// What the coordinator should do in response to a shutdown message or a
/// stage completion.
#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Forward the REQUEST stage to the peer coordinator.
    ForwardRequestToPeer,
    /// Broadcast INFORM to these hosts and wait on the reply barrier.
    /// An empty list means the barrier is already complete.
    Inform { targets: Vec<SocketAddr> },
    /// Begin the sequential PERFORM walk with this host.
    PerformNext { target: SocketAddr },
    /// Every host has completed PERFORM; the fleet is down.
    FleetDone,
    /// Ask an upstream component to initiate the shutdown.
    TriggerUpstream,
    /// Nothing to do for this stage.
    Ignore,
}

/// Tracks the shutdown stage, the INFORM barrier and the PERFORM queue.
#[derive(Debug, Default)]
pub struct ShutdownOrchestrator {
    stage: ShutdownStage,
    shutdown_time: GameTime,
    informs_outstanding: usize,
    perform_queue: VecDeque<SocketAddr>,
}

impl ShutdownOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ShutdownStage {
        self.stage
    }

    pub fn shutdown_time(&self) -> GameTime {
        self.shutdown_time
    }

    /// Whether a fleet shutdown is underway. New hosts are refused while
    /// this holds.
    pub fn in_progress(&self) -> bool {
        self.stage != ShutdownStage::None
    }

    /// Handle an incoming `controlled_shutdown` message.
    ///
    /// `hosts` must be the registry's current addresses in registration
    /// order; INFORM and PERFORM both snapshot it here.
    pub fn handle_stage(
        &mut self,
        stage: ShutdownStage,
        time: GameTime,
        hosts: Vec<SocketAddr>,
    ) -> StageOutcome {
        tracing::info!("Controlled shutdown: stage = {}", stage);

        match stage {
            ShutdownStage::Request => StageOutcome::ForwardRequestToPeer,

            ShutdownStage::Inform => {
                self.stage = stage;
                self.shutdown_time = time;
                self.informs_outstanding = hosts.len();
                StageOutcome::Inform { targets: hosts }
            }

            ShutdownStage::Perform => {
                self.stage = stage;
                self.perform_queue = hosts.into();
                self.advance_perform()
            }

            ShutdownStage::Trigger => StageOutcome::TriggerUpstream,

            ShutdownStage::None | ShutdownStage::DisconnectProxies => StageOutcome::Ignore,
        }
    }

    /// Note one INFORM reply (or transport error). Returns true when the
    /// barrier is complete and the upstream requester can be acknowledged.
    pub fn note_inform_reply(&mut self) -> bool {
        if self.informs_outstanding > 0 {
            self.informs_outstanding -= 1;
        }
        self.informs_outstanding == 0
    }

    pub fn informs_outstanding(&self) -> usize {
        self.informs_outstanding
    }

    /// Pop the next host for the PERFORM walk.
    pub fn advance_perform(&mut self) -> StageOutcome {
        match self.perform_queue.pop_front() {
            Some(target) => StageOutcome::PerformNext { target },
            None => StageOutcome::FleetDone,
        }
    }
}
