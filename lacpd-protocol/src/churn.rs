//! Churn detection machines (802.1AX-2014 6.4.17)
//!
//! Two parallel copies per port, one watching the Actor Oper Sync bit and
//! one the Partner's. A side whose sync bit stays down for the whole churn
//! detection time has failed to converge; that is an operator-visible
//! condition, logged and counted, but it does not disable the port.

use crate::event::{acknowledge, MachineEvent, ACTOR_CDM_MODULE, PARTNER_CDM_MODULE};
use crate::port::PortShared;
use crate::timer::{EventTimer, CHURN_DETECTION_TIME};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which sync bit this instance watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnSide {
    Actor,
    Partner,
}

/// Churn detection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnState {
    NoChurn,
    ChurnMonitor,
    Churn,
}

/// Churn detection events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnEvent {
    Begin,
    SyncOn,
    SyncOff,
    ChurnTimerExpired,
    NotPortEnabled,
}

pub(crate) struct ChurnMachine {
    shared: Arc<PortShared>,
    side: ChurnSide,
    module: &'static str,
    state: ChurnState,
    churn_timer: EventTimer<ChurnEvent>,
    events: mpsc::Receiver<MachineEvent<ChurnEvent>>,
}

impl ChurnMachine {
    pub(crate) fn new(
        shared: Arc<PortShared>,
        side: ChurnSide,
        events: mpsc::Receiver<MachineEvent<ChurnEvent>>,
    ) -> Self {
        let (queue, module) = match side {
            ChurnSide::Actor => (shared.senders.actor_cd.clone(), ACTOR_CDM_MODULE),
            ChurnSide::Partner => (shared.senders.partner_cd.clone(), PARTNER_CDM_MODULE),
        };
        let churn_timer = EventTimer::new(
            queue,
            module,
            ChurnEvent::ChurnTimerExpired,
            CHURN_DETECTION_TIME,
        );
        Self {
            shared,
            side,
            module,
            state: ChurnState::NoChurn,
            churn_timer,
            events,
        }
    }

    pub(crate) fn spawn(
        shared: Arc<PortShared>,
        side: ChurnSide,
        events: mpsc::Receiver<MachineEvent<ChurnEvent>>,
        kill: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(shared, side, events).run(kill))
    }

    async fn run(mut self, mut kill: oneshot::Receiver<()>) {
        debug!(port = self.shared.port_number, side = ?self.side, "churn machine start");
        loop {
            tokio::select! {
                _ = &mut kill => {
                    self.churn_timer.stop();
                    debug!(port = self.shared.port_number, side = ?self.side, "churn machine end");
                    return;
                }
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: MachineEvent<ChurnEvent>) {
        self.process(event.src, event.event);
        acknowledge(self.module, event.ack).await;
    }

    fn process(&mut self, src: &'static str, event: ChurnEvent) {
        let port_enabled = self.shared.block().port_enabled;
        let next = match (self.state, event) {
            // Monitoring starts with the port; a port that never came up
            // must not raise a churn alarm.
            (_, ChurnEvent::Begin) if port_enabled => Some(ChurnState::ChurnMonitor),
            (_, ChurnEvent::Begin) => Some(ChurnState::NoChurn),
            (_, ChurnEvent::SyncOn) => Some(ChurnState::NoChurn),
            (ChurnState::NoChurn, ChurnEvent::SyncOff) => Some(ChurnState::ChurnMonitor),
            (ChurnState::ChurnMonitor, ChurnEvent::ChurnTimerExpired) => Some(ChurnState::Churn),
            // A disabled port is not a churn condition
            (_, ChurnEvent::NotPortEnabled) => Some(ChurnState::NoChurn),
            _ => None,
        };

        let Some(next) = next else {
            self.shared.counters.incr_unhandled();
            debug!(
                port = self.shared.port_number,
                side = ?self.side,
                state = ?self.state,
                event = ?event,
                src,
                "churn event ignored"
            );
            return;
        };

        debug!(
            port = self.shared.port_number,
            side = ?self.side,
            from = ?self.state,
            to = ?next,
            src,
            "churn transition"
        );
        self.state = next;

        match next {
            ChurnState::NoChurn => {
                self.churn_timer.stop();
                self.publish(false);
            }
            ChurnState::ChurnMonitor => {
                self.churn_timer.start();
                self.publish(false);
            }
            ChurnState::Churn => {
                warn!(
                    port = self.shared.port_number,
                    side = ?self.side,
                    "churn detected: sync failed to stabilize"
                );
                self.shared.counters.incr_churn(self.side);
                self.publish(true);
            }
        }
    }

    fn publish(&self, churning: bool) {
        let mut block = self.shared.block.write();
        match self.side {
            ChurnSide::Actor => {
                block.actor_churn_state = self.state;
                block.actor_churn = churning;
            }
            ChurnSide::Partner => {
                block.partner_churn_state = self.state;
                block.partner_churn = churning;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ChurnState {
        self.state
    }
}
