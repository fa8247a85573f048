//! Mux machine (802.1AX-2014 6.4.15)
//!
//! Attaches the port to its aggregator and gates collecting/distributing.
//! Two standardized rulesets: Coupled walks Detached → Waiting → Attached →
//! Collecting → Distributing; Independent folds collecting and distributing
//! into one C-CollectingDistributing state. The ruleset is fixed per system
//! at construction.
//!
//! This machine owns the Actor Oper Sync/Collecting/Distributing bits;
//! every entry that changes them posts NTT to the transmit machine.

use crate::churn::ChurnEvent;
use crate::context::MuxRuleset;
use crate::event::{acknowledge, MachineEvent, MUXM_MODULE};
use crate::port::{PortEvent, PortShared};
use crate::selection::Selection;
use crate::state::StateFlags;
use crate::timer::{EventTimer, AGGREGATE_WAIT_TIME};
use crate::tx::TxEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Mux machine states, both rulesets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Detached,
    Waiting,
    Attached,
    Collecting,
    Distributing,
    CDetached,
    CWaiting,
    CAttached,
    CCollectingDistributing,
}

impl MuxState {
    /// Initial state for a ruleset, before the BEGIN pulse
    pub fn initial(ruleset: MuxRuleset) -> Self {
        match ruleset {
            MuxRuleset::Coupled => MuxState::Detached,
            MuxRuleset::Independent => MuxState::CDetached,
        }
    }

    /// States in which the port is attached to an aggregator
    pub fn is_attached(self) -> bool {
        matches!(
            self,
            MuxState::Attached
                | MuxState::Collecting
                | MuxState::Distributing
                | MuxState::CAttached
                | MuxState::CCollectingDistributing
        )
    }
}

/// Mux machine events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    Begin,
    SelectedEqualSelected,
    SelectedEqualUnselected,
    SelectedEqualSelectedAndPartnerSync,
    SelectedEqualSelectedPartnerSyncCollecting,
    NotPartnerSync,
    NotPartnerCollecting,
    ReadyN,
}

pub(crate) struct MuxMachine {
    shared: Arc<PortShared>,
    ruleset: MuxRuleset,
    state: MuxState,
    wait_while: EventTimer<MuxEvent>,
    events: mpsc::Receiver<MachineEvent<MuxEvent>>,
}

impl MuxMachine {
    pub(crate) fn new(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<MuxEvent>>,
    ) -> Self {
        let wait_while = EventTimer::new(
            shared.senders.mux.clone(),
            MUXM_MODULE,
            MuxEvent::ReadyN,
            AGGREGATE_WAIT_TIME,
        );
        let ruleset = shared.ctx.mux_ruleset;
        Self {
            shared,
            ruleset,
            state: MuxState::initial(ruleset),
            wait_while,
            events,
        }
    }

    pub(crate) fn spawn(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<MuxEvent>>,
        kill: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(shared, events).run(kill))
    }

    async fn run(mut self, mut kill: oneshot::Receiver<()>) {
        debug!(port = self.shared.port_number, "mux machine start");
        loop {
            tokio::select! {
                _ = &mut kill => {
                    self.wait_while.stop();
                    debug!(port = self.shared.port_number, "mux machine end");
                    return;
                }
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: MachineEvent<MuxEvent>) {
        let outbox = self.process(event.src, event.event);
        for out in outbox {
            self.shared.post(MUXM_MODULE, out).await;
        }
        acknowledge(MUXM_MODULE, event.ack).await;
    }

    fn process(&mut self, src: &'static str, event: MuxEvent) -> Vec<PortEvent> {
        // Aggregate wait completed; whether the port may advance depends on
        // the selection below. A stale timer firing outside Waiting is not
        // a completed wait.
        if event == MuxEvent::ReadyN
            && matches!(self.state, MuxState::Waiting | MuxState::CWaiting)
        {
            self.shared.block.write().ready_n = true;
        }
        let selected = self.shared.block().agg_selected == Selection::Selected;

        let next = match self.ruleset {
            MuxRuleset::Coupled => match (self.state, event) {
                (_, MuxEvent::Begin) => Some(MuxState::Detached),
                (MuxState::Detached, MuxEvent::SelectedEqualSelected) => Some(MuxState::Waiting),
                (MuxState::Waiting, MuxEvent::ReadyN) if selected => Some(MuxState::Attached),
                (
                    MuxState::Waiting
                    | MuxState::Attached
                    | MuxState::Collecting
                    | MuxState::Distributing,
                    MuxEvent::SelectedEqualUnselected,
                ) => Some(MuxState::Detached),
                (MuxState::Attached, MuxEvent::SelectedEqualSelectedAndPartnerSync) => {
                    Some(MuxState::Collecting)
                }
                (MuxState::Collecting, MuxEvent::SelectedEqualSelectedPartnerSyncCollecting) => {
                    Some(MuxState::Distributing)
                }
                (MuxState::Collecting, MuxEvent::NotPartnerSync) => Some(MuxState::Attached),
                (MuxState::Distributing, MuxEvent::NotPartnerSync) => Some(MuxState::Collecting),
                (MuxState::Distributing, MuxEvent::NotPartnerCollecting) => {
                    Some(MuxState::Collecting)
                }
                _ => None,
            },
            MuxRuleset::Independent => match (self.state, event) {
                (_, MuxEvent::Begin) => Some(MuxState::CDetached),
                (MuxState::CDetached, MuxEvent::SelectedEqualSelected) => Some(MuxState::CWaiting),
                (MuxState::CWaiting, MuxEvent::ReadyN) if selected => Some(MuxState::CAttached),
                (
                    MuxState::CWaiting
                    | MuxState::CAttached
                    | MuxState::CCollectingDistributing,
                    MuxEvent::SelectedEqualUnselected,
                ) => Some(MuxState::CDetached),
                (MuxState::CAttached, MuxEvent::SelectedEqualSelectedAndPartnerSync) => {
                    Some(MuxState::CCollectingDistributing)
                }
                (MuxState::CCollectingDistributing, MuxEvent::NotPartnerSync) => {
                    Some(MuxState::CAttached)
                }
                _ => None,
            },
        };

        let Some(next) = next else {
            self.shared.counters.incr_unhandled();
            debug!(
                port = self.shared.port_number,
                state = ?self.state,
                event = ?event,
                src,
                "mux event ignored"
            );
            return Vec::new();
        };

        debug!(
            port = self.shared.port_number,
            from = ?self.state,
            to = ?next,
            src,
            "mux transition"
        );
        self.state = next;

        let mut outbox = Vec::new();
        match next {
            MuxState::Detached | MuxState::CDetached => self.enter_detached(next, &mut outbox),
            MuxState::Waiting | MuxState::CWaiting => self.enter_waiting(next),
            MuxState::Attached | MuxState::CAttached => self.enter_attached(next, &mut outbox),
            MuxState::Collecting => self.enter_collecting(&mut outbox),
            MuxState::Distributing | MuxState::CCollectingDistributing => {
                self.enter_distributing(next, &mut outbox)
            }
        }
        outbox
    }

    fn enter_detached(&mut self, state: MuxState, outbox: &mut Vec<PortEvent>) {
        self.wait_while.stop();

        let had_attachment = {
            let mut block = self.shared.block.write();
            block.mux_state = state;
            block.ready_n = false;

            let old = block.actor_oper.state;
            block
                .actor_oper
                .state
                .clear(StateFlags::SYNC | StateFlags::COLLECTING | StateFlags::DISTRIBUTING);
            Self::ntt_on_change(old, block.actor_oper.state, outbox);
            if old.is_set(StateFlags::SYNC) {
                outbox.push(PortEvent::ActorChurn(ChurnEvent::SyncOff));
            }

            block.agg_attached.take().is_some()
        };

        if had_attachment {
            self.shared.ctx.selector.detach(self.shared.port_number);
        }
    }

    fn enter_waiting(&mut self, state: MuxState) {
        self.shared.block.write().mux_state = state;
        self.wait_while.start();
    }

    fn enter_attached(&mut self, state: MuxState, outbox: &mut Vec<PortEvent>) {
        let agg = self.shared.ctx.selector.attach(self.shared.port_number);

        let mut block = self.shared.block.write();
        block.mux_state = state;
        block.agg_attached = agg.as_ref().map(Arc::downgrade);

        let old = block.actor_oper.state;
        block.actor_oper.state.set(StateFlags::SYNC);
        block
            .actor_oper
            .state
            .clear(StateFlags::COLLECTING | StateFlags::DISTRIBUTING);
        Self::ntt_on_change(old, block.actor_oper.state, outbox);
        if !old.is_set(StateFlags::SYNC) {
            outbox.push(PortEvent::ActorChurn(ChurnEvent::SyncOn));
        }
    }

    fn enter_collecting(&mut self, outbox: &mut Vec<PortEvent>) {
        let mut block = self.shared.block.write();
        block.mux_state = MuxState::Collecting;

        let old = block.actor_oper.state;
        block.actor_oper.state.set(StateFlags::COLLECTING);
        block.actor_oper.state.clear(StateFlags::DISTRIBUTING);
        Self::ntt_on_change(old, block.actor_oper.state, outbox);
    }

    fn enter_distributing(&mut self, state: MuxState, outbox: &mut Vec<PortEvent>) {
        // CCollectingDistributing also (re)establishes the attachment
        let agg = if state == MuxState::CCollectingDistributing {
            self.shared.ctx.selector.attach(self.shared.port_number)
        } else {
            None
        };

        let mut block = self.shared.block.write();
        block.mux_state = state;
        if let Some(agg) = agg.as_ref() {
            block.agg_attached = Some(Arc::downgrade(agg));
        }

        let old = block.actor_oper.state;
        block
            .actor_oper
            .state
            .set(StateFlags::SYNC | StateFlags::COLLECTING | StateFlags::DISTRIBUTING);
        Self::ntt_on_change(old, block.actor_oper.state, outbox);
        if !old.is_set(StateFlags::SYNC) {
            outbox.push(PortEvent::ActorChurn(ChurnEvent::SyncOn));
        }
    }

    fn ntt_on_change(old: StateFlags, new: StateFlags, outbox: &mut Vec<PortEvent>) {
        if old != new {
            outbox.push(PortEvent::Tx(TxEvent::Ntt));
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> MuxState {
        self.state
    }
}
