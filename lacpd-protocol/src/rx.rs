//! Receive machine (802.1AX-2014 6.4.12, Table 6-18)
//!
//! Parses inbound LACPDUs, maintains Partner Oper (and the Actor Oper
//! Defaulted/Expired bits), decides selection eligibility and fans the
//! resulting state changes out to the Mux, Periodic Tx, Tx and Churn
//! machines. The current-while timer polices partner liveness: Current →
//! Expired → Defaulted as PDUs stop arriving.

use crate::churn::ChurnEvent;
use crate::event::{acknowledge, AckSender, MachineEvent, RXM_MODULE};
use crate::mux::{MuxEvent, MuxState};
use crate::port::{PortEvent, PortShared, PortStateBlock};
use crate::ptx::PtxEvent;
use crate::selection::Selection;
use crate::state::{PortInfo, StateFlags};
use crate::timer::{
    EventTimer, FAST_PERIODIC_TIME, LONG_TIMEOUT_TIME, SHORT_TIMEOUT_TIME, SLOW_PERIODIC_TIME,
};
use crate::tx::TxEvent;
use lacpd_packet::Lacpdu;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Receive machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Pseudo state before the BEGIN pulse
    None,
    Initialize,
    PortDisabled,
    Expired,
    LacpDisabled,
    Defaulted,
    Current,
}

/// Receive machine events
#[derive(Debug, Clone, PartialEq)]
pub enum RxEvent {
    Begin,
    UnconditionalFallthrough,
    NotPortEnabledAndNotPortMoved,
    PortMoved,
    PortEnabledAndLacpEnabled,
    PortEnabledAndLacpDisabled,
    CurrentWhileTimerExpired,
    LacpEnabled,
    LacpPktRx(Lacpdu),
}

/// An inbound LACPDU payload queued for the receive machine
#[derive(Debug)]
pub struct PduRx {
    pub payload: Vec<u8>,
    pub ack: Option<AckSender>,
}

/// State bits compared by updateNTT besides the timeout bit
const NTT_STATE_MASK: u8 = StateFlags::ACTIVITY | StateFlags::AGGREGATION | StateFlags::SYNC;

pub(crate) struct RxMachine {
    shared: Arc<PortShared>,
    state: RxState,
    current_while: EventTimer<RxEvent>,
    events: mpsc::Receiver<MachineEvent<RxEvent>>,
    pdus: mpsc::Receiver<PduRx>,
}

impl RxMachine {
    pub(crate) fn new(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<RxEvent>>,
        pdus: mpsc::Receiver<PduRx>,
    ) -> Self {
        let current_while = EventTimer::new(
            shared.senders.rx.clone(),
            RXM_MODULE,
            RxEvent::CurrentWhileTimerExpired,
            SHORT_TIMEOUT_TIME,
        );
        Self {
            shared,
            state: RxState::None,
            current_while,
            events,
            pdus,
        }
    }

    pub(crate) fn spawn(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<RxEvent>>,
        pdus: mpsc::Receiver<PduRx>,
        kill: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(shared, events, pdus).run(kill))
    }

    async fn run(mut self, mut kill: oneshot::Receiver<()>) {
        debug!(port = self.shared.port_number, "rx machine start");
        loop {
            tokio::select! {
                _ = &mut kill => {
                    self.current_while.stop();
                    debug!(port = self.shared.port_number, "rx machine end");
                    return;
                }
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
                maybe = self.pdus.recv() => match maybe {
                    Some(pdu) => self.handle_frame(pdu).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: MachineEvent<RxEvent>) {
        let ack = event.ack;
        let outbox = self.process(event.src, event.event);
        self.flush(outbox).await;

        // The standard falls straight through Initialize, and a port whose
        // enable flags are already up continues past PortDisabled.
        if self.state == RxState::Initialize {
            let outbox = self.process(RXM_MODULE, RxEvent::UnconditionalFallthrough);
            self.flush(outbox).await;
        }
        if self.state == RxState::PortDisabled {
            let (port_enabled, lacp_enabled) = {
                let block = self.shared.block();
                (block.port_enabled, block.lacp_enabled)
            };
            if port_enabled {
                let follow_up = if lacp_enabled {
                    RxEvent::PortEnabledAndLacpEnabled
                } else {
                    RxEvent::PortEnabledAndLacpDisabled
                };
                let outbox = self.process(RXM_MODULE, follow_up);
                self.flush(outbox).await;
            }
        }

        acknowledge(RXM_MODULE, ack).await;
    }

    async fn handle_frame(&mut self, pdu: PduRx) {
        self.shared.counters.incr_in_pkts();

        let parsed = match Lacpdu::parse(&pdu.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.shared.counters.incr_parse_errors();
                debug!(port = self.shared.port_number, %err, "malformed LACPDU dropped");
                acknowledge(RXM_MODULE, pdu.ack).await;
                return;
            }
        };

        if self.check_port_moved(&parsed) {
            info!(port = self.shared.port_number, "port moved");
            self.shared.block.write().port_moved = true;
            let outbox = self.process(RXM_MODULE, RxEvent::PortMoved);
            self.flush(outbox).await;
        } else {
            // A PDU only matters in Expired/Defaulted/Current; anywhere
            // else the transition table ignores it.
            let outbox = self.process(RXM_MODULE, RxEvent::LacpPktRx(parsed));
            self.flush(outbox).await;
        }

        acknowledge(RXM_MODULE, pdu.ack).await;
    }

    /// The partner identity recorded on this (disabled) port showed up in a
    /// PDU again: the link was re-cabled to another port.
    fn check_port_moved(&self, pdu: &Lacpdu) -> bool {
        if self.state != RxState::PortDisabled {
            return false;
        }
        let block = self.shared.block();
        block.partner_oper.port_number == pdu.actor.port_number
            && block.partner_oper.system.id == pdu.actor.system_id
            && block.partner_oper.system.priority == pdu.actor.system_priority
    }

    /// Total transition function. Returns the events to post once the lock
    /// is released; a (state, event) pair with no rule is a logged no-op.
    fn process(&mut self, src: &'static str, event: RxEvent) -> Vec<PortEvent> {
        let next = match (self.state, &event) {
            (_, RxEvent::Begin) => Some(RxState::Initialize),
            (RxState::Initialize, RxEvent::UnconditionalFallthrough) => Some(RxState::PortDisabled),
            (state, RxEvent::NotPortEnabledAndNotPortMoved) if state != RxState::PortDisabled => {
                Some(RxState::PortDisabled)
            }
            (RxState::PortDisabled, RxEvent::PortMoved) => Some(RxState::Initialize),
            (RxState::PortDisabled, RxEvent::PortEnabledAndLacpEnabled) => Some(RxState::Expired),
            (RxState::PortDisabled, RxEvent::PortEnabledAndLacpDisabled) => {
                Some(RxState::LacpDisabled)
            }
            (RxState::Expired, RxEvent::CurrentWhileTimerExpired) => Some(RxState::Defaulted),
            (RxState::Current, RxEvent::CurrentWhileTimerExpired) => Some(RxState::Expired),
            (RxState::LacpDisabled, RxEvent::LacpEnabled) => Some(RxState::PortDisabled),
            (
                RxState::Expired | RxState::Defaulted | RxState::Current,
                RxEvent::LacpPktRx(_),
            ) => Some(RxState::Current),
            _ => None,
        };

        let Some(next) = next else {
            self.shared.counters.incr_unhandled();
            debug!(
                port = self.shared.port_number,
                state = ?self.state,
                event = ?event,
                src,
                "rx event ignored"
            );
            return Vec::new();
        };

        debug!(
            port = self.shared.port_number,
            from = ?self.state,
            to = ?next,
            src,
            "rx transition"
        );
        self.state = next;

        let mut outbox = Vec::new();
        match next {
            RxState::Initialize => self.enter_initialize(&mut outbox),
            RxState::PortDisabled => self.enter_port_disabled(&mut outbox),
            RxState::Expired => self.enter_expired(&mut outbox),
            RxState::LacpDisabled => self.enter_lacp_disabled(&mut outbox),
            RxState::Defaulted => self.enter_defaulted(&mut outbox),
            RxState::Current => {
                if let RxEvent::LacpPktRx(pdu) = event {
                    self.enter_current(pdu, &mut outbox);
                }
            }
            RxState::None => {}
        }
        outbox
    }

    fn enter_initialize(&mut self, outbox: &mut Vec<PortEvent>) {
        let mut block = self.shared.block.write();
        block.rx_state = RxState::Initialize;

        let prev_sync = block.partner_oper.state.is_set(StateFlags::SYNC);
        let admin_state = block.partner_admin.state;
        block.partner_oper.state = admin_state;
        Self::notify_partner_sync(&block, prev_sync, outbox);

        block.agg_selected = Selection::Unselected;
        outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualUnselected));

        block.actor_oper.state.clear(StateFlags::EXPIRED);
        block.port_moved = false;
    }

    fn enter_port_disabled(&mut self, outbox: &mut Vec<PortEvent>) {
        let mut block = self.shared.block.write();
        block.rx_state = RxState::PortDisabled;

        let prev_sync = block.partner_oper.state.is_set(StateFlags::SYNC);
        block.partner_oper.state.clear(StateFlags::SYNC);
        Self::notify_partner_sync(&block, prev_sync, outbox);
    }

    fn enter_expired(&mut self, outbox: &mut Vec<PortEvent>) {
        let mut block = self.shared.block.write();
        block.rx_state = RxState::Expired;

        let prev_sync = block.partner_oper.state.is_set(StateFlags::SYNC);
        block.partner_oper.state.clear(StateFlags::SYNC);
        Self::notify_partner_sync(&block, prev_sync, outbox);

        // Ask the partner for fast cadence and give it one short timeout to
        // show up.
        block.partner_oper.state.set(StateFlags::TIMEOUT);
        block.actor_oper.state.set(StateFlags::EXPIRED);
        drop(block);

        self.current_while.set_timeout(SHORT_TIMEOUT_TIME);
        self.current_while.start();
    }

    fn enter_lacp_disabled(&mut self, outbox: &mut Vec<PortEvent>) {
        self.current_while.stop();

        let mut block = self.shared.block.write();
        block.rx_state = RxState::LacpDisabled;

        block.agg_selected = Selection::Unselected;
        outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualUnselected));

        Self::record_default(&mut block, outbox);

        block.partner_oper.state.clear(StateFlags::AGGREGATION);
        block.actor_oper.state.clear(StateFlags::EXPIRED);
    }

    fn enter_defaulted(&mut self, outbox: &mut Vec<PortEvent>) {
        let mut block = self.shared.block.write();
        block.rx_state = RxState::Defaulted;

        Self::update_default_selected(&mut block, outbox);
        Self::record_default(&mut block, outbox);
        block.actor_oper.state.clear(StateFlags::EXPIRED);

        // Should the partner stay silent, these defaults keep the port out
        // of the aggregate.
        block.partner_admin.state = StateFlags(StateFlags::AGGREGATABLE_DOWN);
    }

    fn enter_current(&mut self, pdu: Lacpdu, outbox: &mut Vec<PortEvent>) {
        {
            let mut block = self.shared.block.write();
            block.rx_state = RxState::Current;

            Self::update_selected(&pdu, &mut block, outbox);
            let ntt = Self::update_ntt(&pdu, &block);

            if self.shared.ctx.lacp_version >= 2 {
                block.partner_version = pdu.version;
            }

            Self::record_pdu(&pdu, &mut block, outbox);

            // The current-while timeout tracks the Actor Oper timeout bit;
            // re-arm to the right value if they drifted apart.
            let wanted = if block.actor_oper.state.is_set(StateFlags::TIMEOUT) {
                SHORT_TIMEOUT_TIME
            } else {
                LONG_TIMEOUT_TIME
            };
            if self.current_while.timeout() != wanted {
                debug!(
                    port = self.shared.port_number,
                    ?wanted,
                    "current while timer invalid, adjusting"
                );
                self.current_while.set_timeout(wanted);
            }

            block.actor_oper.state.clear(StateFlags::EXPIRED);

            if ntt {
                outbox.push(PortEvent::Tx(TxEvent::Ntt));
            }
        }
        self.current_while.start();

        self.inform_machines_of_state_changes(outbox);

        self.shared.block.write().partner_admin.state = StateFlags(StateFlags::AGGREGATABLE_DOWN);
    }

    /// recordPDU (802.1AX 6.4.9): copy the PDU's Actor info into Partner
    /// Oper and derive the partner Sync bit.
    fn record_pdu(pdu: &Lacpdu, block: &mut PortStateBlock, outbox: &mut Vec<PortEvent>) {
        let prev_sync = block.partner_oper.state.is_set(StateFlags::SYNC);

        block.partner_oper = PortInfo::from(&pdu.actor);
        block.actor_oper.state.clear(StateFlags::DEFAULTED);

        let pdu_actor_state = StateFlags(pdu.actor.state);
        let pdu_partner = PortInfo::from(&pdu.partner);

        // Partner is in sync when it is talking about this very port (or is
        // an individual link) and its view says so, and at least one side
        // participates actively.
        let agrees = pdu_partner.matches(&block.actor_oper, StateFlags::AGGREGATION);
        let sync = ((agrees && pdu_actor_state.is_set(StateFlags::SYNC))
            || (!pdu_actor_state.is_set(StateFlags::AGGREGATION)
                && pdu_actor_state.is_set(StateFlags::SYNC)))
            && (pdu_actor_state.is_set(StateFlags::ACTIVITY)
                || (block.actor_oper.state.is_set(StateFlags::ACTIVITY)
                    && pdu_partner.state.is_set(StateFlags::ACTIVITY)));

        if sync {
            block.partner_oper.state.set(StateFlags::SYNC);
        } else {
            block.partner_oper.state.clear(StateFlags::SYNC);
            if matches!(
                block.mux_state,
                MuxState::Collecting | MuxState::Distributing | MuxState::CCollectingDistributing
            ) {
                outbox.push(PortEvent::Mux(MuxEvent::NotPartnerSync));
            }
        }
        Self::notify_partner_sync(block, prev_sync, outbox);
    }

    /// recordDefault (802.1AX 6.4.9): fall back to the admin-configured
    /// partner and declare it in sync.
    fn record_default(block: &mut PortStateBlock, outbox: &mut Vec<PortEvent>) {
        let prev_sync = block.partner_oper.state.is_set(StateFlags::SYNC);

        block.partner_oper = block.partner_admin;
        block.actor_oper.state.set(StateFlags::DEFAULTED);
        block.partner_oper.state.set(StateFlags::SYNC);
        Self::notify_partner_sync(block, prev_sync, outbox);

        if matches!(block.mux_state, MuxState::Attached | MuxState::CAttached)
            && block.agg_selected == Selection::Selected
        {
            outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualSelectedAndPartnerSync));
        }
    }

    /// updateNTT (802.1AX 6.4.9): does the partner's view of us disagree
    /// with what we are?
    fn update_ntt(pdu: &Lacpdu, block: &PortStateBlock) -> bool {
        let pdu_partner = PortInfo::from(&pdu.partner);
        if !pdu_partner.matches(&block.actor_oper, NTT_STATE_MASK) {
            return true;
        }
        pdu_partner.state.is_set(StateFlags::TIMEOUT)
            != block.actor_oper.state.is_set(StateFlags::TIMEOUT)
    }

    /// updateSelected (802.1AX 6.4.9): a changed partner identity voids the
    /// current selection.
    fn update_selected(pdu: &Lacpdu, block: &mut PortStateBlock, outbox: &mut Vec<PortEvent>) {
        let pdu_actor = PortInfo::from(&pdu.actor);
        if !pdu_actor.matches(&block.partner_oper, StateFlags::AGGREGATION) {
            block.agg_selected = Selection::Unselected;
            outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualUnselected));
        }
    }

    /// updateDefaultSelected: same comparison, against the admin defaults
    fn update_default_selected(block: &mut PortStateBlock, outbox: &mut Vec<PortEvent>) {
        if !block
            .partner_admin
            .matches(&block.partner_oper, StateFlags::AGGREGATION)
        {
            block.agg_selected = Selection::Unselected;
            outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualUnselected));
        }
    }

    /// Fan the effects of a freshly recorded PDU out to the Mux and
    /// Periodic Tx machines.
    fn inform_machines_of_state_changes(&self, outbox: &mut Vec<PortEvent>) {
        // A detached port is a candidate again: let the selection
        // collaborator take a fresh look. Called without the lock held.
        let mux_state = self.shared.block().mux_state;
        if matches!(mux_state, MuxState::Detached | MuxState::CDetached) {
            let selection = self
                .shared
                .ctx
                .selector
                .reevaluate(self.shared.port_number);
            let mut block = self.shared.block.write();
            block.agg_selected = selection;
            match selection {
                Selection::Selected => outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualSelected)),
                Selection::Unselected => {
                    outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualUnselected))
                }
                Selection::Standby => {}
            }
        }

        let block = self.shared.block();
        let partner_sync = block.partner_oper.state.is_set(StateFlags::SYNC);

        if partner_sync && block.agg_selected == Selection::Selected {
            match block.mux_state {
                MuxState::Attached | MuxState::CAttached => {
                    outbox.push(PortEvent::Mux(MuxEvent::SelectedEqualSelectedAndPartnerSync))
                }
                MuxState::Collecting => outbox.push(PortEvent::Mux(
                    MuxEvent::SelectedEqualSelectedPartnerSyncCollecting,
                )),
                _ => {}
            }
        } else if !partner_sync
            && matches!(
                block.mux_state,
                MuxState::Collecting | MuxState::Distributing
            )
        {
            outbox.push(PortEvent::Mux(MuxEvent::NotPartnerSync));
        } else if !block.partner_oper.state.is_set(StateFlags::COLLECTING)
            && block.mux_state == MuxState::Distributing
        {
            outbox.push(PortEvent::Mux(MuxEvent::NotPartnerCollecting));
        }

        if block.partner_oper.state.is_set(StateFlags::TIMEOUT)
            && block.ptx_interval == Some(SLOW_PERIODIC_TIME)
        {
            outbox.push(PortEvent::Ptx(PtxEvent::PartnerOperStateTimeoutShort));
        } else if !block.partner_oper.state.is_set(StateFlags::TIMEOUT)
            && block.ptx_interval == Some(FAST_PERIODIC_TIME)
        {
            outbox.push(PortEvent::Ptx(PtxEvent::PartnerOperStateTimeoutLong));
        }

        // Both ends passive: no PDU will ever arrive, stop expecting them.
        if !block.actor_oper.state.is_set(StateFlags::ACTIVITY)
            && !block.partner_oper.state.is_set(StateFlags::ACTIVITY)
        {
            outbox.push(PortEvent::Ptx(PtxEvent::ActorPartnerOperActivityPassiveMode));
        }
    }

    fn notify_partner_sync(block: &PortStateBlock, prev_sync: bool, outbox: &mut Vec<PortEvent>) {
        let now_sync = block.partner_oper.state.is_set(StateFlags::SYNC);
        if now_sync != prev_sync {
            outbox.push(PortEvent::PartnerChurn(if now_sync {
                ChurnEvent::SyncOn
            } else {
                ChurnEvent::SyncOff
            }));
        }
    }

    async fn flush(&self, outbox: Vec<PortEvent>) {
        for event in outbox {
            self.shared.post(RXM_MODULE, event).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RxState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn current_while_timeout(&self) -> std::time::Duration {
        self.current_while.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PortConfig, SystemContext};
    use crate::port::PortEngine;
    use crate::selection::StaticSelector;
    use crate::state::SystemInfo;
    use lacpd_core::{MacAddr, NullTransmitter};
    use lacpd_packet::ParticipantInfo;

    fn test_ctx() -> SystemContext {
        SystemContext::new(
            SystemInfo::new(0x8000, MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])),
            Arc::new(NullTransmitter),
            Arc::new(StaticSelector::new(1, 1)),
        )
    }

    fn machine() -> (RxMachine, crate::port::MachineReceivers) {
        let engine = PortEngine::new(
            test_ctx(),
            PortConfig::new(1, "eth0", MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]), 1),
        );
        let mut receivers = engine.take_receivers();
        let events = std::mem::replace(&mut receivers.rx, mpsc::channel(1).1);
        let pdus = std::mem::replace(&mut receivers.rx_pdu, mpsc::channel(1).1);
        (RxMachine::new(engine.shared().clone(), events, pdus), receivers)
    }

    fn partner_pdu(shared: &PortShared) -> Lacpdu {
        // A partner that mirrors our identity back at us, in sync, active.
        let block = shared.block();
        let actor = ParticipantInfo {
            system_priority: 0x8000,
            system_id: MacAddr([0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]),
            key: 1,
            port_priority: 0x80,
            port_number: 2,
            state: StateFlags::ACTIVITY
                | StateFlags::TIMEOUT
                | StateFlags::AGGREGATION
                | StateFlags::SYNC,
        };
        let partner = ParticipantInfo {
            state: block.actor_oper.state.bits(),
            ..ParticipantInfo::from(&block.actor_oper)
        };
        Lacpdu::new(actor, partner)
    }

    async fn begin(m: &mut RxMachine) {
        m.handle_event(MachineEvent::new("test", RxEvent::Begin)).await;
    }

    async fn enable(m: &mut RxMachine) {
        {
            let mut block = m.shared.block.write();
            block.port_enabled = true;
            block.lacp_enabled = true;
        }
        m.handle_event(MachineEvent::new("test", RxEvent::PortEnabledAndLacpEnabled))
            .await;
    }

    #[tokio::test]
    async fn test_begin_falls_through_to_port_disabled() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        assert_eq!(m.state(), RxState::PortDisabled);
        let block = m.shared.block();
        assert!(!block.partner_oper.state.is_set(StateFlags::SYNC));
        assert!(!block.actor_oper.state.is_set(StateFlags::EXPIRED));
    }

    #[tokio::test]
    async fn test_enable_moves_to_expired_with_short_timeout() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        assert_eq!(m.state(), RxState::Expired);
        assert_eq!(m.current_while_timeout(), SHORT_TIMEOUT_TIME);
        let block = m.shared.block();
        assert!(block.actor_oper.state.is_set(StateFlags::EXPIRED));
        assert!(block.partner_oper.state.is_set(StateFlags::TIMEOUT));
        assert!(!block.partner_oper.state.is_set(StateFlags::SYNC));
    }

    #[tokio::test]
    async fn test_pdu_moves_to_current_and_records_partner() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        let pdu = partner_pdu(&m.shared);
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu.clone())))
            .await;

        assert_eq!(m.state(), RxState::Current);
        let block = m.shared.block();
        assert_eq!(block.partner_oper.port_number, 2);
        assert_eq!(
            block.partner_oper.system.id,
            MacAddr([0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE])
        );
        assert!(!block.actor_oper.state.is_set(StateFlags::EXPIRED));
        assert!(!block.actor_oper.state.is_set(StateFlags::DEFAULTED));
        // Partner echoed our info and claims sync while active
        assert!(block.partner_oper.state.is_set(StateFlags::SYNC));
        // Having seen a live partner, its silence must keep the port down
        assert_eq!(
            block.partner_admin.state.bits(),
            StateFlags::AGGREGATABLE_DOWN
        );
    }

    #[tokio::test]
    async fn test_record_pdu_is_idempotent() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        let pdu = partner_pdu(&m.shared);
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu.clone())))
            .await;
        let first_partner = m.shared.block().partner_oper;

        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu)))
            .await;
        assert_eq!(m.shared.block().partner_oper, first_partner);
    }

    #[tokio::test]
    async fn test_sync_requires_activity() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        // Passive partner, and it does not see us as active either: the
        // partner echoes us correctly and claims sync, yet no side is
        // active, so sync must not be granted.
        {
            let mut block = m.shared.block.write();
            block.actor_oper.state.clear(StateFlags::ACTIVITY);
        }
        let mut pdu = partner_pdu(&m.shared);
        pdu.actor.state = StateFlags::TIMEOUT | StateFlags::AGGREGATION | StateFlags::SYNC;
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu)))
            .await;

        assert!(!m.shared.block().partner_oper.state.is_set(StateFlags::SYNC));
    }

    #[tokio::test]
    async fn test_individual_link_syncs_without_matching() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        // Partner does not echo our info, but declares itself individual
        // and in sync: clause (2) applies.
        let mut pdu = partner_pdu(&m.shared);
        pdu.actor.state = StateFlags::ACTIVITY | StateFlags::SYNC;
        pdu.partner = ParticipantInfo::default();
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu)))
            .await;

        assert!(m.shared.block().partner_oper.state.is_set(StateFlags::SYNC));
    }

    #[tokio::test]
    async fn test_update_ntt_on_stale_partner_view() {
        let (mut m, mut rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        let mut pdu = partner_pdu(&m.shared);
        // Partner's view of us differs in the SYNC bit only
        pdu.partner.state ^= StateFlags::SYNC;
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu)))
            .await;

        let mut saw_ntt = false;
        while let Ok(ev) = rest.tx.try_recv() {
            if matches!(ev.event, TxEvent::Ntt) {
                saw_ntt = true;
            }
        }
        assert!(saw_ntt);
    }

    #[tokio::test]
    async fn test_current_while_expiry_walks_to_defaulted() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        let pdu = partner_pdu(&m.shared);
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu)))
            .await;
        assert_eq!(m.state(), RxState::Current);

        m.handle_event(MachineEvent::new("test", RxEvent::CurrentWhileTimerExpired))
            .await;
        assert_eq!(m.state(), RxState::Expired);
        assert!(m.shared.block().actor_oper.state.is_set(StateFlags::EXPIRED));

        m.handle_event(MachineEvent::new("test", RxEvent::CurrentWhileTimerExpired))
            .await;
        assert_eq!(m.state(), RxState::Defaulted);
        let block = m.shared.block();
        assert!(block.actor_oper.state.is_set(StateFlags::DEFAULTED));
        // Partner Oper equals Partner Admin apart from the sync override
        let mut expected = block.partner_admin;
        expected.state.set(StateFlags::SYNC);
        assert_eq!(block.partner_oper, expected);
    }

    #[tokio::test]
    async fn test_port_moved_detected_while_disabled() {
        let (mut m, mut rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        let pdu = partner_pdu(&m.shared);
        m.handle_event(MachineEvent::new("test", RxEvent::LacpPktRx(pdu.clone())))
            .await;

        // Port goes down; same partner identity arrives again.
        m.shared.block.write().port_enabled = false;
        m.handle_event(MachineEvent::new("test", RxEvent::NotPortEnabledAndNotPortMoved))
            .await;
        assert_eq!(m.state(), RxState::PortDisabled);
        while rest.mux.try_recv().is_ok() {}

        m.handle_frame(PduRx {
            payload: pdu.build(),
            ack: None,
        })
        .await;
        assert_eq!(m.state(), RxState::Initialize);
    }

    #[tokio::test]
    async fn test_malformed_pdu_counts_and_keeps_state() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        enable(&mut m).await;

        m.handle_frame(PduRx {
            payload: vec![0xFF; 20],
            ack: None,
        })
        .await;

        assert_eq!(m.state(), RxState::Expired);
        let counters = m.shared.counters.snapshot();
        assert_eq!(counters.parse_errors, 1);
        assert_eq!(counters.lacp_in_pkts, 1);
    }

    #[tokio::test]
    async fn test_rule_miss_is_noop() {
        let (mut m, _rest) = machine();
        begin(&mut m).await;
        let before = m.state();
        m.handle_event(MachineEvent::new("test", RxEvent::CurrentWhileTimerExpired))
            .await;
        assert_eq!(m.state(), before);
        assert!(m.shared.counters.snapshot().unhandled_events >= 1);
    }
}
