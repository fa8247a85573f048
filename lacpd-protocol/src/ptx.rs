//! Periodic transmit machine (802.1AX-2014 6.4.13)
//!
//! Drives the periodic LACPDU cadence: fast (1 s) while the partner asks
//! for short timeouts, slow (30 s) otherwise, none while the port is down,
//! LACP is disabled or both ends are passive. Expiry of the periodic timer
//! passes through PeriodicTx, which posts NTT to the transmit machine and
//! re-enters the cadence the partner currently wants.

use crate::event::{acknowledge, MachineEvent, PTXM_MODULE};
use crate::port::{PortEvent, PortShared};
use crate::state::StateFlags;
use crate::timer::{EventTimer, FAST_PERIODIC_TIME, SLOW_PERIODIC_TIME};
use crate::tx::TxEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Periodic transmit machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtxState {
    /// Pseudo state before the BEGIN pulse
    None,
    NoPeriodic,
    FastPeriodic,
    SlowPeriodic,
    /// Transient: post NTT, then re-enter Fast or Slow
    PeriodicTx,
}

/// Periodic transmit machine events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtxEvent {
    Begin,
    NotPortEnabled,
    LacpDisabled,
    ActorPartnerOperActivityPassiveMode,
    PartnerOperStateTimeoutShort,
    PartnerOperStateTimeoutLong,
    UnconditionalFallthrough,
    PeriodicTimerExpired,
}

pub(crate) struct PtxMachine {
    shared: Arc<PortShared>,
    state: PtxState,
    periodic: EventTimer<PtxEvent>,
    events: mpsc::Receiver<MachineEvent<PtxEvent>>,
}

impl PtxMachine {
    pub(crate) fn new(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<PtxEvent>>,
    ) -> Self {
        let periodic = EventTimer::new(
            shared.senders.ptx.clone(),
            PTXM_MODULE,
            PtxEvent::PeriodicTimerExpired,
            FAST_PERIODIC_TIME,
        );
        Self {
            shared,
            state: PtxState::None,
            periodic,
            events,
        }
    }

    pub(crate) fn spawn(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<PtxEvent>>,
        kill: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(shared, events).run(kill))
    }

    async fn run(mut self, mut kill: oneshot::Receiver<()>) {
        debug!(port = self.shared.port_number, "periodic tx machine start");
        loop {
            tokio::select! {
                _ = &mut kill => {
                    self.periodic.stop();
                    debug!(port = self.shared.port_number, "periodic tx machine end");
                    return;
                }
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: MachineEvent<PtxEvent>) {
        let outbox = self.process(event.src, event.event);
        for out in outbox {
            self.shared.post(PTXM_MODULE, out).await;
        }
        acknowledge(PTXM_MODULE, event.ack).await;
    }

    fn process(&mut self, src: &'static str, event: PtxEvent) -> Vec<PortEvent> {
        let next = match (self.state, event) {
            (_, PtxEvent::Begin)
            | (_, PtxEvent::NotPortEnabled)
            | (_, PtxEvent::LacpDisabled)
            | (_, PtxEvent::ActorPartnerOperActivityPassiveMode) => Some(PtxState::NoPeriodic),
            (PtxState::NoPeriodic, PtxEvent::UnconditionalFallthrough) => {
                Some(PtxState::FastPeriodic)
            }
            (PtxState::FastPeriodic | PtxState::SlowPeriodic, PtxEvent::PeriodicTimerExpired) => {
                Some(PtxState::PeriodicTx)
            }
            (PtxState::FastPeriodic, PtxEvent::PartnerOperStateTimeoutLong) => {
                Some(PtxState::SlowPeriodic)
            }
            // The partner switched to short timeouts mid-wait: transmit now
            // rather than at the end of the slow interval.
            (PtxState::SlowPeriodic, PtxEvent::PartnerOperStateTimeoutShort) => {
                Some(PtxState::PeriodicTx)
            }
            _ => None,
        };

        let Some(next) = next else {
            self.shared.counters.incr_unhandled();
            debug!(
                port = self.shared.port_number,
                state = ?self.state,
                event = ?event,
                src,
                "periodic tx event ignored"
            );
            return Vec::new();
        };

        debug!(
            port = self.shared.port_number,
            from = ?self.state,
            to = ?next,
            src,
            "periodic tx transition"
        );
        self.state = next;

        let mut outbox = Vec::new();
        match next {
            PtxState::NoPeriodic => self.enter_no_periodic(),
            PtxState::FastPeriodic => self.enter_fast_periodic(),
            PtxState::SlowPeriodic => self.enter_slow_periodic(),
            PtxState::PeriodicTx => self.enter_periodic_tx(&mut outbox),
            PtxState::None => {}
        }
        outbox
    }

    fn enter_no_periodic(&mut self) {
        self.periodic.stop();
        let mut block = self.shared.block.write();
        block.ptx_state = PtxState::NoPeriodic;
        block.ptx_interval = None;
    }

    fn enter_fast_periodic(&mut self) {
        self.periodic.set_timeout(FAST_PERIODIC_TIME);
        self.periodic.start();
        let mut block = self.shared.block.write();
        block.ptx_state = PtxState::FastPeriodic;
        block.ptx_interval = Some(FAST_PERIODIC_TIME);
    }

    fn enter_slow_periodic(&mut self) {
        self.periodic.set_timeout(SLOW_PERIODIC_TIME);
        self.periodic.start();
        let mut block = self.shared.block.write();
        block.ptx_state = PtxState::SlowPeriodic;
        block.ptx_interval = Some(SLOW_PERIODIC_TIME);
    }

    fn enter_periodic_tx(&mut self, outbox: &mut Vec<PortEvent>) {
        let partner_short = {
            let mut block = self.shared.block.write();
            block.ptx_state = PtxState::PeriodicTx;
            block.partner_oper.state.is_set(StateFlags::TIMEOUT)
        };

        outbox.push(PortEvent::Tx(TxEvent::Ntt));

        if partner_short {
            self.state = PtxState::FastPeriodic;
            self.enter_fast_periodic();
        } else {
            self.state = PtxState::SlowPeriodic;
            self.enter_slow_periodic();
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> PtxState {
        self.state
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

    fn machine() -> (PtxMachine, crate::port::MachineReceivers) {
        let ctx = SystemContext::new(
            SystemInfo::new(0x8000, MacAddr([0, 1, 2, 3, 4, 5])),
            Arc::new(NullTransmitter),
            Arc::new(StaticSelector::new(1, 1)),
        );
        let engine = PortEngine::new(ctx, PortConfig::new(1, "eth0", MacAddr::zero(), 1));
        let mut receivers = engine.take_receivers();
        let events = std::mem::replace(&mut receivers.ptx, mpsc::channel(1).1);
        (PtxMachine::new(engine.shared().clone(), events), receivers)
    }

    async fn drive(m: &mut PtxMachine, event: PtxEvent) {
        m.handle_event(MachineEvent::new("test", event)).await;
    }

    #[tokio::test]
    async fn test_begin_enters_no_periodic() {
        let (mut m, _rest) = machine();
        drive(&mut m, PtxEvent::Begin).await;
        assert_eq!(m.state(), PtxState::NoPeriodic);
        assert_eq!(m.shared.block().ptx_interval, None);
    }

    #[tokio::test]
    async fn test_fallthrough_starts_fast_cadence() {
        let (mut m, _rest) = machine();
        drive(&mut m, PtxEvent::Begin).await;
        drive(&mut m, PtxEvent::UnconditionalFallthrough).await;
        assert_eq!(m.state(), PtxState::FastPeriodic);
        assert_eq!(m.shared.block().ptx_interval, Some(FAST_PERIODIC_TIME));
    }

    #[tokio::test]
    async fn test_timer_expiry_posts_ntt_and_reenters_cadence() {
        let (mut m, mut rest) = machine();
        drive(&mut m, PtxEvent::Begin).await;
        drive(&mut m, PtxEvent::UnconditionalFallthrough).await;

        // Partner wants short timeouts: stay fast.
        m.shared
            .block
            .write()
            .partner_oper
            .state
            .set(StateFlags::TIMEOUT);
        drive(&mut m, PtxEvent::PeriodicTimerExpired).await;
        assert_eq!(m.state(), PtxState::FastPeriodic);
        assert!(matches!(rest.tx.try_recv().unwrap().event, TxEvent::Ntt));

        // Partner switches to long timeouts: drop to slow.
        m.shared
            .block
            .write()
            .partner_oper
            .state
            .clear(StateFlags::TIMEOUT);
        drive(&mut m, PtxEvent::PeriodicTimerExpired).await;
        assert_eq!(m.state(), PtxState::SlowPeriodic);
        assert_eq!(m.shared.block().ptx_interval, Some(SLOW_PERIODIC_TIME));
        assert!(matches!(rest.tx.try_recv().unwrap().event, TxEvent::Ntt));
    }

    #[tokio::test]
    async fn test_short_timeout_request_in_slow_transmits_immediately() {
        let (mut m, mut rest) = machine();
        drive(&mut m, PtxEvent::Begin).await;
        drive(&mut m, PtxEvent::UnconditionalFallthrough).await;
        drive(&mut m, PtxEvent::PartnerOperStateTimeoutLong).await;
        assert_eq!(m.state(), PtxState::SlowPeriodic);

        m.shared
            .block
            .write()
            .partner_oper
            .state
            .set(StateFlags::TIMEOUT);
        drive(&mut m, PtxEvent::PartnerOperStateTimeoutShort).await;
        assert_eq!(m.state(), PtxState::FastPeriodic);
        assert!(matches!(rest.tx.try_recv().unwrap().event, TxEvent::Ntt));
    }

    #[tokio::test]
    async fn test_disable_events_stop_the_cadence() {
        let (mut m, _rest) = machine();
        drive(&mut m, PtxEvent::Begin).await;
        drive(&mut m, PtxEvent::UnconditionalFallthrough).await;

        drive(&mut m, PtxEvent::ActorPartnerOperActivityPassiveMode).await;
        assert_eq!(m.state(), PtxState::NoPeriodic);
        assert_eq!(m.shared.block().ptx_interval, None);
    }
}
