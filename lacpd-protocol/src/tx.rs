//! Transmit machine (802.1AX-2014 6.4.16)
//!
//! Honours the NTT flag: assembles an LACPDU from the current Actor/Partner
//! Oper blocks and hands it to the frame-transmit collaborator, at most
//! three per fast-periodic interval. A transmission that would exceed the
//! cap leaves NTT pending until the interval boundary.

use crate::event::{acknowledge, MachineEvent, TXM_MODULE};
use crate::port::PortShared;
use crate::timer::{EventTimer, FAST_PERIODIC_TIME, MAX_TX_PER_INTERVAL};
use lacpd_packet::{EtherType, EthernetFrame, Lacpdu, ParticipantInfo, SLOW_PROTOCOLS_MULTICAST};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Transmit machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Pseudo state before the BEGIN pulse
    None,
    /// LACP disabled: NTT requests are discarded
    Off,
    /// LACP enabled: NTT requests produce LACPDUs
    On,
}

/// Transmit machine events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Begin,
    LacpEnabled,
    LacpDisabled,
    Ntt,
    GuardTimerExpired,
}

pub(crate) struct TxMachine {
    shared: Arc<PortShared>,
    state: TxState,
    /// Need-to-transmit flag, owned by this machine
    ntt: bool,
    /// Transmissions in the current fast-periodic window
    tx_count: u32,
    guard: EventTimer<TxEvent>,
    events: mpsc::Receiver<MachineEvent<TxEvent>>,
}

impl TxMachine {
    pub(crate) fn new(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<TxEvent>>,
    ) -> Self {
        let guard = EventTimer::new(
            shared.senders.tx.clone(),
            TXM_MODULE,
            TxEvent::GuardTimerExpired,
            FAST_PERIODIC_TIME,
        );
        Self {
            shared,
            state: TxState::None,
            ntt: false,
            tx_count: 0,
            guard,
            events,
        }
    }

    pub(crate) fn spawn(
        shared: Arc<PortShared>,
        events: mpsc::Receiver<MachineEvent<TxEvent>>,
        kill: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(shared, events).run(kill))
    }

    async fn run(mut self, mut kill: oneshot::Receiver<()>) {
        debug!(port = self.shared.port_number, "tx machine start");
        loop {
            tokio::select! {
                _ = &mut kill => {
                    self.guard.stop();
                    debug!(port = self.shared.port_number, "tx machine end");
                    return;
                }
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: MachineEvent<TxEvent>) {
        match event.event {
            TxEvent::Begin => {
                self.state = TxState::Off;
                self.ntt = false;
                self.tx_count = 0;
                self.guard.stop();
            }
            TxEvent::LacpEnabled => {
                self.state = TxState::On;
            }
            TxEvent::LacpDisabled => {
                self.state = TxState::Off;
                self.ntt = false;
                self.tx_count = 0;
                self.guard.stop();
            }
            TxEvent::Ntt => {
                if self.state == TxState::On {
                    self.ntt = true;
                    self.try_transmit();
                } else {
                    // Disabled: clear NTT and do nothing
                    self.ntt = false;
                }
            }
            TxEvent::GuardTimerExpired => {
                self.tx_count = 0;
                if self.state == TxState::On && self.ntt {
                    self.try_transmit();
                }
            }
        }
        acknowledge(TXM_MODULE, event.ack).await;
    }

    /// Send one LACPDU if the rate window allows; otherwise leave NTT
    /// pending for the guard timer.
    fn try_transmit(&mut self) {
        if self.tx_count >= MAX_TX_PER_INTERVAL {
            debug!(
                port = self.shared.port_number,
                "tx rate limited, ntt pending"
            );
            return;
        }

        let frame = {
            let block = self.shared.block();
            let mut pdu = Lacpdu::new(
                ParticipantInfo::from(&block.actor_oper),
                ParticipantInfo::from(&block.partner_oper),
            );
            pdu.version = self.shared.ctx.lacp_version;
            EthernetFrame::new(
                SLOW_PROTOCOLS_MULTICAST,
                self.shared.mac,
                EtherType::SlowProtocols,
                pdu.build(),
            )
        };

        match self
            .shared
            .ctx
            .frame_tx
            .transmit(self.shared.port_number, &frame.to_bytes())
        {
            Ok(()) => self.shared.counters.incr_out_pkts(),
            Err(err) => {
                self.shared.counters.incr_tx_errors();
                debug!(port = self.shared.port_number, %err, "lacpdu transmit failed");
            }
        }

        self.ntt = false;
        if self.tx_count == 0 {
            self.guard.start();
        }
        self.tx_count += 1;
    }

    #[cfg(test)]
    pub(crate) fn ntt_pending(&self) -> bool {
        self.ntt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PortConfig, SystemContext};
    use crate::port::PortEngine;
    use crate::selection::StaticSelector;
    use crate::state::{StateFlags, SystemInfo};
    use lacpd_core::{FrameTransmitter, MacAddr, Result};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectTx {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameTransmitter for CollectTx {
        fn transmit(&self, _port: u16, frame: &[u8]) -> Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn machine(sink: Arc<CollectTx>) -> TxMachine {
        let ctx = SystemContext::new(
            SystemInfo::new(0x8000, MacAddr([0, 1, 2, 3, 4, 5])),
            sink,
            Arc::new(StaticSelector::new(1, 1)),
        );
        let engine = PortEngine::new(
            ctx,
            PortConfig::new(1, "eth0", MacAddr([0x02, 0, 0, 0, 0, 1]), 1),
        );
        let mut receivers = engine.take_receivers();
        let events = std::mem::replace(&mut receivers.tx, mpsc::channel(1).1);
        TxMachine::new(engine.shared().clone(), events)
    }

    async fn drive(m: &mut TxMachine, event: TxEvent) {
        m.handle_event(MachineEvent::new("test", event)).await;
    }

    #[tokio::test]
    async fn test_ntt_while_disabled_is_discarded() {
        let sink = Arc::new(CollectTx::default());
        let mut m = machine(sink.clone());

        drive(&mut m, TxEvent::Begin).await;
        drive(&mut m, TxEvent::Ntt).await;

        assert!(sink.frames.lock().is_empty());
        assert!(!m.ntt_pending());
    }

    #[tokio::test]
    async fn test_ntt_emits_frame_with_actor_oper_state() {
        let sink = Arc::new(CollectTx::default());
        let mut m = machine(sink.clone());
        m.shared
            .block
            .write()
            .actor_oper
            .state
            .set(StateFlags::SYNC | StateFlags::COLLECTING);

        drive(&mut m, TxEvent::Begin).await;
        drive(&mut m, TxEvent::LacpEnabled).await;
        drive(&mut m, TxEvent::Ntt).await;

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let frame = EthernetFrame::from_bytes(&frames[0]).unwrap();
        assert_eq!(frame.destination, SLOW_PROTOCOLS_MULTICAST);
        assert_eq!(frame.source, MacAddr([0x02, 0, 0, 0, 0, 1]));
        assert_eq!(frame.ethertype, EtherType::SlowProtocols);

        let pdu = Lacpdu::parse(&frame.payload).unwrap();
        let expected = m.shared.block().actor_oper.state.bits();
        assert_eq!(pdu.actor.state, expected);
        assert_eq!(pdu.actor.port_number, 1);
        assert_eq!(m.shared.counters.snapshot().lacp_out_pkts, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_to_three_per_interval() {
        let sink = Arc::new(CollectTx::default());
        let mut m = machine(sink.clone());

        drive(&mut m, TxEvent::Begin).await;
        drive(&mut m, TxEvent::LacpEnabled).await;
        for _ in 0..5 {
            drive(&mut m, TxEvent::Ntt).await;
        }

        assert_eq!(sink.frames.lock().len(), MAX_TX_PER_INTERVAL as usize);
        assert!(m.ntt_pending());

        // Interval boundary: pending NTT goes out, window restarts.
        drive(&mut m, TxEvent::GuardTimerExpired).await;
        assert_eq!(sink.frames.lock().len(), MAX_TX_PER_INTERVAL as usize + 1);
        assert!(!m.ntt_pending());
    }

    #[tokio::test]
    async fn test_lacp_disabled_clears_pending_ntt() {
        let sink = Arc::new(CollectTx::default());
        let mut m = machine(sink.clone());

        drive(&mut m, TxEvent::Begin).await;
        drive(&mut m, TxEvent::LacpEnabled).await;
        for _ in 0..4 {
            drive(&mut m, TxEvent::Ntt).await;
        }
        assert!(m.ntt_pending());

        drive(&mut m, TxEvent::LacpDisabled).await;
        drive(&mut m, TxEvent::GuardTimerExpired).await;
        assert_eq!(sink.frames.lock().len(), MAX_TX_PER_INTERVAL as usize);
    }
}
