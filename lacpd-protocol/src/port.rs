//! Per-port engine: shared state block, dispatcher and lifecycle
//!
//! A `PortEngine` owns one port's Actor/Partner parameter block and the five
//! machine tasks. Configuration operations (BEGIN, port/LACP enable and
//! disable) build the same event batches the 802.1AX management clauses
//! describe and hand them to the dispatcher, which fans them out to the
//! machine queues and, when asked, joins on per-event acknowledgements.
//!
//! Write ownership of the shared block is partitioned: the Rx machine owns
//! Partner Oper and Actor Oper Defaulted/Expired, the Mux machine owns Actor
//! Oper Sync/Collecting/Distributing, the Periodic Tx machine its cadence,
//! the Tx machine the NTT flag. Configuration owns the enable flags. The
//! lock is never held across an await.

use crate::churn::{ChurnEvent, ChurnSide, ChurnState};
use crate::context::{PortConfig, SystemContext};
use crate::event::{AckSender, MachineEvent, PORT_CONFIG_MODULE};
use crate::mux::{MuxEvent, MuxState};
use crate::ptx::{PtxEvent, PtxState};
use crate::rx::{PduRx, RxEvent, RxState};
use crate::selection::{Aggregator, Selection};
use crate::state::{PortInfo, StateFlags};
use crate::tx::TxEvent;
use lacpd_core::{Error, MacAddr, PortId, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const EVENT_QUEUE_DEPTH: usize = 16;
const PDU_QUEUE_DEPTH: usize = 64;

/// An event addressed to one of the port's machines
#[derive(Debug, Clone)]
pub enum PortEvent {
    Rx(RxEvent),
    Ptx(PtxEvent),
    Tx(TxEvent),
    Mux(MuxEvent),
    ActorChurn(ChurnEvent),
    PartnerChurn(ChurnEvent),
}

/// The authoritative per-port parameter block (802.1AX 6.4.7)
#[derive(Debug, Clone)]
pub struct PortStateBlock {
    pub actor_admin: PortInfo,
    pub actor_oper: PortInfo,
    pub partner_admin: PortInfo,
    pub partner_oper: PortInfo,

    /// Disposition toward an aggregator, driven by the selection collaborator
    pub agg_selected: Selection,
    /// Attached aggregator, valid only while the parent keeps it alive
    pub agg_attached: Option<Weak<Aggregator>>,

    /// MAC_Operational: link is up
    pub port_enabled: bool,
    /// LACP administratively enabled on the port
    pub lacp_enabled: bool,
    /// Partner identity reappeared elsewhere while this port was disabled
    pub port_moved: bool,
    /// Aggregate-wait completed; the mux may proceed past Waiting
    pub ready_n: bool,
    /// BEGIN pulse in progress
    pub begin: bool,

    /// Partner's LACPDU version, captured when the actor speaks v2+
    pub partner_version: u8,

    /// Operator-visible churn indications
    pub actor_churn: bool,
    pub partner_churn: bool,

    // State mirrors, published by the owning machine on every transition so
    // other machines can consult them without reaching into a peer task.
    pub rx_state: RxState,
    pub mux_state: MuxState,
    pub ptx_state: PtxState,
    pub ptx_interval: Option<Duration>,
    pub actor_churn_state: ChurnState,
    pub partner_churn_state: ChurnState,
}

/// Per-port protocol counters
#[derive(Debug, Default)]
pub struct PortCounters {
    lacp_in_pkts: AtomicU64,
    lacp_out_pkts: AtomicU64,
    parse_errors: AtomicU64,
    tx_errors: AtomicU64,
    unhandled_events: AtomicU64,
    actor_churn_events: AtomicU64,
    partner_churn_events: AtomicU64,
}

impl PortCounters {
    pub(crate) fn incr_in_pkts(&self) {
        self.lacp_in_pkts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_out_pkts(&self) {
        self.lacp_out_pkts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_tx_errors(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_unhandled(&self) {
        self.unhandled_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_churn(&self, side: ChurnSide) {
        match side {
            ChurnSide::Actor => self.actor_churn_events.fetch_add(1, Ordering::Relaxed),
            ChurnSide::Partner => self.partner_churn_events.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            lacp_in_pkts: self.lacp_in_pkts.load(Ordering::Relaxed),
            lacp_out_pkts: self.lacp_out_pkts.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            unhandled_events: self.unhandled_events.load(Ordering::Relaxed),
            actor_churn_events: self.actor_churn_events.load(Ordering::Relaxed),
            partner_churn_events: self.partner_churn_events.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub lacp_in_pkts: u64,
    pub lacp_out_pkts: u64,
    pub parse_errors: u64,
    pub tx_errors: u64,
    pub unhandled_events: u64,
    pub actor_churn_events: u64,
    pub partner_churn_events: u64,
}

/// Event-queue senders for every machine on the port
pub(crate) struct MachineSenders {
    pub rx: mpsc::Sender<MachineEvent<RxEvent>>,
    pub rx_pdu: mpsc::Sender<PduRx>,
    pub ptx: mpsc::Sender<MachineEvent<PtxEvent>>,
    pub tx: mpsc::Sender<MachineEvent<TxEvent>>,
    pub mux: mpsc::Sender<MachineEvent<MuxEvent>>,
    pub actor_cd: mpsc::Sender<MachineEvent<ChurnEvent>>,
    pub partner_cd: mpsc::Sender<MachineEvent<ChurnEvent>>,
}

/// State shared between the engine and its machine tasks
pub struct PortShared {
    pub ctx: SystemContext,
    pub port_id: PortId,
    pub port_number: u16,
    pub intf_name: String,
    pub mac: MacAddr,
    pub key: u16,
    pub counters: PortCounters,
    pub(crate) block: RwLock<PortStateBlock>,
    pub(crate) senders: MachineSenders,
}

impl PortShared {
    /// Read access to the parameter block
    pub fn block(&self) -> RwLockReadGuard<'_, PortStateBlock> {
        self.block.read()
    }

    /// Route one event to its machine queue
    pub(crate) async fn route(
        &self,
        src: &'static str,
        event: PortEvent,
        ack: Option<AckSender>,
    ) -> Result<()> {
        let sent = match event {
            PortEvent::Rx(e) => self
                .senders
                .rx
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
            PortEvent::Ptx(e) => self
                .senders
                .ptx
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
            PortEvent::Tx(e) => self
                .senders
                .tx
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
            PortEvent::Mux(e) => self
                .senders
                .mux
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
            PortEvent::ActorChurn(e) => self
                .senders
                .actor_cd
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
            PortEvent::PartnerChurn(e) => self
                .senders
                .partner_cd
                .send(MachineEvent { event: e, src, ack })
                .await
                .is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(Error::EngineStopped(format!("port {}", self.port_number)))
        }
    }

    /// Fire-and-forget event post between machines
    pub(crate) async fn post(&self, src: &'static str, event: PortEvent) {
        if let Err(err) = self.route(src, event, None).await {
            debug!(port = self.port_number, %err, "event post after stop dropped");
        }
    }

    /// PTXM may leave NoPeriodic only while the port runs LACP and at least
    /// one end is active.
    pub(crate) fn no_periodic_exit_ready(block: &PortStateBlock) -> bool {
        block.port_enabled
            && block.lacp_enabled
            && (block.actor_oper.state.is_set(StateFlags::ACTIVITY)
                || block.partner_oper.state.is_set(StateFlags::ACTIVITY))
    }
}

pub(crate) struct MachineReceivers {
    pub(crate) rx: mpsc::Receiver<MachineEvent<RxEvent>>,
    pub(crate) rx_pdu: mpsc::Receiver<PduRx>,
    pub(crate) ptx: mpsc::Receiver<MachineEvent<PtxEvent>>,
    pub(crate) tx: mpsc::Receiver<MachineEvent<TxEvent>>,
    pub(crate) mux: mpsc::Receiver<MachineEvent<MuxEvent>>,
    pub(crate) actor_cd: mpsc::Receiver<MachineEvent<ChurnEvent>>,
    pub(crate) partner_cd: mpsc::Receiver<MachineEvent<ChurnEvent>>,
}

#[derive(Default)]
struct EngineInner {
    receivers: Option<MachineReceivers>,
    tasks: Vec<JoinHandle<()>>,
    kills: Vec<oneshot::Sender<()>>,
}

/// One aggregation-capable port's protocol engine
pub struct PortEngine {
    shared: Arc<PortShared>,
    inner: Mutex<EngineInner>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for PortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortEngine").finish_non_exhaustive()
    }
}

impl PortEngine {
    /// Allocate a new port engine in its pre-BEGIN state
    pub fn new(ctx: SystemContext, config: PortConfig) -> Self {
        let actor_admin = PortInfo {
            system: ctx.system,
            key: config.key,
            port_priority: config.port_priority,
            port_number: config.port_number,
            state: config.actor_admin_state(),
        };
        let partner_admin = PortInfo {
            state: ctx.partner_state_default,
            ..PortInfo::default()
        };

        let block = PortStateBlock {
            actor_admin,
            actor_oper: actor_admin,
            partner_admin,
            partner_oper: partner_admin,
            agg_selected: Selection::Unselected,
            agg_attached: None,
            port_enabled: false,
            lacp_enabled: false,
            port_moved: false,
            ready_n: false,
            begin: false,
            partner_version: 1,
            actor_churn: false,
            partner_churn: false,
            rx_state: RxState::None,
            mux_state: MuxState::initial(ctx.mux_ruleset),
            ptx_state: PtxState::None,
            ptx_interval: None,
            actor_churn_state: ChurnState::NoChurn,
            partner_churn_state: ChurnState::NoChurn,
        };

        let (rx_tx, rx_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (pdu_tx, pdu_rx) = mpsc::channel(PDU_QUEUE_DEPTH);
        let (ptx_tx, ptx_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (tx_tx, tx_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (mux_tx, mux_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (acd_tx, acd_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (pcd_tx, pcd_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let shared = Arc::new(PortShared {
            port_id: PortId::new(config.port_priority, config.port_number),
            port_number: config.port_number,
            intf_name: config.intf_name.clone(),
            mac: config.mac,
            key: config.key,
            ctx,
            counters: PortCounters::default(),
            block: RwLock::new(block),
            senders: MachineSenders {
                rx: rx_tx,
                rx_pdu: pdu_tx,
                ptx: ptx_tx,
                tx: tx_tx,
                mux: mux_tx,
                actor_cd: acd_tx,
                partner_cd: pcd_tx,
            },
        });

        Self {
            shared,
            inner: Mutex::new(EngineInner {
                receivers: Some(MachineReceivers {
                    rx: rx_rx,
                    rx_pdu: pdu_rx,
                    ptx: ptx_rx,
                    tx: tx_rx,
                    mux: mux_rx,
                    actor_cd: acd_rx,
                    partner_cd: pcd_rx,
                }),
                ..EngineInner::default()
            }),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn port_number(&self) -> u16 {
        self.shared.port_number
    }

    pub fn shared(&self) -> &Arc<PortShared> {
        &self.shared
    }

    /// Read access to the parameter block
    pub fn block(&self) -> RwLockReadGuard<'_, PortStateBlock> {
        self.shared.block.read()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// Sender the frame-receive collaborator pushes LACPDU payloads into
    pub fn pdu_sender(&self) -> mpsc::Sender<PduRx> {
        self.shared.senders.rx_pdu.clone()
    }

    /// BEGIN: spawn the machine tasks on first call, then pulse every
    /// machine into its initial state and join on the acknowledgements.
    pub async fn begin(&self) -> Result<()> {
        self.check_running()?;

        {
            let mut inner = self.inner.lock();
            if let Some(receivers) = inner.receivers.take() {
                let mut spawn = |task: JoinHandle<()>, kill: oneshot::Sender<()>| {
                    inner.tasks.push(task);
                    inner.kills.push(kill);
                };

                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::rx::RxMachine::spawn(
                        self.shared.clone(),
                        receivers.rx,
                        receivers.rx_pdu,
                        kill_rx,
                    ),
                    kill_tx,
                );
                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::tx::TxMachine::spawn(self.shared.clone(), receivers.tx, kill_rx),
                    kill_tx,
                );
                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::ptx::PtxMachine::spawn(self.shared.clone(), receivers.ptx, kill_rx),
                    kill_tx,
                );
                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::churn::ChurnMachine::spawn(
                        self.shared.clone(),
                        ChurnSide::Actor,
                        receivers.actor_cd,
                        kill_rx,
                    ),
                    kill_tx,
                );
                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::churn::ChurnMachine::spawn(
                        self.shared.clone(),
                        ChurnSide::Partner,
                        receivers.partner_cd,
                        kill_rx,
                    ),
                    kill_tx,
                );
                let (kill_tx, kill_rx) = oneshot::channel();
                spawn(
                    crate::mux::MuxMachine::spawn(self.shared.clone(), receivers.mux, kill_rx),
                    kill_tx,
                );
            }
        }

        self.shared.block.write().begin = true;

        self.distribute(
            vec![
                PortEvent::Rx(RxEvent::Begin),
                PortEvent::Ptx(PtxEvent::Begin),
                PortEvent::ActorChurn(ChurnEvent::Begin),
                PortEvent::PartnerChurn(ChurnEvent::Begin),
                PortEvent::Mux(MuxEvent::Begin),
                PortEvent::Tx(TxEvent::Begin),
            ],
            true,
        )
        .await?;

        self.shared.block.write().begin = false;
        Ok(())
    }

    /// Stop the engine: signal every machine, cancel timers (dropped with
    /// the machines), await the tasks. Submitting afterwards is an error.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let (kills, tasks) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.kills),
                std::mem::take(&mut inner.tasks),
            )
        };
        for kill in kills {
            let _ = kill.send(());
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(port = self.shared.port_number, "port engine stopped");
    }

    /// Submit a single event, optionally with an acknowledgement sink
    pub async fn submit(&self, event: PortEvent, ack: Option<AckSender>) -> Result<()> {
        self.check_running()?;
        self.shared.route(PORT_CONFIG_MODULE, event, ack).await
    }

    /// Hand an inbound LACPDU payload (Ethernet header already stripped)
    /// to the receive machine.
    pub async fn receive_pdu(&self, payload: Vec<u8>) -> Result<()> {
        self.check_running()?;
        self.shared
            .senders
            .rx_pdu
            .send(PduRx {
                payload,
                ack: None,
            })
            .await
            .map_err(|_| Error::EngineStopped(format!("port {}", self.shared.port_number)))
    }

    /// Fan a batch of events out to the machines. With `wait_for_response`,
    /// blocks until every addressed machine has acknowledged.
    pub async fn distribute(&self, events: Vec<PortEvent>, wait_for_response: bool) -> Result<()> {
        self.check_running()?;

        let count = events.len();
        let (ack_tx, mut ack_rx) = mpsc::channel::<&'static str>(count.max(1));

        for event in events {
            let ack = if wait_for_response {
                Some(ack_tx.clone())
            } else {
                None
            };
            self.shared.route(PORT_CONFIG_MODULE, event, ack).await?;
        }
        drop(ack_tx);

        if wait_for_response {
            let mut responded = 0;
            while responded < count {
                match ack_rx.recv().await {
                    Some(module) => {
                        debug!(port = self.shared.port_number, module, "response received");
                        responded += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// MAC became operational
    pub async fn enable_port(&self) -> Result<()> {
        info!(port = self.shared.port_number, intf = %self.shared.intf_name, "port enabled");

        let (lacp_enabled, actor_sync, partner_sync, ptx_ready) = {
            let mut block = self.shared.block.write();
            block.port_enabled = true;
            (
                block.lacp_enabled,
                block.actor_oper.state.is_set(StateFlags::SYNC),
                block.partner_oper.state.is_set(StateFlags::SYNC),
                PortShared::no_periodic_exit_ready(&block),
            )
        };

        let mut events = vec![PortEvent::Rx(if lacp_enabled {
            RxEvent::PortEnabledAndLacpEnabled
        } else {
            RxEvent::PortEnabledAndLacpDisabled
        })];
        if ptx_ready {
            events.push(PortEvent::Ptx(PtxEvent::UnconditionalFallthrough));
        }
        // Kick the churn monitors with the sync state as it stands now
        events.push(PortEvent::ActorChurn(if actor_sync {
            ChurnEvent::SyncOn
        } else {
            ChurnEvent::SyncOff
        }));
        events.push(PortEvent::PartnerChurn(if partner_sync {
            ChurnEvent::SyncOn
        } else {
            ChurnEvent::SyncOff
        }));
        if lacp_enabled {
            events.push(PortEvent::Tx(TxEvent::LacpEnabled));
        }

        self.distribute(events, false).await
    }

    /// MAC went down
    pub async fn disable_port(&self) -> Result<()> {
        info!(port = self.shared.port_number, intf = %self.shared.intf_name, "port disabled");

        let port_moved = {
            let mut block = self.shared.block.write();
            block.port_enabled = false;
            block.port_moved
        };

        let mut events = Vec::new();
        if !port_moved {
            events.push(PortEvent::Rx(RxEvent::NotPortEnabledAndNotPortMoved));
        }
        events.push(PortEvent::Ptx(PtxEvent::NotPortEnabled));
        events.push(PortEvent::ActorChurn(ChurnEvent::NotPortEnabled));
        events.push(PortEvent::PartnerChurn(ChurnEvent::NotPortEnabled));
        events.push(PortEvent::Tx(TxEvent::LacpDisabled));

        self.distribute(events, false).await
    }

    /// LACP administratively enabled
    pub async fn enable_lacp(&self) -> Result<()> {
        info!(port = self.shared.port_number, "lacp enabled");

        let (port_enabled, ptx_ready) = {
            let mut block = self.shared.block.write();
            block.lacp_enabled = true;
            (
                block.port_enabled,
                PortShared::no_periodic_exit_ready(&block),
            )
        };

        if !port_enabled {
            return Ok(());
        }

        let mut events = vec![
            PortEvent::Rx(RxEvent::PortEnabledAndLacpEnabled),
            PortEvent::Tx(TxEvent::LacpEnabled),
        ];
        if ptx_ready {
            events.push(PortEvent::Ptx(PtxEvent::UnconditionalFallthrough));
        }

        self.distribute(events, false).await
    }

    /// LACP administratively disabled; the port falls back to individual
    /// operation.
    pub async fn disable_lacp(&self) -> Result<()> {
        info!(port = self.shared.port_number, "lacp disabled");

        let port_enabled = {
            let mut block = self.shared.block.write();
            block.lacp_enabled = false;
            let admin_state = block.actor_admin.state;
            block.actor_oper.state = admin_state;
            block.port_enabled
        };

        let mut events = Vec::new();
        if port_enabled {
            events.push(PortEvent::Rx(RxEvent::PortEnabledAndLacpDisabled));
        }
        events.push(PortEvent::Ptx(PtxEvent::LacpDisabled));
        events.push(PortEvent::Tx(TxEvent::LacpDisabled));

        self.distribute(events, false).await
    }

    /// Hand the machine queues to a test that drives machines directly.
    #[cfg(test)]
    pub(crate) fn take_receivers(&self) -> MachineReceivers {
        self.inner
            .lock()
            .receivers
            .take()
            .expect("receivers already taken")
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(Error::EngineStopped(format!(
                "port {}",
                self.shared.port_number
            )))
        } else {
            Ok(())
        }
    }
}
