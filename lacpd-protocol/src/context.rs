//! System context and per-port configuration
//!
//! Actor system identity, state templates and collaborator handles are
//! carried in a [`SystemContext`] passed to every port at construction;
//! there is no process-global state.

use crate::selection::AggregatorSelector;
use crate::state::{StateFlags, SystemInfo};
use lacpd_core::{FrameTransmitter, MacAddr};
use std::sync::Arc;

/// Default Actor admin state: active, short timeout, aggregatable
pub const DEFAULT_ACTOR_STATE: u8 =
    StateFlags::ACTIVITY | StateFlags::TIMEOUT | StateFlags::AGGREGATION;

/// Default Partner admin state: a defaulted partner is passive and
/// long-timeout, so a passive actor stays quiet until a live partner shows
/// up.
pub const DEFAULT_PARTNER_STATE: u8 = StateFlags::AGGREGATION
    | StateFlags::SYNC
    | StateFlags::COLLECTING
    | StateFlags::DISTRIBUTING;

/// LACP participation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LacpMode {
    /// Transmit periodically regardless of the partner
    Active,
    /// Transmit only when the partner is active
    Passive,
}

/// Requested partner cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// 3 s current-while timeout, 1 s partner cadence
    Short,
    /// 90 s current-while timeout, 30 s partner cadence
    Long,
}

/// Which Mux machine ruleset the system runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRuleset {
    /// Detached, Waiting, Attached, Collecting, Distributing
    Coupled,
    /// CDetached, CWaiting, CAttached, CCollectingDistributing
    Independent,
}

/// Process-wide actor identity, defaults and collaborator handles
#[derive(Clone)]
pub struct SystemContext {
    /// Actor system priority and id, shared by every port
    pub system: SystemInfo,
    /// LACP version spoken (1 or 2)
    pub lacp_version: u8,
    /// Actor admin state template applied at port creation
    pub actor_state_default: StateFlags,
    /// Partner admin state template applied at port creation
    pub partner_state_default: StateFlags,
    /// Mux machine ruleset
    pub mux_ruleset: MuxRuleset,
    /// Link-layer transmit collaborator
    pub frame_tx: Arc<dyn FrameTransmitter>,
    /// Aggregator selection collaborator
    pub selector: Arc<dyn AggregatorSelector>,
}

impl SystemContext {
    pub fn new(
        system: SystemInfo,
        frame_tx: Arc<dyn FrameTransmitter>,
        selector: Arc<dyn AggregatorSelector>,
    ) -> Self {
        Self {
            system,
            lacp_version: 1,
            actor_state_default: StateFlags(DEFAULT_ACTOR_STATE),
            partner_state_default: StateFlags(DEFAULT_PARTNER_STATE),
            mux_ruleset: MuxRuleset::Coupled,
            frame_tx,
            selector,
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.lacp_version = version;
        self
    }

    pub fn with_ruleset(mut self, ruleset: MuxRuleset) -> Self {
        self.mux_ruleset = ruleset;
        self
    }
}

/// Per-port creation parameters
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port number (also the registry key)
    pub port_number: u16,
    /// Port priority, most significant half of the Port ID
    pub port_priority: u16,
    /// Interface name, for logs
    pub intf_name: String,
    /// Source MAC for transmitted LACPDUs
    pub mac: MacAddr,
    /// Actor operational key
    pub key: u16,
    /// Active or passive participation
    pub mode: LacpMode,
    /// Cadence requested of the partner
    pub timeout: TimeoutMode,
    /// Whether the port may be aggregated with others
    pub aggregatable: bool,
}

impl PortConfig {
    pub fn new(port_number: u16, intf_name: impl Into<String>, mac: MacAddr, key: u16) -> Self {
        Self {
            port_number,
            port_priority: 0x80,
            intf_name: intf_name.into(),
            mac,
            key,
            mode: LacpMode::Active,
            timeout: TimeoutMode::Short,
            aggregatable: true,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.port_priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: LacpMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutMode) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn individual(mut self) -> Self {
        self.aggregatable = false;
        self
    }

    /// Actor admin state octet derived from the configured mode bits
    pub fn actor_admin_state(&self) -> StateFlags {
        let mut state = StateFlags::default();
        if matches!(self.mode, LacpMode::Active) {
            state.set(StateFlags::ACTIVITY);
        }
        if matches!(self.timeout, TimeoutMode::Short) {
            state.set(StateFlags::TIMEOUT);
        }
        if self.aggregatable {
            state.set(StateFlags::AGGREGATION);
        }
        state
    }
}
