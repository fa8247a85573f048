//! LACP per-port protocol engine
//!
//! Implements the Link Aggregation Control Protocol control plane of IEEE
//! 802.1AX-2014: per aggregation-capable port, five cooperating state
//! machines (Receive, Periodic Transmit, Transmit, Mux, Churn Detection)
//! drive the negotiation that admits the port into a Link Aggregation
//! Group.
//!
//! Each machine runs as its own task with a single-consumer event queue;
//! machines never call into each other, they post events. Timers are
//! cancellable one-shots that enqueue an event on the owning machine's
//! queue. The shared Actor/Partner parameter block lives in a
//! [`port::PortEngine`] and is write-partitioned between the machines.
//!
//! Link-layer I/O and aggregator-wide selection are collaborator traits
//! ([`lacpd_core::FrameTransmitter`], [`selection::AggregatorSelector`]);
//! the engine itself never touches a socket.

pub mod churn;
pub mod context;
pub mod event;
pub mod mux;
pub mod port;
pub mod ptx;
pub mod rx;
pub mod selection;
pub mod state;
pub mod system;
pub mod timer;
pub mod tx;


pub use context::{LacpMode, MuxRuleset, PortConfig, SystemContext, TimeoutMode};
pub use port::{CountersSnapshot, PortEngine, PortEvent};
pub use selection::{Aggregator, AggregatorSelector, Selection, StaticSelector};
pub use state::{PortInfo, StateFlags, SystemInfo};
pub use system::LacpSystem;
