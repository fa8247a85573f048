//! Event envelope shared by every machine queue
//!
//! Events carry the name of the module that produced them (for transition
//! logs) and an optional acknowledgement sender. A machine that received an
//! event with an ack attached must post its module name back once the event
//! has been fully handled, whether or not it caused a transition; the
//! dispatcher's `wait_for_response` counts those replies.

use tokio::sync::mpsc;

/// Source-module tags used in transition logs and acknowledgements
pub const PORT_CONFIG_MODULE: &str = "Port Config";
pub const RXM_MODULE: &str = "Rx Machine";
pub const PTXM_MODULE: &str = "Periodic Tx Machine";
pub const TXM_MODULE: &str = "Tx Machine";
pub const MUXM_MODULE: &str = "Mux Machine";
pub const ACTOR_CDM_MODULE: &str = "Actor Churn Machine";
pub const PARTNER_CDM_MODULE: &str = "Partner Churn Machine";

/// Acknowledgement sink: carries the responding module's tag
pub type AckSender = mpsc::Sender<&'static str>;

/// An event addressed to one machine
#[derive(Debug)]
pub struct MachineEvent<E> {
    pub event: E,
    pub src: &'static str,
    pub ack: Option<AckSender>,
}

impl<E> MachineEvent<E> {
    pub fn new(src: &'static str, event: E) -> Self {
        Self {
            event,
            src,
            ack: None,
        }
    }

    pub fn with_ack(src: &'static str, event: E, ack: AckSender) -> Self {
        Self {
            event,
            src,
            ack: Some(ack),
        }
    }
}

/// Post the acknowledgement for a handled event, if one was requested.
pub(crate) async fn acknowledge(module: &'static str, ack: Option<AckSender>) {
    if let Some(ack) = ack {
        let _ = ack.send(module).await;
    }
}
