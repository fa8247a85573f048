//! Aggregator selection hook
//!
//! Selection across ports (which ports may share an aggregator, standby
//! arbitration) is not the port engine's business. The engine calls the
//! [`AggregatorSelector`] collaborator to re-evaluate a port's disposition
//! and to attach/detach it; everything else happens on the other side of
//! the trait.

use std::sync::Arc;

/// Per-port disposition toward an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Unselected,
    Standby,
    Selected,
}

/// Handle to an aggregator the port may be attached to
#[derive(Debug)]
pub struct Aggregator {
    /// Aggregator identifier
    pub id: u32,
    /// Operational key members must carry
    pub actor_key: u16,
}

impl Aggregator {
    pub fn new(id: u32, actor_key: u16) -> Self {
        Self { id, actor_key }
    }
}

/// Aggregator-side collaborator consulted by the port engine
pub trait AggregatorSelector: Send + Sync {
    /// Re-evaluate whether the port may be Selected/Standby/Unselected,
    /// based on the partner identity recorded on it and its sibling ports.
    fn reevaluate(&self, port_number: u16) -> Selection;

    /// Attach the port to its aggregator; returns the aggregator handle.
    fn attach(&self, port_number: u16) -> Option<Arc<Aggregator>>;

    /// Detach the port from its aggregator.
    fn detach(&self, port_number: u16);
}

/// Selects every port into one fixed aggregator.
///
/// Enough for single-LAG deployments and for tests; real systems implement
/// [`AggregatorSelector`] over their aggregator table.
#[derive(Debug)]
pub struct StaticSelector {
    agg: Arc<Aggregator>,
}

impl StaticSelector {
    pub fn new(agg_id: u32, actor_key: u16) -> Self {
        Self {
            agg: Arc::new(Aggregator::new(agg_id, actor_key)),
        }
    }
}

impl AggregatorSelector for StaticSelector {
    fn reevaluate(&self, _port_number: u16) -> Selection {
        Selection::Selected
    }

    fn attach(&self, _port_number: u16) -> Option<Arc<Aggregator>> {
        Some(self.agg.clone())
    }

    fn detach(&self, _port_number: u16) {}
}
