//! Process-wide port registry
//!
//! One `LacpSystem` per actor system identity: it creates port engines from
//! configuration, hands out lookups by port number, and tears ports down.

use crate::context::{PortConfig, SystemContext};
use crate::port::PortEngine;
use dashmap::DashMap;
use lacpd_core::{Error, Result};
use std::sync::Arc;

/// The set of LACP ports run by this system
pub struct LacpSystem {
    ctx: SystemContext,
    ports: DashMap<u16, Arc<PortEngine>>,
}

impl LacpSystem {
    pub fn new(ctx: SystemContext) -> Self {
        Self {
            ctx,
            ports: DashMap::new(),
        }
    }

    pub fn context(&self) -> &SystemContext {
        &self.ctx
    }

    /// Create a port engine, run its BEGIN pulse and register it
    pub async fn create_port(&self, config: PortConfig) -> Result<Arc<PortEngine>> {
        let port_number = config.port_number;
        if self.ports.contains_key(&port_number) {
            return Err(Error::PortExists(port_number));
        }

        let engine = Arc::new(PortEngine::new(self.ctx.clone(), config));
        engine.begin().await?;
        self.ports.insert(port_number, engine.clone());
        Ok(engine)
    }

    /// Look a port up by its port number
    pub fn find_port(&self, port_number: u16) -> Option<Arc<PortEngine>> {
        self.ports
            .get(&port_number)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Stop a port engine and drop it from the registry
    pub async fn delete_port(&self, port_number: u16) -> Result<()> {
        let (_, engine) = self
            .ports
            .remove(&port_number)
            .ok_or(Error::PortNotFound(port_number))?;
        engine.stop().await;
        Ok(())
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::StaticSelector;
    use crate::state::SystemInfo;
    use lacpd_core::{MacAddr, NullTransmitter};

    fn system() -> LacpSystem {
        LacpSystem::new(SystemContext::new(
            SystemInfo::new(0x8000, MacAddr([0, 1, 2, 3, 4, 5])),
            Arc::new(NullTransmitter),
            Arc::new(StaticSelector::new(1, 1)),
        ))
    }

    #[tokio::test]
    async fn test_create_find_delete() {
        let system = system();
        let port = system
            .create_port(PortConfig::new(7, "eth7", MacAddr::zero(), 1))
            .await
            .unwrap();
        assert_eq!(port.port_number(), 7);
        assert_eq!(system.port_count(), 1);

        let found = system.find_port(7).expect("port must be registered");
        assert_eq!(found.port_number(), 7);
        assert!(system.find_port(8).is_none());

        system.delete_port(7).await.unwrap();
        assert_eq!(system.port_count(), 0);
        assert!(system.find_port(7).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_port_number_rejected() {
        let system = system();
        system
            .create_port(PortConfig::new(7, "eth7", MacAddr::zero(), 1))
            .await
            .unwrap();
        let err = system
            .create_port(PortConfig::new(7, "eth7b", MacAddr::zero(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortExists(7)));
    }

    #[tokio::test]
    async fn test_submit_after_delete_errors() {
        let system = system();
        let port = system
            .create_port(PortConfig::new(7, "eth7", MacAddr::zero(), 1))
            .await
            .unwrap();
        system.delete_port(7).await.unwrap();

        assert!(matches!(
            port.receive_pdu(vec![0u8; 110]).await,
            Err(Error::EngineStopped(_))
        ));
        assert!(matches!(
            port.enable_port().await,
            Err(Error::EngineStopped(_))
        ));
    }
}
