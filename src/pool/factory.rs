//! Connection factory with a swappable endpoint target.

use super::Connection;
use crate::client::Connector;
use crate::error::{Error, Result};
use crate::types::SYSTEM_KEYSPACE;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where new connections are opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub hostname: String,
    pub port: u16,
    pub timeout: Duration,
    pub frame_size: usize,
    pub max_message_size: usize,
}

impl EndpointTarget {
    /// Same limits, different host.
    pub fn with_hostname(&self, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// The published target together with the generation it was installed at.
#[derive(Debug, Clone)]
struct TargetSlot {
    target: Arc<EndpointTarget>,
    generation: u64,
}

/// Creates, validates and destroys connections for the current target.
///
/// Every connection is stamped with the generation of the target it was
/// opened against. [`ConnectionFactory::retarget`] bumps the generation, so
/// connections opened before the swap fail validation from then on.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    slot: RwLock<TargetSlot>,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, target: EndpointTarget) -> Self {
        Self {
            connector,
            slot: RwLock::new(TargetSlot {
                target: Arc::new(target),
                generation: 0,
            }),
        }
    }

    /// The current target.
    pub fn target(&self) -> Arc<EndpointTarget> {
        self.slot.read().target.clone()
    }

    /// The current target generation.
    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    /// Install a new target. Returns the new generation.
    pub fn retarget(&self, target: EndpointTarget) -> u64 {
        let mut slot = self.slot.write();
        let previous = slot.target.clone();
        slot.generation += 1;
        slot.target = Arc::new(target);
        info!(
            from = %previous,
            to = %slot.target,
            generation = slot.generation,
            "Connection factory retargeted"
        );
        slot.generation
    }

    /// Open a connection for a namespace against the current target.
    ///
    /// Connections for a namespace other than the system namespace have that
    /// keyspace selected before they are handed out.
    pub async fn make(&self, namespace: &str) -> Result<Connection> {
        let TargetSlot { target, generation } = self.slot.read().clone();

        let mut client = self
            .connector
            .connect(&target)
            .await
            .map_err(|e| Error::temporary(&format!("connect to {}", target), e))?;

        if namespace != SYSTEM_KEYSPACE {
            if let Err(e) = client.set_keyspace(namespace).await {
                client.close();
                return Err(Error::temporary(
                    &format!("select keyspace {} on {}", namespace, target),
                    e,
                ));
            }
        }

        debug!(%namespace, target = %target, generation, "Opened connection");
        Ok(Connection::new(client, namespace.to_string(), target, generation))
    }

    /// Borrow-time validation: current generation and a successful liveness probe.
    pub async fn validate_on_borrow(&self, conn: &mut Connection) -> bool {
        if !self.validate_on_return(conn) {
            return false;
        }
        match conn.client_mut().ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(target = %conn.target(), error = %e, "Liveness probe failed");
                false
            }
        }
    }

    /// Return-time validation: current generation, session still open, not poisoned.
    pub fn validate_on_return(&self, conn: &Connection) -> bool {
        conn.generation() == self.generation() && conn.is_usable()
    }

    /// Tear a connection down.
    pub fn destroy(&self, mut conn: Connection) {
        debug!(
            namespace = %conn.namespace(),
            target = %conn.target(),
            generation = conn.generation(),
            "Destroying connection"
        );
        conn.client_mut().close();
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("ConnectionFactory")
            .field("target", &slot.target)
            .field("generation", &slot.generation)
            .finish()
    }
}
