//! A single pooled session.

use super::EndpointTarget;
use crate::client::ColumnStoreClient;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// One live session, bound to the endpoint target active when it was opened.
pub struct Connection {
    client: Box<dyn ColumnStoreClient>,
    namespace: String,
    target: Arc<EndpointTarget>,
    generation: u64,
    created_at: Instant,
    poisoned: bool,
}

impl Connection {
    pub(crate) fn new(
        client: Box<dyn ColumnStoreClient>,
        namespace: String,
        target: Arc<EndpointTarget>,
        generation: u64,
    ) -> Self {
        Self {
            client,
            namespace,
            target,
            generation,
            created_at: Instant::now(),
            poisoned: false,
        }
    }

    pub fn client(&self) -> &dyn ColumnStoreClient {
        self.client.as_ref()
    }

    pub fn client_mut(&mut self) -> &mut dyn ColumnStoreClient {
        self.client.as_mut()
    }

    /// Namespace this connection was opened for.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Endpoint this connection talks to.
    pub fn target(&self) -> &Arc<EndpointTarget> {
        &self.target
    }

    /// Target generation at creation time.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Mark the session as unfit for reuse; it is destroyed when returned.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Open and not poisoned.
    pub fn is_usable(&self) -> bool {
        !self.poisoned && self.client.is_open()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("namespace", &self.namespace)
            .field("target", &self.target)
            .field("generation", &self.generation)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
