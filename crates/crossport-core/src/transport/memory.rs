//! In-process transport.
//!
//! A [`MemoryHub`] connects any number of contexts living in one process.
//! Each context gets its own [`MemoryTransport`] endpoint, identified by its
//! module name; a channel named `"<module>.<method>"` is delivered to the
//! listener of `<module>`.

use super::{Channel, Incoming, Transport};
use crate::latch::Latch;
use crate::protocol::module_of;
use crate::{CrossportError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Shared routing table for in-process contexts.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Channel>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint for the context publishing under `module_name`.
    pub fn endpoint(&self, module_name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            module_name: module_name.into(),
            listening: Latch::new(),
        }
    }

    fn route(&self, module_name: &str) -> Option<mpsc::UnboundedSender<Channel>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module_name)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

/// One context's view of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    module_name: String,
    listening: Latch,
}

impl MemoryTransport {
    pub fn module_name(&self) -> &str {
        &self.module_name
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, name: &str) -> Result<Channel> {
        let module = module_of(name).ok_or_else(|| {
            CrossportError::channel_unavailable(name, "channel name has no module part")
        })?;

        let listener = self.hub.route(module).ok_or_else(|| {
            CrossportError::channel_unavailable(name, format!("no context listens for {}", module))
        })?;

        let (local, remote) = Channel::pair(name);
        listener
            .send(remote)
            .map_err(|_| CrossportError::channel_unavailable(name, "listener shut down"))?;

        debug!("Memory channel {} opened", name);
        Ok(local)
    }

    fn listen(&self) -> Result<Incoming> {
        if !self.listening.fire() {
            return Err(CrossportError::configuration(format!(
                "transport for {} is already listening",
                self.module_name
            )));
        }

        let mut listeners = self
            .hub
            .listeners
            .lock()
            .map_err(|_| CrossportError::Other("memory hub lock poisoned".to_string()))?;

        if listeners
            .get(&self.module_name)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(CrossportError::configuration(format!(
                "another context already listens for {}",
                self.module_name
            )));
        }

        let (tx, incoming) = Incoming::channel();
        listeners.insert(self.module_name.clone(), tx);
        Ok(incoming)
    }
}
