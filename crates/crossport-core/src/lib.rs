//! Crossport Core - method publication, RPC and variable binding between
//! isolated contexts.
//!
//! Contexts that share no memory talk over named, ordered, bidirectional
//! JSON channels supplied by a [`Transport`]. On top of that this crate
//! provides:
//!
//! - a publication [`Registry`] exposing local methods as
//!   `"<module>.<method>"`, optionally pushing value changes to subscribers;
//! - an [`RpcClient`] that opens a channel per call and returns either a
//!   single result or a [`Subscription`];
//! - [`Bindings`], which mirror a variable of one context into another and
//!   forward local edits back.
//!
//! # Example
//!
//! ```rust,ignore
//! use crossport_core::{Messenger, MessagingConfig, MemoryHub, PublishOptions, Scope, sync_method};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> crossport_core::Result<()> {
//!     let hub = MemoryHub::new();
//!     let host = Messenger::start(MessagingConfig::new("Host")?, Arc::new(hub.endpoint("Host")))?;
//!     let page = Messenger::start(MessagingConfig::new("Page")?, Arc::new(hub.endpoint("Page")))?;
//!
//!     host.publish("double", sync_method(|x| Ok(json!(x.as_i64().unwrap_or(0) * 2))), PublishOptions::default())?;
//!     assert_eq!(page.call_method("Host", "double", json!(5)).await?, json!(10));
//!
//!     let state = Scope::new();
//!     state.declare("user", json!({"name": "Alice"}));
//!     host.publish_variable(&state, "user")?;
//!
//!     let local = Scope::new();
//!     local.declare("user", json!({}));
//!     let user = page.bind_variable("Host", "user").to(&local, "user")?.await?;
//!     println!("bound user: {}", user);
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod client;
pub mod config;
pub mod error;
pub mod latch;
pub mod protocol;
pub mod registry;
pub mod scope;
pub mod transport;

// Re-export commonly used types
pub use binding::{BindRequest, Binding, Bindings};
pub use client::{Notification, RpcClient, Subscription};
pub use config::{BindingConfig, ChannelConfig, MessagingConfig};
pub use error::{CrossportError, Result};
pub use latch::Latch;
pub use protocol::{Request, Response, ResponseStatus};
pub use registry::{
    sync_method, MethodResult, Publication, PublicationHandle, PublishOptions, PublishedMethod,
    Registry,
};
pub use scope::Scope;
pub use transport::{Channel, ChannelSender, Incoming, MemoryHub, MemoryTransport, TcpTransport, Transport};

use serde_json::Value;
use std::sync::Arc;

/// Main entry point: one context's registry, client and bindings.
///
/// Construction takes the transport's listener, so each transport backs
/// exactly one `Messenger`.
#[derive(Debug)]
pub struct Messenger {
    registry: Arc<Registry>,
    client: RpcClient,
    bindings: Bindings,
}

impl Messenger {
    /// Start a messenger for `config.module_name()` on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: MessagingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let registry = Arc::new(Registry::start(config, transport.as_ref())?);
        let client = RpcClient::new(transport);
        let bindings = Bindings::new(Arc::clone(&registry), client.clone());

        Ok(Self {
            registry,
            client,
            bindings,
        })
    }

    pub fn module_name(&self) -> &str {
        self.registry.module_name()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Publish a method under this context's module name.
    pub fn publish(
        &self,
        method_name: &str,
        method: impl PublishedMethod,
        options: PublishOptions,
    ) -> Result<PublicationHandle> {
        self.registry.publish(method_name, method, options)
    }

    /// Call a method published by another context.
    pub async fn call_method(
        &self,
        module_name: &str,
        method_name: &str,
        params: Value,
    ) -> Result<Value> {
        self.client.call_method(module_name, method_name, params).await
    }

    /// Subscribe to a subscribable method published by another context.
    pub async fn subscribe(
        &self,
        module_name: &str,
        method_name: &str,
        params: Value,
    ) -> Result<Subscription> {
        self.client.subscribe(module_name, method_name, params).await
    }

    /// Publish `scope.<variable>` for binding by other contexts.
    pub fn publish_variable(&self, scope: &Scope, variable: &str) -> Result<PublicationHandle> {
        self.bindings.publish_variable(scope, variable)
    }

    /// Bind a variable published by `module_name`.
    pub fn bind_variable(&self, module_name: &str, host_variable: &str) -> BindRequest {
        self.bindings.bind_variable(module_name, host_variable)
    }
}
