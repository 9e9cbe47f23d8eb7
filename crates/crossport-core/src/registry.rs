//! Publication registry.
//!
//! Exposes local methods under `"<module>.<method>"` channel names. The
//! registry owns the transport's single listener and hands each inbound
//! channel to the publication whose name matches it byte for byte; channels
//! matching nothing are disconnected.
//!
//! # Thread Safety
//!
//! Each accepted channel is served by its own task. A publication's
//! subscriber list sits behind a mutex owned by the publication, so fan-out
//! and disconnect cleanup from different tasks are serialized. Evaluating a
//! subscribable method and sending its result happen under one async lock,
//! so a watch call's initial value never overtakes a later change.

use crate::config::MessagingConfig;
use crate::protocol::{channel_name, Request, Response};
use crate::transport::{Channel, ChannelSender, Incoming, Transport};
use crate::{CrossportError, Result};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of a published method: a value, or the rejection reason.
pub type MethodResult = std::result::Result<Value, Value>;

/// A locally owned method that can be published.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = MethodResult>`;
/// wrap synchronous functions with [`sync_method`].
#[async_trait::async_trait]
pub trait PublishedMethod: Send + Sync + 'static {
    async fn invoke(&self, params: Value) -> MethodResult;
}

#[async_trait::async_trait]
impl<F, Fut> PublishedMethod for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    async fn invoke(&self, params: Value) -> MethodResult {
        (self)(params).await
    }
}

/// Adapter publishing a synchronous function.
pub struct SyncMethod<F>(F);

/// Publish a synchronous `Fn(Value) -> MethodResult`.
pub fn sync_method<F>(f: F) -> SyncMethod<F>
where
    F: Fn(Value) -> MethodResult + Send + Sync + 'static,
{
    SyncMethod(f)
}

#[async_trait::async_trait]
impl<F> PublishedMethod for SyncMethod<F>
where
    F: Fn(Value) -> MethodResult + Send + Sync + 'static,
{
    async fn invoke(&self, params: Value) -> MethodResult {
        (self.0)(params)
    }
}

/// Options for [`Registry::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Keep watch callers as subscribers and push every change to them.
    ///
    /// A subscribable method is always invoked without parameters.
    pub can_subscribe: bool,
}

impl PublishOptions {
    pub fn subscribable() -> Self {
        Self {
            can_subscribe: true,
        }
    }
}

/// A published method.
pub struct Publication {
    key: String,
    method_name: String,
    method: Arc<dyn PublishedMethod>,
    subscribers: Option<Mutex<Vec<ChannelSender>>>,
    /// Held from evaluation to send, so subscribers see values in the order
    /// they were read.
    delivery: tokio::sync::Mutex<()>,
}

/// Shared handle to a publication.
pub type PublicationHandle = Arc<Publication>;

impl Publication {
    fn new(
        module_name: &str,
        method_name: &str,
        method: Arc<dyn PublishedMethod>,
        options: PublishOptions,
    ) -> Self {
        Self {
            key: channel_name(module_name, method_name),
            method_name: method_name.to_string(),
            method,
            subscribers: options.can_subscribe.then(|| Mutex::new(Vec::new())),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    /// The channel name this publication answers.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn is_subscribable(&self) -> bool {
        self.subscribers.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .as_ref()
            .map(|subs| subs.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Serve every request arriving on an accepted channel, until the peer
    /// disconnects or the registry shuts down.
    async fn serve(self: Arc<Self>, mut channel: Channel, mut shutdown: watch::Receiver<bool>) {
        let sender = channel.sender();

        loop {
            let message = tokio::select! {
                message = channel.recv() => message,
                _ = shutdown.changed() => None,
            };
            let Some(message) = message else {
                break;
            };

            let request = match Request::from_value(message) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Discarding request on {}: {}", self.key, e);
                    Self::notify_client(&sender, Err(Value::String(e.to_string())));
                    continue;
                }
            };

            if self.is_subscribable() {
                let _delivery = self.delivery.lock().await;
                if request.watch {
                    self.add_subscriber(&sender);
                }
                let outcome = self.invoke(Value::Null).await;
                Self::notify_client(&sender, outcome);
            } else {
                let outcome = self.invoke(request.params).await;
                Self::notify_client(&sender, outcome);
            }
        }

        // Drop every handle on the peer so it observes the disconnect.
        self.remove_subscriber(sender.id());
        debug!("Channel {} ({}) finished", self.key, sender.id());
    }

    /// Run the method, turning a panic into a rejection.
    async fn invoke(&self, params: Value) -> MethodResult {
        match AssertUnwindSafe(self.method.invoke(params))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!("Method {} panicked: {}", self.key, reason);
                Err(Value::String(reason))
            }
        }
    }

    fn add_subscriber(&self, sender: &ChannelSender) {
        let Some(subscribers) = self.subscribers.as_ref() else {
            return;
        };

        let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subs.iter().any(|s| s.id() == sender.id()) {
            return;
        }
        subs.push(sender.clone());
        debug!("Subscriber {} added to {}", sender.id(), self.key);
    }

    fn remove_subscriber(&self, id: u64) {
        let Some(subscribers) = self.subscribers.as_ref() else {
            return;
        };
        let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id() != id);
        if subs.len() != before {
            debug!("Subscriber {} removed from {}", id, self.key);
        }
    }

    fn snapshot_subscribers(&self) -> Vec<ChannelSender> {
        self.subscribers
            .as_ref()
            .map(|subs| subs.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    /// Send one response envelope for a method outcome.
    ///
    /// Never fails: a send to a vanished peer is only logged.
    fn notify_client(sender: &ChannelSender, outcome: MethodResult) {
        let envelope = match Response::from_outcome(outcome).to_value() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Could not encode response on {}: {}", sender.name(), e);
                return;
            }
        };

        if let Err(e) = sender.send(envelope) {
            debug!("Response on {} not delivered: {}", sender.name(), e);
        }
    }

    /// Push `value` to every current subscriber.
    pub fn notify_subscribers(&self, value: Value) {
        self.fan_out(Ok(value));
    }

    fn fan_out(&self, outcome: MethodResult) {
        for subscriber in self.snapshot_subscribers() {
            Self::notify_client(&subscriber, outcome.clone());
        }
    }

    /// Re-evaluate the method and push the result to every subscriber.
    ///
    /// This is what the host calls when the observed value changes.
    pub async fn notify_changed(&self) {
        if !self.is_subscribable() {
            return;
        }
        let _delivery = self.delivery.lock().await;
        let outcome = self.invoke(Value::Null).await;
        self.fan_out(outcome);
    }

    /// Call [`Publication::notify_changed`] on every change seen by `changes`.
    ///
    /// The task ends when the watched value's owner goes away.
    pub fn watch_changes(
        self: &Arc<Self>,
        mut changes: watch::Receiver<Value>,
    ) -> tokio::task::JoinHandle<()> {
        let publication = Arc::clone(self);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                publication.notify_changed().await;
            }
            debug!("Change feed for {} closed", publication.key);
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "method panicked".to_string())
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("key", &self.key)
            .field("subscribable", &self.is_subscribable())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

struct RegistryInner {
    config: MessagingConfig,
    publications: RwLock<HashMap<String, PublicationHandle>>,
}

/// Registry of the methods this context publishes.
///
/// Dropping the registry stops answering and closes every served channel.
pub struct Registry {
    inner: Arc<RegistryInner>,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Registry {
    /// Take the transport's listener and start dispatching channels.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: MessagingConfig, transport: &dyn Transport) -> Result<Self> {
        let incoming = transport.listen()?;
        let inner = Arc::new(RegistryInner {
            config,
            publications: RwLock::new(HashMap::new()),
        });

        info!(
            "Publication registry listening for module {}",
            inner.config.module_name()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(Self::dispatch_loop(
            Arc::clone(&inner),
            incoming,
            shutdown_rx,
        ));

        Ok(Self {
            inner,
            shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    pub fn module_name(&self) -> &str {
        self.inner.config.module_name()
    }

    /// Publish `method` as `"<module>.<method_name>"`.
    pub fn publish(
        &self,
        method_name: &str,
        method: impl PublishedMethod,
        options: PublishOptions,
    ) -> Result<PublicationHandle> {
        if method_name.is_empty() {
            return Err(CrossportError::configuration("method name must not be empty"));
        }

        let publication = Arc::new(Publication::new(
            self.module_name(),
            method_name,
            Arc::new(method),
            options,
        ));

        let mut publications = self
            .inner
            .publications
            .write()
            .map_err(|_| CrossportError::Other("registry lock poisoned".to_string()))?;

        if publications.contains_key(publication.key()) {
            return Err(CrossportError::configuration(format!(
                "{} is already published",
                publication.key()
            )));
        }

        publications.insert(publication.key().to_string(), Arc::clone(&publication));
        info!(
            "Published {} (subscribable: {})",
            publication.key(),
            options.can_subscribe
        );

        Ok(publication)
    }

    /// Look up a publication by method name.
    pub fn publication(&self, method_name: &str) -> Option<PublicationHandle> {
        let key = channel_name(self.module_name(), method_name);
        self.inner
            .publications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Channel names of every publication, sorted.
    pub fn published(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .publications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn dispatch_loop(
        inner: Arc<RegistryInner>,
        mut incoming: Incoming,
        shutdown: watch::Receiver<bool>,
    ) {
        while let Some(channel) = incoming.next().await {
            let publication = inner
                .publications
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(channel.name())
                .cloned();

            match publication {
                Some(publication) => {
                    debug!("Channel {} ({}) accepted", channel.name(), channel.id());
                    tokio::spawn(publication.serve(channel, shutdown.clone()));
                }
                None => {
                    debug!("No publication named {}; disconnecting", channel.name());
                    channel.disconnect();
                }
            }
        }

        info!(
            "Transport stopped delivering channels for {}",
            inner.config.module_name()
        );
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("module_name", &self.module_name())
            .field("published", &self.published())
            .finish()
    }
}
