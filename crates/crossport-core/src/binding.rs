//! Two-way variable binding.
//!
//! A host context publishes a variable as a pair of methods,
//! `__cm_get_<var>` (subscribable) and `__cm_set_<var>`. A client context
//! binds one of its own variables to it:
//!
//! - remote to local: every value pushed by the getter subscription is
//!   written into the local variable;
//! - local to remote: once the first remote value has been applied, local
//!   changes are sent to the setter, fire-and-forget.
//!
//! The binding future resolves with the first non-null remote value. The
//! synchronisation itself outlives the future and runs until the
//! subscription ends.

use crate::client::{Notification, RpcClient};
use crate::config::BindingConfig;
use crate::latch::Latch;
use crate::registry::{sync_method, PublicationHandle, PublishOptions, Registry};
use crate::scope::Scope;
use crate::{CrossportError, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Publishes and binds variables on top of a registry and a client.
#[derive(Debug, Clone)]
pub struct Bindings {
    registry: Arc<Registry>,
    client: RpcClient,
}

impl Bindings {
    pub fn new(registry: Arc<Registry>, client: RpcClient) -> Self {
        Self { registry, client }
    }

    /// Publish `scope.<variable>` so other contexts can bind to it.
    ///
    /// Returns the getter publication, which pushes every change of the
    /// variable to its subscribers.
    pub fn publish_variable(&self, scope: &Scope, variable: &str) -> Result<PublicationHandle> {
        let changes = scope.watch(variable)?;

        let getter_scope = scope.clone();
        let getter_variable = variable.to_string();
        let getter = self.registry.publish(
            &BindingConfig::getter_name(variable),
            sync_method(move |_| Ok(getter_scope.get(&getter_variable).unwrap_or(Value::Null))),
            PublishOptions::subscribable(),
        )?;

        let setter_scope = scope.clone();
        let setter_variable = variable.to_string();
        self.registry.publish(
            &BindingConfig::setter_name(variable),
            sync_method(move |value| {
                setter_scope
                    .set(&setter_variable, value)
                    .map(|_| Value::Null)
                    .map_err(|e| Value::String(e.to_string()))
            }),
            PublishOptions::default(),
        )?;

        getter.watch_changes(changes);
        Ok(getter)
    }

    /// Start binding `module_name`'s published `host_variable`.
    pub fn bind_variable(&self, module_name: &str, host_variable: &str) -> BindRequest {
        BindRequest {
            client: self.client.clone(),
            module_name: module_name.to_string(),
            host_variable: host_variable.to_string(),
        }
    }
}

/// A binding waiting for its local side.
#[derive(Debug)]
pub struct BindRequest {
    client: RpcClient,
    module_name: String,
    host_variable: String,
}

impl BindRequest {
    /// Bind to `scope.<local_variable>`.
    ///
    /// Fails immediately if the scope has no such variable.
    pub fn to(self, scope: &Scope, local_variable: &str) -> Result<Binding> {
        let getter = scope.watch(local_variable)?;
        let scope = scope.clone();
        let local_variable = local_variable.to_string();

        Ok(self.to_accessors(getter, move |value| {
            if let Err(e) = scope.set(&local_variable, value) {
                warn!("Binding could not assign {}: {}", local_variable, e);
            }
        }))
    }

    /// Bind to an arbitrary local value.
    ///
    /// `getter` observes the local value; `setter` assigns it. Must be
    /// called from within a tokio runtime.
    pub fn to_accessors<S>(self, getter: watch::Receiver<Value>, setter: S) -> Binding
    where
        S: Fn(Value) + Send + Sync + 'static,
    {
        let channel = crate::protocol::channel_name(
            &self.module_name,
            &BindingConfig::getter_name(&self.host_variable),
        );
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(self.run(getter, setter, ready_tx));

        Binding {
            channel,
            ready: ready_rx,
        }
    }

    async fn run<S>(
        self,
        getter: watch::Receiver<Value>,
        setter: S,
        ready_tx: oneshot::Sender<Result<Value>>,
    ) where
        S: Fn(Value) + Send + Sync + 'static,
    {
        let mut ready_tx = Some(ready_tx);
        let mut getter = Some(getter);
        let settled = Latch::new();
        let attached = Latch::new();
        let last_remote = Arc::new(Mutex::new(Value::Null));
        let mut echo_task = None;

        let getter_name = BindingConfig::getter_name(&self.host_variable);
        let mut subscription = match self
            .client
            .subscribe(&self.module_name, &getter_name, Value::Null)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                settle(&settled, &mut ready_tx, Err(e));
                return;
            }
        };

        loop {
            match subscription.next().await {
                Notification::Value(value) => {
                    {
                        // Held across the local write; the echo task compares under it.
                        let mut last = last_remote.lock().unwrap_or_else(PoisonError::into_inner);
                        *last = value.clone();
                        setter(value.clone());
                    }

                    if attached.fire() {
                        echo_task = getter
                            .take()
                            .map(|getter| self.spawn_echo(getter, Arc::clone(&last_remote)));
                    }

                    if !value.is_null() {
                        settle(&settled, &mut ready_tx, Ok(value));
                    }
                }
                Notification::Error(e) => {
                    if !settle(&settled, &mut ready_tx, Err(e)) {
                        debug!("Binding {} ended", subscription.name());
                    }
                    break;
                }
                Notification::End => break,
            }
        }

        if let Some(task) = echo_task {
            task.abort();
        }
    }

    /// Forward local changes to the host's setter.
    fn spawn_echo(
        &self,
        mut getter: watch::Receiver<Value>,
        last_remote: Arc<Mutex<Value>>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let module_name = self.module_name.clone();
        let setter_name = BindingConfig::setter_name(&self.host_variable);

        // Whatever the local side held before now is not echoed.
        getter.borrow_and_update();

        tokio::spawn(async move {
            while getter.changed().await.is_ok() {
                let value = {
                    let last = last_remote.lock().unwrap_or_else(PoisonError::into_inner);
                    let value = getter.borrow_and_update().clone();
                    if *last == value {
                        continue;
                    }
                    value
                };

                let client = client.clone();
                let module_name = module_name.clone();
                let setter_name = setter_name.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.call_method(&module_name, &setter_name, value).await {
                        debug!("{}.{} failed: {}", module_name, setter_name, e);
                    }
                });
            }
        })
    }
}

/// Deliver the binding outcome if it has not been delivered yet.
fn settle(
    settled: &Latch,
    ready_tx: &mut Option<oneshot::Sender<Result<Value>>>,
    outcome: Result<Value>,
) -> bool {
    if !settled.fire() {
        return false;
    }
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(outcome);
    }
    true
}

/// Future resolving once the bound variable holds a non-null remote value.
#[derive(Debug)]
pub struct Binding {
    channel: String,
    ready: oneshot::Receiver<Result<Value>>,
}

impl Binding {
    /// Name of the getter channel this binding subscribes to.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Future for Binding {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.ready).poll(cx));
        Poll::Ready(outcome.unwrap_or_else(|_| {
            Err(CrossportError::channel_unavailable(
                &self.channel,
                "binding ended before a value arrived",
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;
    use crate::transport::MemoryHub;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn bindings(hub: &MemoryHub, module: &str) -> Bindings {
        let transport = Arc::new(hub.endpoint(module));
        let registry = Registry::start(MessagingConfig::new(module).unwrap(), transport.as_ref())
            .unwrap();
        Bindings::new(Arc::new(registry), RpcClient::new(transport))
    }

    #[tokio::test]
    async fn test_publish_variable_exposes_getter_and_setter() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let scope = Scope::new();
        scope.declare("count", json!(1));

        let getter = host.publish_variable(&scope, "count").unwrap();
        assert_eq!(getter.key(), "Host.__cm_get_count");
        assert!(getter.is_subscribable());

        let client = RpcClient::new(Arc::new(hub.endpoint("Caller")));
        let value = client
            .call_method("Host", "__cm_get_count", Value::Null)
            .await
            .unwrap();
        assert_eq!(value, json!(1));

        let ack = client
            .call_method("Host", "__cm_set_count", json!(5))
            .await
            .unwrap();
        assert_eq!(ack, Value::Null);
        assert_eq!(scope.get("count"), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_publish_undeclared_variable_fails() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let err = host.publish_variable(&Scope::new(), "nope").unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_bind_to_undeclared_local_fails_synchronously() {
        let hub = MemoryHub::new();
        let client = bindings(&hub, "Client");
        let err = client
            .bind_variable("Host", "user")
            .to(&Scope::new(), "user")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_bind_to_unreachable_host_rejects() {
        let hub = MemoryHub::new();
        let client = bindings(&hub, "Client");
        let local = Scope::new();
        local.declare("user", json!({}));

        let binding = client.bind_variable("Host", "user").to(&local, "user").unwrap();
        assert_eq!(binding.channel(), "Host.__cm_get_user");

        let err = tokio::time::timeout(WAIT, binding).await.unwrap().unwrap_err();
        assert!(err.is_channel_unavailable());
        assert_eq!(local.get("user"), Some(json!({})));
    }

    #[tokio::test]
    async fn test_to_accessors_applies_remote_values() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let client = bindings(&hub, "Client");

        let host_scope = Scope::new();
        host_scope.declare("title", json!("hello"));
        host.publish_variable(&host_scope, "title").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (_local_tx, local_rx) = watch::channel(Value::Null);

        let binding = client
            .bind_variable("Host", "title")
            .to_accessors(local_rx, move |v| sink.lock().unwrap().push(v));

        let value = tokio::time::timeout(WAIT, binding).await.unwrap().unwrap();
        assert_eq!(value, json!("hello"));
        assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);
    }

    #[tokio::test]
    async fn test_remote_rejection_rejects_binding() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let client = bindings(&hub, "Client");

        host.registry
            .publish(
                "__cm_get_broken",
                sync_method(|_| Err(json!("no access"))),
                PublishOptions::subscribable(),
            )
            .unwrap();

        let local = Scope::new();
        local.declare("broken", json!("placeholder"));
        let binding = client.bind_variable("Host", "broken").to(&local, "broken").unwrap();

        let err = tokio::time::timeout(WAIT, binding).await.unwrap().unwrap_err();
        assert_eq!(err.rejection_reason(), Some(&json!("no access")));
        assert_eq!(local.get("broken"), Some(json!("placeholder")));
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_host_shutdown_after_resolution_leaves_local_alone() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let client = bindings(&hub, "Client");

        let host_scope = Scope::new();
        host_scope.declare("x", json!(1));
        let getter = host.publish_variable(&host_scope, "x").unwrap();

        let local = Scope::new();
        local.declare("x", Value::Null);
        let binding = client.bind_variable("Host", "x").to(&local, "x").unwrap();
        assert_eq!(tokio::time::timeout(WAIT, binding).await.unwrap().unwrap(), json!(1));
        assert_eq!(getter.subscriber_count(), 1);

        drop(host);
        assert!(wait_until(|| getter.subscriber_count() == 0).await);

        // The subscription ended; the local copy keeps its value and later
        // edits go nowhere.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(local.get("x"), Some(json!(1)));

        local.set("x", json!(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host_scope.get("x"), Some(json!(1)));
        assert_eq!(local.get("x"), Some(json!(5)));

        // Host-side changes no longer reach the local copy either.
        host_scope.set("x", json!(9)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(local.get("x"), Some(json!(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rapid_host_changes_are_not_reverted_by_echo() {
        let hub = MemoryHub::new();
        let host = bindings(&hub, "Host");
        let client = bindings(&hub, "Client");

        let host_scope = Scope::new();
        host_scope.declare("x", json!(0));
        host.publish_variable(&host_scope, "x").unwrap();

        let local = Scope::new();
        local.declare("x", Value::Null);
        let binding = client.bind_variable("Host", "x").to(&local, "x").unwrap();
        assert_eq!(tokio::time::timeout(WAIT, binding).await.unwrap().unwrap(), json!(0));

        for i in 1..=50 {
            host_scope.set("x", json!(i)).unwrap();
            tokio::task::yield_now().await;
        }

        assert!(wait_until(|| local.get("x") == Some(json!(50))).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(host_scope.get("x"), Some(json!(50)));
        assert_eq!(local.get("x"), Some(json!(50)));
    }
}
