//! RPC client.
//!
//! Every call opens its own channel, sends one request envelope and reads
//! response envelopes back. A plain call settles on the first well-formed
//! response and then disconnects; a subscription yields a notification per
//! `resolved` response until a `rejected` one ends it.
//!
//! Envelopes that do not parse, or carry an unknown status, are logged and
//! skipped. No timeout is applied: a publication that never answers leaves
//! the call pending.

use crate::protocol::{channel_name, Request, Response, ResponseStatus};
use crate::transport::{Channel, Transport};
use crate::{CrossportError, Result};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tracing::{debug, warn};

/// Client for calling methods published by other contexts.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Call `module_name.method_name` once.
    ///
    /// Resolves with the remote value, fails with
    /// [`CrossportError::RemoteRejected`] carrying the remote reason, or with
    /// [`CrossportError::ChannelUnavailable`] if the channel cannot be opened
    /// or closes before answering.
    pub async fn call_method(
        &self,
        module_name: &str,
        method_name: &str,
        params: Value,
    ) -> Result<Value> {
        let mut channel = self
            .open(module_name, method_name, Request::call(params))
            .await?;

        loop {
            let Some(message) = channel.recv().await else {
                return Err(CrossportError::channel_unavailable(
                    channel.name(),
                    "channel closed before a response arrived",
                ));
            };

            match Response::from_value(message) {
                Ok(response) => {
                    debug!("Call {} settled: {:?}", channel.name(), response.status);
                    channel.disconnect();
                    return match response.status {
                        ResponseStatus::Resolved => Ok(response.data),
                        ResponseStatus::Rejected => {
                            Err(CrossportError::RemoteRejected(response.data))
                        }
                    };
                }
                Err(e) => warn!("Discarding envelope on {}: {}", channel.name(), e),
            }
        }
    }

    /// Subscribe to `module_name.method_name`.
    ///
    /// The subscription receives the current value first, then one value per
    /// change on the publishing side.
    pub async fn subscribe(
        &self,
        module_name: &str,
        method_name: &str,
        params: Value,
    ) -> Result<Subscription> {
        let channel = self
            .open(module_name, method_name, Request::watch(params))
            .await?;
        Ok(Subscription::new(channel))
    }

    async fn open(&self, module_name: &str, method_name: &str, request: Request) -> Result<Channel> {
        let name = channel_name(module_name, method_name);
        let channel = self.transport.connect(&name).await?;
        channel.send(request.to_value()?)?;
        Ok(channel)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

/// One event delivered by a [`Subscription`].
#[derive(Debug)]
pub enum Notification {
    /// A new value from the publication.
    Value(Value),
    /// The subscription failed. Nothing else follows.
    Error(CrossportError),
    /// The subscription is over.
    End,
}

/// Live subscription to a published method.
///
/// Dropping it disconnects the channel, which removes it from the
/// publication's subscribers.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    channel: Option<Channel>,
}

impl Subscription {
    fn new(channel: Channel) -> Self {
        Self {
            name: channel.name().to_string(),
            channel: Some(channel),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a terminal notification has already been delivered.
    pub fn is_finished(&self) -> bool {
        self.channel.is_none()
    }

    /// Wait for the next notification.
    pub async fn next(&mut self) -> Notification {
        std::future::poll_fn(|cx| self.poll_notification(cx)).await
    }

    pub fn poll_notification(&mut self, cx: &mut Context<'_>) -> Poll<Notification> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return Poll::Ready(Notification::End);
            };

            let Some(message) = ready!(channel.poll_recv(cx)) else {
                self.channel = None;
                return Poll::Ready(Notification::Error(CrossportError::channel_unavailable(
                    &self.name,
                    "channel disconnected",
                )));
            };

            match Response::from_value(message) {
                Ok(Response {
                    status: ResponseStatus::Resolved,
                    data,
                }) => return Poll::Ready(Notification::Value(data)),
                Ok(Response {
                    status: ResponseStatus::Rejected,
                    data,
                }) => {
                    self.channel = None;
                    return Poll::Ready(Notification::Error(CrossportError::RemoteRejected(data)));
                }
                Err(e) => warn!("Discarding envelope on {}: {}", self.name, e),
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(match ready!(self.get_mut().poll_notification(cx)) {
            Notification::Value(value) => Some(Ok(value)),
            Notification::Error(e) => Some(Err(e)),
            Notification::End => None,
        })
    }
}
