//! Moving envelopes between buses.
//!
//! [`Transport`] is the seam the [`Bus`](crate::bus::Bus) talks to.
//! [`BrokerTransport`] implements it on top of a [`Broker`]: a bus binds one on
//! its own endpoint and connects one to every remote endpoint it calls.
//!
//! Channel layout on a broker:
//!
//! | channel | kind | content |
//! |---|---|---|
//! | `requests` | list | requests, pings and subscription control messages |
//! | `response:<id>` | list, with TTL | the single reply to request `<id>` |
//! | event topic | pub/sub | events fired by objects hosted on that bus |

use crate::broker::{Broker, BrokerClient};
use crate::config::BusConfig;
use crate::protocol::{Args, Event, Message, MessageId};
use crate::url::Endpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub const REQUESTS_CHANNEL: &str = "requests";
const RESPONSE_CHANNEL_PREFIX: &str = "response:";

pub fn response_channel(id: MessageId) -> String {
    format!("{}{}", RESPONSE_CHANNEL_PREFIX, id)
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address {0} is already in use")]
    AddrInUse(String),
    #[error("cannot reach {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("transport is closed")]
    Closed,
    #[error("transport for {0} is not bound")]
    NotBound(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether this is a connection-kind failure (bind collision, unreachable
    /// broker, closed transport), as opposed to a malformed message.
    pub fn is_connection(&self) -> bool {
        !matches!(self, TransportError::Codec(_) | TransportError::Broker(_))
    }
}

/// Stable name of a subscribed callback. Subscribing twice under the same id
/// is a no-op, unsubscribing removes exactly that registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallbackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub type CallbackFn = dyn Fn(&Args) + Send + Sync;

/// A local event handler and the id it is registered under.
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    func: Arc<CallbackFn>,
}

impl Callback {
    pub fn new(id: impl Into<CallbackId>, func: impl Fn(&Args) + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            func: Arc::new(func),
        }
    }

    pub fn id(&self) -> &CallbackId {
        &self.id
    }

    /// The same function registered under another id.
    pub fn with_id(&self, id: impl Into<CallbackId>) -> Self {
        Self {
            id: id.into(),
            func: Arc::clone(&self.func),
        }
    }

    /// Run the callback. A panic is logged and reported as `false`.
    pub fn invoke(&self, args: &Args) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(args))) {
            Ok(()) => true,
            Err(cause) => {
                error!(callback = %self.id, cause = panic_message(&cause), "event callback panicked");
                false
            }
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

pub(crate) fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Serve the endpoint. Idempotent; fails with `AddrInUse` when another
    /// process already serves it.
    async fn bind(&self) -> Result<(), TransportError>;

    /// Open (or reopen) the connection to the endpoint. Idempotent.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Liveness of the remote broker. Never fails, an unreachable broker is `false`.
    async fn ping(&self) -> bool;

    /// Queue a message on the endpoint's request channel.
    async fn send_request(&self, message: &Message) -> Result<(), TransportError>;

    /// Next inbound message on a bound endpoint, `None` after `timeout`.
    /// Without a timeout, waits until one arrives.
    async fn recv_request(&self, timeout: Option<Duration>)
        -> Result<Option<Message>, TransportError>;

    /// Queue the reply to request `id` on a bound endpoint.
    async fn send_response(&self, id: MessageId, reply: &Message) -> Result<(), TransportError>;

    /// Wait for the reply to request `id`, `None` after `timeout`.
    async fn recv_response(
        &self,
        id: MessageId,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError>;

    /// Broadcast an event on `topic`. Returns how many connections received it.
    async fn publish(&self, topic: &str, event: &Event) -> Result<usize, TransportError>;

    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str, callback: &CallbackId) -> Result<(), TransportError>;

    /// Release the connection (and the broker, when bound). Safe to repeat.
    async fn close(&self);
}

type Subscriptions = Arc<Mutex<HashMap<String, Vec<Callback>>>>;

pub struct BrokerTransport {
    endpoint: Endpoint,
    config: BusConfig,
    broker: tokio::sync::Mutex<Option<Broker>>,
    client: tokio::sync::Mutex<Option<Arc<BrokerClient>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Subscriptions,
    // serializes subscribe/unsubscribe so broker subscription follows the table
    subscription_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl BrokerTransport {
    pub fn new(endpoint: Endpoint, config: BusConfig) -> Self {
        Self {
            endpoint,
            config,
            broker: tokio::sync::Mutex::new(None),
            client: tokio::sync::Mutex::new(None),
            dispatcher: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            subscription_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_bound(&self) -> bool {
        self.broker.lock().await.is_some()
    }

    pub async fn is_connected(&self) -> bool {
        self.client
            .lock()
            .await
            .as_ref()
            .is_some_and(|client| client.is_alive())
    }

    /// Callback ids registered on `topic`, in registration order.
    pub fn callbacks(&self, topic: &str) -> Vec<CallbackId> {
        self.subscriptions
            .lock()
            .get(topic)
            .map(|callbacks| callbacks.iter().map(|c| c.id().clone()).collect())
            .unwrap_or_default()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn check_bound(&self) -> Result<(), TransportError> {
        if self.is_bound().await {
            Ok(())
        } else {
            Err(TransportError::NotBound(self.endpoint.to_string()))
        }
    }

    /// Live client, reconnecting (and resubscribing) if the last one dropped.
    async fn client(&self) -> Result<Arc<BrokerClient>, TransportError> {
        self.check_open()?;

        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if client.is_alive() {
                return Ok(Arc::clone(client));
            }
            debug!(endpoint = %self.endpoint, "reconnecting to broker");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(
            BrokerClient::connect(&self.endpoint, self.config.connect_timeout(), tx).await?,
        );

        let dispatcher = tokio::spawn(dispatch_events(
            self.endpoint.clone(),
            rx,
            Arc::clone(&self.subscriptions),
        ));
        if let Some(previous) = self.dispatcher.lock().replace(dispatcher) {
            previous.abort();
        }

        let topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        for topic in topics {
            client.subscribe(&topic).await?;
        }

        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Pop from `key` until something arrives or `deadline` passes (never,
    /// when `None`). Brokers cap a single blocking pop, so long waits are
    /// issued as a series of pops of at most `max_blocking_pop`.
    async fn pop_until(
        &self,
        client: &BrokerClient,
        key: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, TransportError> {
        let slice = self.config.max_blocking_pop();
        let mut attempted = false;
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() && attempted {
                        return Ok(None);
                    }
                    remaining.min(slice)
                }
                None => slice,
            };
            if let Some(payload) = client.pop(key, wait).await? {
                return Ok(Some(payload));
            }
            attempted = true;
        }
    }

    fn decode(&self, payload: &str) -> Option<Message> {
        match Message::decode(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "dropping undecodable message");
                None
            }
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn bind(&self) -> Result<(), TransportError> {
        self.check_open()?;
        {
            let mut broker = self.broker.lock().await;
            if broker.is_none() {
                *broker = Some(Broker::bind(&self.endpoint).await?);
            }
        }
        self.client().await.map(|_| ())
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.client().await.map(|_| ())
    }

    async fn ping(&self) -> bool {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "ping failed");
                return false;
            }
        };
        client.ping(self.config.ping_timeout()).await.unwrap_or(false)
    }

    async fn send_request(&self, message: &Message) -> Result<(), TransportError> {
        let payload = message.encode()?;
        self.client()
            .await?
            .push(REQUESTS_CHANNEL, payload, None)
            .await
    }

    async fn recv_request(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, TransportError> {
        self.check_open()?;
        self.check_bound().await?;
        let client = self.client().await?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let payload = self.pop_until(&client, REQUESTS_CHANNEL, deadline).await?;
        Ok(payload.and_then(|payload| self.decode(&payload)))
    }

    async fn send_response(&self, id: MessageId, reply: &Message) -> Result<(), TransportError> {
        self.check_open()?;
        self.check_bound().await?;
        let payload = reply.encode()?;
        self.client()
            .await?
            .push(&response_channel(id), payload, Some(self.config.response_ttl()))
            .await
    }

    async fn recv_response(
        &self,
        id: MessageId,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        let deadline = Instant::now() + timeout;
        let client = self.client().await?;
        let payload = self
            .pop_until(&client, &response_channel(id), Some(deadline))
            .await?;
        Ok(payload.and_then(|payload| self.decode(&payload)))
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<usize, TransportError> {
        let payload = Message::Event(event.clone()).encode()?;
        self.client().await?.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> Result<(), TransportError> {
        self.check_open()?;
        let _gate = self.subscription_gate.lock().await;

        let first = {
            let mut subscriptions = self.subscriptions.lock();
            let callbacks = subscriptions.entry(topic.to_string()).or_default();
            if callbacks.iter().any(|c| c.id() == callback.id()) {
                return Ok(());
            }
            callbacks.push(callback.clone());
            callbacks.len() == 1
        };

        if first {
            let subscribed = match self.client().await {
                Ok(client) => client.subscribe(topic).await,
                Err(e) => Err(e),
            };
            if let Err(e) = subscribed {
                let mut subscriptions = self.subscriptions.lock();
                if let Some(callbacks) = subscriptions.get_mut(topic) {
                    callbacks.retain(|c| c.id() != callback.id());
                    if callbacks.is_empty() {
                        subscriptions.remove(topic);
                    }
                }
                return Err(e);
            }
            debug!(endpoint = %self.endpoint, topic, "subscribed to topic");
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, callback: &CallbackId) -> Result<(), TransportError> {
        self.check_open()?;
        let _gate = self.subscription_gate.lock().await;

        let last = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(callbacks) = subscriptions.get_mut(topic) else {
                return Ok(());
            };
            let before = callbacks.len();
            callbacks.retain(|c| c.id() != callback);
            if callbacks.len() == before {
                return Ok(());
            }
            if callbacks.is_empty() {
                subscriptions.remove(topic);
                true
            } else {
                false
            }
        };

        if last {
            // a dropped connection already lost its broker subscriptions
            let client = self.client.lock().await.clone();
            if let Some(client) = client.filter(|client| client.is_alive()) {
                client.unsubscribe(topic).await?;
                debug!(endpoint = %self.endpoint, topic, "unsubscribed from topic");
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        if let Some(broker) = self.broker.lock().await.take() {
            broker.shutdown();
        }
        self.subscriptions.lock().clear();
        debug!(endpoint = %self.endpoint, "transport closed");
    }
}

/// Deliver events in arrival order. Callbacks run off the async workers so a
/// slow one delays only later events on this connection.
async fn dispatch_events(
    endpoint: Endpoint,
    mut rx: mpsc::UnboundedReceiver<(String, String)>,
    subscriptions: Subscriptions,
) {
    while let Some((topic, payload)) = rx.recv().await {
        let event = match Message::decode(&payload) {
            Ok(Message::Event(event)) => event,
            Ok(other) => {
                warn!(endpoint = %endpoint, topic, kind = other.kind(), "non-event message on topic");
                continue;
            }
            Err(e) => {
                warn!(endpoint = %endpoint, topic, error = %e, "dropping undecodable event");
                continue;
            }
        };

        let callbacks = subscriptions
            .lock()
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            continue;
        }

        let delivered = tokio::task::spawn_blocking(move || {
            for callback in &callbacks {
                callback.invoke(&event.args);
            }
        })
        .await;
        if let Err(e) = delivered {
            error!(endpoint = %endpoint, topic, error = %e, "event dispatch failed");
        }
    }
}
