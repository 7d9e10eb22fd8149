//! The bus: an addressable endpoint hosting objects, calling objects on other
//! buses and fanning events out to remote subscribers.
//!
//! A [`Bus`] owns a bound [`BrokerTransport`] for its own endpoint and a cache
//! of connected transports for the endpoints it talks to. Requests travel to
//! the callee's broker and the callee replies on that same broker, so a bus
//! that only makes calls never needs to bind.
//!
//! ```no_run
//! use skybus::{Args, Bus, BusConfig, Endpoint, ResourceRegistry};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(Bus::new(Endpoint::new("127.0.0.1", 7666), BusConfig::default()));
//! bus.set_resolver(Arc::new(ResourceRegistry::new()));
//!
//! let server = Arc::clone(&bus);
//! tokio::spawn(async move { server.run_forever().await });
//!
//! let me = bus.object_url("Client", None)?;
//! let telescope = "tcp://127.0.0.1:7666/Telescope/0".parse()?;
//! let az = bus.call(&me, &telescope, "get_az", Args::default()).await?;
//! println!("azimuth {}", az);
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::BusConfig;
use crate::protocol::{
    Args, HandlerError, Message, MessageId, Pong, Protocol, RemoteError, Request, Response,
    Subscribe, Unsubscribe,
};
use crate::transport::{
    panic_message, BrokerTransport, Callback, CallbackId, Transport, TransportError,
};
use crate::url::{create_url, Endpoint, Url, UrlError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    Created,
    Bound,
    Running,
    ShuttingDown,
    Closed,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Created => "CREATED",
            BusState::Bound => "BOUND",
            BusState::Running => "RUNNING",
            BusState::ShuttingDown => "SHUTTING_DOWN",
            BusState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid url: {0}")]
    Url(#[from] UrlError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request {id} to {dst} timed out after {timeout:?}")]
    Timeout {
        id: MessageId,
        dst: String,
        timeout: Duration,
    },
    #[error("bus is closed")]
    Closed,
    #[error("bus is already running")]
    AlreadyRunning,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

impl BusError {
    /// Connection-kind failures: the caller may retry once the peer is back.
    pub fn is_connection(&self) -> bool {
        match self {
            BusError::Transport(e) => e.is_connection(),
            BusError::Closed => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}

/// An event name on a publishing object. Query parameters of the publisher
/// url do not take part in the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    publisher: Url,
    event: String,
}

impl EventId {
    pub fn new(publisher: &Url, event: impl Into<String>) -> Self {
        Self {
            publisher: publisher.without_query(),
            event: event.into(),
        }
    }

    pub fn publisher(&self) -> &Url {
        &self.publisher
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Broker channel the events are published on.
    pub fn topic(&self) -> String {
        format!("{}#{}", self.publisher, self.event)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.publisher, self.event)
    }
}

/// A callback registered by the object at `url`. The publisher side keeps
/// these for remote subscribers, the subscriber side for its own callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub url: Url,
    pub callback: CallbackId,
}

impl Subscriber {
    pub fn new(url: &Url, callback: &CallbackId) -> Self {
        Self {
            url: url.clone(),
            callback: callback.clone(),
        }
    }

    // one transport registration per (sub, callback), several may share a topic
    fn transport_id(&self) -> CallbackId {
        CallbackId::new(format!("{}#{}", self.url, self.callback))
    }
}

pub type Handler = Arc<dyn Fn(&Args) -> Result<Value, HandlerError> + Send + Sync>;

/// Outcome of looking up `(object path, method)`.
pub enum Resolution {
    ObjectNotFound,
    MethodNotFound,
    Found(Handler),
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::ObjectNotFound => f.write_str("ObjectNotFound"),
            Resolution::MethodNotFound => f.write_str("MethodNotFound"),
            Resolution::Found(_) => f.write_str("Found(..)"),
        }
    }
}

/// Maps inbound requests onto hosted objects.
pub trait Resolver: Send + Sync {
    /// `path` is the object path (`/Class/name`) of the request target.
    fn resolve(&self, path: &str, method: &str) -> Resolution;
}

struct NoObjects;

impl Resolver for NoObjects {
    fn resolve(&self, _path: &str, _method: &str) -> Resolution {
        Resolution::ObjectNotFound
    }
}

#[derive(Default)]
struct Tables {
    // subscriber side: our own callbacks, per event
    callbacks: HashMap<EventId, Vec<(Subscriber, Callback)>>,
    // publisher side: remote subscribers of events we publish
    subscribers: HashMap<EventId, Vec<Subscriber>>,
}

pub struct Bus {
    endpoint: Endpoint,
    config: BusConfig,
    inbound: Arc<BrokerTransport>,
    outbound: DashMap<Endpoint, Arc<BrokerTransport>>,
    resolver: RwLock<Arc<dyn Resolver>>,
    tables: Mutex<Tables>,
    state: watch::Sender<BusState>,
    workers: Arc<Semaphore>,
}

impl Bus {
    pub fn new(endpoint: Endpoint, config: BusConfig) -> Self {
        let (state, _) = watch::channel(BusState::Created);
        Self {
            inbound: Arc::new(BrokerTransport::new(endpoint.clone(), config.clone())),
            outbound: DashMap::new(),
            resolver: RwLock::new(Arc::new(NoObjects)),
            tables: Mutex::new(Tables::default()),
            workers: Arc::new(Semaphore::new(config.max_workers())),
            state,
            endpoint,
            config,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> BusState {
        *self.state.borrow()
    }

    /// Url for an object hosted on this bus; a missing name gets a random one.
    pub fn object_url(&self, cls: &str, name: Option<&str>) -> Result<Url, UrlError> {
        create_url(&self.endpoint, cls, name)
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.resolver.write() = resolver;
    }

    fn check_open(&self) -> Result<(), BusError> {
        if self.state() == BusState::Closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Bind the bus's own broker. Idempotent.
    pub async fn bind(&self) -> Result<(), BusError> {
        self.check_open()?;
        self.inbound.bind().await?;
        self.state.send_if_modified(|state| {
            if *state == BusState::Created {
                *state = BusState::Bound;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Transport to `endpoint`; our own endpoint is bound first.
    async fn transport_for(&self, endpoint: &Endpoint) -> Result<Arc<BrokerTransport>, BusError> {
        self.check_open()?;

        if *endpoint == self.endpoint {
            self.bind().await?;
            return Ok(Arc::clone(&self.inbound));
        }
        self.outbound_transport(endpoint).await
    }

    /// Like [`Bus::transport_for`] but never binds: our own endpoint is only
    /// reachable when something already serves it.
    async fn connected_transport(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<BrokerTransport>, BusError> {
        self.check_open()?;

        if *endpoint == self.endpoint {
            self.inbound.connect().await?;
            return Ok(Arc::clone(&self.inbound));
        }
        self.outbound_transport(endpoint).await
    }

    async fn outbound_transport(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<BrokerTransport>, BusError> {
        let cached = self.outbound.get(endpoint).map(|t| Arc::clone(t.value()));
        if let Some(transport) = cached {
            transport.connect().await?;
            return Ok(transport);
        }

        let transport = Arc::new(BrokerTransport::new(endpoint.clone(), self.config.clone()));
        transport.connect().await?;

        let winner = match self.outbound.entry(endpoint.clone()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&transport));
                None
            }
        };
        match winner {
            Some(existing) => {
                transport.close().await;
                Ok(existing)
            }
            None => {
                debug!(endpoint = %endpoint, "opened connection");
                Ok(transport)
            }
        }
    }

    /// Liveness check of the bus hosting `dst`. `None` when it does not answer
    /// within the ping timeout, including when nothing was ever bound there.
    pub async fn ping(&self, src: &Url, dst: &Url) -> Option<Pong> {
        let timeout = self.config.ping_timeout();
        let exchange = async {
            let transport = match self.connected_transport(dst.endpoint()).await {
                Ok(transport) => transport,
                Err(e) => {
                    debug!(dst = %dst, error = %e, "ping failed");
                    return None;
                }
            };

            let ping = Protocol::ping(src, dst);
            if let Err(e) = transport.send_request(&ping.clone().into()).await {
                debug!(dst = %dst, error = %e, "ping failed");
                return None;
            }

            match transport.recv_response(ping.id, timeout).await {
                Ok(Some(Message::Pong(pong))) => Some(pong),
                Ok(Some(other)) => {
                    warn!(dst = %dst, kind = other.kind(), "unexpected reply to ping");
                    None
                }
                Ok(None) => None,
                Err(e) => {
                    debug!(dst = %dst, error = %e, "ping failed");
                    None
                }
            }
        };

        time::timeout(timeout, exchange).await.ok().flatten()
    }

    /// Call `method` on `dst` and wait for the response.
    ///
    /// 404 and 500 responses are `Ok`: inspect [`Response::code`] or use
    /// [`Bus::call`]. A timeout does not mean the method did not run.
    pub async fn request(
        &self,
        src: &Url,
        dst: &Url,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Response, BusError> {
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        let transport = self.transport_for(dst.endpoint()).await?;

        let request = Protocol::request(src, dst, method, args);
        debug!(id = %request.id, dst = %dst, method, "sending request");
        transport.send_request(&request.clone().into()).await?;

        match transport.recv_response(request.id, timeout).await? {
            Some(Message::Response(response)) if response.id == request.id => Ok(response),
            Some(other) => {
                warn!(id = %request.id, kind = other.kind(), "dropping mismatched reply");
                Err(BusError::Transport(TransportError::Broker(format!(
                    "unexpected {} on response channel of {}",
                    other.kind(),
                    request.id
                ))))
            }
            None => {
                debug!(id = %request.id, dst = %dst, method, "request timed out");
                Err(BusError::Timeout {
                    id: request.id,
                    dst: dst.to_string(),
                    timeout,
                })
            }
        }
    }

    /// [`Bus::request`] with the default timeout, unwrapped into the result value.
    pub async fn call(
        &self,
        src: &Url,
        dst: &Url,
        method: &str,
        args: Args,
    ) -> Result<Value, BusError> {
        let response = self.request(src, dst, method, args, None).await?;
        let not_found = response.is_not_found();
        response.into_result().map_err(|error| {
            if not_found {
                BusError::NotFound(error.message)
            } else {
                BusError::Remote(error)
            }
        })
    }

    /// Fire `event` from `publisher`. Nothing is sent when nobody subscribed.
    /// Returns how many subscribing buses received it.
    pub async fn publish(
        &self,
        publisher: &Url,
        event: &str,
        args: Args,
    ) -> Result<usize, BusError> {
        self.check_open()?;
        let event_id = EventId::new(publisher, event);
        let subscribed = self
            .tables
            .lock()
            .subscribers
            .get(&event_id)
            .is_some_and(|subscribers| !subscribers.is_empty());
        if !subscribed {
            return Ok(0);
        }

        let transport = self.transport_for(publisher.endpoint()).await?;
        let event = Protocol::event(publisher, event, args);
        let receivers = transport.publish(&event_id.topic(), &event).await?;
        debug!(event = %event_id, receivers, "published event");
        Ok(receivers)
    }

    /// Have `callback` invoked for every `event` fired by `publisher`, on
    /// behalf of the object at `sub`. Subscribing the same `(sub, callback id)`
    /// again is a no-op.
    pub async fn subscribe(
        &self,
        sub: &Url,
        publisher: &Url,
        event: &str,
        callback: Callback,
    ) -> Result<(), BusError> {
        self.check_open()?;
        let event_id = EventId::new(publisher, event);
        let subscriber = Subscriber::new(sub, callback.id());

        {
            let mut tables = self.tables.lock();
            let callbacks = tables.callbacks.entry(event_id.clone()).or_default();
            if callbacks.iter().any(|(s, _)| *s == subscriber) {
                return Ok(());
            }
            callbacks.push((subscriber.clone(), callback.clone()));
        }

        let mut transport = None;
        let result = self
            .subscribe_remote(&subscriber, &event_id, &callback, &mut transport)
            .await;

        if let Err(e) = result {
            warn!(event = %event_id, callback = %callback.id(), error = %e, "subscribe failed, rolling back");
            self.forget_callback(&event_id, &subscriber);
            if let Some(transport) = transport {
                let topic = event_id.topic();
                if let Err(e) = transport.unsubscribe(&topic, &subscriber.transport_id()).await {
                    debug!(event = %event_id, error = %e, "rollback unsubscribe failed");
                }
            }
            return Err(e);
        }

        debug!(event = %event_id, sub = %sub, callback = %callback.id(), "subscribed");
        Ok(())
    }

    async fn subscribe_remote(
        &self,
        subscriber: &Subscriber,
        event_id: &EventId,
        callback: &Callback,
        used: &mut Option<Arc<BrokerTransport>>,
    ) -> Result<(), BusError> {
        let transport = self.transport_for(event_id.publisher().endpoint()).await?;
        transport
            .subscribe(&event_id.topic(), callback.with_id(subscriber.transport_id()))
            .await?;
        *used = Some(Arc::clone(&transport));

        let control = Protocol::subscribe(
            &subscriber.url,
            event_id.publisher(),
            event_id.event(),
            subscriber.callback.as_str(),
        );
        if event_id.publisher().endpoint() == &self.endpoint {
            self.add_subscriber(&control);
        } else {
            transport.send_request(&Message::Subscribe(control)).await?;
        }
        Ok(())
    }

    /// Remove the registration made by [`Bus::subscribe`]. Safe to repeat.
    ///
    /// The local registration is dropped only once the publisher was told, so
    /// a failed unsubscribe can be retried.
    pub async fn unsubscribe(
        &self,
        sub: &Url,
        publisher: &Url,
        event: &str,
        callback: &CallbackId,
    ) -> Result<(), BusError> {
        self.check_open()?;
        let event_id = EventId::new(publisher, event);
        let subscriber = Subscriber::new(sub, callback);
        if !self.is_registered(&event_id, &subscriber) {
            return Ok(());
        }

        let transport = self.transport_for(publisher.endpoint()).await?;
        let control = Protocol::unsubscribe(sub, event_id.publisher(), event, callback.as_str());
        if publisher.endpoint() == &self.endpoint {
            self.remove_subscriber(&control);
        } else {
            transport.send_request(&Message::Unsubscribe(control)).await?;
        }
        transport
            .unsubscribe(&event_id.topic(), &subscriber.transport_id())
            .await?;

        self.forget_callback(&event_id, &subscriber);
        debug!(event = %event_id, sub = %sub, callback = %callback, "unsubscribed");
        Ok(())
    }

    fn is_registered(&self, event_id: &EventId, subscriber: &Subscriber) -> bool {
        self.tables
            .lock()
            .callbacks
            .get(event_id)
            .is_some_and(|callbacks| callbacks.iter().any(|(s, _)| s == subscriber))
    }

    fn forget_callback(&self, event_id: &EventId, subscriber: &Subscriber) -> bool {
        let mut tables = self.tables.lock();
        let Some(callbacks) = tables.callbacks.get_mut(event_id) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(s, _)| s != subscriber);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            tables.callbacks.remove(event_id);
        }
        removed
    }

    fn add_subscriber(&self, control: &Subscribe) {
        let event_id = EventId::new(&control.publisher, control.event.clone());
        let subscriber = Subscriber::new(&control.sub, &CallbackId::new(control.callback.clone()));

        let mut tables = self.tables.lock();
        let subscribers = tables.subscribers.entry(event_id.clone()).or_default();
        if !subscribers.contains(&subscriber) {
            debug!(event = %event_id, sub = %subscriber.url, "subscriber added");
            subscribers.push(subscriber);
        }
    }

    fn remove_subscriber(&self, control: &Unsubscribe) {
        let event_id = EventId::new(&control.publisher, control.event.clone());
        let callback = CallbackId::new(control.callback.clone());

        let mut tables = self.tables.lock();
        if let Some(subscribers) = tables.subscribers.get_mut(&event_id) {
            subscribers.retain(|s| !(s.url == control.sub && s.callback == callback));
            if subscribers.is_empty() {
                tables.subscribers.remove(&event_id);
            }
            debug!(event = %event_id, sub = %control.sub, "subscriber removed");
        }
    }

    /// Our own registrations for `event_id`, in registration order.
    pub fn callbacks(&self, event_id: &EventId) -> Vec<Subscriber> {
        self.tables
            .lock()
            .callbacks
            .get(event_id)
            .map(|callbacks| callbacks.iter().map(|(s, _)| s.clone()).collect())
            .unwrap_or_default()
    }

    /// Remote subscribers of `event_id` known to this (publishing) bus.
    pub fn subscribers(&self, event_id: &EventId) -> Vec<Subscriber> {
        self.tables
            .lock()
            .subscribers
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Serve inbound messages until [`Bus::shutdown`]. Binds first if needed.
    pub async fn run_forever(&self) -> Result<(), BusError> {
        self.bind().await?;

        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state == BusState::Bound {
                *state = BusState::Running;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return match self.state() {
                BusState::Running => Err(BusError::AlreadyRunning),
                _ => Err(BusError::Closed),
            };
        }

        info!(endpoint = %self.endpoint, "bus running");
        let tick = self.config.loop_tick();
        let mut state_rx = self.state.subscribe();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| *state != BusState::Running) => break,
                received = self.inbound.recv_request(Some(tick)) => received,
            };

            match received {
                Ok(Some(message)) => {
                    if let Some(worker) = self.dispatch(message).await {
                        workers.push(worker);
                    }
                }
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "receive failed");
                    time::sleep(tick).await;
                }
            }
            workers.retain(|worker| !worker.is_finished());
        }

        info!(endpoint = %self.endpoint, in_flight = workers.len(), "bus stopping");
        let deadline = Instant::now() + self.config.shutdown_grace();
        for worker in workers {
            if time::timeout_at(deadline, worker).await.is_err() {
                warn!(endpoint = %self.endpoint, "abandoning in-flight handlers");
                break;
            }
        }

        self.close_transports().await;
        self.state.send_replace(BusState::Closed);
        info!(endpoint = %self.endpoint, "bus closed");
        Ok(())
    }

    async fn dispatch(&self, message: Message) -> Option<JoinHandle<()>> {
        match message {
            Message::Ping(ping) => {
                let pong = Message::Pong(ping.pong());
                if let Err(e) = self.inbound.send_response(ping.id, &pong).await {
                    warn!(id = %ping.id, error = %e, "failed to answer ping");
                }
                None
            }
            Message::Request(request) => {
                let resolver = Arc::clone(&*self.resolver.read());
                Some(tokio::spawn(serve_request(
                    Arc::clone(&self.inbound),
                    resolver,
                    Arc::clone(&self.workers),
                    request,
                )))
            }
            Message::Subscribe(control) => {
                self.add_subscriber(&control);
                None
            }
            Message::Unsubscribe(control) => {
                self.remove_subscriber(&control);
                None
            }
            other => {
                warn!(endpoint = %self.endpoint, kind = other.kind(), "unexpected message on request channel");
                None
            }
        }
    }

    /// Stop serving and release every connection. Returns once the bus is
    /// closed; handlers still running after the grace period are abandoned.
    pub async fn shutdown(&self) {
        let mut was_running = false;
        let initiated = self.state.send_if_modified(|state| match *state {
            BusState::ShuttingDown | BusState::Closed => false,
            previous => {
                was_running = previous == BusState::Running;
                *state = BusState::ShuttingDown;
                true
            }
        });

        let mut state_rx = self.state.subscribe();
        let limit = self.config.shutdown_grace() + self.config.loop_tick() + Duration::from_secs(1);

        if !initiated || was_running {
            // the server loop (or another shutdown) finishes the job
            if time::timeout(limit, state_rx.wait_for(|state| *state == BusState::Closed))
                .await
                .is_ok()
            {
                return;
            }
            if initiated {
                error!(endpoint = %self.endpoint, "server loop did not stop in time");
            }
        }

        self.close_transports().await;
        self.state.send_replace(BusState::Closed);
        info!(endpoint = %self.endpoint, "bus closed");
    }

    async fn close_transports(&self) {
        self.inbound.close().await;
        let outbound: Vec<Arc<BrokerTransport>> = self
            .outbound
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.outbound.clear();
        for transport in outbound {
            transport.close().await;
        }
        self.workers.close();
    }
}

async fn serve_request(
    transport: Arc<BrokerTransport>,
    resolver: Arc<dyn Resolver>,
    workers: Arc<Semaphore>,
    request: Request,
) {
    let path = request.dst.path();
    let response = match resolver.resolve(&path, &request.method) {
        Resolution::ObjectNotFound => request.not_found(format!("object {} not found", path)),
        Resolution::MethodNotFound => request.not_found(format!(
            "method '{}' not found on {}",
            request.method, path
        )),
        Resolution::Found(handler) => {
            let Ok(_permit) = workers.acquire_owned().await else {
                debug!(id = %request.id, "bus closed before the handler could run");
                return;
            };
            let args = request.args.clone();
            match tokio::task::spawn_blocking(move || handler(&args)).await {
                Ok(Ok(value)) => request.ok(value),
                Ok(Err(e)) => {
                    debug!(id = %request.id, method = %request.method, error = %e, "handler failed");
                    request.error(&e)
                }
                Err(join) if join.is_panic() => {
                    let cause = panic_message(&*join.into_panic());
                    error!(id = %request.id, method = %request.method, cause, "handler panicked");
                    request.error(&HandlerError::new("Panic", cause))
                }
                Err(join) => request.error(&HandlerError::new("Cancelled", join.to_string())),
            }
        }
    };

    if let Err(e) = transport
        .send_response(request.id, &Message::Response(response))
        .await
    {
        warn!(id = %request.id, error = %e, "could not deliver response");
    }
}
