//! Message broker a bus binds at its `host:port`.
//!
//! The broker keeps named FIFO lists (request and response channels) and named
//! pub/sub channels (event topics) in memory. Clients speak newline-delimited
//! JSON: one [`BrokerCommand`] per line in, one [`BrokerReply`] per line out.
//! Every command carries a client-chosen `tag` echoed by its reply, so a single
//! connection multiplexes any number of in-flight commands. Messages published
//! on a subscribed channel arrive as untagged [`BrokerReply::Message`] lines.
//!
//! Commands other than `Pop` are handled in arrival order on each connection,
//! which keeps publishes FIFO per subscriber. Blocking pops run concurrently.
//!
//! A popped entry is never silently lost. If its reply cannot be written the
//! broker puts it back at the head of its list, and a client that receives a
//! pop reply nobody waits for any more (the caller gave up) hands it back with
//! a `Restore` command. Either way the entry keeps its remaining TTL.

use crate::transport::TransportError;
use crate::url::Endpoint;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const JANITOR_PERIOD_MS: u64 = 1000;
// Long pops are split so a dead client frees its waiter eventually
const MAX_POP_WAIT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerCommand {
    Ping {
        tag: u64,
    },
    Push {
        tag: u64,
        key: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Pop {
        tag: u64,
        key: String,
        timeout_ms: u64,
    },
    /// Put a popped entry back at the head of `key`.
    Restore {
        tag: u64,
        key: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Publish {
        tag: u64,
        channel: String,
        payload: String,
    },
    Subscribe {
        tag: u64,
        channel: String,
    },
    Unsubscribe {
        tag: u64,
        channel: String,
    },
}

impl BrokerCommand {
    pub fn tag(&self) -> u64 {
        match self {
            BrokerCommand::Ping { tag }
            | BrokerCommand::Push { tag, .. }
            | BrokerCommand::Pop { tag, .. }
            | BrokerCommand::Restore { tag, .. }
            | BrokerCommand::Publish { tag, .. }
            | BrokerCommand::Subscribe { tag, .. }
            | BrokerCommand::Unsubscribe { tag, .. } => *tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum BrokerReply {
    Pong { tag: u64 },
    Ok { tag: u64 },
    Popped {
        tag: u64,
        payload: Option<String>,
        // where the payload came from, so it can be restored
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Published { tag: u64, receivers: usize },
    Error { tag: u64, message: String },
    Message { channel: String, payload: String },
}

impl BrokerReply {
    fn popped(tag: u64, key: &str, entry: Option<Entry>) -> Self {
        match entry {
            Some(entry) => {
                let ttl_ms = entry.remaining_ttl_ms(Instant::now());
                BrokerReply::Popped {
                    tag,
                    payload: Some(entry.payload),
                    key: Some(key.to_string()),
                    ttl_ms,
                }
            }
            None => BrokerReply::Popped {
                tag,
                payload: None,
                key: None,
                ttl_ms: None,
            },
        }
    }

    /// The entry carried by a non-empty pop reply.
    fn into_popped_entry(self) -> Option<(String, Entry)> {
        match self {
            BrokerReply::Popped {
                payload: Some(payload),
                key: Some(key),
                ttl_ms,
                ..
            } => Some((key, Entry::with_ttl(payload, ttl_ms.map(Duration::from_millis)))),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<u64> {
        match self {
            BrokerReply::Pong { tag }
            | BrokerReply::Ok { tag }
            | BrokerReply::Popped { tag, .. }
            | BrokerReply::Published { tag, .. }
            | BrokerReply::Error { tag, .. } => Some(*tag),
            BrokerReply::Message { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    payload: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn with_ttl(payload: String, ttl: Option<Duration>) -> Self {
        Self {
            payload,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining_ttl_ms(&self, now: Instant) -> Option<u64> {
        self.expires_at
            .map(|at| at.saturating_duration_since(now).as_millis() as u64)
    }
}

type ConnId = u64;

struct BrokerState {
    lists: Mutex<HashMap<String, VecDeque<Entry>>>,
    waiters: DashMap<String, Arc<Notify>>,
    channels: DashMap<String, HashMap<ConnId, mpsc::UnboundedSender<BrokerReply>>>,
    next_conn: AtomicU64,
    stop: watch::Sender<bool>,
}

impl BrokerState {
    fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            lists: Mutex::new(HashMap::new()),
            waiters: DashMap::new(),
            channels: DashMap::new(),
            next_conn: AtomicU64::new(0),
            stop,
        }
    }

    fn push(&self, key: &str, payload: String, ttl: Option<Duration>) {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(Entry::with_ttl(payload, ttl));
        self.wake(key);
    }

    /// Put a popped entry back where it was taken from.
    fn restore(&self, key: &str, entry: Entry) {
        if entry.is_expired(Instant::now()) || *self.stop.borrow() {
            return;
        }
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_front(entry);
        self.wake(key);
    }

    fn reclaim(&self, reply: BrokerReply) {
        if let Some((key, entry)) = reply.into_popped_entry() {
            debug!(key = %key, "restoring undelivered entry");
            self.restore(&key, entry);
        }
    }

    fn wake(&self, key: &str) {
        if let Some(notify) = self.waiters.get(key) {
            notify.notify_waiters();
        }
    }

    fn try_pop(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let mut lists = self.lists.lock();
        let queue = lists.get_mut(key)?;

        let mut found = None;
        while let Some(entry) = queue.pop_front() {
            if !entry.is_expired(now) {
                found = Some(entry);
                break;
            }
        }

        if queue.is_empty() {
            lists.remove(key);
        }
        found
    }

    fn waiter(&self, key: &str) -> Arc<Notify> {
        self.waiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn pop(&self, key: &str, timeout: Duration) -> Option<Entry> {
        let deadline = Instant::now() + timeout.min(Duration::from_millis(MAX_POP_WAIT_MS));
        loop {
            let notify = self.waiter(key);
            let notified = notify.notified();
            tokio::pin!(notified);
            // register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop(key) {
                return Some(entry);
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key);
            }
        }
    }

    fn publish(&self, channel: &str, payload: &str) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };

        let mut receivers = 0;
        for tx in subscribers.values() {
            let message = BrokerReply::Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if tx.send(message).is_ok() {
                receivers += 1;
            }
        }
        receivers
    }

    fn subscribe(&self, channel: &str, conn: ConnId, tx: mpsc::UnboundedSender<BrokerReply>) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn, tx);
    }

    fn unsubscribe(&self, channel: &str, conn: ConnId) {
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&conn);
        }
        self.channels.remove_if(channel, |_, subscribers| subscribers.is_empty());
    }

    fn drop_connection(&self, conn: ConnId) {
        for mut subscribers in self.channels.iter_mut() {
            subscribers.remove(&conn);
        }
        self.channels.retain(|_, subscribers| !subscribers.is_empty());
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.lists.lock().retain(|_, queue| {
            queue.retain(|entry| !entry.is_expired(now));
            !queue.is_empty()
        });
        self.waiters.retain(|_, notify| Arc::strong_count(notify) > 1);
    }

    fn list_len(&self, key: &str) -> usize {
        self.lists.lock().get(key).map_or(0, VecDeque::len)
    }
}

/// A running broker. Dropping it without [`Broker::shutdown`] leaves the
/// listener running until the runtime stops.
pub struct Broker {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    state: Arc<BrokerState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Broker {
    /// Bind the broker on `endpoint`. Fails with [`TransportError::AddrInUse`]
    /// when something else already listens there.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint.socket_addr())
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => TransportError::AddrInUse(endpoint.to_string()),
                _ => TransportError::Connection {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                },
            })?;
        let local_addr = listener.local_addr()?;
        info!(endpoint = %endpoint, addr = %local_addr, "broker listening");

        let state = Arc::new(BrokerState::new());
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_state = Arc::clone(&state);
        let accept_tasks = Arc::clone(&tasks);
        let accept = tokio::spawn(async move {
            accept_loop(listener, accept_state, accept_tasks).await;
        });

        let janitor_state = Arc::clone(&state);
        let janitor = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(JANITOR_PERIOD_MS));
            loop {
                interval.tick().await;
                janitor_state.sweep();
            }
        });

        tasks.lock().extend([accept, janitor]);

        Ok(Self {
            endpoint: endpoint.clone(),
            local_addr,
            state,
            tasks,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of entries waiting in list `key`.
    pub fn list_len(&self, key: &str) -> usize {
        self.state.list_len(key)
    }

    /// Stop accepting, drop every client connection and discard stored lists.
    pub fn shutdown(&self) {
        self.state.stop.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.lists.lock().clear();
        self.state.channels.clear();
        info!(endpoint = %self.endpoint, "broker stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<BrokerState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
                debug!(conn, %addr, "broker client connected");
                let client_state = Arc::clone(&state);
                let handle = tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, conn, Arc::clone(&client_state)).await {
                        debug!(conn, error = %e, "broker client error");
                    }
                    client_state.drop_connection(conn);
                    debug!(conn, "broker client disconnected");
                });

                let mut tasks = tasks.lock();
                tasks.retain(|task| !task.is_finished());
                tasks.push(handle);
            }
            Err(e) => {
                warn!(error = %e, "broker failed to accept connection");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    conn: ConnId,
    state: Arc<BrokerState>,
) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);

    let (tx, rx) = mpsc::unbounded_channel::<BrokerReply>();
    let (gone, _) = watch::channel(false);
    let writer_task = tokio::spawn(write_replies(
        writer,
        rx,
        Arc::clone(&state),
        gone.subscribe(),
    ));

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "broker client read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let command = match serde_json::from_str::<BrokerCommand>(trimmed) {
            Ok(command) => command,
            Err(e) => {
                warn!(conn, error = %e, "broker received an invalid command");
                let _ = tx.send(BrokerReply::Error {
                    tag: 0,
                    message: format!("invalid command: {}", e),
                });
                continue;
            }
        };

        let reply = match command {
            BrokerCommand::Ping { tag } => BrokerReply::Pong { tag },
            BrokerCommand::Push {
                tag,
                key,
                payload,
                ttl_ms,
            } => {
                state.push(&key, payload, ttl_ms.map(Duration::from_millis));
                BrokerReply::Ok { tag }
            }
            BrokerCommand::Pop {
                tag,
                key,
                timeout_ms,
            } => {
                let pop_state = Arc::clone(&state);
                let pop_tx = tx.clone();
                let mut stop = state.stop.subscribe();
                let mut gone = gone.subscribe();
                tokio::spawn(async move {
                    let entry = tokio::select! {
                        entry = pop_state.pop(&key, Duration::from_millis(timeout_ms)) => entry,
                        _ = stop.wait_for(|stopped| *stopped) => return,
                        _ = gone.wait_for(|gone| *gone) => return,
                    };
                    if let Err(mpsc::error::SendError(reply)) =
                        pop_tx.send(BrokerReply::popped(tag, &key, entry))
                    {
                        pop_state.reclaim(reply);
                    }
                });
                continue;
            }
            BrokerCommand::Restore {
                tag,
                key,
                payload,
                ttl_ms,
            } => {
                state.restore(&key, Entry::with_ttl(payload, ttl_ms.map(Duration::from_millis)));
                BrokerReply::Ok { tag }
            }
            BrokerCommand::Publish {
                tag,
                channel,
                payload,
            } => BrokerReply::Published {
                tag,
                receivers: state.publish(&channel, &payload),
            },
            BrokerCommand::Subscribe { tag, channel } => {
                state.subscribe(&channel, conn, tx.clone());
                BrokerReply::Ok { tag }
            }
            BrokerCommand::Unsubscribe { tag, channel } => {
                state.unsubscribe(&channel, conn);
                BrokerReply::Ok { tag }
            }
        };

        if tx.send(reply).is_err() {
            break;
        }
    }

    state.drop_connection(conn);
    gone.send_replace(true);
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<BrokerReply>,
    state: Arc<BrokerState>,
    mut gone: watch::Receiver<bool>,
) {
    let mut stop = state.stop.subscribe();
    loop {
        let reply = tokio::select! {
            reply = rx.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = gone.wait_for(|gone| *gone) => break,
        };
        let mut line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode broker reply");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "failed to write broker reply");
            state.reclaim(reply);
            break;
        }
    }

    // replies queued for a client that is gone
    rx.close();
    while let Ok(reply) = rx.try_recv() {
        state.reclaim(reply);
    }
    let _ = writer.shutdown().await;
}

// tag of commands the pump sends on its own; their replies are ignored
const UNTRACKED_TAG: u64 = 0;

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn write_command(writer: &SharedWriter, command: &BrokerCommand) -> Result<(), TransportError> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    writer.lock().await.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Client connection to a broker.
///
/// A background pump reads replies and routes each one to the pending command
/// with the same tag. Channel messages go to the `messages` sender handed to
/// [`BrokerClient::connect`]. A pop whose caller stopped waiting (its future
/// was dropped or timed out) still gets its reply; the pump restores that
/// entry on the broker.
pub struct BrokerClient {
    endpoint: Endpoint,
    writer: SharedWriter,
    pending: Arc<DashMap<u64, oneshot::Sender<BrokerReply>>>,
    next_tag: AtomicU64,
    alive: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl BrokerClient {
    pub async fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        messages: mpsc::UnboundedSender<(String, String)>,
    ) -> Result<Self, TransportError> {
        let connection_error = |reason: String| TransportError::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };

        let stream = time::timeout(timeout, TcpStream::connect(endpoint.socket_addr()))
            .await
            .map_err(|_| connection_error("connect timed out".to_string()))?
            .map_err(|e| connection_error(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let pending: Arc<DashMap<u64, oneshot::Sender<BrokerReply>>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let pump_writer = Arc::clone(&writer);
        let pump_pending = Arc::clone(&pending);
        let pump_alive = Arc::clone(&alive);
        let pump_endpoint = endpoint.clone();
        let pump = tokio::spawn(async move {
            let mut buf_reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match buf_reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(endpoint = %pump_endpoint, error = %e, "broker connection read failed");
                        break;
                    }
                }

                let reply = match serde_json::from_str::<BrokerReply>(line.trim()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(endpoint = %pump_endpoint, error = %e, "invalid broker reply");
                        continue;
                    }
                };

                match reply {
                    BrokerReply::Message { channel, payload } => {
                        let _ = messages.send((channel, payload));
                    }
                    reply => {
                        let Some(tag) = reply.tag() else { continue };
                        if tag == UNTRACKED_TAG {
                            continue;
                        }
                        let reply = match pump_pending.remove(&tag) {
                            Some((_, tx)) => match tx.send(reply) {
                                Ok(()) => continue,
                                // receiver dropped between remove and send
                                Err(reply) => reply,
                            },
                            None => reply,
                        };
                        debug!(endpoint = %pump_endpoint, tag, "unmatched broker reply");
                        if let Some((key, entry)) = reply.into_popped_entry() {
                            let restore = BrokerCommand::Restore {
                                tag: UNTRACKED_TAG,
                                key,
                                ttl_ms: entry.remaining_ttl_ms(Instant::now()),
                                payload: entry.payload,
                            };
                            if let Err(e) = write_command(&pump_writer, &restore).await {
                                warn!(endpoint = %pump_endpoint, error = %e, "could not restore abandoned entry");
                            }
                        }
                    }
                }
            }

            pump_alive.store(false, Ordering::SeqCst);
            // dropping the senders wakes every pending command with an error
            pump_pending.clear();
            debug!(endpoint = %pump_endpoint, "broker connection closed");
        });

        Ok(Self {
            endpoint: endpoint.clone(),
            writer,
            pending,
            next_tag: AtomicU64::new(1),
            alive,
            pump,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a command and wait for its reply, at most `timeout` if given.
    /// `Ok(None)` means the wait timed out.
    async fn call(
        &self,
        build: impl FnOnce(u64) -> BrokerCommand,
        timeout: Option<Duration>,
    ) -> Result<Option<BrokerReply>, TransportError> {
        if !self.is_alive() {
            return Err(self.lost());
        }

        let tag = self.next_tag();
        let command = build(tag);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag, tx);
        // the pump may have drained `pending` just before the insert
        if !self.is_alive() {
            self.pending.remove(&tag);
            return Err(self.lost());
        }

        if let Err(e) = write_command(&self.writer, &command).await {
            self.pending.remove(&tag);
            return Err(match e {
                TransportError::Io(e) => TransportError::Connection {
                    endpoint: self.endpoint.to_string(),
                    reason: e.to_string(),
                },
                other => other,
            });
        }

        let reply = match timeout {
            Some(timeout) => match time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.remove(&tag);
                    return Ok(None);
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(BrokerReply::Error { message, .. }) => Err(TransportError::Broker(message)),
            Ok(reply) => Ok(Some(reply)),
            Err(_) => Err(self.lost()),
        }
    }

    fn lost(&self) -> TransportError {
        TransportError::Connection {
            endpoint: self.endpoint.to_string(),
            reason: "connection lost".to_string(),
        }
    }

    fn unexpected(&self, reply: BrokerReply) -> TransportError {
        TransportError::Broker(format!("unexpected reply {:?}", reply))
    }

    pub async fn ping(&self, timeout: Duration) -> Result<bool, TransportError> {
        match self.call(|tag| BrokerCommand::Ping { tag }, Some(timeout)).await? {
            Some(BrokerReply::Pong { .. }) => Ok(true),
            Some(reply) => Err(self.unexpected(reply)),
            None => Ok(false),
        }
    }

    pub async fn push(
        &self,
        key: &str,
        payload: String,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError> {
        let command = |tag| BrokerCommand::Push {
            tag,
            key: key.to_string(),
            payload,
            ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
        };
        match self.call(command, None).await? {
            Some(BrokerReply::Ok { .. }) => Ok(()),
            Some(reply) => Err(self.unexpected(reply)),
            None => Err(self.lost()),
        }
    }

    /// Blocking pop; `Ok(None)` when nothing arrived within `timeout`.
    pub async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, TransportError> {
        let command = |tag| BrokerCommand::Pop {
            tag,
            key: key.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        // the broker answers at its own deadline, this one only guards a hung broker
        let guard = timeout + Duration::from_secs(5);
        match self.call(command, Some(guard)).await? {
            Some(BrokerReply::Popped { payload, .. }) => Ok(payload),
            Some(reply) => Err(self.unexpected(reply)),
            None => Ok(None),
        }
    }

    pub async fn publish(&self, channel: &str, payload: String) -> Result<usize, TransportError> {
        let command = |tag| BrokerCommand::Publish {
            tag,
            channel: channel.to_string(),
            payload,
        };
        match self.call(command, None).await? {
            Some(BrokerReply::Published { receivers, .. }) => Ok(receivers),
            Some(reply) => Err(self.unexpected(reply)),
            None => Err(self.lost()),
        }
    }

    pub async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let command = |tag| BrokerCommand::Subscribe {
            tag,
            channel: channel.to_string(),
        };
        match self.call(command, None).await? {
            Some(BrokerReply::Ok { .. }) => Ok(()),
            Some(reply) => Err(self.unexpected(reply)),
            None => Err(self.lost()),
        }
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let command = |tag| BrokerCommand::Unsubscribe {
            tag,
            channel: channel.to_string(),
        };
        match self.call(command, None).await? {
            Some(BrokerReply::Ok { .. }) => Ok(()),
            Some(reply) => Err(self.unexpected(reply)),
            None => Err(self.lost()),
        }
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().await.shutdown().await;
        self.pump.abort();
        self.pending.clear();
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
