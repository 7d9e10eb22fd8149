use crate::url::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const CODE_OK: u16 = 200;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_ERROR: u16 = 500;

pub const NOT_FOUND_KIND: &str = "NotFound";

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Opaque random token identifying a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Positional and keyword arguments of a call or event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Args {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Positional argument `index` decoded as `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::new("TypeError", format!("missing positional argument {}", index))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            HandlerError::new("TypeError", format!("argument {}: {}", index, e))
        })
    }

    /// Keyword argument `name` decoded as `T`, `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::new("TypeError", format!("argument '{}': {}", name, e))),
            None => Ok(None),
        }
    }
}

/// Failure raised by a hosted-object method. Travels back as a 500 response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Capture any error, using its type name as the kind and its source chain
    /// as the traceback.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();

        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            kind,
            message: error.to_string(),
            traceback: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// Error carried inside a [`Response`]. The remote error type never crosses the
/// wire, only its kind name, message and captured traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: MessageId,
    pub ts: Timestamp,
    pub src: Url,
    pub dst: Url,
}

impl Ping {
    pub fn pong(&self) -> Pong {
        Pong {
            id: self.id,
            ts: Protocol::timestamp(),
            src: self.dst.clone(),
            dst: self.src.clone(),
            ok: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub id: MessageId,
    pub ts: Timestamp,
    pub src: Url,
    pub dst: Url,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: MessageId,
    pub ts: Timestamp,
    pub src: Url,
    pub dst: Url,
    pub method: String,
    #[serde(flatten)]
    pub args: Args,
}

impl Request {
    pub fn ok(&self, result: Value) -> Response {
        Protocol::ok(self, result)
    }

    pub fn error(&self, error: &HandlerError) -> Response {
        Protocol::error(self, error)
    }

    pub fn not_found(&self, message: impl Into<String>) -> Response {
        Protocol::not_found(self, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: MessageId,
    pub ts: Timestamp,
    pub src: Url,
    pub dst: Url,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn is_not_found(&self) -> bool {
        self.code == CODE_NOT_FOUND
    }

    /// The result value (JSON `null` for a unit result), or the remote error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub ts: Timestamp,
    pub sub: Url,
    #[serde(rename = "pub")]
    pub publisher: Url,
    pub event: String,
    pub callback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub ts: Timestamp,
    pub sub: Url,
    #[serde(rename = "pub")]
    pub publisher: Url,
    pub event: String,
    pub callback: String,
}

/// An event fired by `src`. No reply is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: Timestamp,
    pub src: Url,
    pub event: String,
    #[serde(flatten)]
    pub args: Args,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    Request(Request),
    Response(Response),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Event(Event),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Subscribe(_) => "subscribe",
            Message::Unsubscribe(_) => "unsubscribe",
            Message::Event(_) => "event",
        }
    }

    /// Correlation id for messages that expect or carry a reply.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::Ping(m) => Some(m.id),
            Message::Pong(m) => Some(m.id),
            Message::Request(m) => Some(m.id),
            Message::Response(m) => Some(m.id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

impl From<Request> for Message {
    fn from(m: Request) -> Self {
        Message::Request(m)
    }
}

impl From<Response> for Message {
    fn from(m: Response) -> Self {
        Message::Response(m)
    }
}

impl From<Ping> for Message {
    fn from(m: Ping) -> Self {
        Message::Ping(m)
    }
}

impl From<Pong> for Message {
    fn from(m: Pong) -> Self {
        Message::Pong(m)
    }
}

impl From<Event> for Message {
    fn from(m: Event) -> Self {
        Message::Event(m)
    }
}

/// Envelope construction. Never performs I/O, never blocks.
pub struct Protocol;

impl Protocol {
    pub fn id() -> MessageId {
        MessageId(rand::random())
    }

    pub fn timestamp() -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn ping(src: &Url, dst: &Url) -> Ping {
        Ping {
            id: Self::id(),
            ts: Self::timestamp(),
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    pub fn request(src: &Url, dst: &Url, method: &str, args: Args) -> Request {
        Request {
            id: Self::id(),
            ts: Self::timestamp(),
            src: src.clone(),
            dst: dst.clone(),
            method: method.to_string(),
            args,
        }
    }

    pub fn ok(request: &Request, result: Value) -> Response {
        Response {
            id: request.id,
            ts: Self::timestamp(),
            src: request.dst.clone(),
            dst: request.src.clone(),
            code: CODE_OK,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(request: &Request, error: &HandlerError) -> Response {
        Response {
            id: request.id,
            ts: Self::timestamp(),
            src: request.dst.clone(),
            dst: request.src.clone(),
            code: CODE_ERROR,
            result: None,
            error: Some(RemoteError {
                kind: error.kind.clone(),
                message: error.message.clone(),
                traceback: error.traceback.clone(),
            }),
        }
    }

    pub fn not_found(request: &Request, message: impl Into<String>) -> Response {
        Response {
            id: request.id,
            ts: Self::timestamp(),
            src: request.dst.clone(),
            dst: request.src.clone(),
            code: CODE_NOT_FOUND,
            result: None,
            error: Some(RemoteError {
                kind: NOT_FOUND_KIND.to_string(),
                message: message.into(),
                traceback: None,
            }),
        }
    }

    pub fn event(src: &Url, event: &str, args: Args) -> Event {
        Event {
            ts: Self::timestamp(),
            src: src.clone(),
            event: event.to_string(),
            args,
        }
    }

    pub fn subscribe(sub: &Url, publisher: &Url, event: &str, callback: &str) -> Subscribe {
        Subscribe {
            ts: Self::timestamp(),
            sub: sub.clone(),
            publisher: publisher.clone(),
            event: event.to_string(),
            callback: callback.to_string(),
        }
    }

    pub fn unsubscribe(sub: &Url, publisher: &Url, event: &str, callback: &str) -> Unsubscribe {
        Unsubscribe {
            ts: Self::timestamp(),
            sub: sub.clone(),
            publisher: publisher.clone(),
            event: event.to_string(),
            callback: callback.to_string(),
        }
    }
}
