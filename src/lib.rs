//! # skybus
//!
//! RPC and publish/subscribe bus connecting observatory object managers.
//!
//! Every manager runs a [`Bus`] bound to a `tcp://host:port` endpoint and hosts
//! instrument objects (telescopes, cameras, domes) addressed by urls such as
//! `tcp://127.0.0.1:7666/Telescope/0`. Other managers call methods on those
//! objects with a timeout and subscribe to the events they fire.
//!
//! ## Architecture
//!
//! - [`url`] - endpoint and object addressing
//! - [`protocol`] - request, response, ping and event envelopes (line-delimited JSON)
//! - [`broker`] - the TCP message broker each bus binds (lists and pub/sub channels)
//! - [`transport`] - the [`Transport`] seam and its broker-backed implementation
//! - [`bus`] - ping, request, publish/subscribe and the server loop
//! - [`resources`] - registry of hosted objects, resolving inbound requests
//! - [`config`] - timeouts and worker limits
//!
//! ## Quick Start
//!
//! ```no_run
//! use skybus::{Args, Bus, BusConfig, Endpoint, HostedObject, ResourceRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ResourceRegistry::new());
//! registry.add(
//!     "/Telescope/main",
//!     HostedObject::new().method("get_az", |_: &Args| Ok(json!(42.0))),
//! )?;
//!
//! let bus = Arc::new(Bus::new(Endpoint::new("127.0.0.1", 7666), BusConfig::default()));
//! bus.set_resolver(registry);
//! bus.run_forever().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod broker;
pub mod bus;
pub mod config;
pub mod protocol;
pub mod resources;
pub mod transport;
pub mod url;

pub use bus::{Bus, BusError, BusState, EventId, Handler, Resolution, Resolver, Subscriber};
pub use config::BusConfig;
pub use protocol::{Args, HandlerError, Message, MessageId, Pong, Protocol, RemoteError, Response};
pub use resources::{HostedObject, RegistryError, Resource, ResourceRegistry};
pub use transport::{BrokerTransport, Callback, CallbackId, Transport, TransportError};
pub use url::{create_url, parse_url, resolve_url, Endpoint, Url, UrlError};
