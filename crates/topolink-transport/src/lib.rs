//! # topolink-transport: Connector Protocol over HTTP
//!
//! ## Outgoing
//! [`ConnectorRegistry`] owns one [`TopologyConnectorClient`] per remote
//! endpoint. [`HeartbeatScheduler`] pings them all once per interval; each
//! ping is a single PUT with its own timeout and no in-cycle retries.
//!
//! ## Incoming
//! [`TopologyConnectorReceiver`] serves `PUT`/`DELETE <prefix>.<owner>.json`
//! through axum. Unauthorized requests get 404.
//!
//! ## Wiring
//! [`ConnectorServer`] builds the shared [`ConnectorContext`] and starts
//! everything; [`RunningServer`] is the handle to reload or stop it.

pub mod client;
pub mod codec;
pub mod connectors;
pub mod context;
pub mod heartbeat;
pub mod receiver;
pub mod server;

pub use client::{ConnectorInfo, TopologyConnectorClient};
pub use codec::BodyEncoding;
pub use connectors::ConnectorRegistry;
pub use context::ConnectorContext;
pub use heartbeat::HeartbeatScheduler;
pub use receiver::{ConnectorRequest, ConnectorResponse, TopologyConnectorReceiver};
pub use server::{ConnectorServer, RunningServer};
