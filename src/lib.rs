// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A process that is both server and client of one unary RPC.
//!
//! The server side binds a TCP endpoint and serves [`PingService`] until it is asked to stop
//! gracefully. The client side dials that endpoint with a deadline, calls [`PingService::ping`]
//! once, and hands the reply back. [`lifecycle::run`] sequences the two.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{prelude::*, EnvFilter};

pub mod client;
pub mod error;
pub mod lifecycle;
pub mod server;
pub mod service;

pub use error::Error;

/// The text of every reply.
pub const PONG: &str = "PONG";

/// The request sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub text: String,
}

impl PingRequest {
    pub fn new(text: impl Into<String>) -> Self {
        PingRequest { text: text.into() }
    }
}

/// The reply produced by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongReply {
    pub text: String,
}

impl PongReply {
    /// The acknowledgement returned for every request.
    pub fn pong() -> Self {
        PongReply {
            text: PONG.to_string(),
        }
    }
}

/// This is the service definition. It defines one RPC, ping, which takes a request and returns a
/// reply.
#[tarpc::service]
pub trait PingService {
    /// Acknowledges a ping.
    async fn ping(request: PingRequest) -> PongReply;
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to `info` with tarpc's
/// per-request events muted.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tarpc=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
