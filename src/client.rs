// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Dials a ping server and performs calls against it.

use crate::{error::Error, PingRequest, PingServiceClient, PongReply};
use rand::Rng;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tarpc::{client, context, serde_transport::tcp, tokio_serde::formats::Json};
use tokio::time::{self, Instant};

/// Calls carry no deadline of their own, so their tarpc context is pushed out by this much.
const UNBOUNDED_CALL: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings that control how a [`Session`] waits for its server.
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay before the second dial attempt. Doubles after every failed attempt.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between dial attempts.
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
        }
    }
}

impl Config {
    /// The delay to wait after failed attempt number `attempt`, starting at 1, with up to 20%
    /// jitter subtracted.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        delay.mul_f64(1.0 - jitter)
    }
}

/// A connection to a ping server.
#[derive(Clone, Debug)]
pub struct Session {
    addr: SocketAddr,
    client: PingServiceClient,
}

impl Session {
    /// Connects to `addr`, waiting for the server to accept until `deadline`.
    ///
    /// A server that is not listening yet is not an error: refused and reset connections are
    /// retried with backoff until the deadline passes, at which point [`Error::Timeout`] is
    /// returned. Any other dial failure is returned immediately as [`Error::Connect`].
    pub async fn connect(
        config: Config,
        addr: SocketAddr,
        deadline: Instant,
    ) -> Result<Session, Error> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let client = time::timeout_at(deadline, dial(&config, addr))
            .await
            .map_err(|_| Error::Timeout { addr, timeout })??;
        tracing::info!(%addr, "connected");
        Ok(Session { addr, client })
    }

    /// Returns the address this session is connected to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends one ping carrying `text` and waits for the reply.
    pub async fn ping(&self, text: impl Into<String>) -> Result<PongReply, Error> {
        let mut ctx = context::current();
        ctx.deadline += UNBOUNDED_CALL;
        let reply = self.client.ping(ctx, PingRequest::new(text)).await?;
        Ok(reply)
    }
}

async fn dial(config: &Config, addr: SocketAddr) -> Result<PingServiceClient, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match tcp::connect(addr, Json::default).await {
            Ok(transport) => {
                tracing::debug!(attempt, %addr, "dial succeeded");
                return Ok(PingServiceClient::new(client::Config::default(), transport).spawn());
            }
            Err(e) if is_transient(&e) => {
                let delay = config.backoff(attempt);
                tracing::debug!(attempt, %addr, "dial failed ({e}), retrying in {delay:?}");
                time::sleep(delay).await;
            }
            Err(source) => return Err(Error::Connect { addr, source }),
        }
    }
}

/// Failures that go away once the server starts listening.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

/// The address a local client should dial to reach a server listening on `listen_addr`.
///
/// A server bound to every interface is reached through loopback.
pub fn dial_addr(listen_addr: SocketAddr) -> SocketAddr {
    let ip = match listen_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, listen_addr.port())
}
