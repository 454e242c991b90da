// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    client::{self, dial_addr, Session},
    server::{self, Server},
    service::PingServer,
};
use anyhow::Context as _;
use clap::Parser;
use std::{io::Write, net::Ipv4Addr, time::Duration};
use tokio::time::Instant;

/// Serves a ping endpoint, calls it once, and stops it gracefully.
#[derive(Parser, Debug, Clone)]
#[command(name = "ping-pong", version)]
pub struct Options {
    /// Sets the port number to listen on, on every interface. 0 picks a free port.
    #[arg(long, default_value_t = 50051)]
    pub port: u16,
    /// How long the client waits for the server to accept its connection.
    #[arg(long, value_name = "MILLIS", default_value_t = 1000)]
    pub connect_timeout_ms: u64,
    /// Bounds the graceful stop. Unbounded when omitted.
    #[arg(long, value_name = "MILLIS")]
    pub drain_timeout_ms: Option<u64>,
    /// The text sent in the request.
    #[arg(long, default_value = "PING")]
    pub message: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            port: 50051,
            connect_timeout_ms: 1000,
            drain_timeout_ms: None,
            message: "PING".into(),
        }
    }
}

impl Options {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn server_config(&self) -> server::Config {
        server::Config {
            drain_timeout: self.drain_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Binds and serves, calls the server once, writes the reply to `out`, then stops the server.
///
/// Returns the first error hit along the way. The server task is left to the runtime in that
/// case; the caller is expected to exit.
pub async fn run(options: &Options, out: &mut impl Write) -> anyhow::Result<()> {
    let server = options
        .server_config()
        .bind((Ipv4Addr::UNSPECIFIED, options.port))
        .await?;
    let addr = dial_addr(server.local_addr());
    let server = server.spawn(PingServer::default());
    server.ready().await;

    let deadline = Instant::now() + options.connect_timeout();
    let session = Session::connect(client::Config::default(), addr, deadline).await?;
    let reply = session.ping(options.message.as_str()).await?;

    writeln!(out, "Response from server: {}", reply.text)?;
    out.flush()?;

    drop(session);
    server
        .stop()
        .await
        .context("server task failed while draining")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_command_line_defaults() {
        let parsed = Options::parse_from(["ping-pong"]);
        let default = Options::default();
        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.connect_timeout_ms, default.connect_timeout_ms);
        assert_eq!(parsed.drain_timeout_ms, default.drain_timeout_ms);
        assert_eq!(parsed.message, default.message);
    }

    #[test]
    fn flags_convert_to_configs() {
        let options = Options::parse_from([
            "ping-pong",
            "--port",
            "0",
            "--connect-timeout-ms",
            "250",
            "--drain-timeout-ms",
            "5000",
            "--message",
            "hello",
        ]);
        assert_eq!(options.port, 0);
        assert_eq!(options.connect_timeout(), Duration::from_millis(250));
        assert_eq!(
            options.server_config().drain_timeout,
            Some(Duration::from_secs(5))
        );
        assert_eq!(options.message, "hello");
    }

    #[tokio::test]
    async fn run_prints_the_reply() -> anyhow::Result<()> {
        let options = Options {
            port: 0,
            ..Options::default()
        };
        let mut out = Vec::new();
        run(&options, &mut out).await?;
        assert_eq!(String::from_utf8(out)?, "Response from server: PONG\n");
        Ok(())
    }
}
