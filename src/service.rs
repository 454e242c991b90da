// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{PingRequest, PingService, PongReply};
use std::time::Duration;
use tarpc::context;

// This is the type that implements the generated PingService trait. It is the business logic
// handed to the server.
#[derive(Clone, Debug, Default)]
pub struct PingServer {
    latency: Option<Duration>,
}

impl PingServer {
    /// Holds every reply back by `latency` before sending it.
    pub fn with_latency(latency: Duration) -> Self {
        PingServer {
            latency: Some(latency),
        }
    }
}

impl PingService for PingServer {
    async fn ping(self, _: context::Context, request: PingRequest) -> PongReply {
        tracing::info!("Received ping: {}", request.text);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        PongReply::pong()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PingServiceClient, PONG};
    use assert_matches::assert_matches;
    use futures::prelude::*;
    use std::time::Instant;
    use tarpc::{
        client,
        server::{BaseChannel, Channel},
        transport::channel,
    };

    async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
        tokio::spawn(fut);
    }

    #[tokio::test]
    async fn reply_is_independent_of_request_text() {
        for text in ["PING", "", "  spaced \t out\n", "héllo 🏓 世界"] {
            let reply = PingServer::default()
                .ping(context::current(), PingRequest::new(text))
                .await;
            assert_eq!(reply, PongReply::pong(), "request text {text:?}");
        }
    }

    #[tokio::test]
    async fn ping_over_in_process_channel() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let (tx, rx) = channel::unbounded();
        tokio::spawn(
            BaseChannel::with_defaults(rx)
                .execute(PingServer::default().serve())
                .for_each(spawn),
        );
        let client = PingServiceClient::new(client::Config::default(), tx).spawn();

        assert_matches!(
            client.ping(context::current(), PingRequest::new("PING")).await,
            Ok(PongReply { ref text }) if text == PONG
        );
        Ok(())
    }

    #[tokio::test]
    async fn latency_delays_but_does_not_change_reply() {
        let start = Instant::now();
        let reply = PingServer::with_latency(Duration::from_millis(50))
            .ping(context::current(), PingRequest::new("slow"))
            .await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(reply.text, PONG);
    }
}
