// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Binds the ping endpoint, serves it on a background task, and shuts it down gracefully.
//!
//! A server moves through [`ServerState`] in one direction only:
//!
//! ```text
//! bind ─▶ Bound ─▶ Serving ─▶ Draining ─▶ Stopped
//! ```
//!
//! Stopping is cooperative. The accept loop ends and the listener is closed, every open connection
//! stops reading requests, and the server waits until the calls that were already read have sent
//! their replies.

use crate::{
    error::Error, service::PingServer, PingService, PingServiceRequest, PingServiceResponse,
};
use futures::{future, prelude::*, task::*};
use pin_project::pin_project;
use std::{fmt, net::SocketAddr, pin::Pin, time::Duration};
use tarpc::{
    serde_transport::tcp,
    server::{BaseChannel, Channel},
    tokio_serde::formats::Json,
    ClientMessage, Response,
};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

type Codec = Json<ClientMessage<PingServiceRequest>, Response<PingServiceResponse>>;

type Listener = tcp::Incoming<
    ClientMessage<PingServiceRequest>,
    Response<PingServiceResponse>,
    Codec,
    fn() -> Codec,
>;

/// Settings that control how a [`Server`] shuts down.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Upper bound on the time spent draining after a stop request. `None` waits for every
    /// in-flight call, however long it takes.
    pub drain_timeout: Option<Duration>,
}

impl Config {
    /// Reserves `addr` for a server configured with `self`.
    pub async fn bind(self, addr: impl Into<SocketAddr>) -> Result<Server, Error> {
        let addr = addr.into();
        let codec: fn() -> Codec = Json::default;
        let listener = tcp::listen(addr, codec)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let (state, _) = watch::channel(ServerState::Bound);

        Ok(Server {
            config: self,
            listener,
            shutdown: CancellationToken::new(),
            state,
        })
    }
}

/// Where a server is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// The endpoint is reserved but connections are not yet being accepted.
    Bound,
    /// Connections are accepted and calls dispatched.
    Serving,
    /// No new connections or calls are taken; in-flight calls are finishing.
    Draining,
    /// Every connection and call has finished.
    Stopped,
}

/// A bound endpoint that has not started serving yet.
pub struct Server {
    config: Config,
    listener: Listener,
    shutdown: CancellationToken,
    state: watch::Sender<ServerState>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Server {
    /// Reserves `addr` with the default [`Config`].
    pub async fn bind(addr: impl Into<SocketAddr>) -> Result<Server, Error> {
        Config::default().bind(addr).await
    }

    /// Returns the address being listened on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Returns a handle that can observe and stop this server once it is running.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Runs [`serve`](Server::serve) on a new tokio task.
    pub fn spawn(self, service: PingServer) -> RunningServer {
        let handle = self.handle();
        let local_addr = self.local_addr();
        let task = tokio::spawn(self.serve(service));
        RunningServer {
            handle,
            local_addr,
            task,
        }
    }

    /// Accepts connections and dispatches their calls to `service` until a stop is requested,
    /// then drains. Resolves once the server is [`Stopped`](ServerState::Stopped).
    pub async fn serve(self, service: PingServer) {
        let Server {
            config,
            mut listener,
            shutdown,
            state,
        } = self;
        let local_addr = listener.local_addr();
        // Connections and the calls they spawn are tracked together, so waiting on the tracker
        // covers replies that are still being written.
        let tasks = TaskTracker::new();

        state.send_replace(ServerState::Serving);
        tracing::info!("Server listening at {local_addr}");

        loop {
            let transport = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.next() => match accepted {
                    Some(Ok(transport)) => transport,
                    Some(Err(e)) => {
                        tracing::warn!("failed to accept connection: {e}");
                        continue;
                    }
                    None => break,
                },
            };

            let peer_addr = transport.peer_addr().ok();
            tracing::info!(?peer_addr, "accepted connection");

            let channel = BaseChannel::with_defaults(Drain::new(transport, shutdown.clone()));
            let service = service.clone();
            let calls = tasks.clone();
            tasks.spawn(async move {
                channel
                    .execute(service.serve())
                    .for_each(|call| {
                        calls.spawn(call);
                        future::ready(())
                    })
                    .await;
                tracing::info!(?peer_addr, "connection closed");
            });
        }

        drop(listener);
        state.send_replace(ServerState::Draining);
        tracing::info!(in_flight = tasks.len(), "Server draining");

        tasks.close();
        match config.drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, tasks.wait()).await.is_err() {
                    tracing::warn!(
                        abandoned = tasks.len(),
                        "drain did not finish within {limit:?}"
                    );
                }
            }
            None => tasks.wait().await,
        }

        state.send_replace(ServerState::Stopped);
        tracing::info!("Server stopped");
    }
}

/// Observes a server's state and requests its graceful stop. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ServerState>,
}

impl ServerHandle {
    /// Returns the most recently published state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Asks the server to stop accepting work and drain. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("graceful stop requested");
        }
        self.shutdown.cancel();
    }

    /// Waits until the server has reached `target` or any later state.
    ///
    /// If the server is dropped before it gets there, returns the last state it published.
    pub async fn wait_for(&self, target: ServerState) -> ServerState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|current| *current >= target)
            .await
            .map(|current| *current);
        reached.unwrap_or_else(|_| *state.borrow())
    }
}

/// A server serving on its own task.
#[derive(Debug)]
pub struct RunningServer {
    handle: ServerHandle,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// Returns the address being listened on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Resolves once the server accepts connections.
    pub async fn ready(&self) -> ServerState {
        self.handle.wait_for(ServerState::Serving).await
    }

    /// Requests a graceful stop and waits for the drain to finish.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.handle.stop();
        self.task.await
    }
}

/// Ends the inbound half of a transport once shutdown is requested. The outbound half stays open
/// so replies to calls that were already read still reach the client.
///
/// tarpc closes a channel when its inbound half has ended and no requests are in flight, so
/// wrapping a transport in `Drain` turns a shutdown request into a graceful close of that
/// connection.
#[pin_project]
struct Drain<T> {
    #[pin]
    transport: T,
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
    draining: bool,
}

impl<T> Drain<T> {
    fn new(transport: T, shutdown: CancellationToken) -> Self {
        Drain {
            transport,
            shutdown: Box::pin(async move { shutdown.cancelled().await }),
            draining: false,
        }
    }
}

impl<T> Stream for Drain<T>
where
    T: Stream,
{
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T::Item>> {
        let this = self.project();
        if !*this.draining && this.shutdown.as_mut().poll(cx).is_ready() {
            *this.draining = true;
        }
        if *this.draining {
            return Poll::Ready(None);
        }
        this.transport.poll_next(cx)
    }
}

impl<T, Item> Sink<Item> for Drain<T>
where
    T: Sink<Item>,
{
    type Error = T::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), T::Error>> {
        self.project().transport.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Item) -> Result<(), T::Error> {
        self.project().transport.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), T::Error>> {
        self.project().transport.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), T::Error>> {
        self.project().transport.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PingRequest, PingServiceClient, PongReply};
    use assert_matches::assert_matches;
    use tarpc::{client, context, transport::channel};

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn drain_ends_stream_after_shutdown() {
        let shutdown = CancellationToken::new();
        let mut drain = Drain::new(stream::iter(1..=3), shutdown.clone());

        assert_eq!(drain.next().await, Some(1));
        shutdown.cancel();
        assert_eq!(drain.next().await, None);
        assert_eq!(drain.next().await, None);
    }

    #[tokio::test]
    async fn drain_keeps_sink_open_after_shutdown() -> anyhow::Result<()> {
        let (tx, mut rx) = futures::channel::mpsc::unbounded::<u32>();
        let shutdown = CancellationToken::new();
        let mut drain = Drain::new(tx, shutdown.clone());
        shutdown.cancel();

        drain.send(7).await?;
        assert_eq!(rx.next().await, Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn drained_channel_answers_in_flight_call_then_closes() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let (tx, rx) = channel::unbounded();
        let shutdown = CancellationToken::new();
        let channel = BaseChannel::with_defaults(Drain::new(rx, shutdown.clone()));
        let connection = tokio::spawn(
            channel
                .execute(PingServer::with_latency(Duration::from_millis(200)).serve())
                .for_each(|call| async move {
                    tokio::spawn(call);
                }),
        );
        let client = PingServiceClient::new(client::Config::default(), tx).spawn();

        let call = tokio::spawn(async move {
            client
                .ping(context::current(), PingRequest::new("in flight"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert_matches!(call.await?, Ok(reply) if reply == PongReply::pong());
        tokio::time::timeout(Duration::from_secs(5), connection).await??;
        Ok(())
    }

    #[tokio::test]
    async fn bind_starts_in_bound_state() -> anyhow::Result<()> {
        let server = Server::bind(localhost()).await?;
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.handle().state(), ServerState::Bound);
        Ok(())
    }

    #[tokio::test]
    async fn stop_moves_through_every_state() -> anyhow::Result<()> {
        let server = Server::bind(localhost()).await?;
        let handle = server.handle();
        let running = server.spawn(PingServer::default());

        assert_eq!(running.ready().await, ServerState::Serving);
        handle.stop();
        assert!(handle.wait_for(ServerState::Draining).await >= ServerState::Draining);
        running.stop().await?;
        assert_eq!(handle.state(), ServerState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn drain_timeout_bounds_stop() -> anyhow::Result<()> {
        let config = Config {
            drain_timeout: Some(Duration::from_millis(100)),
        };
        let server = config.bind(localhost()).await?;
        let addr = server.local_addr();
        let running = server.spawn(PingServer::with_latency(Duration::from_secs(30)));
        running.ready().await;

        let transport = tcp::connect(addr, Json::default).await?;
        let client = PingServiceClient::new(client::Config::default(), transport).spawn();
        tokio::spawn(async move {
            let _ = client
                .ping(context::current(), PingRequest::new("stuck"))
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let handle = running.handle().clone();
        tokio::time::timeout(Duration::from_secs(5), running.stop()).await??;
        assert_eq!(handle.state(), ServerState::Stopped);
        Ok(())
    }
}
