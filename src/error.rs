// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::{io, net::SocketAddr, time::Duration};
use tarpc::client::RpcError;

/// Everything that can go wrong between binding the endpoint and receiving the reply.
///
/// None of these are retried by the lifecycle; each one ends the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The listening endpoint could not be reserved.
    #[error("failed to listen on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Dialing the server failed in a way that waiting would not fix.
    #[error("did not connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The server did not accept a connection before the deadline.
    #[error("did not connect to {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    /// The call was sent but no reply came back.
    #[error("could not ping")]
    Call(#[from] RpcError),
}
