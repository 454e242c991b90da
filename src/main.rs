// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use ping_pong::lifecycle::{self, Options};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    ping_pong::init_tracing()?;

    let mut stdout = std::io::stdout();
    lifecycle::run(&options, &mut stdout).await.map_err(|e| {
        tracing::error!("{e:#}");
        e
    })
}
