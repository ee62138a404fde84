// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Logging setup.
//!
//! Level priority: the `--debug` flag, then the `LACQUER_LOG` environment
//! variable (e.g. "debug", "warn"), then info. Logs go to stderr so that
//! application output owns stdout.

use std::env;

use crate::error::Error;

/// Initialise the global subscriber. Call once at startup.
pub fn init(debug: bool) -> Result<(), Error> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        env::var("LACQUER_LOG")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(tracing::Level::INFO)
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::from(format!("failed to initialize logging: {}", e)))
}
