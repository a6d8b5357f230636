// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Companion binary re-exec'd by a process-backed `Context` in integration
//! tests. `cargo test` builds this alongside the library; tests locate it
//! via `env!("CARGO_BIN_EXE_echo_worker")` and point a `ContextConfig` at
//! it directly, bypassing the default `current_exe()` re-exec so the test
//! harness binary itself never needs to double as a worker entry point.

use anyhow::Result;
use parallel_pool::child;
use parallel_pool::fixtures::Echo;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    if child::is_worker_entry() {
        child::serve_stdio::<Echo>().await;
    }

    Ok(())
}
