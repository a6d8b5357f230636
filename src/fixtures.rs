// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Task types shared between the crate's own tests and the `echo_worker`
//! companion binary (`demos/echo_worker.rs`), which a process-backed
//! `Context` in an integration test re-execs as its child. Not part of the
//! crate's public contract beyond that.

use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::TaskFailure;
use crate::task::Task;

/// Returns its input unchanged, after sleeping `delay_ms` first. The delay
/// exists so tests can prove two jobs actually ran concurrently on one
/// worker (varied, overlapping durations) rather than one at a time.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Echo {
    pub payload: String,
    pub delay_ms: u64,
}

impl Echo {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            delay_ms: 0,
        }
    }

    pub fn after(payload: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            payload: payload.into(),
            delay_ms,
        }
    }
}

impl Task for Echo {
    type Output = String;

    fn run(&self, _env: &Environment) -> Result<String, TaskFailure> {
        if self.delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
        }
        Ok(self.payload.clone())
    }
}

/// Stores `value` under `key` in the `Environment`, then reads it back —
/// exercises `Environment` round-tripping through a task that runs on the
/// worker side rather than directly in a unit test.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoundTripEnvironment {
    pub key: String,
    pub value: i64,
}

impl Task for RoundTripEnvironment {
    type Output = i64;

    fn run(&self, env: &Environment) -> Result<i64, TaskFailure> {
        env.set(self.key.clone(), self.value, None);
        Ok(env.get::<i64>(&self.key).unwrap_or_default())
    }
}

/// Reads back whatever bytes `ContextConfig::bootstrap` put into the
/// `Environment`, or an empty `Vec` if none were configured.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReadBootstrap;

impl Task for ReadBootstrap {
    type Output = Vec<u8>;

    fn run(&self, env: &Environment) -> Result<Vec<u8>, TaskFailure> {
        Ok(env
            .get::<Vec<u8>>(crate::child::BOOTSTRAP_ENV_KEY)
            .unwrap_or_default())
    }
}

/// Always fails, carrying `message` in its `RemoteFailure`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AlwaysFails(pub String);

impl Task for AlwaysFails {
    type Output = ();

    fn run(&self, _env: &Environment) -> Result<(), TaskFailure> {
        Err(TaskFailure(crate::error::RemoteFailure::new(
            "AlwaysFails",
            self.message_or_default(),
        )))
    }
}

impl AlwaysFails {
    fn message_or_default(&self) -> String {
        if self.0.is_empty() {
            "task failed".to_string()
        } else {
            self.0.clone()
        }
    }
}
