//! In-flight request table for single-flight coalescing.
//!
//! The first caller for a fingerprint becomes the leader and owns a broadcast sender; later
//! callers subscribe while the registration is still in the table. The leader always removes
//! the registration before publishing, so every subscriber is registered before the single
//! message is sent.

use crate::{Error, ErrorContext};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

pub(crate) type Outcome = std::result::Result<Value, Error>;

#[derive(Default)]
pub(crate) struct InFlight {
    calls: Mutex<HashMap<String, broadcast::Sender<Outcome>>>,
}

pub(crate) enum Role<'a> {
    Leader(FlightGuard<'a>),
    Waiter(broadcast::Receiver<Outcome>),
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Outcome>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the computation already running for `key`, or register as its leader.
    pub(crate) fn join_or_lead(&self, key: &str) -> Role<'_> {
        let mut calls = self.lock();
        if let Some(tx) = calls.get(key) {
            return Role::Waiter(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        calls.insert(key.to_string(), tx.clone());
        Role::Leader(FlightGuard {
            table: self,
            key: key.to_string(),
            tx: Some(tx),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Leader's handle on a registration. Dropping it without completing (cancelled future,
/// panicking compute) deregisters and closes the channel, which waiters observe as an
/// abandoned computation.
pub(crate) struct FlightGuard<'a> {
    table: &'a InFlight,
    key: String,
    tx: Option<broadcast::Sender<Outcome>>,
}

impl FlightGuard<'_> {
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.table.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            // No receivers is fine: nobody joined.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.table.lock().remove(&self.key);
        }
    }
}

pub(crate) async fn wait(mut rx: broadcast::Receiver<Outcome>, key: &str) -> Outcome {
    rx.recv().await.unwrap_or_else(|_| Err(abandoned(key)))
}

/// Blocks the current thread. Must not be called from inside an async runtime worker.
pub(crate) fn wait_blocking(mut rx: broadcast::Receiver<Outcome>, key: &str) -> Outcome {
    rx.blocking_recv().unwrap_or_else(|_| Err(abandoned(key)))
}

fn abandoned(key: &str) -> Error {
    Error::runtime_with_context(
        "in-flight computation was abandoned before completing",
        ErrorContext::new()
            .with_details(key.to_string())
            .with_source("prompt_cache"),
    )
}
