//! Correlation of outbound requests with their asynchronous responses
//!
//! Each outbound request that expects a later answer registers a token here.
//! The caller keeps the receiving half of a oneshot channel; whoever sees the
//! answer (a RESPONSE frame, a hub callback, a teardown) completes the entry.
//! The table is not synchronized; owners keep it behind their own lock.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Generate a fresh correlation token
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A request waiting for its answer
#[derive(Debug)]
pub struct Pending<T, C> {
    tx: oneshot::Sender<Result<T>>,
    context: C,
    created_at: Instant,
}

impl<T, C> Pending<T, C> {
    /// Contextual data registered with the request
    pub fn context(&self) -> &C {
        &self.context
    }

    /// When the request was registered
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Settle the request successfully, returning its context
    pub fn resolve(self, value: T) -> C {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.tx.send(Ok(value));
        self.context
    }

    /// Settle the request with an error, returning its context
    pub fn reject(self, error: Error) -> C {
        let _ = self.tx.send(Err(error));
        self.context
    }
}

/// Token -> pending request map
#[derive(Debug)]
pub struct CorrelationTable<T, C> {
    entries: HashMap<String, Pending<T, C>>,
}

impl<T, C> Default for CorrelationTable<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C> CorrelationTable<T, C> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a pending request under `token`.
    ///
    /// Fails if the token is already pending.
    pub fn register(
        &mut self,
        token: impl Into<String>,
        context: C,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let token = token.into();
        if self.entries.contains_key(&token) {
            return Err(Error::InvalidParameter(format!(
                "Correlation token {token} is already pending"
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            token,
            Pending {
                tx,
                context,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Remove and return the pending entry for `token`
    pub fn take(&mut self, token: &str) -> Option<Pending<T, C>> {
        self.entries.remove(token)
    }

    /// Get the context of a pending entry
    pub fn get(&self, token: &str) -> Option<&C> {
        self.entries.get(token).map(Pending::context)
    }

    /// Check if a token is pending
    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    /// Resolve and remove the entry for `token`
    pub fn resolve(&mut self, token: &str, value: T) -> Option<C> {
        self.take(token).map(|pending| pending.resolve(value))
    }

    /// Reject and remove the entry for `token`
    pub fn reject(&mut self, token: &str, error: Error) -> Option<C> {
        self.take(token).map(|pending| pending.reject(error))
    }

    /// Reject every pending entry, returning their tokens and contexts
    pub fn reject_all(&mut self, error: impl Fn() -> Error) -> Vec<(String, C)> {
        self.entries
            .drain()
            .map(|(token, pending)| (token, pending.reject(error())))
            .collect()
    }

    /// Reject entries registered more than `ttl` before `now` with
    /// [`Error::Expired`], returning their tokens and contexts
    pub fn expire(&mut self, ttl: Duration, now: Instant) -> Vec<(String, C)> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.created_at) >= ttl)
            .map(|(token, _)| token.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|token| {
                self.reject(&token, Error::Expired)
                    .map(|context| (token, context))
            })
            .collect()
    }

    /// Tokens currently pending
    pub fn tokens(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
