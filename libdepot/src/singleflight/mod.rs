//! Coalesces concurrent identical calls.
//!
//! The first caller for a key spawns the work; every caller that arrives
//! while it runs awaits the same result. The work runs on its own task, so
//! callers going away (a client disconnecting, a request timing out) never
//! cancel it.

use crate::error::{DepotError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Instrument;

#[cfg(test)]
mod tests;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

/// A singleflight group for calls producing `T`.
pub struct Group<T: Clone> {
    calls: Arc<Mutex<HashMap<String, SharedCall<T>>>>,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` unless a call for `key` is already in flight, in which case
    /// its result is awaited instead. Errors are shared verbatim.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::singleflight::Group;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> libdepot::error::Result<()> {
    /// let group: Group<u32> = Group::new();
    /// let value = group.run("answer", || async { Ok(42) }).await?;
    /// assert_eq!(value, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(key) {
                Some(call) => {
                    tracing::trace!(key, "joining in-flight call");
                    call.clone()
                }
                None => {
                    let call = self.spawn(key.to_string(), f());
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };
        call.await
    }

    fn spawn<Fut>(&self, key: String, work: Fut) -> SharedCall<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let calls = self.calls.clone();
        let handle = tokio::spawn(
            async move {
                let result = work.await;
                calls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                result
            }
            .in_current_span(),
        );

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(DepotError::network_with_source("Coalesced call failed", e)))
        }
        .boxed()
        .shared()
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
