//! At most one in-flight load per key. Later callers for the same key await
//! the first caller's result instead of starting their own.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

pub struct SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    in_flight: Arc<Mutex<HashMap<String, Flight<T, E>>>>,
}

/// Outcome of [`SingleFlight::run`].
pub struct Joined<T, E> {
    pub result: Result<T, E>,
    /// False when this caller awaited a load started by someone else.
    pub leader: bool,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        SingleFlight {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `work` for `key` unless a run is already in progress, in which
    /// case its result is shared. The work runs on its own task, so a caller
    /// that gives up does not cancel it for the others.
    pub async fn run<F>(&self, key: &str, work: F) -> Joined<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (flight, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let registry = self.in_flight.clone();
                    let owned_key = key.to_string();
                    let task = tokio::spawn(async move {
                        let result = work.await;
                        // Removed only after the work is done, so a caller
                        // arriving later sees its effects.
                        registry.lock().remove(&owned_key);
                        result
                    });
                    let flight = async move { task.await.unwrap_or_else(|e| Err(E::from(e))) }
                        .boxed()
                        .shared();
                    in_flight.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        Joined {
            result: flight.await,
            leader,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
