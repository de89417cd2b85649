//! Best-known account/position state for one agent
//!
//! Read priority:
//! 1. stream snapshot, present only while the connector is subscribed
//! 2. previous on-demand fetch younger than the TTL
//! 3. a fresh fetch, shared by every concurrent caller

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{sort_positions, AccountSnapshot, PositionSnapshot, SnapshotSource, StreamSnapshot};
use crate::error::{Result, TraderError};
use crate::exchange::ExchangeClient;

type SharedFetch<T> = Shared<BoxFuture<'static, std::result::Result<Arc<T>, String>>>;

struct SlotState<T> {
    cached: Option<(Arc<T>, Instant)>,
    in_flight: Option<SharedFetch<T>>,
}

/// TTL cache for one data kind with de-duplicated fetches
struct FetchSlot<T> {
    kind: &'static str,
    state: Mutex<SlotState<T>>,
}

impl<T: Send + Sync + 'static> FetchSlot<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Mutex::new(SlotState {
                cached: None,
                in_flight: None,
            }),
        }
    }

    async fn get_or_fetch<F, Fut>(&self, ttl: Duration, fetch: F) -> Result<(Arc<T>, SnapshotSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut state = self.state.lock().await;
            if let Some((value, fetched_at)) = &state.cached {
                if fetched_at.elapsed() < ttl {
                    return Ok((value.clone(), SnapshotSource::Cache));
                }
            }

            match &state.in_flight {
                Some(existing) => {
                    debug!(kind = self.kind, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let fut = fetch();
                    let shared = async move { fut.await.map(Arc::new).map_err(|e| e.to_string()) }
                        .boxed()
                        .shared();
                    state.in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        let outcome = shared.clone().await;

        {
            let mut state = self.state.lock().await;
            let ours = state
                .in_flight
                .as_ref()
                .map(|f| f.ptr_eq(&shared))
                .unwrap_or(false);
            if ours {
                state.in_flight = None;
                if let Ok(value) = &outcome {
                    state.cached = Some((value.clone(), Instant::now()));
                }
            }
        }

        match outcome {
            Ok(value) => Ok((value, SnapshotSource::Fetch)),
            Err(message) => {
                warn!(kind = self.kind, error = %message, "on-demand fetch failed");
                Err(TraderError::DataUnavailable(format!(
                    "{} fetch failed: {}",
                    self.kind, message
                )))
            }
        }
    }

    async fn clear(&self) {
        self.state.lock().await.cached = None;
    }
}

/// Account/position cache owned by one agent
pub struct StateCache {
    exchange: Arc<dyn ExchangeClient>,
    ttl: Duration,
    stream: RwLock<Option<Arc<StreamSnapshot>>>,
    account: FetchSlot<AccountSnapshot>,
    positions: FetchSlot<Vec<PositionSnapshot>>,
}

impl StateCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            stream: RwLock::new(None),
            account: FetchSlot::new("account"),
            positions: FetchSlot::new("positions"),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_account(&self) -> Result<AccountSnapshot> {
        if let Some(snapshot) = self.stream.read().await.as_ref() {
            return Ok(snapshot.account.clone());
        }

        let exchange = self.exchange.clone();
        let (account, source) = self
            .account
            .get_or_fetch(self.ttl, move || async move { exchange.get_account().await })
            .await?;
        Ok(account.as_ref().clone().with_source(source))
    }

    /// Positions ordered by (instrument, direction)
    pub async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        if let Some(snapshot) = self.stream.read().await.as_ref() {
            return Ok(snapshot.positions.clone());
        }

        let exchange = self.exchange.clone();
        let (positions, _) = self
            .positions
            .get_or_fetch(self.ttl, move || async move {
                let mut positions = exchange.get_positions().await?;
                sort_positions(&mut positions);
                Ok(positions)
            })
            .await?;
        Ok(positions.as_ref().clone())
    }

    /// Replace the stream snapshot in one step.
    pub async fn update_from_stream(&self, snapshot: StreamSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.stream.write().await = Some(snapshot);
    }

    /// Stop serving stream data; reads fall back to cache/fetch.
    pub async fn mark_stream_stale(&self) {
        if self.stream.write().await.take().is_some() {
            debug!("stream snapshot dropped");
        }
    }

    /// Drop everything; the next read goes to the stream or exchange.
    pub async fn invalidate(&self) {
        self.stream.write().await.take();
        self.account.clear().await;
        self.positions.clear().await;
    }

    pub async fn has_stream_snapshot(&self) -> bool {
        self.stream.read().await.is_some()
    }
}
