//! Timer-driven polling of watched queries.
//!
//! A query registered with a poll interval is owned by the scheduler: the
//! scheduler installs its listener, fetches at registration, and refetches
//! on every tick until the poll slot is released.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::{ManagerInner, QueryListener};
use crate::types::WatchQueryOptions;

#[derive(Default)]
pub(crate) struct QueryScheduler {
    polling: DashMap<String, JoinHandle<()>>,
}

impl QueryScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate a query id for a polling query from the shared counter.
    pub(crate) fn register_polling_query(
        &self,
        manager: &Arc<ManagerInner>,
        _options: &WatchQueryOptions,
    ) -> String {
        manager.generate_query_id()
    }

    /// Install the listener (when given one) and spawn the poll task. The
    /// first tick fires immediately, so registration fetches once up front;
    /// every subsequent tick re-fetches with `force_fetch`.
    pub(crate) fn start_polling_query(
        &self,
        manager: &Arc<ManagerInner>,
        options: Arc<RwLock<WatchQueryOptions>>,
        listener: Option<QueryListener>,
        query_id: Option<String>,
    ) -> String {
        let query_id =
            query_id.unwrap_or_else(|| self.register_polling_query(manager, &snapshot(&options)));

        if let Some(listener) = listener {
            manager.add_query_listener(&query_id, listener);
        }

        let Some(period) = snapshot(&options).poll_interval else {
            warn!(%query_id, "polling requested without a poll interval");
            return query_id;
        };

        let weak: Weak<ManagerInner> = Arc::downgrade(manager);
        let task_query_id = query_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut first = true;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                // The registration fetch is cache-aware; every tick after it
                // exists to observe server-side change, so it forces the
                // network.
                let mut current = snapshot(&options);
                if !first {
                    current.force_fetch = true;
                }
                first = false;
                if let Err(error) = manager.fetch_query(&task_query_id, &current).await {
                    debug!(query_id = %task_query_id, %error, "poll fetch failed");
                }
            }
        });

        if let Some(previous) = self.polling.insert(query_id.clone(), handle) {
            previous.abort();
        }
        debug!(%query_id, ?period, "polling started");
        query_id
    }

    /// Release the poll slot; the listener, if any, stays until the watch is
    /// stopped.
    pub(crate) fn stop_polling_query(&self, query_id: &str) {
        if let Some((_, handle)) = self.polling.remove(query_id) {
            handle.abort();
            debug!(%query_id, "polling stopped");
        }
    }
}

fn snapshot(options: &Arc<RwLock<WatchQueryOptions>>) -> WatchQueryOptions {
    options
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
