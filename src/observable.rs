//! Live query observation: the observer capability record and the
//! subscription handle returned to callers of `watch_query`.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::manager::{QueryError, QueryManager};
use crate::network::NetworkError;
use crate::types::{GraphQLResult, WatchQueryOptions};

/// What a watched query delivers over the channel adapter.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Next(GraphQLResult),
    Error(Arc<NetworkError>),
}

/// An observer is a capability record: results flow to `next`, transport
/// failures to `error`. A missing `error` capability downgrades transport
/// failures to log lines.
#[derive(Clone, Default)]
pub struct QueryObserver {
    pub next: Option<Arc<dyn Fn(GraphQLResult) + Send + Sync>>,
    pub error: Option<Arc<dyn Fn(Arc<NetworkError>) + Send + Sync>>,
}

impl QueryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next(mut self, next: impl Fn(GraphQLResult) + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(next));
        self
    }

    pub fn on_error(mut self, error: impl Fn(Arc<NetworkError>) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    /// An observer backed by a bounded channel, with the receiving half as a
    /// stream. Deliveries beyond the buffer are dropped with a warning; a
    /// closed receiver ends deliveries silently.
    pub fn channel(buffer: usize) -> (Self, ReceiverStream<ObserverEvent>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let error_sender = sender.clone();

        let observer = Self::new()
            .on_next(move |result| match sender.try_send(ObserverEvent::Next(result)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("observer buffer full, dropping result");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            })
            .on_error(move |error| {
                let _ = error_sender.try_send(ObserverEvent::Error(error));
            });

        (observer, ReceiverStream::new(receiver))
    }
}

/// A watchable query: holds the options, does nothing until subscribed.
pub struct ObservableQuery {
    manager: QueryManager,
    options: WatchQueryOptions,
}

impl ObservableQuery {
    pub(crate) fn new(manager: QueryManager, options: WatchQueryOptions) -> Self {
        Self { manager, options }
    }

    /// Register the observer, fetch once, and keep delivering on every
    /// relevant store change until the subscription is dropped via
    /// `unsubscribe`.
    pub fn subscribe(&self, observer: QueryObserver) -> QuerySubscription {
        self.manager.subscribe(self.options.clone(), observer)
    }

    /// Subscribe, await the first delivery, then unsubscribe on the next
    /// tick. This is the one-shot `query` path.
    pub async fn result(&self) -> Result<GraphQLResult, QueryError> {
        let (observer, mut stream) = QueryObserver::channel(8);
        let subscription = self.subscribe(observer);

        let event = stream.next().await;
        tokio::spawn(async move {
            subscription.unsubscribe();
        });

        match event {
            Some(ObserverEvent::Next(result)) => Ok(result),
            Some(ObserverEvent::Error(error)) => Err(QueryError::Network(error)),
            None => Err(QueryError::WatchTerminated),
        }
    }
}

/// The handle a subscriber holds on a live watched query.
pub struct QuerySubscription {
    manager: QueryManager,
    query_id: String,
    options: Arc<RwLock<WatchQueryOptions>>,
}

impl QuerySubscription {
    pub(crate) fn new(
        manager: QueryManager,
        query_id: String,
        options: Arc<RwLock<WatchQueryOptions>>,
    ) -> Self {
        Self {
            manager,
            query_id,
            options,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Remove the listener, release any poll slot, and record the stop in
    /// the store. In-flight requests are not cancelled; their late results
    /// update the store but reach no listener.
    pub fn unsubscribe(self) {
        self.manager.stop_query(&self.query_id);
    }

    /// Re-run the query against the network, optionally with new variables.
    /// Subsequent deliveries use the updated variables.
    pub async fn refetch(&self, variables: Option<Value>) -> Result<GraphQLResult, QueryError> {
        let options = {
            let mut guard = self.options.write().unwrap_or_else(PoisonError::into_inner);
            guard.force_fetch = true;
            if let Some(variables) = variables {
                guard.variables = Some(variables);
            }
            guard.clone()
        };
        self.manager.fetch(&self.query_id, &options).await
    }

    /// Hand the query's lifecycle to the polling scheduler at the given
    /// cadence.
    pub fn start_polling(&self, interval: Duration) {
        {
            let mut guard = self.options.write().unwrap_or_else(PoisonError::into_inner);
            guard.poll_interval = Some(interval);
        }
        self.manager
            .start_polling(self.options.clone(), self.query_id.clone());
    }

    /// Release the poll slot while keeping the watch alive.
    pub fn stop_polling(&self) {
        self.manager.stop_polling(&self.query_id);
    }
}
