//! Coalescing of fetch requests onto shared transport round trips.
//!
//! The coordinator always enqueues here; with batching off each request is
//! forwarded immediately and individually, with it on a timer drains the
//! queue into a single `batch_query` call.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::network::{NetworkError, NetworkInterface};
use crate::types::{GraphQLRequest, GraphQLResult};

/// How a fetch request completes: the result, or the transport error shared
/// across every request of a failed batch.
pub type FetchResponse = Result<GraphQLResult, Arc<NetworkError>>;

struct PendingRequest {
    request: GraphQLRequest,
    query_id: String,
    sender: oneshot::Sender<FetchResponse>,
}

pub struct QueryBatcher {
    network: Arc<dyn NetworkInterface>,
    should_batch: bool,
    queue: Mutex<Vec<PendingRequest>>,
}

impl QueryBatcher {
    pub fn new(network: Arc<dyn NetworkInterface>, should_batch: bool) -> Arc<Self> {
        Arc::new(Self {
            network,
            should_batch,
            queue: Mutex::new(Vec::new()),
        })
    }

    /// Start the drain timer. The task holds the batcher weakly and exits
    /// once the owning manager is dropped. Must be called inside a tokio
    /// runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(batcher) = weak.upgrade() else {
                    break;
                };
                batcher.consume_queue().await;
            }
        });
    }

    /// Enqueue a request, returning the handle its response arrives on.
    pub fn enqueue_request(
        &self,
        request: GraphQLRequest,
        query_id: String,
    ) -> oneshot::Receiver<FetchResponse> {
        let (sender, receiver) = oneshot::channel();
        let pending = PendingRequest {
            request,
            query_id,
            sender,
        };

        if self.should_batch {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push(pending);
            debug!(queued = queue.len(), "request queued for batching");
        } else {
            let network = self.network.clone();
            tokio::spawn(async move {
                let response = network.query(pending.request).await.map_err(Arc::new);
                let _ = pending.sender.send(response);
            });
        }

        receiver
    }

    async fn consume_queue(&self) {
        let pending: Vec<PendingRequest> = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "dispatching batched requests");
        let requests: Vec<GraphQLRequest> =
            pending.iter().map(|item| item.request.clone()).collect();

        match self.network.batch_query(requests).await {
            Ok(results) => {
                if results.len() != pending.len() {
                    let error = Arc::new(NetworkError::BatchSizeMismatch {
                        sent: pending.len(),
                        received: results.len(),
                    });
                    for item in pending {
                        let _ = item.sender.send(Err(error.clone()));
                    }
                    return;
                }
                for (item, result) in pending.into_iter().zip(results) {
                    let _ = item.sender.send(Ok(result));
                }
            }
            Err(error) => {
                let shared = Arc::new(error);
                for item in pending {
                    warn!(query_id = %item.query_id, error = %shared, "batched request failed");
                    let _ = item.sender.send(Err(shared.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct CountingNetwork {
        single_calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        responses: Mutex<VecDeque<GraphQLResult>>,
        fail: Mutex<Option<String>>,
    }

    impl CountingNetwork {
        fn push_response(&self, result: GraphQLResult) {
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(result);
        }

        fn next_response(&self) -> GraphQLResult {
            self.responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl NetworkInterface for CountingNetwork {
        async fn query(&self, _request: GraphQLRequest) -> Result<GraphQLResult, NetworkError> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.fail.lock().unwrap_or_else(PoisonError::into_inner).clone()
            {
                return Err(NetworkError::Transport(message));
            }
            Ok(self.next_response())
        }

        fn supports_batching(&self) -> bool {
            true
        }

        async fn batch_query(
            &self,
            requests: Vec<GraphQLRequest>,
        ) -> Result<Vec<GraphQLResult>, NetworkError> {
            self.batch_sizes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(requests.len());
            if let Some(message) = self.fail.lock().unwrap_or_else(PoisonError::into_inner).clone()
            {
                return Err(NetworkError::Transport(message));
            }
            Ok(requests.iter().map(|_| self.next_response()).collect())
        }
    }

    fn request(query: &str) -> GraphQLRequest {
        GraphQLRequest {
            query: query.to_string(),
            variables: None,
            operation_name: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unbatched_requests_go_out_immediately_and_individually() {
        let network = Arc::new(CountingNetwork::default());
        network.push_response(GraphQLResult::from_data(json!({"a": 1})));
        let batcher = QueryBatcher::new(network.clone(), false);

        let receiver = batcher.enqueue_request(request("{ a }"), "1".to_string());
        let response = receiver.await.unwrap().unwrap();

        assert_eq!(response.data, Some(json!({"a": 1})));
        assert_eq!(network.single_calls.load(Ordering::SeqCst), 1);
        assert!(network
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_requests_wait_for_the_tick_and_share_one_call() {
        let network = Arc::new(CountingNetwork::default());
        network.push_response(GraphQLResult::from_data(json!({"a": 1})));
        network.push_response(GraphQLResult::from_data(json!({"b": 2})));
        let batcher = QueryBatcher::new(network.clone(), true);
        batcher.start(Duration::from_millis(25));

        let first = batcher.enqueue_request(request("{ a }"), "1".to_string());
        let second = batcher.enqueue_request(request("{ b }"), "2".to_string());

        // Nothing leaves before the timer fires.
        assert!(network
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.data, Some(json!({"a": 1})));
        assert_eq!(second.data, Some(json!({"b": 2})));
        assert_eq!(
            *network
                .batch_sizes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            vec![2]
        );
        assert_eq!(network.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_reaches_every_pending_request() {
        let network = Arc::new(CountingNetwork::default());
        *network.fail.lock().unwrap_or_else(PoisonError::into_inner) =
            Some("connection reset".to_string());
        let batcher = QueryBatcher::new(network.clone(), true);
        batcher.start(Duration::from_millis(25));

        let first = batcher.enqueue_request(request("{ a }"), "1".to_string());
        let second = batcher.enqueue_request(request("{ b }"), "2".to_string());

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert!(matches!(
            first.as_ref().unwrap_err().as_ref(),
            NetworkError::Transport(message) if message == "connection reset"
        ));
        assert!(second.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_task_exits_when_the_batcher_is_dropped() {
        let network = Arc::new(CountingNetwork::default());
        let batcher = QueryBatcher::new(network.clone(), true);
        batcher.start(Duration::from_millis(25));

        drop(batcher);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(network
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }
}
