//! The query manager: decides what part of a requested query goes over the
//! wire, drives the store through its event transitions, and fans result
//! changes out to live observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::batcher::QueryBatcher;
use crate::diff::{diff_selection_set_against_store, StoreReadError};
use crate::document::{
    apply_query_transformer, create_fragment_map, document_for_missing, get_mutation_definition,
    get_query_definition, DocumentError, QueryTransformer,
};
use crate::network::{NetworkError, NetworkInterface};
use crate::observable::{ObservableQuery, QueryObserver, QuerySubscription};
use crate::reader::read_selection_set_from_store;
use crate::scheduler::QueryScheduler;
use crate::store::{ClientState, QueryStoreValue, Store, StoreEvent};
use crate::types::{
    GraphQLRequest, GraphQLResult, MutationOptions, SelectionSetWithRoot, WatchQueryOptions,
    ROOT_QUERY_ID,
};

#[derive(Debug, Error)]
pub enum QueryError {
    /// Partial results only make sense on a watch that will be completed by
    /// a later delivery; one-shot queries reject them up front.
    #[error("returnPartialData is only supported on watched queries")]
    PartialDataOnQuery,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Store(#[from] StoreReadError),
    #[error("network error: {0}")]
    Network(Arc<NetworkError>),
    #[error("watch ended before a result was delivered")]
    WatchTerminated,
}

/// A listener is bound to one query id and fed that query's store snapshot
/// on every broadcast.
pub(crate) type QueryListener = Arc<dyn Fn(&QueryStoreValue) + Send + Sync>;

pub struct QueryManagerOptions {
    pub network_interface: Arc<dyn NetworkInterface>,
    pub store: Arc<dyn Store>,
    pub root_key: String,
    pub query_transformer: Option<Arc<dyn QueryTransformer>>,
    /// Defaults to whatever the network interface advertises.
    pub should_batch: Option<bool>,
    pub batch_interval: Duration,
}

impl QueryManagerOptions {
    pub fn new(network_interface: Arc<dyn NetworkInterface>, store: Arc<dyn Store>) -> Self {
        Self {
            network_interface,
            store,
            root_key: "apollo".to_string(),
            query_transformer: None,
            should_batch: None,
            batch_interval: Duration::from_millis(25),
        }
    }

    pub fn with_root_key(mut self, root_key: impl Into<String>) -> Self {
        self.root_key = root_key.into();
        self
    }

    pub fn with_query_transformer(mut self, transformer: Arc<dyn QueryTransformer>) -> Self {
        self.query_transformer = Some(transformer);
        self
    }

    pub fn with_should_batch(mut self, should_batch: bool) -> Self {
        self.should_batch = Some(should_batch);
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }
}

pub(crate) struct ManagerInner {
    network: Arc<dyn NetworkInterface>,
    store: Arc<dyn Store>,
    root_key: String,
    transformer: Option<Arc<dyn QueryTransformer>>,
    batcher: Arc<QueryBatcher>,
    pub(crate) scheduler: QueryScheduler,
    listeners: Mutex<HashMap<String, QueryListener>>,
    id_counter: AtomicU64,
    last_broadcast: Mutex<Option<ClientState>>,
}

/// The coordinator. Cheap to clone; all clones share one listener registry,
/// id counter, batcher, and scheduler. Must be created inside a tokio
/// runtime (the batch timer is spawned at construction).
#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<ManagerInner>,
}

impl QueryManager {
    pub fn new(options: QueryManagerOptions) -> Self {
        let QueryManagerOptions {
            network_interface,
            store,
            root_key,
            query_transformer,
            should_batch,
            batch_interval,
        } = options;

        let should_batch = should_batch.unwrap_or_else(|| network_interface.supports_batching());
        let batcher = QueryBatcher::new(network_interface.clone(), should_batch);
        batcher.start(batch_interval);

        let inner = Arc::new(ManagerInner {
            network: network_interface,
            store: store.clone(),
            root_key,
            transformer: query_transformer,
            batcher,
            scheduler: QueryScheduler::new(),
            listeners: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            last_broadcast: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscribed = store.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.broadcast_if_changed();
            }
        }));
        if !subscribed {
            debug!("store has no change subscription; call broadcast_new_store after external updates");
        }

        Self { inner }
    }

    /// A long-lived watch on a query. Nothing happens until `subscribe` is
    /// called on the returned observable.
    pub fn watch_query(&self, options: WatchQueryOptions) -> ObservableQuery {
        ObservableQuery::new(self.clone(), options)
    }

    /// One-shot query: subscribe, await the first delivery, unsubscribe.
    pub async fn query(&self, options: WatchQueryOptions) -> Result<GraphQLResult, QueryError> {
        if options.return_partial_data {
            return Err(QueryError::PartialDataOnQuery);
        }
        get_query_definition(&options.query)?;
        self.watch_query(options).result().await
    }

    /// Run a mutation: no diffing, no batching, single shot. Transport
    /// failures propagate to the caller unchanged.
    pub async fn mutate(&self, options: MutationOptions) -> Result<GraphQLResult, QueryError> {
        self.inner.mutate(options).await
    }

    /// Re-run the broadcast against the current store state. For hosts whose
    /// store has no change subscription; applies the same skip rule as the
    /// subscription path.
    pub fn broadcast_new_store(&self) {
        self.inner.broadcast_if_changed();
    }

    pub(crate) fn subscribe(
        &self,
        options: WatchQueryOptions,
        observer: QueryObserver,
    ) -> QuerySubscription {
        let polled = options.poll_interval.is_some();
        let shared = Arc::new(RwLock::new(options));
        let listener = ManagerInner::make_listener(Arc::downgrade(&self.inner), observer);

        let query_id = if polled {
            self.inner
                .scheduler
                .start_polling_query(&self.inner, shared.clone(), Some(listener), None)
        } else {
            self.inner.start_query(shared.clone(), listener)
        };

        QuerySubscription::new(self.clone(), query_id, shared)
    }

    pub(crate) async fn fetch(
        &self,
        query_id: &str,
        options: &WatchQueryOptions,
    ) -> Result<GraphQLResult, QueryError> {
        self.inner.fetch_query(query_id, options).await
    }

    pub(crate) fn stop_query(&self, query_id: &str) {
        self.inner.stop_query(query_id);
    }

    pub(crate) fn start_polling(
        &self,
        options: Arc<RwLock<WatchQueryOptions>>,
        query_id: String,
    ) {
        self.inner
            .scheduler
            .start_polling_query(&self.inner, options, None, Some(query_id));
    }

    pub(crate) fn stop_polling(&self, query_id: &str) {
        self.inner.scheduler.stop_polling_query(query_id);
    }
}

impl ManagerInner {
    /// Query ids and request ids are drawn from one monotonic counter, so a
    /// late result can always be told apart from the current attempt.
    fn generate_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn generate_query_id(&self) -> String {
        self.generate_id().to_string()
    }

    fn projected_state(&self) -> ClientState {
        self.store
            .get_state()
            .get(&self.root_key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn add_query_listener(&self, query_id: &str, listener: QueryListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(query_id.to_string(), listener);
        debug!(%query_id, "listener installed");
    }

    fn remove_query_listener(&self, query_id: &str) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(query_id);
        debug!(%query_id, "listener removed");
    }

    pub(crate) fn start_query(
        self: &Arc<Self>,
        options: Arc<RwLock<WatchQueryOptions>>,
        listener: QueryListener,
    ) -> String {
        let query_id = self.generate_query_id();
        self.add_query_listener(&query_id, listener);

        let snapshot = options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let inner = Arc::clone(self);
        let task_query_id = query_id.clone();
        tokio::spawn(async move {
            if let Err(error) = inner.fetch_query(&task_query_id, &snapshot).await {
                debug!(query_id = %task_query_id, %error, "watched fetch failed");
            }
        });

        query_id
    }

    pub(crate) fn stop_query(&self, query_id: &str) {
        self.remove_query_listener(query_id);
        self.scheduler.stop_polling_query(query_id);
        self.store.dispatch(StoreEvent::QueryStop {
            query_id: query_id.to_string(),
        });
    }

    /// The listener installed for a watch: applies the delivery contract to
    /// the query's store snapshot and re-reads result data from the entity
    /// map.
    pub(crate) fn make_listener(inner: Weak<ManagerInner>, observer: QueryObserver) -> QueryListener {
        Arc::new(move |value: &QueryStoreValue| {
            if value.loading && !value.return_partial_data {
                return;
            }
            if let Some(errors) = &value.graphql_errors {
                if let Some(next) = &observer.next {
                    next(GraphQLResult {
                        data: None,
                        errors: Some(errors.clone()),
                    });
                }
                return;
            }
            if let Some(error) = &value.network_error {
                match &observer.error {
                    Some(handler) => handler(error.clone()),
                    None => warn!(%error, "unhandled network error on watched query"),
                }
                return;
            }

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let state = inner.projected_state();
            match read_selection_set_from_store(
                &state.data,
                &value.query.id,
                &value.query.selection_set,
                value.variables.as_ref(),
                &value.fragment_map,
                value.return_partial_data,
            ) {
                Ok(data) => {
                    if let Some(next) = &observer.next {
                        next(GraphQLResult::from_data(data));
                    }
                }
                Err(error) => debug!(%error, "store read during broadcast failed"),
            }
        })
    }

    pub(crate) fn broadcast_if_changed(&self) {
        let view = self.projected_state();
        {
            let mut last = self
                .last_broadcast
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = last.as_ref() {
                if !previous.is_empty() && *previous == view {
                    return;
                }
            }
            *last = Some(view.clone());
        }
        self.broadcast_queries(&view);
    }

    fn broadcast_queries(&self, state: &ClientState) {
        // Snapshot the registry so a listener may unsubscribe mid-broadcast.
        let listeners: Vec<(String, QueryListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(query_id, listener)| (query_id.clone(), listener.clone()))
            .collect();

        for (query_id, listener) in listeners {
            if let Some(value) = state.queries.get(&query_id) {
                listener(value);
            }
        }
    }

    pub(crate) async fn fetch_query(
        self: &Arc<Self>,
        query_id: &str,
        options: &WatchQueryOptions,
    ) -> Result<GraphQLResult, QueryError> {
        let transformed = match &self.transformer {
            Some(transformer) => apply_query_transformer(&options.query, transformer.as_ref()),
            None => options.query.clone(),
        };
        let query_def = get_query_definition(&transformed)?;
        let fragment_map = create_fragment_map(&transformed);

        let untransformed_def = get_query_definition(&options.query)?;
        let query_ss = SelectionSetWithRoot::query(untransformed_def.selection_set.clone());
        let query_string = options.query.to_string();

        let mut minimized_query = None;
        let mut minimized_query_string = None;
        let mut minimized_doc = None;
        let mut initial_result = None;

        if options.force_fetch {
            minimized_query = Some(SelectionSetWithRoot::query(query_def.selection_set.clone()));
            minimized_query_string = Some(transformed.to_string());
            minimized_doc = Some(transformed.clone());
            // The planner is skipped, but a partial-data watch still gets
            // whatever the cache holds ahead of the forced fetch.
            if options.return_partial_data {
                let state = self.projected_state();
                initial_result = Some(read_selection_set_from_store(
                    &state.data,
                    &query_ss.id,
                    &query_ss.selection_set,
                    options.variables.as_ref(),
                    &fragment_map,
                    true,
                )?);
            }
        } else {
            let state = self.projected_state();
            let diff = diff_selection_set_against_store(
                &state.data,
                ROOT_QUERY_ID,
                "Query",
                &query_def.selection_set,
                options.variables.as_ref(),
                &fragment_map,
                false,
            )?;
            initial_result = Some(diff.result);
            if !diff.missing_selection_sets.is_empty() {
                let residual = document_for_missing(
                    query_def.name.clone(),
                    &query_def.variable_definitions,
                    &diff.missing_selection_sets,
                    &fragment_map,
                );
                let residual_def = get_query_definition(&residual)?;
                minimized_query = Some(SelectionSetWithRoot::query(residual_def.selection_set));
                minimized_query_string = Some(residual.to_string());
                minimized_doc = Some(residual);
            }
        }

        let request_id = self.generate_id();
        debug!(
            %query_id,
            request_id,
            force_fetch = options.force_fetch,
            skip_network = minimized_doc.is_none(),
            "fetching query"
        );

        self.store.dispatch(StoreEvent::QueryInit {
            query_string,
            query: query_ss.clone(),
            minimized_query_string,
            minimized_query,
            variables: options.variables.clone(),
            force_fetch: options.force_fetch,
            return_partial_data: options.return_partial_data,
            query_id: query_id.to_string(),
            request_id,
            fragment_map: fragment_map.clone(),
        });

        if minimized_doc.is_none() || options.return_partial_data {
            self.store.dispatch(StoreEvent::QueryResultClient {
                result: GraphQLResult {
                    data: initial_result.clone(),
                    errors: None,
                },
                variables: options.variables.clone(),
                query: query_ss.clone(),
                complete: minimized_doc.is_none(),
                query_id: query_id.to_string(),
            });
        }

        let Some(residual) = minimized_doc else {
            // Resolve through the caller's selection, like the post-fetch
            // merge does; the diff ran against the transformed query and may
            // hold injected fields the caller never asked for.
            let state = self.projected_state();
            let data = read_selection_set_from_store(
                &state.data,
                &query_ss.id,
                &query_ss.selection_set,
                options.variables.as_ref(),
                &fragment_map,
                options.return_partial_data,
            )
            .ok();
            return Ok(GraphQLResult { data, errors: None });
        };

        let request = GraphQLRequest {
            query: residual.to_string(),
            variables: options.variables.clone(),
            operation_name: query_def.name.clone(),
        };
        let receiver = self.batcher.enqueue_request(request, query_id.to_string());

        match receiver.await {
            Ok(Ok(result)) => {
                self.store.dispatch(StoreEvent::QueryResult {
                    result: result.clone(),
                    query_id: query_id.to_string(),
                    request_id,
                });
                // Merge cached and fetched data by re-reading the full
                // selection; a failed re-read surfaces through the store,
                // not this handle.
                let state = self.projected_state();
                let merged = read_selection_set_from_store(
                    &state.data,
                    &query_ss.id,
                    &query_ss.selection_set,
                    options.variables.as_ref(),
                    &fragment_map,
                    false,
                )
                .ok();
                Ok(GraphQLResult {
                    data: merged,
                    errors: None,
                })
            }
            Ok(Err(error)) => {
                self.store.dispatch(StoreEvent::QueryError {
                    error: error.clone(),
                    query_id: query_id.to_string(),
                    request_id,
                });
                Err(QueryError::Network(error))
            }
            Err(_) => {
                let error = Arc::new(NetworkError::RequestDropped);
                self.store.dispatch(StoreEvent::QueryError {
                    error: error.clone(),
                    query_id: query_id.to_string(),
                    request_id,
                });
                Err(QueryError::Network(error))
            }
        }
    }

    async fn mutate(&self, options: MutationOptions) -> Result<GraphQLResult, QueryError> {
        let mutation_id = self.generate_id().to_string();
        let mutation = match &self.transformer {
            Some(transformer) => apply_query_transformer(&options.mutation, transformer.as_ref()),
            None => options.mutation.clone(),
        };
        let mutation_def = get_mutation_definition(&mutation)?;
        let fragment_map = create_fragment_map(&mutation);
        let mutation_string = mutation.to_string();

        debug!(%mutation_id, "running mutation");
        self.store.dispatch(StoreEvent::MutationInit {
            mutation_string: mutation_string.clone(),
            mutation: SelectionSetWithRoot::mutation(mutation_def.selection_set.clone()),
            variables: options.variables.clone(),
            mutation_id: mutation_id.clone(),
            fragment_map,
        });

        let request = GraphQLRequest {
            query: mutation_string,
            variables: options.variables.clone(),
            operation_name: mutation_def.name.clone(),
        };
        let result = self
            .network
            .query(request)
            .await
            .map_err(|error| QueryError::Network(Arc::new(error)))?;

        self.store.dispatch(StoreEvent::MutationResult {
            result: result.clone(),
            mutation_id,
        });
        Ok(result)
    }
}
