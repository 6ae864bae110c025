//! The event-sourced cache behind the query manager.
//!
//! The manager never mutates cache state directly: it dispatches events from
//! the vocabulary below, and a [`Store`] implementation applies them. The
//! event kind strings are the binding contract with external stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::document::{FragmentMap, SelectionSet};
use crate::network::NetworkError;
use crate::types::{GraphQLError, GraphQLResult, SelectionSetWithRoot, ROOT_MUTATION_ID, ROOT_QUERY_ID};
use crate::writer::write_selection_set_to_store;

pub const QUERY_INIT: &str = "APOLLO_QUERY_INIT";
pub const QUERY_RESULT_CLIENT: &str = "APOLLO_QUERY_RESULT_CLIENT";
pub const QUERY_RESULT: &str = "APOLLO_QUERY_RESULT";
pub const QUERY_ERROR: &str = "APOLLO_QUERY_ERROR";
pub const QUERY_STOP: &str = "APOLLO_QUERY_STOP";
pub const MUTATION_INIT: &str = "APOLLO_MUTATION_INIT";
pub const MUTATION_RESULT: &str = "APOLLO_MUTATION_RESULT";

/// A record in the normalized entity map.
pub type StoreObject = Map<String, Value>;
/// The normalized entity map: data id to record.
pub type NormalizedCache = HashMap<String, StoreObject>;

/// A cache-mutating event dispatched by the query manager.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    QueryInit {
        query_string: String,
        query: SelectionSetWithRoot,
        minimized_query_string: Option<String>,
        minimized_query: Option<SelectionSetWithRoot>,
        variables: Option<Value>,
        force_fetch: bool,
        return_partial_data: bool,
        query_id: String,
        request_id: u64,
        fragment_map: FragmentMap,
    },
    QueryResultClient {
        result: GraphQLResult,
        variables: Option<Value>,
        query: SelectionSetWithRoot,
        complete: bool,
        query_id: String,
    },
    QueryResult {
        result: GraphQLResult,
        query_id: String,
        request_id: u64,
    },
    QueryError {
        error: Arc<NetworkError>,
        query_id: String,
        request_id: u64,
    },
    QueryStop {
        query_id: String,
    },
    MutationInit {
        mutation_string: String,
        mutation: SelectionSetWithRoot,
        variables: Option<Value>,
        mutation_id: String,
        fragment_map: FragmentMap,
    },
    MutationResult {
        result: GraphQLResult,
        mutation_id: String,
    },
}

impl StoreEvent {
    /// The event's kind string, the external interface with host stores.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::QueryInit { .. } => QUERY_INIT,
            StoreEvent::QueryResultClient { .. } => QUERY_RESULT_CLIENT,
            StoreEvent::QueryResult { .. } => QUERY_RESULT,
            StoreEvent::QueryError { .. } => QUERY_ERROR,
            StoreEvent::QueryStop { .. } => QUERY_STOP,
            StoreEvent::MutationInit { .. } => MUTATION_INIT,
            StoreEvent::MutationResult { .. } => MUTATION_RESULT,
        }
    }
}

/// The store's per-query snapshot record; the value listeners are fed.
#[derive(Debug, Clone)]
pub struct QueryStoreValue {
    pub query_string: String,
    pub query: SelectionSetWithRoot,
    pub minimized_query_string: Option<String>,
    pub minimized_query: Option<SelectionSetWithRoot>,
    pub variables: Option<Value>,
    pub loading: bool,
    pub force_fetch: bool,
    pub return_partial_data: bool,
    pub request_id: u64,
    pub graphql_errors: Option<Vec<GraphQLError>>,
    pub network_error: Option<Arc<NetworkError>>,
    pub fragment_map: FragmentMap,
}

impl PartialEq for QueryStoreValue {
    fn eq(&self, other: &Self) -> bool {
        let network_error_eq = match (&self.network_error, &other.network_error) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.to_string() == b.to_string(),
            _ => false,
        };
        network_error_eq
            && self.query_string == other.query_string
            && self.query == other.query
            && self.minimized_query_string == other.minimized_query_string
            && self.minimized_query == other.minimized_query
            && self.variables == other.variables
            && self.loading == other.loading
            && self.force_fetch == other.force_fetch
            && self.return_partial_data == other.return_partial_data
            && self.request_id == other.request_id
            && self.graphql_errors == other.graphql_errors
            && self.fragment_map == other.fragment_map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationStoreValue {
    pub mutation_string: String,
    pub mutation: SelectionSetWithRoot,
    pub variables: Option<Value>,
    pub loading: bool,
    pub fragment_map: FragmentMap,
}

/// What a network result should be written with, recorded at
/// `APOLLO_QUERY_INIT` and consumed when the matching result or error
/// arrives. Kept apart from the query record so that a result landing after
/// `APOLLO_QUERY_STOP` still reaches the entity map.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub selection_set: SelectionSet,
    pub variables: Option<Value>,
    pub fragment_map: FragmentMap,
}

/// The projected view the manager broadcasts from: `state[root_key]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    pub data: NormalizedCache,
    pub queries: HashMap<String, QueryStoreValue>,
    pub mutations: HashMap<String, MutationStoreValue>,
    pub in_flight: HashMap<u64, WritePlan>,
}

impl ClientState {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.queries.is_empty() && self.mutations.is_empty()
    }

    /// Apply one event. This is the whole reducer; custom [`Store`]
    /// implementations can delegate to it.
    pub fn apply(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::QueryInit {
                query_string,
                query,
                minimized_query_string,
                minimized_query,
                variables,
                force_fetch,
                return_partial_data,
                query_id,
                request_id,
                fragment_map,
            } => {
                if let Some(minimized) = minimized_query {
                    self.in_flight.insert(
                        *request_id,
                        WritePlan {
                            selection_set: minimized.selection_set.clone(),
                            variables: variables.clone(),
                            fragment_map: fragment_map.clone(),
                        },
                    );
                }
                self.queries.insert(
                    query_id.clone(),
                    QueryStoreValue {
                        query_string: query_string.clone(),
                        query: query.clone(),
                        minimized_query_string: minimized_query_string.clone(),
                        minimized_query: minimized_query.clone(),
                        variables: variables.clone(),
                        loading: true,
                        force_fetch: *force_fetch,
                        return_partial_data: *return_partial_data,
                        request_id: *request_id,
                        graphql_errors: None,
                        network_error: None,
                        fragment_map: fragment_map.clone(),
                    },
                );
            }
            StoreEvent::QueryResultClient {
                complete, query_id, ..
            } => {
                if let Some(value) = self.queries.get_mut(query_id) {
                    value.loading = !complete;
                    value.network_error = None;
                }
            }
            StoreEvent::QueryResult {
                result,
                query_id,
                request_id,
            } => {
                if let Some(plan) = self.in_flight.remove(request_id) {
                    if let Some(data) = &result.data {
                        if let Err(error) = write_selection_set_to_store(
                            data,
                            ROOT_QUERY_ID,
                            &plan.selection_set,
                            plan.variables.as_ref(),
                            &plan.fragment_map,
                            &mut self.data,
                        ) {
                            warn!(%query_id, %error, "failed to write query result into the store");
                        }
                    }
                }
                if let Some(value) = self.queries.get_mut(query_id) {
                    // A superseded attempt's result updates the entity map
                    // above but not the live query record.
                    if value.request_id == *request_id {
                        value.loading = false;
                        value.network_error = None;
                        value.graphql_errors = result.errors.clone();
                    }
                }
            }
            StoreEvent::QueryError {
                error,
                query_id,
                request_id,
            } => {
                self.in_flight.remove(request_id);
                if let Some(value) = self.queries.get_mut(query_id) {
                    if value.request_id == *request_id {
                        value.loading = false;
                        value.network_error = Some(error.clone());
                    }
                }
            }
            StoreEvent::QueryStop { query_id } => {
                self.queries.remove(query_id);
            }
            StoreEvent::MutationInit {
                mutation_string,
                mutation,
                variables,
                mutation_id,
                fragment_map,
            } => {
                self.mutations.insert(
                    mutation_id.clone(),
                    MutationStoreValue {
                        mutation_string: mutation_string.clone(),
                        mutation: mutation.clone(),
                        variables: variables.clone(),
                        loading: true,
                        fragment_map: fragment_map.clone(),
                    },
                );
            }
            StoreEvent::MutationResult {
                result,
                mutation_id,
            } => {
                if let Some(value) = self.mutations.get_mut(mutation_id) {
                    value.loading = false;
                    if let Some(data) = &result.data {
                        if let Err(error) = write_selection_set_to_store(
                            data,
                            ROOT_MUTATION_ID,
                            &value.mutation.selection_set,
                            value.variables.as_ref(),
                            &value.fragment_map,
                            &mut self.data,
                        ) {
                            warn!(%mutation_id, %error, "failed to write mutation result into the store");
                        }
                    }
                }
            }
        }
    }
}

pub type StoreSubscriber = Arc<dyn Fn() + Send + Sync>;

/// The narrow seam between the manager and its cache. `dispatch` is
/// synchronous: after it returns, `get_state` reflects the event.
pub trait Store: Send + Sync {
    fn dispatch(&self, event: StoreEvent);

    fn get_state(&self) -> HashMap<String, ClientState>;

    /// Register a change callback, invoked after every dispatch. Returns
    /// false when the store does not support subscriptions, in which case
    /// the host must trigger re-broadcasts explicitly.
    fn subscribe(&self, callback: StoreSubscriber) -> bool {
        let _ = callback;
        false
    }
}

/// The default store: client state under a single root key, guarded by a
/// mutex, with synchronous subscriber notification.
pub struct MemoryStore {
    root_key: String,
    state: Mutex<HashMap<String, ClientState>>,
    subscribers: Mutex<Vec<StoreSubscriber>>,
}

impl MemoryStore {
    pub fn new(root_key: impl Into<String>) -> Self {
        Self {
            root_key: root_key.into(),
            state: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl Store for MemoryStore {
    fn dispatch(&self, event: StoreEvent) {
        debug!(kind = event.kind(), "applying store event");
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.entry(self.root_key.clone()).or_default().apply(&event);
        }

        let subscribers: Vec<StoreSubscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber();
        }
    }

    fn get_state(&self) -> HashMap<String, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self, callback: StoreSubscriber) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::document::{create_fragment_map, get_query_definition, parse_document};

    const ROOT: &str = "apollo";

    fn init_event(query_id: &str, request_id: u64, source: &str) -> StoreEvent {
        let document = parse_document(source).unwrap();
        let query = get_query_definition(&document).unwrap();
        let fragment_map = create_fragment_map(&document);
        let selection = SelectionSetWithRoot::query(query.selection_set.clone());
        StoreEvent::QueryInit {
            query_string: document.to_string(),
            query: selection.clone(),
            minimized_query_string: Some(document.to_string()),
            minimized_query: Some(selection),
            variables: None,
            force_fetch: false,
            return_partial_data: false,
            query_id: query_id.to_string(),
            request_id,
            fragment_map,
        }
    }

    fn slice(store: &MemoryStore) -> ClientState {
        store.get_state().get(ROOT).cloned().unwrap_or_default()
    }

    #[test]
    fn init_inserts_a_loading_query() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));

        let state = slice(&store);
        let value = state.queries.get("1").unwrap();
        assert!(value.loading);
        assert!(value.network_error.is_none());
        assert!(state.in_flight.contains_key(&1));
    }

    #[test]
    fn result_writes_data_and_clears_loading() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryResult {
            result: GraphQLResult::from_data(json!({"hero": {"name": "Luke"}})),
            query_id: "1".to_string(),
            request_id: 1,
        });

        let state = slice(&store);
        assert!(!state.queries.get("1").unwrap().loading);
        assert!(state.in_flight.is_empty());
        assert_eq!(
            state.data.get("ROOT_QUERY.hero").unwrap().get("name"),
            Some(&json!("Luke"))
        );
    }

    #[test]
    fn late_result_after_stop_still_writes_data() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryStop {
            query_id: "1".to_string(),
        });
        store.dispatch(StoreEvent::QueryResult {
            result: GraphQLResult::from_data(json!({"hero": {"name": "Luke"}})),
            query_id: "1".to_string(),
            request_id: 1,
        });

        let state = slice(&store);
        assert!(state.queries.is_empty());
        assert!(state.data.contains_key("ROOT_QUERY.hero"));
    }

    #[test]
    fn superseded_result_does_not_touch_the_live_record() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        // A refetch reuses the query id with a fresh request id.
        store.dispatch(init_event("1", 2, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryResult {
            result: GraphQLResult::from_data(json!({"hero": {"name": "Old"}})),
            query_id: "1".to_string(),
            request_id: 1,
        });

        let state = slice(&store);
        // The stale attempt wrote data but the record still loads attempt 2.
        assert!(state.queries.get("1").unwrap().loading);
        assert_eq!(state.queries.get("1").unwrap().request_id, 2);
        assert!(state.data.contains_key("ROOT_QUERY.hero"));
    }

    #[test]
    fn error_records_the_network_error() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryError {
            error: Arc::new(NetworkError::Transport("boom".to_string())),
            query_id: "1".to_string(),
            request_id: 1,
        });

        let state = slice(&store);
        let value = state.queries.get("1").unwrap();
        assert!(!value.loading);
        assert!(value.network_error.is_some());
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn result_client_toggles_loading_on_complete() {
        let store = MemoryStore::new(ROOT);
        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryResultClient {
            result: GraphQLResult::from_data(json!({"hero": {"name": "Luke"}})),
            variables: None,
            query: SelectionSetWithRoot::query(crate::document::empty_selection_set()),
            complete: true,
            query_id: "1".to_string(),
        });

        assert!(!slice(&store).queries.get("1").unwrap().loading);
    }

    #[test]
    fn mutation_result_writes_under_the_mutation_root() {
        let store = MemoryStore::new(ROOT);
        let document = parse_document("mutation { addHero { name } }").unwrap();
        let mutation = crate::document::get_mutation_definition(&document).unwrap();
        store.dispatch(StoreEvent::MutationInit {
            mutation_string: document.to_string(),
            mutation: SelectionSetWithRoot::mutation(mutation.selection_set.clone()),
            variables: None,
            mutation_id: "5".to_string(),
            fragment_map: FragmentMap::new(),
        });
        store.dispatch(StoreEvent::MutationResult {
            result: GraphQLResult::from_data(json!({"addHero": {"name": "Rey"}})),
            mutation_id: "5".to_string(),
        });

        let state = slice(&store);
        assert!(!state.mutations.get("5").unwrap().loading);
        assert_eq!(
            state.data.get("ROOT_MUTATION.addHero").unwrap().get("name"),
            Some(&json!("Rey"))
        );
    }

    #[test]
    fn subscribers_fire_once_per_dispatch() {
        let store = MemoryStore::new(ROOT);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        assert!(store.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        store.dispatch(init_event("1", 1, "{ hero { name } }"));
        store.dispatch(StoreEvent::QueryStop {
            query_id: "1".to_string(),
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn event_kinds_are_the_wire_strings() {
        assert_eq!(
            StoreEvent::QueryStop {
                query_id: String::new()
            }
            .kind(),
            "APOLLO_QUERY_STOP"
        );
        assert_eq!(QUERY_INIT, "APOLLO_QUERY_INIT");
        assert_eq!(QUERY_RESULT_CLIENT, "APOLLO_QUERY_RESULT_CLIENT");
        assert_eq!(QUERY_RESULT, "APOLLO_QUERY_RESULT");
        assert_eq!(QUERY_ERROR, "APOLLO_QUERY_ERROR");
        assert_eq!(MUTATION_INIT, "APOLLO_MUTATION_INIT");
        assert_eq!(MUTATION_RESULT, "APOLLO_MUTATION_RESULT");
    }
}
