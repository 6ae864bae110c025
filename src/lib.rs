//! Client-side GraphQL query manager.
//!
//! The manager mediates between application code and a normalized result
//! cache plus a network transport: it diffs requested queries against the
//! cache so only the missing part goes over the wire, coalesces in-flight
//! requests through a batching layer, drives the cache through an explicit
//! event vocabulary, and fans store changes out to any number of live
//! observers.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use quasar_client::{
//!     parse_document, HttpNetworkInterface, MemoryStore, QueryManager, QueryManagerOptions,
//!     WatchQueryOptions,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = QueryManager::new(QueryManagerOptions::new(
//!     Arc::new(HttpNetworkInterface::new("https://example.com/graphql")),
//!     Arc::new(MemoryStore::new("apollo")),
//! ));
//!
//! let query = parse_document("{ hero { name } }")?;
//! let result = manager.query(WatchQueryOptions::new(query)).await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

mod batcher;
mod diff;
mod document;
mod manager;
mod network;
mod observable;
mod reader;
mod scheduler;
mod store;
mod types;
mod writer;

pub use batcher::{FetchResponse, QueryBatcher};
pub use diff::{diff_selection_set_against_store, DiffResult, StoreReadError};
pub use document::{
    apply_query_transformer, create_fragment_map, get_mutation_definition, get_query_definition,
    parse_document, AddTypename, Document, DocumentError, FragmentMap, OperationDefinition,
    QueryTransformer, SelectionSet,
};
pub use manager::{QueryError, QueryManager, QueryManagerOptions};
pub use network::{HttpNetworkInterface, NetworkError, NetworkInterface};
pub use observable::{ObservableQuery, ObserverEvent, QueryObserver, QuerySubscription};
pub use reader::read_selection_set_from_store;
pub use store::{
    ClientState, MemoryStore, MutationStoreValue, NormalizedCache, QueryStoreValue, Store,
    StoreEvent, StoreObject, StoreSubscriber, WritePlan, MUTATION_INIT, MUTATION_RESULT,
    QUERY_ERROR, QUERY_INIT, QUERY_RESULT, QUERY_RESULT_CLIENT, QUERY_STOP,
};
pub use types::{
    ErrorLocation, GraphQLError, GraphQLRequest, GraphQLResult, MutationOptions,
    SelectionSetWithRoot, WatchQueryOptions, ROOT_MUTATION_ID, ROOT_QUERY_ID,
};
pub use writer::{write_selection_set_to_store, StoreWriteError};
