use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, SelectionSet};

/// Root id of the query entity in the normalized store.
pub const ROOT_QUERY_ID: &str = "ROOT_QUERY";
/// Root id of the mutation entity in the normalized store.
pub const ROOT_MUTATION_ID: &str = "ROOT_MUTATION";

/// The request payload sent to a network interface, shaped like a standard
/// GraphQL POST body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

/// A GraphQL execution result: data, schema-level errors, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,
}

impl GraphQLResult {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }
}

/// A schema-level error returned inside a successful transport response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// A selection tree plus the id and type of the entity it is read from or
/// written to. The addressable unit of store reads, writes, and diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSetWithRoot {
    pub id: String,
    pub type_name: String,
    pub selection_set: SelectionSet,
}

impl SelectionSetWithRoot {
    pub fn query(selection_set: SelectionSet) -> Self {
        Self {
            id: ROOT_QUERY_ID.to_string(),
            type_name: "Query".to_string(),
            selection_set,
        }
    }

    pub fn mutation(selection_set: SelectionSet) -> Self {
        Self {
            id: ROOT_MUTATION_ID.to_string(),
            type_name: "Mutation".to_string(),
            selection_set,
        }
    }
}

/// Options for a watched (or one-shot) query.
#[derive(Debug, Clone)]
pub struct WatchQueryOptions {
    pub query: Document,
    pub variables: Option<Value>,
    pub force_fetch: bool,
    pub return_partial_data: bool,
    pub poll_interval: Option<Duration>,
}

impl WatchQueryOptions {
    pub fn new(query: Document) -> Self {
        Self {
            query,
            variables: None,
            force_fetch: false,
            return_partial_data: false,
            poll_interval: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_force_fetch(mut self, force_fetch: bool) -> Self {
        self.force_fetch = force_fetch;
        self
    }

    pub fn with_return_partial_data(mut self, return_partial_data: bool) -> Self {
        self.return_partial_data = return_partial_data;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }
}

/// Options for a one-shot mutation.
#[derive(Debug, Clone)]
pub struct MutationOptions {
    pub mutation: Document,
    pub variables: Option<Value>,
}

impl MutationOptions {
    pub fn new(mutation: Document) -> Self {
        Self {
            mutation,
            variables: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }
}
