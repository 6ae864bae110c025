//! Projection of a selection set out of the normalized store.

use serde_json::Value;

use crate::diff::{diff_selection_set_against_store, StoreReadError};
use crate::document::{FragmentMap, SelectionSet};
use crate::store::NormalizedCache;

/// Read a selection set rooted at `root_id` out of the store. With
/// `return_partial_data` the projection is best-effort; otherwise any absent
/// field is an error.
pub fn read_selection_set_from_store(
    store: &NormalizedCache,
    root_id: &str,
    selection_set: &SelectionSet,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    return_partial_data: bool,
) -> Result<Value, StoreReadError> {
    let diff = diff_selection_set_against_store(
        store,
        root_id,
        "Query",
        selection_set,
        variables,
        fragment_map,
        !return_partial_data,
    )?;
    Ok(diff.result)
}
