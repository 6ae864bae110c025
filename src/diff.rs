//! Comparison of a selection set against the normalized store.
//!
//! The diff produces the best-effort projection the store can satisfy plus
//! the minimal selection subtrees whose data is absent; those subtrees seed
//! the residual query that goes over the wire.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::document::{
    selection_set_from, Field, FragmentMap, InlineFragment, Selection, SelectionSet,
};
use crate::store::NormalizedCache;
use crate::types::SelectionSetWithRoot;
use crate::writer::store_key_name;

#[derive(Debug, Error)]
pub enum StoreReadError {
    #[error("no field {field} found on object {id}")]
    MissingField { id: String, field: String },
    #[error("field {field} on {id} does not reference a stored object")]
    InvalidReference { id: String, field: String },
    #[error("unknown fragment {0}")]
    UnknownFragment(String),
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    /// Best-effort projection assembled from the store.
    pub result: Value,
    /// Ordered selection subtrees whose data is absent; empty when the store
    /// satisfies the whole selection.
    pub missing_selection_sets: Vec<SelectionSetWithRoot>,
}

/// Diff a selection set against the store rooted at `root_id`. With
/// `throw_on_missing_field` any absent field is an error instead of a
/// missing-selection entry.
pub fn diff_selection_set_against_store(
    store: &NormalizedCache,
    root_id: &str,
    type_name: &str,
    selection_set: &SelectionSet,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    throw_on_missing_field: bool,
) -> Result<DiffResult, StoreReadError> {
    let (result, missing) = diff_level(
        store,
        root_id,
        selection_set,
        variables,
        fragment_map,
        throw_on_missing_field,
    )?;

    let missing_selection_sets = if missing.is_empty() {
        Vec::new()
    } else {
        vec![SelectionSetWithRoot {
            id: root_id.to_string(),
            type_name: type_name.to_string(),
            selection_set: selection_set_from(missing),
        }]
    };

    Ok(DiffResult {
        result,
        missing_selection_sets,
    })
}

fn diff_level(
    store: &NormalizedCache,
    id: &str,
    selection_set: &SelectionSet,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    throw: bool,
) -> Result<(Value, Vec<Selection>), StoreReadError> {
    let record = store.get(id);
    let mut result = Map::new();
    let mut missing: Vec<Selection> = Vec::new();

    for item in &selection_set.items {
        match item {
            Selection::Field(field) => diff_field(
                store,
                id,
                record,
                field,
                variables,
                fragment_map,
                throw,
                &mut result,
                &mut missing,
            )?,
            Selection::FragmentSpread(spread) => {
                let fragment = fragment_map
                    .get(&spread.fragment_name)
                    .ok_or_else(|| StoreReadError::UnknownFragment(spread.fragment_name.clone()))?;
                let (fragment_result, fragment_missing) = diff_level(
                    store,
                    id,
                    &fragment.selection_set,
                    variables,
                    fragment_map,
                    throw,
                )?;
                merge_object(&mut result, fragment_result);
                // A named spread cannot be narrowed in the residual document.
                if !fragment_missing.is_empty() {
                    missing.push(Selection::FragmentSpread(spread.clone()));
                }
            }
            Selection::InlineFragment(inline) => {
                let (inline_result, inline_missing) = diff_level(
                    store,
                    id,
                    &inline.selection_set,
                    variables,
                    fragment_map,
                    throw,
                )?;
                merge_object(&mut result, inline_result);
                if !inline_missing.is_empty() {
                    missing.push(Selection::InlineFragment(InlineFragment {
                        selection_set: selection_set_from(inline_missing),
                        ..inline.clone()
                    }));
                }
            }
        }
    }

    Ok((Value::Object(result), missing))
}

#[allow(clippy::too_many_arguments)]
fn diff_field(
    store: &NormalizedCache,
    id: &str,
    record: Option<&crate::store::StoreObject>,
    field: &Field,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    throw: bool,
    result: &mut Map<String, Value>,
    missing: &mut Vec<Selection>,
) -> Result<(), StoreReadError> {
    let store_key = store_key_name(field, variables);
    let result_key = field.alias.clone().unwrap_or_else(|| field.name.clone());

    let Some(stored) = record.and_then(|object| object.get(&store_key)) else {
        if throw {
            return Err(StoreReadError::MissingField {
                id: id.to_string(),
                field: store_key,
            });
        }
        missing.push(Selection::Field(field.clone()));
        return Ok(());
    };

    if field.selection_set.items.is_empty() {
        result.insert(result_key, stored.clone());
        return Ok(());
    }

    match stored {
        Value::Null => {
            result.insert(result_key, Value::Null);
        }
        Value::String(child_id) => {
            let (child_result, child_missing) = diff_level(
                store,
                child_id,
                &field.selection_set,
                variables,
                fragment_map,
                throw,
            )?;
            result.insert(result_key, child_result);
            if !child_missing.is_empty() {
                missing.push(Selection::Field(Field {
                    selection_set: selection_set_from(child_missing),
                    ..field.clone()
                }));
            }
        }
        Value::Array(references) => {
            let mut complete = true;
            let mut items = Vec::with_capacity(references.len());
            for reference in references {
                match reference {
                    Value::Null => items.push(Value::Null),
                    Value::String(child_id) => {
                        let (child_result, child_missing) = diff_level(
                            store,
                            child_id,
                            &field.selection_set,
                            variables,
                            fragment_map,
                            throw,
                        )?;
                        if !child_missing.is_empty() {
                            complete = false;
                        }
                        items.push(child_result);
                    }
                    _ => {
                        if throw {
                            return Err(StoreReadError::InvalidReference {
                                id: id.to_string(),
                                field: store_key,
                            });
                        }
                        complete = false;
                    }
                }
            }
            result.insert(result_key, Value::Array(items));
            // Per-element residuals are not addressable from an operation
            // document, so an incomplete list is refetched whole.
            if !complete {
                missing.push(Selection::Field(field.clone()));
            }
        }
        _ => {
            if throw {
                return Err(StoreReadError::InvalidReference {
                    id: id.to_string(),
                    field: store_key,
                });
            }
            missing.push(Selection::Field(field.clone()));
        }
    }

    Ok(())
}

fn merge_object(target: &mut Map<String, Value>, source: Value) {
    if let Value::Object(entries) = source {
        for (key, value) in entries {
            target.insert(key, value);
        }
    }
}
