//! Normalization of GraphQL result trees into the flat entity map.
//!
//! Objects are stored under generated ids derived from their path
//! (`{parentId}.{storeKey}`, list elements `{parentId}.{storeKey}.{index}`)
//! and referenced from their parent record by id.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::document::{AstValue, Field, FragmentMap, Selection, SelectionSet};
use crate::store::NormalizedCache;

#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("result for {data_id} is missing field {field}")]
    MissingField { data_id: String, field: String },
    #[error("result for {data_id} is not an object")]
    NotAnObject { data_id: String },
    #[error("field {field} on {data_id} has a selection set but resolved to a scalar")]
    ScalarWithSelection { data_id: String, field: String },
    #[error("unknown fragment {0}")]
    UnknownFragment(String),
}

/// Write a result tree into the normalized store under `data_id`, guided by
/// the selection set it was fetched with.
pub fn write_selection_set_to_store(
    result: &Value,
    data_id: &str,
    selection_set: &SelectionSet,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    store: &mut NormalizedCache,
) -> Result<(), StoreWriteError> {
    let object = result.as_object().ok_or_else(|| StoreWriteError::NotAnObject {
        data_id: data_id.to_string(),
    })?;

    for item in &selection_set.items {
        match item {
            Selection::Field(field) => {
                write_field(object, data_id, field, variables, fragment_map, store)?;
            }
            Selection::FragmentSpread(spread) => {
                let fragment = fragment_map
                    .get(&spread.fragment_name)
                    .ok_or_else(|| StoreWriteError::UnknownFragment(spread.fragment_name.clone()))?;
                write_selection_set_to_store(
                    result,
                    data_id,
                    &fragment.selection_set,
                    variables,
                    fragment_map,
                    store,
                )?;
            }
            Selection::InlineFragment(inline) => {
                write_selection_set_to_store(
                    result,
                    data_id,
                    &inline.selection_set,
                    variables,
                    fragment_map,
                    store,
                )?;
            }
        }
    }

    Ok(())
}

fn write_field(
    object: &Map<String, Value>,
    data_id: &str,
    field: &Field,
    variables: Option<&Value>,
    fragment_map: &FragmentMap,
    store: &mut NormalizedCache,
) -> Result<(), StoreWriteError> {
    let result_key = field.alias.as_ref().unwrap_or(&field.name);
    let value = object
        .get(result_key)
        .ok_or_else(|| StoreWriteError::MissingField {
            data_id: data_id.to_string(),
            field: result_key.clone(),
        })?;
    let store_key = store_key_name(field, variables);

    let stored = if field.selection_set.items.is_empty() {
        value.clone()
    } else {
        match value {
            Value::Null => Value::Null,
            Value::Array(items) => {
                let mut references = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    if item.is_null() {
                        references.push(Value::Null);
                        continue;
                    }
                    let item_id = format!("{data_id}.{store_key}.{index}");
                    write_selection_set_to_store(
                        item,
                        &item_id,
                        &field.selection_set,
                        variables,
                        fragment_map,
                        store,
                    )?;
                    references.push(Value::String(item_id));
                }
                Value::Array(references)
            }
            Value::Object(_) => {
                let child_id = format!("{data_id}.{store_key}");
                write_selection_set_to_store(
                    value,
                    &child_id,
                    &field.selection_set,
                    variables,
                    fragment_map,
                    store,
                )?;
                Value::String(child_id)
            }
            _ => {
                return Err(StoreWriteError::ScalarWithSelection {
                    data_id: data_id.to_string(),
                    field: result_key.clone(),
                })
            }
        }
    };

    store
        .entry(data_id.to_string())
        .or_default()
        .insert(store_key, stored);
    Ok(())
}

/// The key a field occupies in its parent's store record: the field name,
/// with canonically serialized arguments appended when present. Variable
/// references resolve against the operation's variables; an absent variable
/// coerces to null.
pub fn store_key_name(field: &Field, variables: Option<&Value>) -> String {
    if field.arguments.is_empty() {
        return field.name.clone();
    }

    let mut arguments = Map::new();
    for (name, value) in &field.arguments {
        arguments.insert(name.clone(), ast_value_to_json(value, variables));
    }
    format!("{}({})", field.name, Value::Object(arguments))
}

fn ast_value_to_json(value: &AstValue, variables: Option<&Value>) -> Value {
    match value {
        AstValue::Variable(name) => variables
            .and_then(|vars| vars.get(name.as_str()))
            .cloned()
            .unwrap_or(Value::Null),
        AstValue::Int(number) => number.as_i64().map(Value::from).unwrap_or(Value::Null),
        AstValue::Float(float) => Number::from_f64(*float).map(Value::Number).unwrap_or(Value::Null),
        AstValue::String(string) => Value::String(string.clone()),
        AstValue::Boolean(boolean) => Value::Bool(*boolean),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => Value::String(name.clone()),
        AstValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| ast_value_to_json(item, variables))
                .collect(),
        ),
        AstValue::Object(entries) => {
            let mut object = Map::new();
            for (key, entry) in entries {
                object.insert(key.clone(), ast_value_to_json(entry, variables));
            }
            Value::Object(object)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::document::{create_fragment_map, get_query_definition, parse_document};
    use crate::types::ROOT_QUERY_ID;

    fn write(source: &str, result: serde_json::Value, variables: Option<Value>) -> NormalizedCache {
        let document = parse_document(source).unwrap();
        let query = get_query_definition(&document).unwrap();
        let fragments = create_fragment_map(&document);
        let mut store = NormalizedCache::new();
        write_selection_set_to_store(
            &result,
            ROOT_QUERY_ID,
            &query.selection_set,
            variables.as_ref(),
            &fragments,
            &mut store,
        )
        .unwrap();
        store
    }

    #[test]
    fn scalars_land_on_the_root_record() {
        let store = write("{ name age }", json!({"name": "Luke", "age": 23}), None);

        let root = store.get(ROOT_QUERY_ID).unwrap();
        assert_eq!(root.get("name"), Some(&json!("Luke")));
        assert_eq!(root.get("age"), Some(&json!(23)));
    }

    #[test]
    fn nested_objects_become_references() {
        let store = write(
            "{ hero { name } }",
            json!({"hero": {"name": "Luke"}}),
            None,
        );

        let root = store.get(ROOT_QUERY_ID).unwrap();
        assert_eq!(root.get("hero"), Some(&json!("ROOT_QUERY.hero")));
        let hero = store.get("ROOT_QUERY.hero").unwrap();
        assert_eq!(hero.get("name"), Some(&json!("Luke")));
    }

    #[test]
    fn arguments_resolve_variables_into_the_store_key() {
        let store = write(
            "query User($id: ID!) { user(id: $id) { name } }",
            json!({"user": {"name": "Ada"}}),
            Some(json!({"id": 1})),
        );

        let root = store.get(ROOT_QUERY_ID).unwrap();
        assert_eq!(
            root.get("user({\"id\":1})"),
            Some(&json!("ROOT_QUERY.user({\"id\":1})"))
        );
        assert!(store.contains_key("ROOT_QUERY.user({\"id\":1})"));
    }

    #[test]
    fn lists_store_per_index_references() {
        let store = write(
            "{ heroes { name } }",
            json!({"heroes": [{"name": "Luke"}, null, {"name": "Leia"}]}),
            None,
        );

        let root = store.get(ROOT_QUERY_ID).unwrap();
        assert_eq!(
            root.get("heroes"),
            Some(&json!(["ROOT_QUERY.heroes.0", null, "ROOT_QUERY.heroes.2"]))
        );
        assert_eq!(
            store.get("ROOT_QUERY.heroes.2").unwrap().get("name"),
            Some(&json!("Leia"))
        );
    }

    #[test]
    fn aliased_fields_read_the_alias_but_store_the_field() {
        let store = write(
            "{ mainHero: hero { name } }",
            json!({"mainHero": {"name": "Luke"}}),
            None,
        );

        let root = store.get(ROOT_QUERY_ID).unwrap();
        assert_eq!(root.get("hero"), Some(&json!("ROOT_QUERY.hero")));
        assert!(root.get("mainHero").is_none());
    }

    #[test]
    fn fragment_selections_write_to_the_same_record() {
        let store = write(
            "query { hero { ...heroFields } } fragment heroFields on Hero { name }",
            json!({"hero": {"name": "Luke"}}),
            None,
        );

        assert_eq!(
            store.get("ROOT_QUERY.hero").unwrap().get("name"),
            Some(&json!("Luke"))
        );
    }

    #[test]
    fn missing_result_field_is_an_error() {
        let document = parse_document("{ name age }").unwrap();
        let query = get_query_definition(&document).unwrap();
        let mut store = NormalizedCache::new();

        let result = write_selection_set_to_store(
            &json!({"name": "Luke"}),
            ROOT_QUERY_ID,
            &query.selection_set,
            None,
            &FragmentMap::new(),
            &mut store,
        );

        assert!(matches!(
            result,
            Err(StoreWriteError::MissingField { field, .. }) if field == "age"
        ));
    }
}
