//! AST utilities over [`graphql-parser`]'s query grammar: operation
//! extraction, fragment maps, the query-transformer pipeline, and the
//! composition of residual documents for partially cached queries.

use std::collections::{BTreeSet, HashMap};

use graphql_parser::Pos;
use thiserror::Error;

use crate::types::SelectionSetWithRoot;

pub type Document = graphql_parser::query::Document<'static, String>;
pub type Definition = graphql_parser::query::Definition<'static, String>;
pub type OperationDefinition = graphql_parser::query::OperationDefinition<'static, String>;
pub type Query = graphql_parser::query::Query<'static, String>;
pub type Mutation = graphql_parser::query::Mutation<'static, String>;
pub type SelectionSet = graphql_parser::query::SelectionSet<'static, String>;
pub type Selection = graphql_parser::query::Selection<'static, String>;
pub type Field = graphql_parser::query::Field<'static, String>;
pub type FragmentDefinition = graphql_parser::query::FragmentDefinition<'static, String>;
pub type FragmentSpread = graphql_parser::query::FragmentSpread<'static, String>;
pub type InlineFragment = graphql_parser::query::InlineFragment<'static, String>;
pub type VariableDefinition = graphql_parser::query::VariableDefinition<'static, String>;
pub type AstValue = graphql_parser::query::Value<'static, String>;

/// Fragment name to definition, derived once per document and threaded
/// through every read, write, and diff involving that document.
pub type FragmentMap = HashMap<String, FragmentDefinition>;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to parse document: {0}")]
    Parse(#[from] graphql_parser::query::ParseError),
    #[error("document contains no query operation")]
    NoQuery,
    #[error("document contains no mutation operation")]
    NoMutation,
    #[error("document contains more than one operation")]
    MultipleOperations,
}

/// Parse a GraphQL source string into an owned document.
pub fn parse_document(source: &str) -> Result<Document, DocumentError> {
    Ok(graphql_parser::parse_query::<String>(source)?.into_static())
}

fn pos() -> Pos {
    Pos { line: 0, column: 0 }
}

pub(crate) fn empty_selection_set() -> SelectionSet {
    SelectionSet {
        span: (pos(), pos()),
        items: Vec::new(),
    }
}

pub(crate) fn selection_set_from(items: Vec<Selection>) -> SelectionSet {
    SelectionSet {
        span: (pos(), pos()),
        items,
    }
}

/// Extract the single query operation from a document. A bare selection set
/// (`{ ... }`) is treated as an anonymous query.
pub fn get_query_definition(document: &Document) -> Result<Query, DocumentError> {
    let mut queries = document.definitions.iter().filter_map(|def| match def {
        Definition::Operation(OperationDefinition::Query(query)) => Some(query.clone()),
        Definition::Operation(OperationDefinition::SelectionSet(selection_set)) => Some(Query {
            position: selection_set.span.0,
            name: None,
            variable_definitions: Vec::new(),
            directives: Vec::new(),
            selection_set: selection_set.clone(),
        }),
        _ => None,
    });

    let query = queries.next().ok_or(DocumentError::NoQuery)?;
    if queries.next().is_some() {
        return Err(DocumentError::MultipleOperations);
    }
    Ok(query)
}

/// Extract the single mutation operation from a document.
pub fn get_mutation_definition(document: &Document) -> Result<Mutation, DocumentError> {
    let mut mutations = document.definitions.iter().filter_map(|def| match def {
        Definition::Operation(OperationDefinition::Mutation(mutation)) => Some(mutation.clone()),
        _ => None,
    });

    let mutation = mutations.next().ok_or(DocumentError::NoMutation)?;
    if mutations.next().is_some() {
        return Err(DocumentError::MultipleOperations);
    }
    Ok(mutation)
}

/// Collect the document's fragment definitions by name.
pub fn create_fragment_map(document: &Document) -> FragmentMap {
    document
        .definitions
        .iter()
        .filter_map(|def| match def {
            Definition::Fragment(fragment) => Some((fragment.name.clone(), fragment.clone())),
            _ => None,
        })
        .collect()
}

/// A configuration-time hook that rewrites an operation definition before it
/// is diffed or sent, e.g. to inject `__typename` selections. Must be pure
/// with respect to its input.
pub trait QueryTransformer: Send + Sync {
    fn transform(&self, operation: OperationDefinition) -> OperationDefinition;
}

impl<F> QueryTransformer for F
where
    F: Fn(OperationDefinition) -> OperationDefinition + Send + Sync,
{
    fn transform(&self, operation: OperationDefinition) -> OperationDefinition {
        self(operation)
    }
}

/// Apply a transformer to the document's operation definitions, substituting
/// each rewritten operation back into the document. Fragments pass through
/// untouched.
pub fn apply_query_transformer(document: &Document, transformer: &dyn QueryTransformer) -> Document {
    let definitions = document
        .definitions
        .iter()
        .map(|def| match def {
            Definition::Operation(operation) => {
                Definition::Operation(transformer.transform(operation.clone()))
            }
            Definition::Fragment(fragment) => Definition::Fragment(fragment.clone()),
        })
        .collect();
    Document { definitions }
}

/// Transformer that adds a `__typename` field to every non-empty selection
/// set in the operation.
pub struct AddTypename;

impl QueryTransformer for AddTypename {
    fn transform(&self, operation: OperationDefinition) -> OperationDefinition {
        match operation {
            OperationDefinition::SelectionSet(mut selection_set) => {
                add_typename_to_selection_set(&mut selection_set);
                OperationDefinition::SelectionSet(selection_set)
            }
            OperationDefinition::Query(mut query) => {
                add_typename_to_selection_set(&mut query.selection_set);
                OperationDefinition::Query(query)
            }
            OperationDefinition::Mutation(mut mutation) => {
                add_typename_to_selection_set(&mut mutation.selection_set);
                OperationDefinition::Mutation(mutation)
            }
            OperationDefinition::Subscription(mut subscription) => {
                add_typename_to_selection_set(&mut subscription.selection_set);
                OperationDefinition::Subscription(subscription)
            }
        }
    }
}

fn add_typename_to_selection_set(selection_set: &mut SelectionSet) {
    if selection_set.items.is_empty() {
        return;
    }

    let already_present = selection_set.items.iter().any(|item| {
        matches!(item, Selection::Field(field) if field.name == "__typename")
    });
    if !already_present {
        selection_set.items.push(Selection::Field(Field {
            position: pos(),
            alias: None,
            name: "__typename".to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: empty_selection_set(),
        }));
    }

    for item in &mut selection_set.items {
        match item {
            Selection::Field(field) => add_typename_to_selection_set(&mut field.selection_set),
            Selection::InlineFragment(inline) => {
                add_typename_to_selection_set(&mut inline.selection_set);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// Compose a query document requesting only the given missing selection
/// subtrees, preserving the original operation's name and variable
/// definitions and carrying the fragment definitions the subtrees reference.
pub fn document_for_missing(
    name: Option<String>,
    variable_definitions: &[VariableDefinition],
    missing: &[SelectionSetWithRoot],
    fragment_map: &FragmentMap,
) -> Document {
    let items = missing
        .iter()
        .flat_map(|set| set.selection_set.items.iter().cloned())
        .collect();
    let selection_set = selection_set_from(items);

    let mut definitions = vec![Definition::Operation(OperationDefinition::Query(Query {
        position: pos(),
        name,
        variable_definitions: variable_definitions.to_vec(),
        directives: Vec::new(),
        selection_set: selection_set.clone(),
    }))];

    for fragment_name in used_fragment_names(&selection_set, fragment_map) {
        if let Some(fragment) = fragment_map.get(&fragment_name) {
            definitions.push(Definition::Fragment(fragment.clone()));
        }
    }

    Document { definitions }
}

fn used_fragment_names(selection_set: &SelectionSet, fragment_map: &FragmentMap) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_fragment_names(selection_set, fragment_map, &mut names);
    names
}

fn collect_fragment_names(
    selection_set: &SelectionSet,
    fragment_map: &FragmentMap,
    names: &mut BTreeSet<String>,
) {
    for item in &selection_set.items {
        match item {
            Selection::Field(field) => collect_fragment_names(&field.selection_set, fragment_map, names),
            Selection::InlineFragment(inline) => {
                collect_fragment_names(&inline.selection_set, fragment_map, names);
            }
            Selection::FragmentSpread(spread) => {
                if names.insert(spread.fragment_name.clone()) {
                    if let Some(fragment) = fragment_map.get(&spread.fragment_name) {
                        collect_fragment_names(&fragment.selection_set, fragment_map, names);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_definition_from_named_operation() {
        let document = parse_document("query Hero($id: ID!) { hero(id: $id) { name } }").unwrap();
        let query = get_query_definition(&document).unwrap();

        assert_eq!(query.name.as_deref(), Some("Hero"));
        assert_eq!(query.variable_definitions.len(), 1);
        assert_eq!(query.selection_set.items.len(), 1);
    }

    #[test]
    fn query_definition_from_bare_selection_set() {
        let document = parse_document("{ hero { name } }").unwrap();
        let query = get_query_definition(&document).unwrap();

        assert!(query.name.is_none());
        assert!(query.variable_definitions.is_empty());
    }

    #[test]
    fn mutation_document_is_not_a_query() {
        let document = parse_document("mutation { addHero { name } }").unwrap();
        assert!(matches!(
            get_query_definition(&document),
            Err(DocumentError::NoQuery)
        ));
        assert!(get_mutation_definition(&document).is_ok());
    }

    #[test]
    fn fragment_map_collects_definitions() {
        let document = parse_document(
            "query { hero { ...heroFields } } fragment heroFields on Hero { name }",
        )
        .unwrap();
        let fragments = create_fragment_map(&document);

        assert_eq!(fragments.len(), 1);
        assert!(fragments.contains_key("heroFields"));
    }

    #[test]
    fn add_typename_reaches_nested_selections() {
        let document = parse_document("{ hero { name friends { name } } }").unwrap();
        let transformed = apply_query_transformer(&document, &AddTypename);
        let printed = transformed.to_string();

        assert_eq!(printed.matches("__typename").count(), 3);

        // A second application is a no-op.
        let again = apply_query_transformer(&transformed, &AddTypename);
        assert_eq!(again.to_string(), printed);
    }

    #[test]
    fn missing_document_preserves_name_and_variables() {
        let document =
            parse_document("query Hero($id: ID!) { hero(id: $id) { name email } }").unwrap();
        let query = get_query_definition(&document).unwrap();
        let missing = vec![SelectionSetWithRoot::query(query.selection_set.clone())];

        let residual = document_for_missing(
            query.name.clone(),
            &query.variable_definitions,
            &missing,
            &FragmentMap::new(),
        );
        let residual_def = get_query_definition(&residual).unwrap();

        assert_eq!(residual_def.name.as_deref(), Some("Hero"));
        assert_eq!(residual_def.variable_definitions.len(), 1);
        assert_eq!(residual_def.selection_set.items, query.selection_set.items);

        let printed = residual.to_string();
        assert!(printed.contains("query Hero"));
        assert!(parse_document(&printed).is_ok());
    }

    #[test]
    fn missing_document_carries_referenced_fragments() {
        let document = parse_document(
            "query { hero { ...heroFields } } fragment heroFields on Hero { name }",
        )
        .unwrap();
        let query = get_query_definition(&document).unwrap();
        let fragments = create_fragment_map(&document);
        let missing = vec![SelectionSetWithRoot::query(query.selection_set.clone())];

        let residual = document_for_missing(None, &[], &missing, &fragments);

        assert!(residual.to_string().contains("fragment heroFields on Hero"));
    }
}
