//! Derive a defaults document from a match filter. Used by upsert to
//! seed the inserted document when nothing matched.

use bson::{Bson, Document};

use doppio_bson::path;

use crate::error::QueryError;

/// Collect every path constrained to a concrete value by the filter:
/// bare equality, `$eq`, and single-element `$in`, at the top level and
/// inside `$and`. A `$or` contributes only when it has exactly one
/// branch. Other operators constrain nothing and are skipped.
pub fn extract(query: &Document) -> Result<Document, QueryError> {
    let mut doc = Document::new();
    process(&mut doc, query)?;
    Ok(doc)
}

fn process(doc: &mut Document, query: &Document) -> Result<(), QueryError> {
    for (key, value) in query.iter() {
        match key.as_str() {
            "$and" => {
                let branches = branch_list(key, value)?;
                for branch in branches {
                    process(doc, branch)?;
                }
            }
            "$or" | "$nor" => {
                let branches = branch_list(key, value)?;
                if key == "$or" && branches.len() == 1 {
                    process(doc, branches[0])?;
                }
            }
            k if k.starts_with('$') => {}
            _ => extract_field(doc, key, value)?,
        }
    }
    Ok(())
}

fn extract_field(doc: &mut Document, field: &str, value: &Bson) -> Result<(), QueryError> {
    match value {
        Bson::Document(cond) if is_operator_doc(cond) => {
            for (name, operand) in cond.iter() {
                match name.as_str() {
                    "$eq" => path::put(doc, field, operand.clone(), false)?,
                    "$in" => {
                        let items = match operand {
                            Bson::Array(items) => items,
                            _ => {
                                return Err(QueryError::TypeMismatch(
                                    "$in: expected an array".into(),
                                ))
                            }
                        };
                        if items.len() == 1 {
                            path::put(doc, field, items[0].clone(), false)?;
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => path::put(doc, field, value.clone(), false)?,
    }
    Ok(())
}

fn branch_list<'a>(name: &str, value: &'a Bson) -> Result<Vec<&'a Document>, QueryError> {
    let items = match value {
        Bson::Array(items) => items,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected an array"))),
    };
    if items.is_empty() {
        return Err(QueryError::BadValue(format!("{name}: empty array")));
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d),
            _ => Err(QueryError::TypeMismatch(format!(
                "{name}: expected an array of documents"
            ))),
        })
        .collect()
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn bare_equality_and_eq_and_singleton_in() {
        let query = doc! { "a": 1, "b": { "$eq": "x" }, "c": { "$in": [true] } };
        assert_eq!(extract(&query).unwrap(), doc! { "a": 1, "b": "x", "c": true });
    }

    #[test]
    fn descends_into_and() {
        let query = doc! { "$and": [{ "a": 1 }, { "$and": [{ "b": 2 }] }] };
        assert_eq!(extract(&query).unwrap(), doc! { "a": 1, "b": 2 });
    }

    #[test]
    fn or_contributes_only_when_singleton() {
        let single = doc! { "$or": [{ "a": 1 }] };
        assert_eq!(extract(&single).unwrap(), doc! { "a": 1 });

        let multiple = doc! { "$or": [{ "a": 1 }, { "a": 2 }] };
        assert_eq!(extract(&multiple).unwrap(), doc! {});
    }

    #[test]
    fn range_operators_are_skipped() {
        let query = doc! { "a": { "$gt": 5 }, "b": 7, "c": { "$in": [1, 2] } };
        assert_eq!(extract(&query).unwrap(), doc! { "b": 7 });
    }

    #[test]
    fn dotted_paths_build_nested_documents() {
        let query = doc! { "a.b": 1, "a.c": 2 };
        assert_eq!(extract(&query).unwrap(), doc! { "a": { "b": 1, "c": 2 } });
    }

    #[test]
    fn extracted_defaults_satisfy_their_filter() {
        let filters = vec![
            doc! { "a": 1 },
            doc! { "a": { "$eq": "x" }, "b.c": true },
            doc! { "$and": [{ "n": 5 }, { "m": { "$in": [7] } }] },
            doc! { "$or": [{ "solo": 1 }] },
        ];
        for filter in filters {
            let defaults = extract(&filter).unwrap();
            assert!(
                crate::matcher::match_doc(&defaults, &filter).unwrap(),
                "defaults {defaults} do not satisfy {filter}"
            );
        }
    }
}
