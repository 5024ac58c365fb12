//! Document projection.
//!
//! A projection is strictly inclusive or strictly exclusive — mixing the
//! two is an error, except for `_id` which may be excluded from an
//! inclusive projection. Rebuilt documents preserve the original field
//! order.

use bson::{Bson, Document};

use crate::error::QueryError;
use crate::matcher;

#[derive(Debug, Clone, PartialEq)]
enum Spec {
    Include,
    Exclude,
    Slice(i64),
    SliceRange(i64, i64),
    ElemMatch(Document),
    Positional,
    Meta,
}

/// Apply `projection` to `doc`. The driving `query` resolves the
/// positional `$` operator.
pub fn apply(
    doc: &Document,
    projection: &Document,
    query: Option<&Document>,
) -> Result<Document, QueryError> {
    let specs = parse(projection)?;

    let inclusive = specs
        .iter()
        .filter(|(path, _)| path != "_id")
        .any(|(_, spec)| {
            matches!(
                spec,
                Spec::Include | Spec::ElemMatch(_) | Spec::Positional | Spec::Meta
            )
        });
    let exclusive = specs
        .iter()
        .filter(|(path, _)| path != "_id")
        .any(|(_, spec)| matches!(spec, Spec::Exclude));
    if inclusive && exclusive {
        return Err(QueryError::BadValue(
            "cannot mix inclusive and exclusive projection".into(),
        ));
    }

    let id_excluded = specs
        .iter()
        .any(|(path, spec)| path == "_id" && *spec == Spec::Exclude);

    if inclusive {
        project_inclusive(doc, &specs, id_excluded, query)
    } else if exclusive {
        project_exclusive(doc, &specs, "")
    } else if id_excluded || specs.iter().any(|(_, s)| matches!(s, Spec::Slice(_) | Spec::SliceRange(..))) {
        // `{_id: 0}` alone and bare `$slice` projections keep every
        // other field — exclusive shape
        project_exclusive(doc, &specs, "")
    } else {
        project_inclusive(doc, &specs, id_excluded, query)
    }
}

fn parse(projection: &Document) -> Result<Vec<(String, Spec)>, QueryError> {
    if projection.is_empty() {
        return Err(QueryError::BadValue("empty projection document".into()));
    }
    let mut specs = Vec::with_capacity(projection.len());
    for (key, value) in projection.iter() {
        let spec = match value {
            Bson::Int32(0) => Spec::Exclude,
            Bson::Int64(0) => Spec::Exclude,
            Bson::Double(d) if *d == 0.0 => Spec::Exclude,
            Bson::Boolean(false) => Spec::Exclude,
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(true) => {
                Spec::Include
            }
            Bson::Document(op) => parse_operator(key, op)?,
            _ => {
                return Err(QueryError::BadValue(format!(
                    "projection value for '{key}' must be 0, 1 or an operator document"
                )))
            }
        };
        if let Some(prefix) = key.strip_suffix(".$") {
            if spec != Spec::Include {
                return Err(QueryError::BadValue(format!(
                    "positional projection '{key}' takes no operand"
                )));
            }
            specs.push((prefix.to_string(), Spec::Positional));
        } else {
            specs.push((key.clone(), spec));
        }
    }
    Ok(specs)
}

fn parse_operator(key: &str, op: &Document) -> Result<Spec, QueryError> {
    if op.len() != 1 {
        return Err(QueryError::BadValue(format!(
            "projection operator for '{key}' must have a single entry"
        )));
    }
    let (name, operand) = op.iter().next().expect("length checked");
    match name.as_str() {
        "$slice" => match operand {
            Bson::Int32(n) => Ok(Spec::Slice(i64::from(*n))),
            Bson::Int64(n) => Ok(Spec::Slice(*n)),
            Bson::Array(parts) if parts.len() == 2 => {
                let skip = int_value(&parts[0]);
                let limit = int_value(&parts[1]);
                match (skip, limit) {
                    (Some(skip), Some(limit)) if limit > 0 => Ok(Spec::SliceRange(skip, limit)),
                    _ => Err(QueryError::BadValue(format!(
                        "$slice for '{key}' expects [skip, limit] with positive limit"
                    ))),
                }
            }
            _ => Err(QueryError::BadValue(format!(
                "$slice for '{key}' expects a count or [skip, limit]"
            ))),
        },
        "$elemMatch" => match operand {
            Bson::Document(cond) => Ok(Spec::ElemMatch(cond.clone())),
            _ => Err(QueryError::TypeMismatch(format!(
                "$elemMatch for '{key}' expects a document"
            ))),
        },
        "$meta" => match operand {
            Bson::String(kind) if kind == "textScore" => Ok(Spec::Meta),
            _ => Err(QueryError::BadValue(format!(
                "$meta for '{key}' supports only \"textScore\""
            ))),
        },
        other => Err(QueryError::UnknownOperator(format!("{other} (projection)"))),
    }
}

fn int_value(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
}

// ── Inclusive projection ────────────────────────────────────────

fn project_inclusive(
    doc: &Document,
    specs: &[(String, Spec)],
    id_excluded: bool,
    query: Option<&Document>,
) -> Result<Document, QueryError> {
    let paths: Vec<(Vec<&str>, &Spec)> = specs
        .iter()
        .filter(|(path, spec)| path != "_id" || *spec != Spec::Exclude)
        .map(|(path, spec)| (path.split('.').collect(), spec))
        .collect();

    let mut out = Document::new();
    if !id_excluded {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    include_fields(doc, &paths, "", query, &mut out)?;

    // $meta fields materialize even when absent from the source
    for (path, spec) in specs {
        if *spec == Spec::Meta && doppio_bson::path::get(&out, path).is_none() {
            doppio_bson::path::put(&mut out, path, Bson::Double(0.0), false)?;
        }
    }
    Ok(out)
}

fn include_fields(
    source: &Document,
    paths: &[(Vec<&str>, &Spec)],
    prefix: &str,
    query: Option<&Document>,
    out: &mut Document,
) -> Result<(), QueryError> {
    for (key, value) in source.iter() {
        if key == "_id" && prefix.is_empty() {
            continue; // handled by the caller
        }
        let relevant: Vec<&(Vec<&str>, &Spec)> = paths
            .iter()
            .filter(|(segments, _)| segments[0] == key.as_str())
            .collect();
        if relevant.is_empty() {
            continue;
        }

        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if let Some((_, spec)) = relevant.iter().find(|(segments, _)| segments.len() == 1) {
            if let Some(projected) = project_leaf(value, spec, &full, query)? {
                out.insert(key.clone(), projected);
            }
            continue;
        }

        let trimmed: Vec<(Vec<&str>, &Spec)> = relevant
            .iter()
            .map(|(segments, spec)| (segments[1..].to_vec(), *spec))
            .collect();
        match value {
            Bson::Document(d) => {
                let mut sub = Document::new();
                include_fields(d, &trimmed, &full, query, &mut sub)?;
                out.insert(key.clone(), Bson::Document(sub));
            }
            Bson::Array(items) => {
                let mut fresh = Vec::new();
                for item in items {
                    if let Bson::Document(d) = item {
                        let mut sub = Document::new();
                        include_fields(d, &trimmed, &full, query, &mut sub)?;
                        fresh.push(Bson::Document(sub));
                    }
                }
                out.insert(key.clone(), Bson::Array(fresh));
            }
            _ => {}
        }
    }
    Ok(())
}

fn project_leaf(
    value: &Bson,
    spec: &Spec,
    path: &str,
    query: Option<&Document>,
) -> Result<Option<Bson>, QueryError> {
    match spec {
        Spec::Include => Ok(Some(value.clone())),
        Spec::Exclude => Ok(None),
        Spec::Meta => Ok(Some(Bson::Double(0.0))),
        Spec::Slice(n) => Ok(Some(slice_array(value, *n)?)),
        Spec::SliceRange(skip, limit) => Ok(Some(slice_range(value, *skip, *limit)?)),
        Spec::ElemMatch(cond) => {
            let items = match value {
                Bson::Array(items) => items,
                _ => return Ok(None),
            };
            for item in items {
                if matcher::element_matches(item, cond)? {
                    return Ok(Some(Bson::Array(vec![item.clone()])));
                }
            }
            Ok(None)
        }
        Spec::Positional => {
            let items = match value {
                Bson::Array(items) => items,
                _ => return Ok(None),
            };
            let query = query.ok_or_else(|| {
                QueryError::BadValue(format!(
                    "positional projection requires a query condition on '{path}'"
                ))
            })?;
            for item in items {
                if positional_hit(item, path, query)? {
                    return Ok(Some(Bson::Array(vec![item.clone()])));
                }
            }
            Ok(None)
        }
    }
}

fn positional_hit(item: &Bson, path: &str, query: &Document) -> Result<bool, QueryError> {
    let mut found = false;
    for (key, condition) in query.iter() {
        let ok = if key == path {
            found = true;
            matcher::value_matches(item, condition)?
        } else if let Some(rest) = key.strip_prefix(path).and_then(|r| r.strip_prefix('.')) {
            found = true;
            match item {
                Bson::Document(d) => matcher::match_field(d, rest, condition)?,
                _ => false,
            }
        } else {
            continue;
        };
        if !ok {
            return Ok(false);
        }
    }
    if !found {
        return Err(QueryError::BadValue(format!(
            "positional projection requires a query condition on '{path}'"
        )));
    }
    Ok(true)
}

fn slice_array(value: &Bson, n: i64) -> Result<Bson, QueryError> {
    let items = match value {
        Bson::Array(items) => items,
        other => return Ok(other.clone()),
    };
    let sliced: Vec<Bson> = if n >= 0 {
        items.iter().take(n as usize).cloned().collect()
    } else {
        let keep = n.unsigned_abs() as usize;
        items
            .iter()
            .skip(items.len().saturating_sub(keep))
            .cloned()
            .collect()
    };
    Ok(Bson::Array(sliced))
}

fn slice_range(value: &Bson, skip: i64, limit: i64) -> Result<Bson, QueryError> {
    let items = match value {
        Bson::Array(items) => items,
        other => return Ok(other.clone()),
    };
    let start = if skip < 0 {
        items.len().saturating_sub(skip.unsigned_abs() as usize)
    } else {
        (skip as usize).min(items.len())
    };
    let sliced: Vec<Bson> = items
        .iter()
        .skip(start)
        .take(limit as usize)
        .cloned()
        .collect();
    Ok(Bson::Array(sliced))
}

// ── Exclusive projection ────────────────────────────────────────

fn project_exclusive(
    doc: &Document,
    specs: &[(String, Spec)],
    prefix: &str,
) -> Result<Document, QueryError> {
    let mut out = Document::new();
    'fields: for (key, value) in doc.iter() {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        let mut deeper = false;
        for (path, spec) in specs {
            if *path == full {
                match spec {
                    Spec::Exclude => continue 'fields,
                    Spec::Slice(n) => {
                        out.insert(key.clone(), slice_array(value, *n)?);
                        continue 'fields;
                    }
                    Spec::SliceRange(skip, limit) => {
                        out.insert(key.clone(), slice_range(value, *skip, *limit)?);
                        continue 'fields;
                    }
                    _ => {}
                }
            } else if path.starts_with(&full) && path.as_bytes().get(full.len()) == Some(&b'.') {
                deeper = true;
            }
        }

        if deeper {
            match value {
                Bson::Document(d) => {
                    out.insert(
                        key.clone(),
                        Bson::Document(project_exclusive(d, specs, &full)?),
                    );
                    continue;
                }
                Bson::Array(items) => {
                    let mut fresh = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Bson::Document(d) => fresh.push(Bson::Document(project_exclusive(
                                d, specs, &full,
                            )?)),
                            other => fresh.push(other.clone()),
                        }
                    }
                    out.insert(key.clone(), Bson::Array(fresh));
                    continue;
                }
                _ => {}
            }
        }

        out.insert(key.clone(), value.clone());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn project(doc: &Document, projection: Document) -> Document {
        apply(doc, &projection, None).unwrap()
    }

    #[test]
    fn inclusive_keeps_id_and_listed_fields_in_order() {
        let d = doc! { "_id": 1, "a": 10, "b": 20, "c": 30 };
        assert_eq!(project(&d, doc! { "c": 1, "a": 1 }), doc! { "_id": 1, "a": 10, "c": 30 });
    }

    #[test]
    fn inclusive_can_drop_id() {
        let d = doc! { "_id": 1, "a": 10 };
        assert_eq!(project(&d, doc! { "a": 1, "_id": 0 }), doc! { "a": 10 });
    }

    #[test]
    fn exclusive_removes_listed_fields() {
        let d = doc! { "_id": 1, "a": 10, "b": { "x": 1, "y": 2 } };
        assert_eq!(
            project(&d, doc! { "a": 0, "b.y": 0 }),
            doc! { "_id": 1, "b": { "x": 1 } }
        );
    }

    #[test]
    fn mixing_modes_is_an_error() {
        let d = doc! { "a": 1, "b": 2 };
        assert!(apply(&d, &doc! { "a": 1, "b": 0 }, None).is_err());
    }

    #[test]
    fn id_exclusion_does_not_mix_modes() {
        let d = doc! { "_id": 1, "a": 2 };
        assert_eq!(project(&d, doc! { "_id": 0 }), doc! { "a": 2 });
    }

    #[test]
    fn nested_inclusive_paths() {
        let d = doc! { "_id": 1, "a": { "x": 1, "y": 2 }, "b": 3 };
        assert_eq!(
            project(&d, doc! { "a.x": 1 }),
            doc! { "_id": 1, "a": { "x": 1 } }
        );
    }

    #[test]
    fn inclusive_path_through_array_of_documents() {
        let d = doc! { "_id": 1, "items": [{ "sku": "a", "qty": 2 }, { "sku": "b", "qty": 5 }] };
        assert_eq!(
            project(&d, doc! { "items.sku": 1 }),
            doc! { "_id": 1, "items": [{ "sku": "a" }, { "sku": "b" }] }
        );
    }

    #[test]
    fn slice_positive_negative_and_range() {
        let d = doc! { "_id": 1, "a": [1, 2, 3, 4, 5] };
        assert_eq!(project(&d, doc! { "a": { "$slice": 2 } }), doc! { "_id": 1, "a": [1, 2] });
        assert_eq!(
            project(&d, doc! { "a": { "$slice": -2 } }),
            doc! { "_id": 1, "a": [4, 5] }
        );
        assert_eq!(
            project(&d, doc! { "a": { "$slice": [1, 2] } }),
            doc! { "_id": 1, "a": [2, 3] }
        );
    }

    #[test]
    fn elem_match_projects_first_matching_element() {
        let d = doc! { "_id": 1, "scores": [{ "v": 4 }, { "v": 9 }, { "v": 11 }] };
        assert_eq!(
            project(&d, doc! { "scores": { "$elemMatch": { "v": { "$gt": 5 } } } }),
            doc! { "_id": 1, "scores": [{ "v": 9 }] }
        );
        // no match omits the field
        assert_eq!(
            project(&d, doc! { "scores": { "$elemMatch": { "v": { "$gt": 50 } } } }),
            doc! { "_id": 1 }
        );
    }

    #[test]
    fn positional_projects_query_matched_element() {
        let d = doc! { "_id": 1, "grades": [70, 92, 88] };
        let query = doc! { "grades": { "$gte": 90 } };
        assert_eq!(
            apply(&d, &doc! { "grades.$": 1 }, Some(&query)).unwrap(),
            doc! { "_id": 1, "grades": [92] }
        );
    }

    #[test]
    fn meta_projects_stable_sentinel() {
        let d = doc! { "_id": 1, "title": "x" };
        assert_eq!(
            project(&d, doc! { "title": 1, "score": { "$meta": "textScore" } }),
            doc! { "_id": 1, "title": "x", "score": 0.0 }
        );
    }

    #[test]
    fn bare_slice_keeps_other_fields() {
        let d = doc! { "_id": 1, "a": [1, 2, 3], "b": "keep" };
        assert_eq!(
            project(&d, doc! { "a": { "$slice": 1 } }),
            doc! { "_id": 1, "a": [1], "b": "keep" }
        );
    }

    #[test]
    fn unknown_projection_operator_errors() {
        let d = doc! { "a": [1] };
        assert!(apply(&d, &doc! { "a": { "$filter": 1 } }, None).is_err());
    }
}
