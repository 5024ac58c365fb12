//! Dot-separated path access. Numeric components index arrays and may
//! also name document fields. A missing field is `None`, never null.

use bson::{Bson, Document};

use crate::error::PathError;

/// Read the value at `path`. Returns `None` when any component is absent.
pub fn get<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current: Option<&Bson> = None;
    for segment in path.split('.') {
        current = match current {
            None => doc.get(segment),
            Some(Bson::Document(d)) => d.get(segment),
            Some(Bson::Array(arr)) => match segment.parse::<usize>() {
                Ok(idx) => arr.get(idx),
                Err(_) => None,
            },
            Some(_) => None,
        };
        current?;
    }
    current
}

/// Write `value` at `path`, creating intermediate documents as needed.
/// Numeric components address array elements; writing one past the end
/// appends, writing further pads with null. With `prepend` the leaf key
/// is moved to the front of its parent document.
pub fn put(
    doc: &mut Document,
    path: &str,
    value: Bson,
    prepend: bool,
) -> Result<(), PathError> {
    let segments: Vec<&str> = path.split('.').collect();
    put_in_document(doc, &segments, path, value, prepend)
}

/// Remove the value at `path`. Removing an array element nulls it out
/// instead of splicing, preserving sibling positions. Returns the old
/// value if one was present.
pub fn unset(doc: &mut Document, path: &str) -> Option<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    unset_in_document(doc, &segments)
}

fn put_in_document(
    doc: &mut Document,
    segments: &[&str],
    full: &str,
    value: Bson,
    prepend: bool,
) -> Result<(), PathError> {
    let head = segments[0];
    if segments.len() == 1 {
        if prepend {
            insert_front(doc, head, value);
        } else {
            doc.insert(head.to_string(), value);
        }
        return Ok(());
    }

    if doc.get(head).is_none() {
        doc.insert(head.to_string(), Bson::Document(Document::new()));
    }
    match doc.get_mut(head) {
        Some(target) => put_in_value(target, &segments[1..], full, value, prepend),
        None => unreachable!("intermediate inserted above"),
    }
}

fn put_in_value(
    target: &mut Bson,
    segments: &[&str],
    full: &str,
    value: Bson,
    prepend: bool,
) -> Result<(), PathError> {
    match target {
        Bson::Document(d) => put_in_document(d, segments, full, value, prepend),
        Bson::Array(arr) => {
            let head = segments[0];
            let idx: usize = head
                .parse()
                .map_err(|_| PathError::BadIndex(full.to_string()))?;
            while arr.len() < idx {
                arr.push(Bson::Null);
            }
            if segments.len() == 1 {
                if idx < arr.len() {
                    arr[idx] = value;
                } else {
                    arr.push(value);
                }
                return Ok(());
            }
            if idx == arr.len() {
                arr.push(Bson::Document(Document::new()));
            }
            put_in_value(&mut arr[idx], &segments[1..], full, value, prepend)
        }
        _ => Err(PathError::Conflict(full.to_string())),
    }
}

fn unset_in_document(doc: &mut Document, segments: &[&str]) -> Option<Bson> {
    let head = segments[0];
    if segments.len() == 1 {
        return doc.remove(head);
    }
    match doc.get_mut(head) {
        Some(target) => unset_in_value(target, &segments[1..]),
        None => None,
    }
}

fn unset_in_value(target: &mut Bson, segments: &[&str]) -> Option<Bson> {
    match target {
        Bson::Document(d) => unset_in_document(d, segments),
        Bson::Array(arr) => {
            let idx: usize = segments[0].parse().ok()?;
            if segments.len() == 1 {
                if idx < arr.len() {
                    Some(std::mem::replace(&mut arr[idx], Bson::Null))
                } else {
                    None
                }
            } else {
                unset_in_value(arr.get_mut(idx)?, &segments[1..])
            }
        }
        _ => None,
    }
}

fn insert_front(doc: &mut Document, key: &str, value: Bson) {
    let mut fresh = Document::new();
    fresh.insert(key.to_string(), value);
    let old = std::mem::take(doc);
    for (k, v) in old {
        if k != key {
            fresh.insert(k, v);
        }
    }
    *doc = fresh;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    #[test]
    fn get_walks_documents_and_arrays() {
        let d = doc! { "a": { "b": [10, { "c": 20 }] } };
        assert_eq!(get(&d, "a.b.0"), Some(&bson!(10)));
        assert_eq!(get(&d, "a.b.1.c"), Some(&bson!(20)));
        assert_eq!(get(&d, "a.b.2"), None);
        assert_eq!(get(&d, "a.x"), None);
    }

    #[test]
    fn get_numeric_component_names_document_field() {
        let d = doc! { "a": { "0": "zero" } };
        assert_eq!(get(&d, "a.0"), Some(&bson!("zero")));
    }

    #[test]
    fn put_creates_intermediate_documents() {
        let mut d = doc! {};
        put(&mut d, "a.b.c", bson!(7), false).unwrap();
        assert_eq!(d, doc! { "a": { "b": { "c": 7 } } });
    }

    #[test]
    fn put_into_array_by_index_and_append() {
        let mut d = doc! { "a": [1, 2] };
        put(&mut d, "a.1", bson!(9), false).unwrap();
        put(&mut d, "a.2", bson!(3), false).unwrap();
        assert_eq!(d, doc! { "a": [1, 9, 3] });
    }

    #[test]
    fn put_pads_array_with_null() {
        let mut d = doc! { "a": [] };
        put(&mut d, "a.2", bson!(1), false).unwrap();
        assert_eq!(d, doc! { "a": [Bson::Null, Bson::Null, 1] });
    }

    #[test]
    fn put_conflicts_on_scalar_in_path() {
        let mut d = doc! { "a": 1 };
        let err = put(&mut d, "a.b", bson!(2), false).unwrap_err();
        assert_eq!(err, PathError::Conflict("a.b".into()));
    }

    #[test]
    fn put_prepend_moves_key_to_front() {
        let mut d = doc! { "x": 1, "y": 2 };
        put(&mut d, "_id", bson!(5), true).unwrap();
        let keys: Vec<&str> = d.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["_id", "x", "y"]);
    }

    #[test]
    fn unset_removes_field_and_nulls_array_element() {
        let mut d = doc! { "a": { "b": 1 }, "c": [1, 2, 3] };
        assert_eq!(unset(&mut d, "a.b"), Some(bson!(1)));
        assert_eq!(unset(&mut d, "c.1"), Some(bson!(2)));
        assert_eq!(d, doc! { "a": {}, "c": [1, Bson::Null, 3] });
        assert_eq!(unset(&mut d, "nope.x"), None);
    }
}
