//! List utilities over shared documents.

use std::collections::HashSet;

use bson::Bson;

use crate::order::{compare, compare_opt};
use crate::{identity, path, Doc, List};

/// Documents of `a` that are not in `b`, by pointer identity. The order
/// of `a` is preserved; `b` may be in any order.
pub fn difference(a: &List, b: &List) -> List {
    let drop: HashSet<usize> = b.iter().map(identity).collect();
    a.iter()
        .filter(|doc| !drop.contains(&identity(doc)))
        .cloned()
        .collect()
}

/// Stable sort by the value at `path`.
pub fn sort(list: &mut List, path: &str, reverse: bool) {
    list.sort_by(|a, b| {
        let ord = compare_opt(path::get(a, path), path::get(b, path));
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Collect the value at `path` from every document. Missing values are
/// skipped when `compact`, null otherwise. With `distinct` the result is
/// sorted and deduplicated under the total order.
pub fn collect(list: &List, path: &str, compact: bool, distinct: bool) -> Vec<Bson> {
    let mut result = Vec::with_capacity(list.len());
    for doc in list {
        match path::get(doc, path) {
            Some(value) => result.push(value.clone()),
            None if compact => {}
            None => result.push(Bson::Null),
        }
    }

    if !distinct {
        return result;
    }

    result.sort_by(compare);
    result.dedup_by(|a, b| compare(a, b) == std::cmp::Ordering::Equal);
    result
}

/// Like [`collect`], but array values contribute their elements instead
/// of the array itself (one level deep).
pub fn pick(list: &List, path: &str, compact: bool) -> Vec<Bson> {
    let mut result = Vec::with_capacity(list.len());
    for doc in list {
        match path::get(doc, path) {
            Some(Bson::Array(items)) => result.extend(items.iter().cloned()),
            Some(value) => result.push(value.clone()),
            None if compact => {}
            None => result.push(Bson::Null),
        }
    }
    result
}

/// Apply `f` to a deep copy of every document, keeping the results.
pub fn transform<F>(list: &List, mut f: F) -> Result<List, crate::PathError>
where
    F: FnMut(&mut bson::Document) -> Result<(), crate::PathError>,
{
    let mut out = Vec::with_capacity(list.len());
    for doc in list {
        let mut fresh = bson::Document::clone(doc);
        f(&mut fresh)?;
        out.push(Doc::new(fresh));
    }
    Ok(out)
}
