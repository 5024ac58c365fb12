//! Multi-column stable sort driven by a sort document.

use bson::{Bson, Document};

use doppio_bson::order::compare_opt;
use doppio_bson::{path, List};

use crate::error::QueryError;

/// Parse a sort document into `(path, ascending)` columns. Directions
/// must be numeric `1` or `-1`.
pub fn columns(sort: &Document) -> Result<Vec<(String, bool)>, QueryError> {
    let mut cols = Vec::with_capacity(sort.len());
    for (key, dir) in sort.iter() {
        cols.push((key.clone(), ascending(key, dir)?));
    }
    Ok(cols)
}

/// Stable sort of `list` by the columns of `sort`, in declared order.
pub fn sort_list(list: &mut List, sort: &Document) -> Result<(), QueryError> {
    let cols = columns(sort)?;
    if cols.is_empty() {
        return Ok(());
    }
    list.sort_by(|a, b| {
        for (col, asc) in &cols {
            let mut ord = compare_opt(path::get(a, col), path::get(b, col));
            if !*asc {
                ord = ord.reverse();
            }
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(())
}

fn ascending(key: &str, dir: &Bson) -> Result<bool, QueryError> {
    let n = match dir {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(d) if d.fract() == 0.0 => *d as i64,
        _ => {
            return Err(QueryError::BadValue(format!(
                "sort direction for '{key}' must be numeric"
            )))
        }
    };
    match n {
        1 => Ok(true),
        -1 => Ok(false),
        _ => Err(QueryError::BadValue(format!(
            "sort direction for '{key}' must be 1 or -1"
        ))),
    }
}
