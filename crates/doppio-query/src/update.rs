//! The update operator registry and executor.
//!
//! An update document groups operators over field paths. The executor
//! first expands each path against the current document state — binding
//! `$`, `$[]` and `$[identifier]` tokens to concrete array indices —
//! then applies the mutation. The record of concrete changes feeds the
//! change stream's update description.

use std::collections::HashMap;

use bigdecimal::{BigDecimal, FromPrimitive};
use bson::{Bson, Document, Timestamp};
use lazy_static::lazy_static;

use doppio_bson::order::{compare, equal};
use doppio_bson::path;

use crate::error::QueryError;
use crate::matcher;

/// The concrete changes produced by applying an update.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Applied {
    pub changed: bool,
    /// Concrete dotted path → new value.
    pub updated_fields: Document,
    /// Concrete dotted paths that were removed.
    pub removed_fields: Vec<String>,
}

impl Applied {
    fn record_set(&mut self, path: &str, value: &Bson) {
        self.changed = true;
        self.removed_fields.retain(|p| p != path);
        self.updated_fields.insert(path.to_string(), value.clone());
    }

    fn record_removed(&mut self, path: &str) {
        self.changed = true;
        self.updated_fields.remove(path);
        self.removed_fields.push(path.to_string());
    }
}

type UpdateFn = fn(&mut Document, &str, &str, &Bson, &mut Applied) -> Result<(), QueryError>;

lazy_static! {
    static ref UPDATE_OPERATORS: HashMap<&'static str, UpdateFn> = {
        let mut m: HashMap<&'static str, UpdateFn> = HashMap::new();
        m.insert("$set", op_set);
        m.insert("$setOnInsert", op_set);
        m.insert("$unset", op_unset);
        m.insert("$inc", op_inc);
        m.insert("$mul", op_mul);
        m.insert("$min", op_min);
        m.insert("$max", op_max);
        m.insert("$rename", op_rename);
        m.insert("$currentDate", op_current_date);
        m.insert("$push", op_push);
        m.insert("$addToSet", op_add_to_set);
        m.insert("$pop", op_pop);
        m.insert("$pull", op_pull);
        m.insert("$pullAll", op_pull_all);
        m
    };
}

/// Apply `update` to `doc` in place. `inserted` marks a document that is
/// being created by an upsert — the only state in which `$setOnInsert`
/// runs. `query` drives positional `$` resolution; `array_filters` bind
/// `$[identifier]` tokens.
pub fn apply(
    doc: &mut Document,
    update: &Document,
    inserted: bool,
    array_filters: &[Document],
    query: Option<&Document>,
) -> Result<Applied, QueryError> {
    let steps = parse(update)?;
    let bindings = FilterBindings::parse(array_filters)?;

    let mut applied = Applied::default();
    for step in &steps {
        if step.operator == "$setOnInsert" && !inserted {
            continue;
        }
        let op = UPDATE_OPERATORS
            .get(step.operator)
            .expect("operator validated during parse");
        for concrete in expand_paths(doc, step.path, &bindings, query)? {
            op(doc, &concrete, step.operator, step.operand, &mut applied)?;
        }
    }
    Ok(applied)
}

// ── Parsing and validation ──────────────────────────────────────

struct Step<'a> {
    operator: &'a str,
    path: &'a str,
    operand: &'a Bson,
}

fn parse(update: &Document) -> Result<Vec<Step<'_>>, QueryError> {
    let mut steps = Vec::new();
    for (name, value) in update.iter() {
        if !name.starts_with('$') {
            return Err(QueryError::BadValue(format!(
                "update document requires operator keys, found '{name}'"
            )));
        }
        if !UPDATE_OPERATORS.contains_key(name.as_str()) {
            return Err(QueryError::UnknownOperator(name.clone()));
        }
        let fields = match value {
            Bson::Document(d) => d,
            _ => {
                return Err(QueryError::TypeMismatch(format!(
                    "{name}: expected a document of fields"
                )))
            }
        };
        if fields.is_empty() {
            return Err(QueryError::BadValue(format!("{name}: empty document")));
        }
        for (field, operand) in fields.iter() {
            steps.push(Step {
                operator: name.as_str(),
                path: field.as_str(),
                operand,
            });
        }
    }

    if steps.is_empty() {
        return Err(QueryError::BadValue("empty update document".into()));
    }

    // two operators may not target the same path or a prefix of it
    for (i, a) in steps.iter().enumerate() {
        for b in &steps[i + 1..] {
            if conflicting(a.path, b.path) {
                return Err(QueryError::BadValue(format!(
                    "conflicting update operators targeting '{}' and '{}'",
                    a.path, b.path
                )));
            }
        }
    }

    Ok(steps)
}

fn conflicting(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    long.starts_with(short) && long.as_bytes()[short.len()] == b'.'
}

// ── Path expansion ──────────────────────────────────────────────

struct FilterBindings {
    filters: HashMap<String, Document>,
}

impl FilterBindings {
    fn parse(array_filters: &[Document]) -> Result<FilterBindings, QueryError> {
        let mut filters = HashMap::new();
        for filter in array_filters {
            let first = filter
                .keys()
                .next()
                .ok_or_else(|| QueryError::BadValue("empty array filter".into()))?;
            let ident = first.split('.').next().unwrap_or(first).to_string();
            for key in filter.keys() {
                let head = key.split('.').next().unwrap_or(key);
                if head != ident {
                    return Err(QueryError::BadValue(format!(
                        "array filter must use a single identifier, found '{head}' and '{ident}'"
                    )));
                }
            }
            if filters.insert(ident.clone(), filter.clone()).is_some() {
                return Err(QueryError::BadValue(format!(
                    "duplicate array filter identifier '{ident}'"
                )));
            }
        }
        Ok(FilterBindings { filters })
    }

    fn get(&self, ident: &str) -> Option<&Document> {
        self.filters.get(ident)
    }
}

/// Does an array element satisfy the named filter's conditions?
fn binding_matches(element: &Bson, ident: &str, filter: &Document) -> Result<bool, QueryError> {
    for (key, condition) in filter.iter() {
        let ok = if key == ident {
            matcher::value_matches(element, condition)?
        } else {
            let rest = &key[ident.len() + 1..];
            match element {
                Bson::Document(d) => matcher::match_field(d, rest, condition)?,
                _ => false,
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Expand a path with positional tokens into concrete dotted paths
/// against the current document state.
fn expand_paths(
    doc: &Document,
    spec: &str,
    bindings: &FilterBindings,
    query: Option<&Document>,
) -> Result<Vec<String>, QueryError> {
    let segments: Vec<&str> = spec.split('.').collect();
    let mut out = Vec::new();
    let root = Bson::Document(doc.clone());
    expand_value(
        &root,
        &segments,
        String::new(),
        String::new(),
        bindings,
        query,
        &mut out,
    )?;
    Ok(out)
}

fn expand_value(
    value: &Bson,
    segments: &[&str],
    concrete: String,
    original: String,
    bindings: &FilterBindings,
    query: Option<&Document>,
    out: &mut Vec<String>,
) -> Result<(), QueryError> {
    if segments.is_empty() {
        out.push(concrete);
        return Ok(());
    }
    let head = segments[0];
    let rest = &segments[1..];

    let join = |base: &str, seg: &str| {
        if base.is_empty() {
            seg.to_string()
        } else {
            format!("{base}.{seg}")
        }
    };

    if head == "$[]" || (head.starts_with("$[") && head.ends_with(']')) || head == "$" {
        let items = match value {
            Bson::Array(items) => items,
            Bson::Null | Bson::Undefined => return Ok(()),
            _ => {
                return Err(QueryError::TypeMismatch(format!(
                    "cannot apply positional operator to non-array at '{original}'"
                )))
            }
        };
        match head {
            "$[]" => {
                for idx in 0..items.len() {
                    expand_value(
                        &items[idx],
                        rest,
                        join(&concrete, &idx.to_string()),
                        join(&original, head),
                        bindings,
                        query,
                        out,
                    )?;
                }
            }
            "$" => {
                let idx = positional_index(items, &original, query)?;
                expand_value(
                    &items[idx],
                    rest,
                    join(&concrete, &idx.to_string()),
                    join(&original, head),
                    bindings,
                    query,
                    out,
                )?;
            }
            _ => {
                let ident = &head[2..head.len() - 1];
                let filter = bindings.get(ident).ok_or_else(|| {
                    QueryError::BadValue(format!(
                        "no array filter found for identifier '{ident}'"
                    ))
                })?;
                for (idx, item) in items.iter().enumerate() {
                    if binding_matches(item, ident, filter)? {
                        expand_value(
                            item,
                            rest,
                            join(&concrete, &idx.to_string()),
                            join(&original, head),
                            bindings,
                            query,
                            out,
                        )?;
                    }
                }
            }
        }
        return Ok(());
    }

    let child = match value {
        Bson::Document(d) => d.get(head),
        Bson::Array(items) => match head.parse::<usize>() {
            Ok(idx) => items.get(idx),
            Err(_) => None,
        },
        _ => None,
    };
    match child {
        Some(next) => expand_value(
            next,
            rest,
            join(&concrete, head),
            join(&original, head),
            bindings,
            query,
            out,
        ),
        None => {
            // absent branch: no further positional tokens can bind, so the
            // remaining segments become literal path components
            if rest.iter().any(|s| s.starts_with('$')) {
                return Ok(());
            }
            let mut full = join(&concrete, head);
            for seg in rest {
                full = join(&full, seg);
            }
            out.push(full);
            Ok(())
        }
    }
}

/// Resolve `$`: the first array element satisfying the query's
/// conditions on the array's path.
fn positional_index(
    items: &[Bson],
    array_path: &str,
    query: Option<&Document>,
) -> Result<usize, QueryError> {
    let query = query.ok_or_else(|| {
        QueryError::BadValue(format!(
            "positional operator requires a query condition on '{array_path}'"
        ))
    })?;

    let mut conditions: Vec<(Option<String>, &Bson)> = Vec::new();
    collect_conditions(query, array_path, &mut conditions);
    if conditions.is_empty() {
        return Err(QueryError::BadValue(format!(
            "positional operator requires a query condition on '{array_path}'"
        )));
    }

    'items: for (idx, item) in items.iter().enumerate() {
        for (rest, condition) in &conditions {
            let ok = match rest {
                None => matcher::value_matches(item, condition)?,
                Some(sub) => match item {
                    Bson::Document(d) => matcher::match_field(d, sub, condition)?,
                    _ => false,
                },
            };
            if !ok {
                continue 'items;
            }
        }
        return Ok(idx);
    }

    Err(QueryError::BadValue(format!(
        "no array element of '{array_path}' matched the query"
    )))
}

fn collect_conditions<'a>(
    query: &'a Document,
    array_path: &str,
    out: &mut Vec<(Option<String>, &'a Bson)>,
) {
    for (key, condition) in query.iter() {
        if key == "$and" {
            if let Bson::Array(branches) = condition {
                for branch in branches {
                    if let Bson::Document(d) = branch {
                        collect_conditions(d, array_path, out);
                    }
                }
            }
        } else if key == array_path {
            out.push((None, condition));
        } else if let Some(rest) = key.strip_prefix(array_path) {
            if let Some(sub) = rest.strip_prefix('.') {
                out.push((Some(sub.to_string()), condition));
            }
        }
    }
}

// ── Field operators ─────────────────────────────────────────────

fn op_set(
    doc: &mut Document,
    field: &str,
    _name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    if let Some(old) = path::get(doc, field) {
        if equal(old, operand) {
            return Ok(());
        }
    }
    path::put(doc, field, operand.clone(), false)?;
    applied.record_set(field, operand);
    Ok(())
}

fn op_unset(
    doc: &mut Document,
    field: &str,
    _name: &str,
    _operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    if path::unset(doc, field).is_some() {
        applied.record_removed(field);
    }
    Ok(())
}

fn op_inc(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let old = path::get(doc, field).cloned().unwrap_or(Bson::Int32(0));
    let fresh = add_numeric(&old, operand, name)?;
    path::put(doc, field, fresh.clone(), false)?;
    applied.record_set(field, &fresh);
    Ok(())
}

fn op_mul(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let old = path::get(doc, field).cloned().unwrap_or(Bson::Int32(0));
    let fresh = mul_numeric(&old, operand, name)?;
    path::put(doc, field, fresh.clone(), false)?;
    applied.record_set(field, &fresh);
    Ok(())
}

fn op_min(
    doc: &mut Document,
    field: &str,
    _name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let replace = match path::get(doc, field) {
        Some(old) => compare(operand, old) == std::cmp::Ordering::Less,
        None => true,
    };
    if replace {
        path::put(doc, field, operand.clone(), false)?;
        applied.record_set(field, operand);
    }
    Ok(())
}

fn op_max(
    doc: &mut Document,
    field: &str,
    _name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let replace = match path::get(doc, field) {
        Some(old) => compare(operand, old) == std::cmp::Ordering::Greater,
        None => true,
    };
    if replace {
        path::put(doc, field, operand.clone(), false)?;
        applied.record_set(field, operand);
    }
    Ok(())
}

fn op_rename(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let target = match operand {
        Bson::String(s) if !s.is_empty() => s,
        _ => {
            return Err(QueryError::TypeMismatch(format!(
                "{name}: expected a non-empty string target"
            )))
        }
    };
    if target == field {
        return Err(QueryError::BadValue(format!(
            "{name}: source and target are the same path '{field}'"
        )));
    }
    if let Some(value) = path::unset(doc, field) {
        path::put(doc, target, value.clone(), false)?;
        applied.record_removed(field);
        applied.record_set(target, &value);
    }
    Ok(())
}

fn op_current_date(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let now = bson::DateTime::now();
    let fresh = match operand {
        Bson::Boolean(true) => Bson::DateTime(now),
        Bson::Document(spec) => match spec.get_str("$type") {
            Ok("date") => Bson::DateTime(now),
            Ok("timestamp") => Bson::Timestamp(Timestamp {
                time: (now.timestamp_millis() / 1000) as u32,
                increment: 0,
            }),
            _ => {
                return Err(QueryError::BadValue(format!(
                    "{name}: expected true or {{ $type: \"date\" | \"timestamp\" }}"
                )))
            }
        },
        _ => {
            return Err(QueryError::BadValue(format!(
                "{name}: expected true or {{ $type: \"date\" | \"timestamp\" }}"
            )))
        }
    };
    path::put(doc, field, fresh.clone(), false)?;
    applied.record_set(field, &fresh);
    Ok(())
}

// ── Array operators ─────────────────────────────────────────────

fn op_push(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let mut items = take_array(doc, field, name)?;

    let (each, position, slice, sort) = push_modifiers(name, operand)?;

    match position {
        Some(pos) => {
            let at = resolve_position(pos, items.len());
            for (offset, value) in each.into_iter().enumerate() {
                items.insert(at + offset, value);
            }
        }
        None => items.extend(each),
    }

    if let Some(spec) = sort {
        sort_elements(&mut items, &spec)?;
    }

    if let Some(n) = slice {
        apply_slice(&mut items, n);
    }

    let fresh = Bson::Array(items);
    path::put(doc, field, fresh.clone(), false)?;
    applied.record_set(field, &fresh);
    Ok(())
}

/// Decompose a `$push` operand into (elements, $position, $slice, $sort).
fn push_modifiers(
    name: &str,
    operand: &Bson,
) -> Result<(Vec<Bson>, Option<i64>, Option<i64>, Option<Bson>), QueryError> {
    let spec = match operand {
        Bson::Document(d) if d.keys().any(|k| k.starts_with('$')) => d,
        other => return Ok((vec![other.clone()], None, None, None)),
    };

    let mut each = None;
    let mut position = None;
    let mut slice = None;
    let mut sort = None;
    for (key, value) in spec.iter() {
        match key.as_str() {
            "$each" => match value {
                Bson::Array(items) => each = Some(items.clone()),
                _ => {
                    return Err(QueryError::TypeMismatch(format!(
                        "{name}: $each expects an array"
                    )))
                }
            },
            "$position" => {
                position = Some(int_operand(value).ok_or_else(|| {
                    QueryError::TypeMismatch(format!("{name}: $position expects an integer"))
                })?)
            }
            "$slice" => {
                slice = Some(int_operand(value).ok_or_else(|| {
                    QueryError::TypeMismatch(format!("{name}: $slice expects an integer"))
                })?)
            }
            "$sort" => sort = Some(value.clone()),
            other => {
                return Err(QueryError::UnknownOperator(format!("{name}: {other}")));
            }
        }
    }

    let each = each.ok_or_else(|| {
        QueryError::BadValue(format!("{name}: modifiers require $each"))
    })?;
    Ok((each, position, slice, sort))
}

fn resolve_position(pos: i64, len: usize) -> usize {
    if pos < 0 {
        len.saturating_sub(pos.unsigned_abs() as usize)
    } else {
        (pos as usize).min(len)
    }
}

fn apply_slice(items: &mut Vec<Bson>, n: i64) {
    if n >= 0 {
        items.truncate(n as usize);
    } else {
        let keep = n.unsigned_abs() as usize;
        if items.len() > keep {
            items.drain(..items.len() - keep);
        }
    }
}

fn sort_elements(items: &mut [Bson], spec: &Bson) -> Result<(), QueryError> {
    match spec {
        Bson::Int32(1) | Bson::Int64(1) => {
            items.sort_by(compare);
            Ok(())
        }
        Bson::Int32(-1) | Bson::Int64(-1) => {
            items.sort_by(|a, b| compare(b, a));
            Ok(())
        }
        Bson::Document(columns) => {
            let cols = crate::sort::columns(columns)?;
            items.sort_by(|a, b| {
                for (col, asc) in &cols {
                    let left = match a {
                        Bson::Document(d) => path::get(d, col),
                        _ => None,
                    };
                    let right = match b {
                        Bson::Document(d) => path::get(d, col),
                        _ => None,
                    };
                    let mut ord = doppio_bson::order::compare_opt(left, right);
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
        _ => Err(QueryError::BadValue(
            "$sort expects 1, -1 or a sort document".into(),
        )),
    }
}

fn op_add_to_set(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let mut items = take_array(doc, field, name)?;

    let each = match operand {
        Bson::Document(d) if d.get("$each").is_some() => {
            if d.len() != 1 {
                return Err(QueryError::BadValue(format!(
                    "{name}: $each must be the only modifier"
                )));
            }
            match d.get("$each") {
                Some(Bson::Array(values)) => values.clone(),
                _ => {
                    return Err(QueryError::TypeMismatch(format!(
                        "{name}: $each expects an array"
                    )))
                }
            }
        }
        other => vec![other.clone()],
    };

    let mut added = false;
    for value in each {
        if !items.iter().any(|item| equal(item, &value)) {
            items.push(value);
            added = true;
        }
    }
    if added {
        let fresh = Bson::Array(items);
        path::put(doc, field, fresh.clone(), false)?;
        applied.record_set(field, &fresh);
    }
    Ok(())
}

fn op_pop(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let from_front = match int_operand(operand) {
        Some(1) => false,
        Some(-1) => true,
        _ => {
            return Err(QueryError::BadValue(format!("{name}: expected 1 or -1")));
        }
    };
    let mut items = match path::get(doc, field) {
        Some(Bson::Array(items)) => items.clone(),
        Some(_) => {
            return Err(QueryError::TypeMismatch(format!(
                "{name}: field '{field}' is not an array"
            )))
        }
        None => return Ok(()),
    };
    if items.is_empty() {
        return Ok(());
    }
    if from_front {
        items.remove(0);
    } else {
        items.pop();
    }
    let fresh = Bson::Array(items);
    path::put(doc, field, fresh.clone(), false)?;
    applied.record_set(field, &fresh);
    Ok(())
}

fn op_pull(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let items = match path::get(doc, field) {
        Some(Bson::Array(items)) => items.clone(),
        Some(_) => {
            return Err(QueryError::TypeMismatch(format!(
                "{name}: field '{field}' is not an array"
            )))
        }
        None => return Ok(()),
    };

    let mut kept = Vec::with_capacity(items.len());
    for item in &items {
        let remove = match operand {
            Bson::Document(cond) => matcher::element_matches(item, cond)?,
            other => equal(item, other),
        };
        if !remove {
            kept.push(item.clone());
        }
    }
    if kept.len() != items.len() {
        let fresh = Bson::Array(kept);
        path::put(doc, field, fresh.clone(), false)?;
        applied.record_set(field, &fresh);
    }
    Ok(())
}

fn op_pull_all(
    doc: &mut Document,
    field: &str,
    name: &str,
    operand: &Bson,
    applied: &mut Applied,
) -> Result<(), QueryError> {
    let targets = match operand {
        Bson::Array(items) => items,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected an array"))),
    };
    let items = match path::get(doc, field) {
        Some(Bson::Array(items)) => items.clone(),
        Some(_) => {
            return Err(QueryError::TypeMismatch(format!(
                "{name}: field '{field}' is not an array"
            )))
        }
        None => return Ok(()),
    };
    let kept: Vec<Bson> = items
        .iter()
        .filter(|item| !targets.iter().any(|t| equal(item, t)))
        .cloned()
        .collect();
    if kept.len() != items.len() {
        let fresh = Bson::Array(kept);
        path::put(doc, field, fresh.clone(), false)?;
        applied.record_set(field, &fresh);
    }
    Ok(())
}

fn take_array(doc: &Document, field: &str, name: &str) -> Result<Vec<Bson>, QueryError> {
    match path::get(doc, field) {
        Some(Bson::Array(items)) => Ok(items.clone()),
        Some(_) => Err(QueryError::TypeMismatch(format!(
            "{name}: field '{field}' is not an array"
        ))),
        None => Ok(Vec::new()),
    }
}

fn int_operand(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
}

// ── Numeric arithmetic ──────────────────────────────────────────
//
// Two int32 operands stay int32 unless the exact result overflows,
// then widen to int64. Any double operand yields a double. Any decimal
// operand yields a decimal.

pub(crate) fn add_numeric(a: &Bson, b: &Bson, name: &str) -> Result<Bson, QueryError> {
    numeric_op(a, b, name, i32::checked_add, i64::checked_add, |x, y| x + y, |x, y| x + y)
}

pub(crate) fn mul_numeric(a: &Bson, b: &Bson, name: &str) -> Result<Bson, QueryError> {
    numeric_op(a, b, name, i32::checked_mul, i64::checked_mul, |x, y| x * y, |x, y| x * y)
}

fn numeric_op(
    a: &Bson,
    b: &Bson,
    name: &str,
    int32: fn(i32, i32) -> Option<i32>,
    int64: fn(i64, i64) -> Option<i64>,
    double: fn(f64, f64) -> f64,
    decimal: fn(BigDecimal, BigDecimal) -> BigDecimal,
) -> Result<Bson, QueryError> {
    match (a, b) {
        (Bson::Decimal128(_), _) | (_, Bson::Decimal128(_)) => {
            let x = to_big(a, name)?;
            let y = to_big(b, name)?;
            let result = decimal(x, y);
            result
                .to_string()
                .parse()
                .map(Bson::Decimal128)
                .map_err(|_| QueryError::BadValue(format!("{name}: decimal out of range")))
        }
        (Bson::Double(x), other) => Ok(Bson::Double(double(*x, to_f64(other, name)?))),
        (other, Bson::Double(y)) => Ok(Bson::Double(double(to_f64(other, name)?, *y))),
        (Bson::Int32(x), Bson::Int32(y)) => Ok(match int32(*x, *y) {
            Some(n) => Bson::Int32(n),
            None => Bson::Int64(
                int64(i64::from(*x), i64::from(*y))
                    .expect("widened int32 arithmetic cannot overflow"),
            ),
        }),
        (Bson::Int64(x), Bson::Int32(y)) => int64(*x, i64::from(*y))
            .map(Bson::Int64)
            .ok_or_else(|| QueryError::BadValue(format!("{name}: integer overflow"))),
        (Bson::Int32(x), Bson::Int64(y)) => int64(i64::from(*x), *y)
            .map(Bson::Int64)
            .ok_or_else(|| QueryError::BadValue(format!("{name}: integer overflow"))),
        (Bson::Int64(x), Bson::Int64(y)) => int64(*x, *y)
            .map(Bson::Int64)
            .ok_or_else(|| QueryError::BadValue(format!("{name}: integer overflow"))),
        _ => Err(QueryError::TypeMismatch(format!(
            "{name}: expected numeric operands"
        ))),
    }
}

fn to_f64(value: &Bson, name: &str) -> Result<f64, QueryError> {
    match value {
        Bson::Int32(n) => Ok(f64::from(*n)),
        Bson::Int64(n) => Ok(*n as f64),
        Bson::Double(d) => Ok(*d),
        _ => Err(QueryError::TypeMismatch(format!(
            "{name}: expected numeric operands"
        ))),
    }
}

fn to_big(value: &Bson, name: &str) -> Result<BigDecimal, QueryError> {
    match value {
        Bson::Int32(n) => Ok(BigDecimal::from(i64::from(*n))),
        Bson::Int64(n) => Ok(BigDecimal::from(*n)),
        Bson::Double(d) => BigDecimal::from_f64(*d).ok_or_else(|| {
            QueryError::BadValue(format!("{name}: cannot use {d} in decimal arithmetic"))
        }),
        Bson::Decimal128(d) => d
            .to_string()
            .parse()
            .map_err(|_| QueryError::BadValue(format!("{name}: non-finite decimal operand"))),
        _ => Err(QueryError::TypeMismatch(format!(
            "{name}: expected numeric operands"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn run(doc: &mut Document, update: Document) -> Applied {
        apply(doc, &update, false, &[], None).unwrap()
    }

    #[test]
    fn set_and_unset() {
        let mut d = doc! { "a": 1, "b": 2 };
        let applied = run(&mut d, doc! { "$set": { "a": 9, "c.d": true }, "$unset": { "b": "" } });
        assert_eq!(d, doc! { "a": 9, "c": { "d": true } });
        assert!(applied.changed);
        assert_eq!(applied.updated_fields, doc! { "a": 9, "c.d": true });
        assert_eq!(applied.removed_fields, vec!["b".to_string()]);
    }

    #[test]
    fn set_to_equal_value_reports_no_change() {
        let mut d = doc! { "a": 1 };
        let applied = run(&mut d, doc! { "$set": { "a": 1.0 } });
        assert!(!applied.changed);
    }

    #[test]
    fn inc_keeps_int32_until_overflow() {
        let mut d = doc! { "n": 2147483640_i32 };
        run(&mut d, doc! { "$inc": { "n": 5 } });
        assert_eq!(d.get("n"), Some(&Bson::Int32(2147483645)));

        run(&mut d, doc! { "$inc": { "n": 100 } });
        assert_eq!(d.get("n"), Some(&Bson::Int64(2147483745)));
    }

    #[test]
    fn inc_contaminates_to_double_and_decimal() {
        let mut d = doc! { "a": 1, "b": 2 };
        run(&mut d, doc! { "$inc": { "a": 0.5 } });
        assert_eq!(d.get("a"), Some(&Bson::Double(1.5)));

        let half: bson::Decimal128 = "0.5".parse().unwrap();
        run(&mut d, doc! { "$inc": { "b": half } });
        let result = match d.get("b") {
            Some(Bson::Decimal128(v)) => v.to_string(),
            other => panic!("expected decimal, got {other:?}"),
        };
        assert_eq!(result, "2.5");
    }

    #[test]
    fn inc_on_missing_field_starts_from_zero() {
        let mut d = doc! {};
        run(&mut d, doc! { "$inc": { "n": 3 } });
        assert_eq!(d.get("n"), Some(&Bson::Int32(3)));
    }

    #[test]
    fn mul_and_min_max() {
        let mut d = doc! { "n": 6, "lo": 5, "hi": 5 };
        run(&mut d, doc! { "$mul": { "n": 7 } });
        assert_eq!(d.get("n"), Some(&Bson::Int32(42)));

        let applied = run(&mut d, doc! { "$min": { "lo": 3 }, "$max": { "hi": 3 } });
        assert_eq!(d.get("lo"), Some(&Bson::Int32(3)));
        assert_eq!(d.get("hi"), Some(&Bson::Int32(5)));
        assert_eq!(applied.updated_fields, doc! { "lo": 3 });
    }

    #[test]
    fn rename_moves_value() {
        let mut d = doc! { "old": 7, "keep": 1 };
        let applied = run(&mut d, doc! { "$rename": { "old": "fresh" } });
        assert_eq!(d, doc! { "keep": 1, "fresh": 7 });
        assert_eq!(applied.removed_fields, vec!["old".to_string()]);
    }

    #[test]
    fn current_date_forms() {
        let mut d = doc! {};
        run(
            &mut d,
            doc! { "$currentDate": { "at": true, "ts": { "$type": "timestamp" } } },
        );
        assert!(matches!(d.get("at"), Some(Bson::DateTime(_))));
        assert!(matches!(d.get("ts"), Some(Bson::Timestamp(_))));
    }

    #[test]
    fn push_with_modifiers() {
        let mut d = doc! { "scores": [80, 90] };
        run(
            &mut d,
            doc! { "$push": { "scores": { "$each": [70, 100], "$sort": -1, "$slice": 3 } } },
        );
        assert_eq!(d, doc! { "scores": [100, 90, 80] });

        let mut d = doc! { "q": [1, 4] };
        run(&mut d, doc! { "$push": { "q": { "$each": [2, 3], "$position": 1 } } });
        assert_eq!(d, doc! { "q": [1, 2, 3, 4] });

        let mut d = doc! {};
        run(&mut d, doc! { "$push": { "fresh": 1 } });
        assert_eq!(d, doc! { "fresh": [1] });
    }

    #[test]
    fn push_sort_by_element_field() {
        let mut d = doc! { "quizzes": [{ "score": 8 }, { "score": 5 }] };
        run(
            &mut d,
            doc! { "$push": { "quizzes": { "$each": [{ "score": 7 }], "$sort": { "score": 1 } } } },
        );
        assert_eq!(
            d,
            doc! { "quizzes": [{ "score": 5 }, { "score": 7 }, { "score": 8 }] }
        );
    }

    #[test]
    fn add_to_set_dedupes_by_value() {
        let mut d = doc! { "tags": [1] };
        let applied = run(&mut d, doc! { "$addToSet": { "tags": { "$each": [1.0, 2] } } });
        assert_eq!(d, doc! { "tags": [1, 2] });
        assert!(applied.changed);

        let applied = run(&mut d, doc! { "$addToSet": { "tags": 2 } });
        assert!(!applied.changed);
    }

    #[test]
    fn pop_pull_pull_all() {
        let mut d = doc! { "a": [1, 2, 3, 4] };
        run(&mut d, doc! { "$pop": { "a": 1 } });
        assert_eq!(d, doc! { "a": [1, 2, 3] });
        run(&mut d, doc! { "$pop": { "a": -1 } });
        assert_eq!(d, doc! { "a": [2, 3] });

        let mut d = doc! { "n": [1, 5, 9], "docs": [{ "s": 1 }, { "s": 8 }] };
        run(&mut d, doc! { "$pull": { "n": { "$gt": 4 } } });
        assert_eq!(d.get("n"), Some(&Bson::Array(vec![Bson::Int32(1)])));
        run(&mut d, doc! { "$pull": { "docs": { "s": 8 } } });
        assert_eq!(
            d.get("docs"),
            Some(&Bson::Array(vec![Bson::Document(doc! { "s": 1 })]))
        );

        let mut d = doc! { "a": [1, 2, 3, 2] };
        run(&mut d, doc! { "$pullAll": { "a": [2, 3] } });
        assert_eq!(d, doc! { "a": [1] });
    }

    #[test]
    fn set_on_insert_only_on_upsert() {
        let mut d = doc! { "a": 1 };
        let applied = apply(&mut d, &doc! { "$setOnInsert": { "b": 2 } }, false, &[], None).unwrap();
        assert!(!applied.changed);
        assert_eq!(d, doc! { "a": 1 });

        apply(&mut d, &doc! { "$setOnInsert": { "b": 2 } }, true, &[], None).unwrap();
        assert_eq!(d, doc! { "a": 1, "b": 2 });
    }

    #[test]
    fn conflicting_paths_rejected() {
        let mut d = doc! {};
        let err = apply(
            &mut d,
            &doc! { "$set": { "a.b": 1 }, "$unset": { "a": "" } },
            false,
            &[],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::BadValue(_)));

        let err = apply(
            &mut d,
            &doc! { "$set": { "a": 1 }, "$inc": { "a": 1 } },
            false,
            &[],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::BadValue(_)));
    }

    #[test]
    fn unknown_and_malformed_operators() {
        let mut d = doc! {};
        assert!(matches!(
            apply(&mut d, &doc! { "$fancy": { "a": 1 } }, false, &[], None),
            Err(QueryError::UnknownOperator(_))
        ));
        assert!(apply(&mut d, &doc! { "a": 1 }, false, &[], None).is_err());
        assert!(apply(&mut d, &doc! {}, false, &[], None).is_err());
    }

    #[test]
    fn all_positional_updates_every_element() {
        let mut d = doc! { "grades": [80, 90, 100] };
        run(&mut d, doc! { "$inc": { "grades.$[]": 5 } });
        assert_eq!(d, doc! { "grades": [85, 95, 105] });
    }

    #[test]
    fn filtered_positional_binds_identifier() {
        let mut d = doc! { "grades": [{ "g": 80 }, { "g": 95 }] };
        apply(
            &mut d,
            &doc! { "$set": { "grades.$[low].flag": true } },
            false,
            &[doc! { "low.g": { "$lt": 90 } }],
            None,
        )
        .unwrap();
        assert_eq!(d, doc! { "grades": [{ "g": 80, "flag": true }, { "g": 95 }] });
    }

    #[test]
    fn filtered_positional_on_scalars() {
        let mut d = doc! { "n": [2, 9, 4] };
        apply(
            &mut d,
            &doc! { "$mul": { "n.$[big]": 10 } },
            false,
            &[doc! { "big": { "$gte": 5 } }],
            None,
        )
        .unwrap();
        assert_eq!(d, doc! { "n": [2, 90, 4] });
    }

    #[test]
    fn positional_dollar_uses_query_condition() {
        let mut d = doc! { "grades": [75, 92, 88] };
        apply(
            &mut d,
            &doc! { "$set": { "grades.$": 100 } },
            false,
            &[],
            Some(&doc! { "grades": { "$gte": 90 } }),
        )
        .unwrap();
        assert_eq!(d, doc! { "grades": [75, 100, 88] });
    }

    #[test]
    fn positional_dollar_without_query_condition_errors() {
        let mut d = doc! { "grades": [1] };
        let err = apply(
            &mut d,
            &doc! { "$set": { "grades.$": 2 } },
            false,
            &[],
            Some(&doc! { "other": 1 }),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::BadValue(_)));
    }

    #[test]
    fn unknown_array_filter_identifier_errors() {
        let mut d = doc! { "a": [1] };
        let err = apply(&mut d, &doc! { "$set": { "a.$[x]": 2 } }, false, &[], None).unwrap_err();
        assert!(matches!(err, QueryError::BadValue(_)));
    }
}
