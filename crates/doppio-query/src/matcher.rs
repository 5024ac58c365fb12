//! The match operator registry and filter evaluation.
//!
//! A filter document is walked field by field. A field either equates a
//! path to a value or maps the path to a document of operator entries.
//! Arrays on the path are traversed: an operator matches if it matches
//! any element or the array itself, except `$elemMatch` which matches
//! elements only.

use std::collections::HashMap;

use bson::{Bson, Document};
use lazy_static::lazy_static;
use regex::Regex;

use doppio_bson::order::{compare, equal, type_rank};

use crate::error::QueryError;

/// An operator applied to the candidate values resolved for a path.
type OperatorFn = fn(&[Option<&Bson>], &str, &Bson) -> Result<bool, QueryError>;

/// A top-level operator applied to the whole document.
type TopLevelFn = fn(&Document, &str, &Bson) -> Result<bool, QueryError>;

lazy_static! {
    static ref TOP_LEVEL_OPERATORS: HashMap<&'static str, TopLevelFn> = {
        let mut m: HashMap<&'static str, TopLevelFn> = HashMap::new();
        m.insert("$and", match_and);
        m.insert("$or", match_or);
        m.insert("$nor", match_nor);
        m.insert("$jsonSchema", match_json_schema);
        m
    };
    static ref EXPRESSION_OPERATORS: HashMap<&'static str, OperatorFn> = {
        let mut m: HashMap<&'static str, OperatorFn> = HashMap::new();
        m.insert("$eq", match_eq);
        m.insert("$ne", match_ne);
        m.insert("$gt", match_gt);
        m.insert("$gte", match_gte);
        m.insert("$lt", match_lt);
        m.insert("$lte", match_lte);
        m.insert("$in", match_in);
        m.insert("$nin", match_nin);
        m.insert("$exists", match_exists);
        m.insert("$type", match_type);
        m.insert("$mod", match_mod);
        m.insert("$size", match_size);
        m.insert("$all", match_all);
        m.insert("$elemMatch", match_elem_match);
        m.insert("$not", match_not);
        m
    };
}

/// Evaluate `query` against `doc`. Top-level fields combine with AND.
pub fn match_doc(doc: &Document, query: &Document) -> Result<bool, QueryError> {
    for (key, condition) in query.iter() {
        let ok = if key.starts_with('$') {
            match TOP_LEVEL_OPERATORS.get(key.as_str()) {
                Some(op) => op(doc, key, condition)?,
                None => return Err(QueryError::UnknownOperator(key.clone())),
            }
        } else {
            match_field(doc, key, condition)?
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a single field condition (operator document or equality).
pub fn match_field(doc: &Document, path: &str, condition: &Bson) -> Result<bool, QueryError> {
    let candidates = resolve(doc, path);
    match condition {
        Bson::Document(cond) if is_operator_doc(cond) => {
            apply_operator_doc(&candidates, cond)
        }
        other => match_eq(&candidates, "$eq", other),
    }
}

/// Apply an operator document (e.g. `{ "$gt": 5, "$lt": 9 }`) to
/// already-resolved candidates. All entries must hold.
fn apply_operator_doc(
    candidates: &[Option<&Bson>],
    cond: &Document,
) -> Result<bool, QueryError> {
    // $regex pairs with its $options sibling and is handled first
    if cond.get("$regex").is_some() {
        let re = compile_regex(cond.get("$regex").unwrap(), cond.get("$options"))?;
        if !regex_matches(candidates, &re) {
            return Ok(false);
        }
    } else if cond.get("$options").is_some() {
        return Err(QueryError::BadValue("$options without $regex".into()));
    }

    for (name, operand) in cond.iter() {
        if name == "$regex" || name == "$options" {
            continue;
        }
        let op = EXPRESSION_OPERATORS
            .get(name.as_str())
            .ok_or_else(|| QueryError::UnknownOperator(name.clone()))?;
        if !op(candidates, name, operand)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

// ── Path resolution ─────────────────────────────────────────────

/// Resolve the terminal candidate values for `path`, traversing arrays.
/// A `None` candidate records that the path is absent along some branch.
fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<Option<&'a Bson>> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    match doc.get(segments[0]) {
        Some(value) => resolve_value(value, &segments[1..], &mut out),
        None => out.push(None),
    }
    out
}

fn resolve_value<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<Option<&'a Bson>>) {
    if segments.is_empty() {
        out.push(Some(value));
        return;
    }
    let head = segments[0];
    match value {
        Bson::Document(d) => match d.get(head) {
            Some(next) => resolve_value(next, &segments[1..], out),
            None => out.push(None),
        },
        Bson::Array(items) => {
            let mut descended = false;
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(next) = items.get(idx) {
                    resolve_value(next, &segments[1..], out);
                    descended = true;
                }
            }
            for item in items {
                if let Bson::Document(_) = item {
                    resolve_value(item, segments, out);
                    descended = true;
                }
            }
            if !descended {
                out.push(None);
            }
        }
        _ => out.push(None),
    }
}

// ── Logical operators ───────────────────────────────────────────

fn branches<'a>(name: &str, value: &'a Bson) -> Result<Vec<&'a Document>, QueryError> {
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

fn match_and(doc: &Document, name: &str, value: &Bson) -> Result<bool, QueryError> {
    for branch in branches(name, value)? {
        if !match_doc(doc, branch)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_or(doc: &Document, name: &str, value: &Bson) -> Result<bool, QueryError> {
    for branch in branches(name, value)? {
        if match_doc(doc, branch)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn match_nor(doc: &Document, name: &str, value: &Bson) -> Result<bool, QueryError> {
    match_or(doc, name, value).map(|ok| !ok)
}

// ── Equality and ordering ───────────────────────────────────────

/// Equality against a candidate: the value itself, or any array element.
/// A null operand also matches a missing value. A regex operand matches
/// like `$regex`.
fn eq_candidate(candidate: Option<&Bson>, operand: &Bson) -> Result<bool, QueryError> {
    if let Bson::RegularExpression(_) = operand {
        let re = compile_regex(operand, None)?;
        return Ok(regex_candidate(candidate, &re));
    }
    match candidate {
        None => Ok(matches!(operand, Bson::Null)),
        Some(value) => {
            if equal(value, operand) {
                return Ok(true);
            }
            if let Bson::Array(items) = value {
                return Ok(items.iter().any(|item| equal(item, operand)));
            }
            Ok(false)
        }
    }
}

fn match_eq(candidates: &[Option<&Bson>], _name: &str, operand: &Bson) -> Result<bool, QueryError> {
    for candidate in candidates {
        if eq_candidate(*candidate, operand)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn match_ne(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    match_eq(candidates, name, operand).map(|ok| !ok)
}

fn ord_candidate(
    candidate: Option<&Bson>,
    operand: &Bson,
    pred: fn(std::cmp::Ordering) -> bool,
) -> bool {
    let null = Bson::Null;
    let value = match candidate {
        Some(value) => value,
        // missing compares like null, but only against a null operand
        None if matches!(operand, Bson::Null) => &null,
        None => return false,
    };
    if type_rank(Some(value)) == type_rank(Some(operand)) && pred(compare(value, operand)) {
        return true;
    }
    if let Bson::Array(items) = value {
        return items.iter().any(|item| {
            type_rank(Some(item)) == type_rank(Some(operand)) && pred(compare(item, operand))
        });
    }
    false
}

fn ord_match(
    candidates: &[Option<&Bson>],
    operand: &Bson,
    pred: fn(std::cmp::Ordering) -> bool,
) -> Result<bool, QueryError> {
    Ok(candidates
        .iter()
        .any(|candidate| ord_candidate(*candidate, operand, pred)))
}

fn match_gt(c: &[Option<&Bson>], _n: &str, o: &Bson) -> Result<bool, QueryError> {
    ord_match(c, o, std::cmp::Ordering::is_gt)
}

fn match_gte(c: &[Option<&Bson>], _n: &str, o: &Bson) -> Result<bool, QueryError> {
    ord_match(c, o, std::cmp::Ordering::is_ge)
}

fn match_lt(c: &[Option<&Bson>], _n: &str, o: &Bson) -> Result<bool, QueryError> {
    ord_match(c, o, std::cmp::Ordering::is_lt)
}

fn match_lte(c: &[Option<&Bson>], _n: &str, o: &Bson) -> Result<bool, QueryError> {
    ord_match(c, o, std::cmp::Ordering::is_le)
}

// ── Membership ──────────────────────────────────────────────────

fn match_in(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    let members = match operand {
        Bson::Array(items) => items,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected an array"))),
    };
    for member in members {
        if match_eq(candidates, name, member)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn match_nin(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    match_in(candidates, name, operand).map(|ok| !ok)
}

// ── Shape operators ─────────────────────────────────────────────

fn match_exists(
    candidates: &[Option<&Bson>],
    name: &str,
    operand: &Bson,
) -> Result<bool, QueryError> {
    let wanted = match operand {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(d) => *d != 0.0,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected a boolean"))),
    };
    let exists = candidates.iter().any(|c| c.is_some());
    Ok(exists == wanted)
}

fn match_type(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    let specs: Vec<&Bson> = match operand {
        Bson::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for candidate in candidates.iter().flatten() {
        for spec in &specs {
            if type_spec_matches(candidate, spec, name)? {
                return Ok(true);
            }
            if let Bson::Array(items) = candidate {
                for item in items {
                    if type_spec_matches(item, spec, name)? {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

fn type_spec_matches(value: &Bson, spec: &Bson, name: &str) -> Result<bool, QueryError> {
    let code = type_code(value);
    match spec {
        Bson::String(alias) if alias == "number" => Ok(matches!(code, 1 | 16 | 18 | 19)),
        Bson::String(alias) => {
            let wanted = alias_code(alias)
                .ok_or_else(|| QueryError::BadValue(format!("{name}: unknown type alias '{alias}'")))?;
            Ok(code == wanted)
        }
        Bson::Int32(n) => Ok(code == *n),
        Bson::Int64(n) => Ok(i64::from(code) == *n),
        Bson::Double(d) if d.fract() == 0.0 => Ok(code == *d as i32),
        _ => Err(QueryError::TypeMismatch(format!(
            "{name}: expected a type alias or code"
        ))),
    }
}

fn type_code(value: &Bson) -> i32 {
    match value {
        Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::Undefined => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Null => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::Symbol(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::Int32(_) => 16,
        Bson::Timestamp(_) => 17,
        Bson::Int64(_) => 18,
        Bson::Decimal128(_) => 19,
        Bson::MinKey => -1,
        Bson::MaxKey => 127,
    }
}

fn alias_code(alias: &str) -> Option<i32> {
    Some(match alias {
        "double" => 1,
        "string" => 2,
        "object" => 3,
        "array" => 4,
        "binData" => 5,
        "undefined" => 6,
        "objectId" => 7,
        "bool" => 8,
        "date" => 9,
        "null" => 10,
        "regex" => 11,
        "dbPointer" => 12,
        "javascript" => 13,
        "symbol" => 14,
        "javascriptWithScope" => 15,
        "int" => 16,
        "timestamp" => 17,
        "long" => 18,
        "decimal" => 19,
        "minKey" => -1,
        "maxKey" => 127,
        _ => return None,
    })
}

fn match_mod(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    let parts = match operand {
        Bson::Array(items) if items.len() == 2 => items,
        _ => {
            return Err(QueryError::BadValue(format!(
                "{name}: expected [divisor, remainder]"
            )))
        }
    };
    let divisor = as_int(&parts[0])
        .ok_or_else(|| QueryError::TypeMismatch(format!("{name}: divisor must be numeric")))?;
    let remainder = as_int(&parts[1])
        .ok_or_else(|| QueryError::TypeMismatch(format!("{name}: remainder must be numeric")))?;
    if divisor == 0 {
        return Err(QueryError::BadValue(format!("{name}: divisor must not be 0")));
    }

    let hits = |value: &Bson| as_int(value).map(|n| n % divisor == remainder).unwrap_or(false);
    for candidate in candidates.iter().flatten() {
        if hits(candidate) {
            return Ok(true);
        }
        if let Bson::Array(items) = candidate {
            if items.iter().any(hits) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn as_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) => Some(*d as i64),
        _ => None,
    }
}

fn match_size(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    let wanted = as_int(operand)
        .ok_or_else(|| QueryError::TypeMismatch(format!("{name}: expected a number")))?;
    for candidate in candidates.iter().flatten() {
        if let Bson::Array(items) = candidate {
            if items.len() as i64 == wanted {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ── Array operators ─────────────────────────────────────────────

fn match_all(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    let members = match operand {
        Bson::Array(items) => items,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected an array"))),
    };
    if members.is_empty() {
        return Ok(false);
    }
    'candidates: for candidate in candidates {
        for member in members {
            let ok = match member {
                Bson::Document(d) if d.len() == 1 && d.get("$elemMatch").is_some() => {
                    match_elem_match(&[*candidate], "$elemMatch", d.get("$elemMatch").unwrap())?
                }
                other => eq_candidate(*candidate, other)?,
            };
            if !ok {
                continue 'candidates;
            }
        }
        return Ok(true);
    }
    Ok(false)
}

fn match_elem_match(
    candidates: &[Option<&Bson>],
    name: &str,
    operand: &Bson,
) -> Result<bool, QueryError> {
    let cond = match operand {
        Bson::Document(d) => d,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected a document"))),
    };
    for candidate in candidates.iter().flatten() {
        if let Bson::Array(items) = candidate {
            for item in items {
                if element_matches(item, cond)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Apply a field condition to a bare value: an operator document runs
/// its operators against the value, anything else is an equality test.
pub(crate) fn value_matches(value: &Bson, condition: &Bson) -> Result<bool, QueryError> {
    match condition {
        Bson::Document(cond) if is_operator_doc(cond) => {
            apply_operator_doc(&[Some(value)], cond)
        }
        other => eq_candidate(Some(value), other),
    }
}

/// Match a single array element against an `$elemMatch` condition. A
/// condition made purely of operators applies to the element value;
/// otherwise the element must be a document matching it as a query.
pub(crate) fn element_matches(element: &Bson, cond: &Document) -> Result<bool, QueryError> {
    let leaf = cond.keys().all(|k| k.starts_with('$'))
        && !cond.keys().any(|k| TOP_LEVEL_OPERATORS.contains_key(k.as_str()));
    if leaf {
        return apply_operator_doc(&[Some(element)], cond);
    }
    match element {
        Bson::Document(d) => match_doc(d, cond),
        _ => Ok(false),
    }
}

fn match_not(candidates: &[Option<&Bson>], name: &str, operand: &Bson) -> Result<bool, QueryError> {
    match operand {
        Bson::Document(cond) if is_operator_doc(cond) => {
            apply_operator_doc(candidates, cond).map(|ok| !ok)
        }
        Bson::RegularExpression(_) => {
            let re = compile_regex(operand, None)?;
            Ok(!regex_matches(candidates, &re))
        }
        _ => Err(QueryError::BadValue(format!(
            "{name}: expected an operator document or regex"
        ))),
    }
}

// ── Regex ───────────────────────────────────────────────────────

fn compile_regex(pattern: &Bson, options: Option<&Bson>) -> Result<Regex, QueryError> {
    let (pat, embedded) = match pattern {
        Bson::String(s) => (s.as_str(), ""),
        Bson::RegularExpression(re) => (re.pattern.as_str(), re.options.as_str()),
        _ => {
            return Err(QueryError::TypeMismatch(
                "$regex: expected a string or regex".into(),
            ))
        }
    };
    let opts = match options {
        Some(Bson::String(s)) => s.as_str(),
        Some(_) => {
            return Err(QueryError::TypeMismatch("$options: expected a string".into()))
        }
        None => embedded,
    };

    let full = if opts.is_empty() {
        pat.to_string()
    } else {
        let mut prefix = String::with_capacity(3 + opts.len() + pat.len());
        prefix.push_str("(?");
        for ch in opts.chars() {
            match ch {
                'i' | 'm' | 's' | 'x' => prefix.push(ch),
                c => return Err(QueryError::BadValue(format!("unknown regex option: {c}"))),
            }
        }
        prefix.push(')');
        prefix.push_str(pat);
        prefix
    };

    Regex::new(&full).map_err(|e| QueryError::BadValue(format!("invalid regex pattern: {e}")))
}

fn regex_candidate(candidate: Option<&Bson>, re: &Regex) -> bool {
    let hits = |value: &Bson| match value {
        Bson::String(s) => re.is_match(s),
        Bson::Symbol(s) => re.is_match(s),
        _ => false,
    };
    match candidate {
        Some(value) => {
            if hits(value) {
                return true;
            }
            if let Bson::Array(items) = value {
                return items.iter().any(hits);
            }
            false
        }
        None => false,
    }
}

fn regex_matches(candidates: &[Option<&Bson>], re: &Regex) -> bool {
    candidates.iter().any(|c| regex_candidate(*c, re))
}

// ── $jsonSchema (pragmatic subset) ──────────────────────────────

fn match_json_schema(doc: &Document, name: &str, value: &Bson) -> Result<bool, QueryError> {
    let schema = match value {
        Bson::Document(d) => d,
        _ => return Err(QueryError::TypeMismatch(format!("{name}: expected a document"))),
    };
    validate_schema(&Bson::Document(doc.clone()), schema)
}

fn validate_schema(value: &Bson, schema: &Document) -> Result<bool, QueryError> {
    for (keyword, operand) in schema.iter() {
        let ok = match keyword.as_str() {
            "bsonType" => match_type(&[Some(value)], "bsonType", operand)?,
            "type" => json_type_matches(value, operand)?,
            "enum" => match operand {
                Bson::Array(items) => items.iter().any(|item| equal(value, item)),
                _ => return Err(QueryError::TypeMismatch("enum: expected an array".into())),
            },
            "required" => {
                let keys = match operand {
                    Bson::Array(items) => items,
                    _ => {
                        return Err(QueryError::TypeMismatch("required: expected an array".into()))
                    }
                };
                match value {
                    Bson::Document(d) => keys.iter().all(|key| match key {
                        Bson::String(k) => d.get(k).is_some(),
                        _ => false,
                    }),
                    _ => false,
                }
            }
            "properties" => {
                let props = match operand {
                    Bson::Document(d) => d,
                    _ => {
                        return Err(QueryError::TypeMismatch(
                            "properties: expected a document".into(),
                        ))
                    }
                };
                match value {
                    Bson::Document(d) => {
                        let mut all = true;
                        for (prop, sub) in props.iter() {
                            let sub = match sub {
                                Bson::Document(s) => s,
                                _ => {
                                    return Err(QueryError::TypeMismatch(
                                        "properties: expected sub-schemas".into(),
                                    ))
                                }
                            };
                            if let Some(field) = d.get(prop) {
                                if !validate_schema(field, sub)? {
                                    all = false;
                                    break;
                                }
                            }
                        }
                        all
                    }
                    _ => true,
                }
            }
            "items" => {
                let sub = match operand {
                    Bson::Document(d) => d,
                    _ => return Err(QueryError::TypeMismatch("items: expected a document".into())),
                };
                match value {
                    Bson::Array(items) => {
                        let mut all = true;
                        for item in items {
                            if !validate_schema(item, sub)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                    _ => true,
                }
            }
            "minimum" => ord_candidate(Some(value), operand, std::cmp::Ordering::is_ge),
            "maximum" => ord_candidate(Some(value), operand, std::cmp::Ordering::is_le),
            "minLength" => string_len(value)
                .map(|len| as_int(operand).map(|n| len as i64 >= n).unwrap_or(false))
                .unwrap_or(true),
            "maxLength" => string_len(value)
                .map(|len| as_int(operand).map(|n| len as i64 <= n).unwrap_or(false))
                .unwrap_or(true),
            "pattern" => match (value, operand) {
                (Bson::String(s), Bson::String(pat)) => {
                    let re = Regex::new(pat)
                        .map_err(|e| QueryError::BadValue(format!("pattern: {e}")))?;
                    re.is_match(s)
                }
                (_, Bson::String(_)) => true,
                _ => return Err(QueryError::TypeMismatch("pattern: expected a string".into())),
            },
            other => {
                return Err(QueryError::BadValue(format!(
                    "$jsonSchema: unsupported keyword '{other}'"
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn json_type_matches(value: &Bson, operand: &Bson) -> Result<bool, QueryError> {
    let names: Vec<&Bson> = match operand {
        Bson::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for name in names {
        let alias = match name {
            Bson::String(s) => s.as_str(),
            _ => return Err(QueryError::TypeMismatch("type: expected a string".into())),
        };
        let ok = match alias {
            "object" => matches!(value, Bson::Document(_)),
            "array" => matches!(value, Bson::Array(_)),
            "string" => matches!(value, Bson::String(_)),
            "number" => matches!(type_code(value), 1 | 16 | 18 | 19),
            "boolean" => matches!(value, Bson::Boolean(_)),
            "null" => matches!(value, Bson::Null),
            other => {
                return Err(QueryError::BadValue(format!("type: unknown JSON type '{other}'")))
            }
        };
        if ok {
            return Ok(true);
        }
    }
    Ok(false)
}

fn string_len(value: &Bson) -> Option<usize> {
    match value {
        Bson::String(s) => Some(s.chars().count()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn matches(doc: &Document, query: Document) -> bool {
        match_doc(doc, &query).unwrap()
    }

    #[test]
    fn implicit_equality_and_implicit_and() {
        let d = doc! { "a": 1, "b": "x" };
        assert!(matches(&d, doc! { "a": 1 }));
        assert!(matches(&d, doc! { "a": 1, "b": "x" }));
        assert!(!matches(&d, doc! { "a": 1, "b": "y" }));
    }

    #[test]
    fn equality_is_deep_and_numeric_across_types() {
        let d = doc! { "a": { "b": 1 }, "n": 5 };
        assert!(matches(&d, doc! { "a": { "b": 1 } }));
        assert!(!matches(&d, doc! { "a": { "b": 2 } }));
        assert!(matches(&d, doc! { "n": 5.0 }));
    }

    #[test]
    fn array_field_matches_element_or_whole() {
        let d = doc! { "tags": ["x", "y"] };
        assert!(matches(&d, doc! { "tags": "x" }));
        assert!(matches(&d, doc! { "tags": ["x", "y"] }));
        assert!(!matches(&d, doc! { "tags": "z" }));
    }

    #[test]
    fn dotted_path_traverses_array_of_documents() {
        let d = doc! { "items": [{ "sku": "a" }, { "sku": "b" }] };
        assert!(matches(&d, doc! { "items.sku": "b" }));
        assert!(matches(&d, doc! { "items.0.sku": "a" }));
        assert!(!matches(&d, doc! { "items.sku": "c" }));
    }

    #[test]
    fn null_matches_missing_but_exists_does_not() {
        let d = doc! { "a": 1 };
        assert!(matches(&d, doc! { "b": Bson::Null }));
        assert!(!matches(&d, doc! { "b": { "$exists": true } }));
        assert!(matches(&d, doc! { "b": { "$exists": false } }));
        assert!(matches(&d, doc! { "a": { "$exists": true } }));
    }

    #[test]
    fn range_operators_respect_type_classes() {
        let d = doc! { "n": 5, "s": "m" };
        assert!(matches(&d, doc! { "n": { "$gt": 4, "$lte": 5 } }));
        assert!(!matches(&d, doc! { "n": { "$gt": 5 } }));
        assert!(matches(&d, doc! { "s": { "$lt": "z" } }));
        // cross-class comparisons never match
        assert!(!matches(&d, doc! { "s": { "$gt": 1 } }));
    }

    #[test]
    fn in_and_nin() {
        let d = doc! { "status": "active", "tags": ["a", "b"] };
        assert!(matches(&d, doc! { "status": { "$in": ["active", "idle"] } }));
        assert!(!matches(&d, doc! { "status": { "$nin": ["active"] } }));
        assert!(matches(&d, doc! { "tags": { "$in": ["b"] } }));
    }

    #[test]
    fn type_operator_with_aliases_and_codes() {
        let d = doc! { "n": 5, "s": "x", "arr": [1] };
        assert!(matches(&d, doc! { "n": { "$type": "int" } }));
        assert!(matches(&d, doc! { "n": { "$type": "number" } }));
        assert!(matches(&d, doc! { "s": { "$type": 2 } }));
        assert!(matches(&d, doc! { "arr": { "$type": "array" } }));
        assert!(!matches(&d, doc! { "n": { "$type": "string" } }));
    }

    #[test]
    fn mod_and_size() {
        let d = doc! { "n": 10, "tags": ["a", "b", "c"] };
        assert!(matches(&d, doc! { "n": { "$mod": [3, 1] } }));
        assert!(!matches(&d, doc! { "n": { "$mod": [3, 0] } }));
        assert!(matches(&d, doc! { "tags": { "$size": 3 } }));
        assert!(!matches(&d, doc! { "tags": { "$size": 2 } }));
    }

    #[test]
    fn all_matches_every_member() {
        let d = doc! { "tags": ["a", "b", "c"] };
        assert!(matches(&d, doc! { "tags": { "$all": ["a", "c"] } }));
        assert!(!matches(&d, doc! { "tags": { "$all": ["a", "z"] } }));
        assert!(!matches(&d, doc! { "tags": { "$all": [] } }));
    }

    #[test]
    fn elem_match_is_element_only() {
        let d = doc! { "scores": [{ "v": 4 }, { "v": 9 }] };
        assert!(matches(&d, doc! { "scores": { "$elemMatch": { "v": { "$gt": 8 } } } }));
        assert!(!matches(&d, doc! { "scores": { "$elemMatch": { "v": { "$gt": 9 } } } }));

        let scalar = doc! { "n": [2, 8] };
        assert!(matches(&scalar, doc! { "n": { "$elemMatch": { "$gte": 5 } } }));
        assert!(!matches(&scalar, doc! { "n": { "$elemMatch": { "$gte": 9 } } }));
    }

    #[test]
    fn not_inverts_operator_documents() {
        let d = doc! { "n": 5 };
        assert!(matches(&d, doc! { "n": { "$not": { "$gt": 9 } } }));
        assert!(!matches(&d, doc! { "n": { "$not": { "$gt": 1 } } }));
        // missing fields satisfy $not
        assert!(matches(&d, doc! { "m": { "$not": { "$gt": 1 } } }));
    }

    #[test]
    fn logical_operators() {
        let d = doc! { "a": 1, "b": 2 };
        assert!(matches(&d, doc! { "$and": [{ "a": 1 }, { "b": 2 }] }));
        assert!(matches(&d, doc! { "$or": [{ "a": 9 }, { "b": 2 }] }));
        assert!(matches(&d, doc! { "$nor": [{ "a": 9 }, { "b": 9 }] }));
        assert!(!matches(&d, doc! { "$nor": [{ "a": 1 }] }));
        assert!(match_doc(&d, &doc! { "$and": [] }).is_err());
    }

    #[test]
    fn regex_with_options_and_literal_regex_value() {
        let d = doc! { "name": "John Smith" };
        assert!(matches(&d, doc! { "name": { "$regex": "^john", "$options": "i" } }));
        assert!(!matches(&d, doc! { "name": { "$regex": "^john" } }));
        let re = Bson::RegularExpression(bson::Regex {
            pattern: "smith$".into(),
            options: "i".into(),
        });
        assert!(matches(&d, doc! { "name": re }));
        assert!(match_doc(&d, &doc! { "name": { "$options": "i" } }).is_err());
    }

    #[test]
    fn unknown_operators_error() {
        let d = doc! { "a": 1 };
        assert_eq!(
            match_doc(&d, &doc! { "a": { "$near": 1 } }).unwrap_err(),
            QueryError::UnknownOperator("$near".into())
        );
        assert!(match_doc(&d, &doc! { "$fancy": [] }).is_err());
    }

    #[test]
    fn json_schema_subset() {
        let d = doc! { "name": "ada", "age": 36 };
        let schema = doc! {
            "$jsonSchema": {
                "bsonType": "object",
                "required": ["name", "age"],
                "properties": {
                    "name": { "bsonType": "string", "minLength": 2 },
                    "age": { "bsonType": "number", "minimum": 0, "maximum": 150 }
                }
            }
        };
        assert!(matches(&d, schema));

        let bad = doc! {
            "$jsonSchema": { "properties": { "age": { "maximum": 30 } } }
        };
        assert!(!matches(&d, bad));

        let unsupported = doc! { "$jsonSchema": { "allOf": [] } };
        assert!(match_doc(&d, &unsupported).is_err());
    }
}
