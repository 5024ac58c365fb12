//! Canonical total order over BSON values.
//!
//! Values order first by a canonical type rank, then by a type-specific
//! comparison. All numeric types form a single class and compare by
//! numeric value, so `1`, `1.0` and `Decimal128("1")` are equal.

use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::{BigDecimal, FromPrimitive};
use bson::Bson;

/// Canonical rank of a value's type class. A missing value (`None`) ranks
/// between MinKey and Undefined — missing stays distinct from null.
pub fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None => 1,
        Some(v) => match v {
            Bson::MinKey => 0,
            Bson::Undefined => 2,
            Bson::Null => 3,
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 4,
            Bson::String(_) | Bson::Symbol(_) => 5,
            Bson::Document(_) => 6,
            Bson::Array(_) => 7,
            Bson::Binary(_) => 8,
            Bson::ObjectId(_) => 9,
            Bson::Boolean(_) => 10,
            Bson::DateTime(_) => 11,
            Bson::Timestamp(_) => 12,
            Bson::RegularExpression(_) => 13,
            Bson::DbPointer(_) => 14,
            Bson::JavaScriptCode(_) => 15,
            Bson::JavaScriptCodeWithScope(_) => 16,
            Bson::MaxKey => 17,
        },
    }
}

/// Compare two values under the canonical total order.
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    compare_opt(Some(a), Some(b))
}

/// Compare two possibly-missing values. `None` means the field is absent.
pub fn compare_opt(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        // both missing
        _ => return Ordering::Equal,
    };

    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x).cmp(y),
        (Bson::Int64(x), Bson::Int32(y)) => x.cmp(&i64::from(*y)),
        (Bson::Double(x), Bson::Double(y)) => compare_doubles(*x, *y),
        (x, y) if type_rank(Some(x)) == 4 => numeric(x).cmp(&numeric(y)),

        (Bson::String(x), Bson::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::String(x), Bson::Symbol(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Symbol(x), Bson::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.as_bytes().cmp(y.as_bytes()),

        (Bson::Document(x), Bson::Document(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let key = ka.as_bytes().cmp(kb.as_bytes());
                if key != Ordering::Equal {
                    return key;
                }
                let val = compare(va, vb);
                if val != Ordering::Equal {
                    return val;
                }
            }
            x.len().cmp(&y.len())
        }

        (Bson::Array(x), Bson::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let val = compare(va, vb);
                if val != Ordering::Equal {
                    return val;
                }
            }
            x.len().cmp(&y.len())
        }

        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),

        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            x.time.cmp(&y.time).then_with(|| x.increment.cmp(&y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .as_bytes()
            .cmp(y.pattern.as_bytes())
            .then_with(|| x.options.as_bytes().cmp(y.options.as_bytes())),
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::JavaScriptCodeWithScope(x), Bson::JavaScriptCodeWithScope(y)) => x
            .code
            .as_bytes()
            .cmp(y.code.as_bytes())
            .then_with(|| compare(&Bson::Document(x.scope.clone()), &Bson::Document(y.scope.clone()))),

        // singleton classes, and DbPointer values which expose no fields
        _ => Ordering::Equal,
    }
}

/// Structural equality under the total order.
pub fn equal(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Ordering::Equal
}

// ── Numeric comparison ──────────────────────────────────────────

/// A number lifted into an exactly-comparable form. NaN sorts below all
/// other numbers and equals itself.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Numeric {
    Nan,
    NegInfinity,
    Finite(BigDecimal),
    Infinity,
}

fn numeric(value: &Bson) -> Numeric {
    match value {
        Bson::Int32(n) => Numeric::Finite(BigDecimal::from(i64::from(*n))),
        Bson::Int64(n) => Numeric::Finite(BigDecimal::from(*n)),
        Bson::Double(d) => {
            if d.is_nan() {
                Numeric::Nan
            } else if *d == f64::INFINITY {
                Numeric::Infinity
            } else if *d == f64::NEG_INFINITY {
                Numeric::NegInfinity
            } else {
                match BigDecimal::from_f64(*d) {
                    Some(big) => Numeric::Finite(big),
                    None => Numeric::Nan,
                }
            }
        }
        Bson::Decimal128(d) => {
            let repr = d.to_string();
            match repr.as_str() {
                "Infinity" => Numeric::Infinity,
                "-Infinity" => Numeric::NegInfinity,
                _ => match BigDecimal::from_str(&repr) {
                    Ok(big) => Numeric::Finite(big),
                    Err(_) => Numeric::Nan,
                },
            }
        }
        _ => Numeric::Nan,
    }
}

fn compare_doubles(x: f64, y: f64) -> Ordering {
    match x.partial_cmp(&y) {
        Some(ord) => ord,
        None => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn numbers_compare_by_value_across_types() {
        assert_eq!(compare(&bson!(1), &bson!(1.0)), Ordering::Equal);
        assert_eq!(compare(&bson!(1_i64), &bson!(1)), Ordering::Equal);
        assert_eq!(compare(&bson!(2), &bson!(1.5)), Ordering::Greater);
        assert_eq!(compare(&bson!(-3.5), &bson!(-3_i64)), Ordering::Less);
    }

    #[test]
    fn decimal_compares_with_other_numbers() {
        let one: bson::Decimal128 = "1".parse().unwrap();
        let one_and_half: bson::Decimal128 = "1.5".parse().unwrap();
        assert_eq!(compare(&Bson::Decimal128(one), &bson!(1)), Ordering::Equal);
        assert_eq!(
            compare(&Bson::Decimal128(one_and_half), &bson!(1.25)),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_sorts_below_numbers_and_equals_itself() {
        assert_eq!(compare(&bson!(f64::NAN), &bson!(f64::NAN)), Ordering::Equal);
        assert_eq!(
            compare(&bson!(f64::NAN), &bson!(f64::NEG_INFINITY)),
            Ordering::Less
        );
        assert_eq!(compare(&bson!(f64::NAN), &bson!(0)), Ordering::Less);
    }

    #[test]
    fn type_ranks_separate_classes() {
        assert_eq!(compare(&Bson::Null, &bson!(0)), Ordering::Less);
        assert_eq!(compare(&bson!("a"), &bson!(9000)), Ordering::Greater);
        assert_eq!(compare(&bson!(true), &bson!("z")), Ordering::Greater);
        assert_eq!(compare(&Bson::MaxKey, &bson!(true)), Ordering::Greater);
        assert_eq!(compare(&Bson::MinKey, &Bson::Null), Ordering::Less);
    }

    #[test]
    fn missing_is_distinct_from_null() {
        assert_eq!(compare_opt(None, Some(&Bson::Null)), Ordering::Less);
        assert_eq!(compare_opt(None, None), Ordering::Equal);
        assert_eq!(compare_opt(Some(&Bson::MinKey), None), Ordering::Less);
    }

    #[test]
    fn documents_compare_respecting_field_order() {
        let a = bson!({ "a": 1, "b": 2 });
        let b = bson!({ "b": 2, "a": 1 });
        assert_ne!(compare(&a, &b), Ordering::Equal);

        let c = bson!({ "a": 1 });
        let d = bson!({ "a": 1, "b": 0 });
        assert_eq!(compare(&c, &d), Ordering::Less);
    }

    #[test]
    fn arrays_compare_elementwise() {
        assert_eq!(compare(&bson!([1, 2]), &bson!([1, 3])), Ordering::Less);
        assert_eq!(compare(&bson!([1, 2]), &bson!([1, 2, 0])), Ordering::Less);
        assert_eq!(compare(&bson!([1, 2.0]), &bson!([1.0, 2])), Ordering::Equal);
    }

    #[test]
    fn strings_compare_by_bytes_and_match_symbols() {
        assert_eq!(compare(&bson!("abc"), &bson!("abd")), Ordering::Less);
        assert_eq!(
            compare(&bson!("abc"), &Bson::Symbol("abc".into())),
            Ordering::Equal
        );
    }

    #[test]
    fn structural_equality_on_nested_documents() {
        let a = bson!({ "x": { "y": [1, { "z": 2 }] } });
        let b = bson!({ "x": { "y": [1, { "z": 2.0 }] } });
        assert!(equal(&a, &b));
    }
}
