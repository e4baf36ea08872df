//! Selector matching for conditional operations.
//!
//! The engine only needs two things from a query engine: compile a selector
//! once, then test documents against it. [`MongoQueryEngine`] is the default
//! implementation and understands the common Mongo selector subset.

use crate::{error::Result, path::FieldPath, CollectionSchema, Error};
use serde_json::Value;
use std::cmp::Ordering;

/// A compiled selector.
pub trait Predicate: Send + Sync {
    fn matches(&self, doc: &Value) -> bool;
}

/// Compiles selector expressions into predicates.
pub trait QueryEngine: Send + Sync {
    fn compile(&self, schema: &CollectionSchema, selector: &Value) -> Result<Box<dyn Predicate>>;
}

/// Mongo-style selectors.
///
/// Supported: implicit equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`,
/// `$in`, `$nin`, `$exists`, `$size`, `$not`, and the logical `$and`,
/// `$or`, `$nor`. Equality and comparisons against an array field match if
/// any element matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoQueryEngine;

impl QueryEngine for MongoQueryEngine {
    fn compile(&self, _schema: &CollectionSchema, selector: &Value) -> Result<Box<dyn Predicate>> {
        Ok(Box::new(Selector::compile(selector)?))
    }
}

#[derive(Debug, Clone)]
enum Selector {
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Nor(Vec<Selector>),
    Field {
        path: FieldPath,
        condition: Condition,
    },
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Cmp(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(usize),
    Not(Box<Condition>),
    All(Vec<Condition>),
}

impl Selector {
    fn compile(selector: &Value) -> Result<Self> {
        let clauses = selector
            .as_object()
            .ok_or_else(|| Error::InvalidSelector("selector must be an object".into()))?;

        let mut compiled = Vec::with_capacity(clauses.len());
        for (key, value) in clauses {
            let clause = match key.as_str() {
                "$and" => Selector::And(Self::compile_list(key, value)?),
                "$or" => Selector::Or(Self::compile_list(key, value)?),
                "$nor" => Selector::Nor(Self::compile_list(key, value)?),
                op if op.starts_with('$') => {
                    return Err(Error::InvalidSelector(format!(
                        "unsupported top-level operator {}",
                        op
                    )))
                }
                field => Selector::Field {
                    path: FieldPath::parse(field)
                        .map_err(|e| Error::InvalidSelector(e.to_string()))?,
                    condition: Condition::compile(value)?,
                },
            };
            compiled.push(clause);
        }

        Ok(match compiled.len() {
            1 => compiled.remove(0),
            _ => Selector::And(compiled),
        })
    }

    fn compile_list(operator: &str, value: &Value) -> Result<Vec<Selector>> {
        match value {
            Value::Array(items) if !items.is_empty() => items.iter().map(Self::compile).collect(),
            _ => Err(Error::InvalidSelector(format!(
                "{} expects a non-empty array",
                operator
            ))),
        }
    }

    fn test(&self, doc: &Value) -> bool {
        match self {
            Selector::And(all) => all.iter().all(|s| s.test(doc)),
            Selector::Or(any) => any.iter().any(|s| s.test(doc)),
            Selector::Nor(none) => !none.iter().any(|s| s.test(doc)),
            Selector::Field { path, condition } => condition.test(path.get(doc)),
        }
    }
}

impl Predicate for Selector {
    fn matches(&self, doc: &Value) -> bool {
        self.test(doc)
    }
}

impl Condition {
    fn compile(value: &Value) -> Result<Self> {
        let operators = match value.as_object() {
            Some(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
            _ => return Ok(Condition::Eq(value.clone())),
        };

        let mut conditions = Vec::with_capacity(operators.len());
        for (op, arg) in operators {
            let condition = match op.as_str() {
                "$eq" => Condition::Eq(arg.clone()),
                "$ne" => Condition::Ne(arg.clone()),
                "$gt" => Condition::Cmp(Ordering::Greater, false, arg.clone()),
                "$gte" => Condition::Cmp(Ordering::Greater, true, arg.clone()),
                "$lt" => Condition::Cmp(Ordering::Less, false, arg.clone()),
                "$lte" => Condition::Cmp(Ordering::Less, true, arg.clone()),
                "$in" => Condition::In(Self::list(op, arg)?),
                "$nin" => Condition::Nin(Self::list(op, arg)?),
                "$exists" => Condition::Exists(truthy(arg)),
                "$size" => Condition::Size(arg.as_u64().ok_or_else(|| {
                    Error::InvalidSelector("$size expects a non-negative integer".into())
                })? as usize),
                "$not" => Condition::Not(Box::new(Self::compile(arg)?)),
                other => {
                    return Err(Error::InvalidSelector(format!(
                        "unsupported operator {}",
                        other
                    )))
                }
            };
            conditions.push(condition);
        }

        Ok(match conditions.len() {
            1 => conditions.remove(0),
            _ => Condition::All(conditions),
        })
    }

    fn list(op: &str, arg: &Value) -> Result<Vec<Value>> {
        arg.as_array()
            .cloned()
            .ok_or_else(|| Error::InvalidSelector(format!("{} expects an array", op)))
    }

    fn test(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => matches_eq(value, expected),
            Condition::Ne(expected) => !matches_eq(value, expected),
            Condition::Cmp(direction, inclusive, bound) => match value {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| cmp_matches(item, bound, *direction, *inclusive)),
                Some(actual) => cmp_matches(actual, bound, *direction, *inclusive),
                None => false,
            },
            Condition::In(options) => options.iter().any(|o| matches_eq(value, o)),
            Condition::Nin(options) => !options.iter().any(|o| matches_eq(value, o)),
            Condition::Exists(should_exist) => value.is_some() == *should_exist,
            Condition::Size(len) => matches!(value, Some(Value::Array(items)) if items.len() == *len),
            Condition::Not(inner) => !inner.test(value),
            Condition::All(all) => all.iter().all(|c| c.test(value)),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    }
}

fn matches_eq(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn cmp_matches(actual: &Value, bound: &Value, direction: Ordering, inclusive: bool) -> bool {
    match compare_values(actual, bound) {
        Some(Ordering::Equal) => inclusive,
        Some(ordering) => ordering == direction,
        None => false,
    }
}

/// Equality with numeric normalisation, so `1` equals `1.0`.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Order two values of the same kind. Mixed kinds are incomparable.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(selector: Value, doc: Value) -> bool {
        let schema = CollectionSchema::new("items", "id", vec![]);
        MongoQueryEngine
            .compile(&schema, &selector)
            .unwrap()
            .matches(&doc)
    }

    #[test]
    fn implicit_equality() {
        assert!(matches(json!({"name": "a"}), json!({"name": "a"})));
        assert!(!matches(json!({"name": "a"}), json!({"name": "b"})));
        assert!(matches(json!({"n": 1}), json!({"n": 1.0})));
        assert!(matches(json!({"missing": null}), json!({})));
    }

    #[test]
    fn comparisons() {
        let doc = json!({"age": 30, "name": "m"});
        assert!(matches(json!({"age": {"$gt": 20, "$lte": 30}}), doc.clone()));
        assert!(!matches(json!({"age": {"$lt": 30}}), doc.clone()));
        assert!(matches(json!({"name": {"$gte": "a"}}), doc.clone()));
        assert!(!matches(json!({"name": {"$gt": 5}}), doc));
    }

    #[test]
    fn arrays_match_any_element() {
        let doc = json!({"tags": ["x", "y"], "scores": [1, 9]});
        assert!(matches(json!({"tags": "y"}), doc.clone()));
        assert!(matches(json!({"scores": {"$gt": 5}}), doc.clone()));
        assert!(matches(json!({"tags": {"$size": 2}}), doc.clone()));
        assert!(matches(json!({"tags": ["x", "y"]}), doc));
    }

    #[test]
    fn membership_and_existence() {
        let doc = json!({"status": "open", "nested": {"flag": true}});
        assert!(matches(json!({"status": {"$in": ["open", "new"]}}), doc.clone()));
        assert!(matches(json!({"status": {"$nin": ["closed"]}}), doc.clone()));
        assert!(matches(json!({"nested.flag": {"$exists": true}}), doc.clone()));
        assert!(matches(json!({"other": {"$exists": false}}), doc.clone()));
        assert!(matches(json!({"status": {"$not": {"$eq": "closed"}}}), doc));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(json!({"$or": [{"a": 5}, {"b": 2}]}), doc.clone()));
        assert!(matches(json!({"$and": [{"a": 1}, {"b": 2}]}), doc.clone()));
        assert!(!matches(json!({"$nor": [{"a": 1}]}), doc.clone()));
        assert!(matches(json!({}), doc));
    }

    #[test]
    fn invalid_selectors() {
        let schema = CollectionSchema::new("items", "id", vec![]);
        for selector in [
            json!("nope"),
            json!({"$where": "1"}),
            json!({"a": {"$regex": "x"}}),
            json!({"$or": []}),
            json!({"a": {"$in": 3}}),
        ] {
            let result = MongoQueryEngine.compile(&schema, &selector);
            assert!(matches!(result, Err(Error::InvalidSelector(_))), "{}", selector);
        }
    }
}
