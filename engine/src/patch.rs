//! Mongo-style update documents used by `ifMatch` / `ifNotMatch`.
//!
//! Supported operators: `$set`, `$unset`, `$inc`, `$mul`, `$min`, `$max`,
//! `$push`, `$addToSet`, `$pull`, `$pop` and `$rename`. Keys use dotted
//! [`FieldPath`]s. Whole-document replacements are rejected: every write
//! must be expressible as a replayable operator.

use crate::{error::Result, path::FieldPath, query::compare_values, Error};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Apply `update` to `doc`, returning the patched document.
pub fn apply_update(mut doc: Value, update: &Value) -> Result<Value> {
    let operators = update
        .as_object()
        .ok_or_else(|| Error::InvalidPatch("update must be an object".into()))?;

    for (operator, fields) in operators {
        if !operator.starts_with('$') {
            return Err(Error::InvalidPatch(format!(
                "'{}' is not an update operator; replacement documents are not supported",
                operator
            )));
        }
        let fields = fields.as_object().ok_or_else(|| {
            Error::InvalidPatch(format!("{} expects an object of fields", operator))
        })?;

        for (raw_path, arg) in fields {
            let path = FieldPath::parse(raw_path).map_err(|e| Error::InvalidPatch(e.to_string()))?;
            match operator.as_str() {
                "$set" => set(&path, &mut doc, arg.clone())?,
                "$unset" => {
                    path.remove(&mut doc);
                }
                "$inc" => arithmetic(&path, &mut doc, arg, operator, add_numbers)?,
                "$mul" => arithmetic(&path, &mut doc, arg, operator, mul_numbers)?,
                "$min" => bound(&path, &mut doc, arg, Ordering::Less)?,
                "$max" => bound(&path, &mut doc, arg, Ordering::Greater)?,
                "$push" => push(&path, &mut doc, arg, false)?,
                "$addToSet" => push(&path, &mut doc, arg, true)?,
                "$pull" => pull(&path, &mut doc, arg)?,
                "$pop" => pop(&path, &mut doc, arg)?,
                "$rename" => rename(&path, &mut doc, arg)?,
                other => {
                    return Err(Error::InvalidPatch(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }

    Ok(doc)
}

fn set(path: &FieldPath, doc: &mut Value, value: Value) -> Result<()> {
    path.set(doc, value)
        .map_err(|e| Error::InvalidPatch(e.to_string()))
}

fn arithmetic(
    path: &FieldPath,
    doc: &mut Value,
    arg: &Value,
    operator: &str,
    combine: fn(&Number, &Number) -> Option<Number>,
) -> Result<()> {
    let Value::Number(operand) = arg else {
        return Err(Error::InvalidPatch(format!(
            "{} on '{}' needs a numeric argument",
            operator, path
        )));
    };
    let next = match path.get(doc) {
        None | Some(Value::Null) => match operator {
            "$mul" => Number::from(0),
            _ => operand.clone(),
        },
        Some(Value::Number(current)) => combine(current, operand).ok_or_else(|| {
            Error::InvalidPatch(format!("{} on '{}' overflowed", operator, path))
        })?,
        Some(_) => {
            return Err(Error::InvalidPatch(format!(
                "{} on non-numeric field '{}'",
                operator, path
            )))
        }
    };
    set(path, doc, Value::Number(next))
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.checked_add(y).map(Number::from),
        _ => Number::from_f64(a.as_f64()? + b.as_f64()?),
    }
}

fn mul_numbers(a: &Number, b: &Number) -> Option<Number> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.checked_mul(y).map(Number::from),
        _ => Number::from_f64(a.as_f64()? * b.as_f64()?),
    }
}

/// `$min` keeps the smaller value, `$max` the greater one.
fn bound(path: &FieldPath, doc: &mut Value, arg: &Value, wanted: Ordering) -> Result<()> {
    let replace = match path.get(doc) {
        None | Some(Value::Null) => true,
        Some(current) => compare_values(arg, current) == Some(wanted),
    };
    if replace {
        set(path, doc, arg.clone())?;
    }
    Ok(())
}

fn push(path: &FieldPath, doc: &mut Value, arg: &Value, unique: bool) -> Result<()> {
    let items: Vec<Value> = match arg.as_object().and_then(|o| o.get("$each")) {
        Some(Value::Array(each)) => each.clone(),
        Some(_) => {
            return Err(Error::InvalidPatch(format!(
                "$each on '{}' must be an array",
                path
            )))
        }
        None => vec![arg.clone()],
    };

    let mut list = match path.get(doc) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(existing)) => existing.clone(),
        Some(_) => {
            return Err(Error::InvalidPatch(format!(
                "cannot push to non-array field '{}'",
                path
            )))
        }
    };
    for item in items {
        if !unique || !list.contains(&item) {
            list.push(item);
        }
    }
    set(path, doc, Value::Array(list))
}

fn pull(path: &FieldPath, doc: &mut Value, arg: &Value) -> Result<()> {
    match path.get_mut(doc) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(list)) => {
            list.retain(|item| item != arg);
            Ok(())
        }
        Some(_) => Err(Error::InvalidPatch(format!(
            "cannot pull from non-array field '{}'",
            path
        ))),
    }
}

fn pop(path: &FieldPath, doc: &mut Value, arg: &Value) -> Result<()> {
    let from_front = match arg.as_i64() {
        Some(-1) => true,
        Some(1) => false,
        _ => {
            return Err(Error::InvalidPatch(format!(
                "$pop on '{}' expects 1 or -1",
                path
            )))
        }
    };
    match path.get_mut(doc) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(list)) => {
            if from_front && !list.is_empty() {
                list.remove(0);
            } else {
                list.pop();
            }
            Ok(())
        }
        Some(_) => Err(Error::InvalidPatch(format!(
            "cannot pop from non-array field '{}'",
            path
        ))),
    }
}

fn rename(path: &FieldPath, doc: &mut Value, arg: &Value) -> Result<()> {
    let target = arg
        .as_str()
        .ok_or_else(|| Error::InvalidPatch(format!("$rename target for '{}' must be a string", path)))
        .and_then(|t| FieldPath::parse(t).map_err(|e| Error::InvalidPatch(e.to_string())))?;
    if let Some(value) = path.remove(doc) {
        set(&target, doc, value)?;
    }
    Ok(())
}

/// Build a `$set` update from every non-internal top-level field of `doc`,
/// skipping `exclude`.
pub fn set_all_fields(doc: &Map<String, Value>, exclude: &str) -> Value {
    let fields: Map<String, Value> = doc
        .iter()
        .filter(|(key, _)| !key.starts_with('_') && key.as_str() != exclude)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let mut update = Map::new();
    update.insert("$set".into(), Value::Object(fields));
    Value::Object(update)
}
