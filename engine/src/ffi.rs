//! FFI layer for hosts whose replication engine is not written in Rust.
//!
//! The functions are stateless: every call carries the schema and the
//! documents it needs. All data crosses the boundary as JSON strings, and
//! the digest is always the default [`Blake3Hash`].
//!
//! # Memory Management
//!
//! - Strings returned by `splice_*` functions are allocated by Rust
//! - Caller must free them with `splice_string_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure

use crate::{
    conflict::{ConflictHandler, ConflictInput, ConflictResolution, CrdtConflictHandler},
    hash::{hash_operations, Blake3Hash},
    merge::merge_fields,
    query::MongoQueryEngine,
    rebuild::rebuild,
    schema::{crdt_schema_part, parse_crdt_field},
    CollectionSchema, CrdtField, OperationRow,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

/// Result wrapper for FFI responses.
#[derive(serde::Serialize)]
#[serde(untagged)]
enum FfiResult<T: serde::Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: serde::Serialize> FfiResult<T> {
    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e))
    }
}

impl<T: serde::Serialize> From<Result<T, String>> for FfiResult<T> {
    fn from(result: Result<T, String>) -> Self {
        match result {
            Ok(ok) => FfiResult::Ok { ok },
            Err(error) => FfiResult::Err { error },
        }
    }
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `splice_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        // String contained null bytes - return error JSON
        Err(_) => CString::new(r#"{"error":"string contained null bytes"}"#)
            .unwrap_or_default()
            .into_raw(),
    }
}

fn respond<T: serde::Serialize>(result: Result<T, String>) -> *mut c_char {
    to_c_string(FfiResult::from(result).to_json())
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Read and parse a JSON argument.
unsafe fn parse_arg<T: DeserializeOwned>(ptr: *const c_char, name: &str) -> Result<T, String> {
    let raw = from_c_string(ptr).ok_or_else(|| format!("invalid {} string", name))?;
    serde_json::from_str(&raw).map_err(|e| format!("{} parse error: {}", name, e))
}

/// Parse a crdt field argument and check it against the crdt schema.
unsafe fn crdt_arg(ptr: *const c_char, name: &str) -> Result<CrdtField, String> {
    let value: Value = parse_arg(ptr, name)?;
    parse_crdt_field(&value).map_err(|e| format!("{}: {}", name, e))
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `splice_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn splice_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Crdt Operations
// ============================================================================

/// Merge two crdt fields.
///
/// # Returns
/// JSON string: `{"ok": CrdtField}` or `{"error": "message"}`
///
/// # Safety
/// - `a_json` and `b_json` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `splice_string_free`
#[no_mangle]
pub unsafe extern "C" fn splice_merge_fields(
    a_json: *const c_char,
    b_json: *const c_char,
) -> *mut c_char {
    let result = (|| -> Result<CrdtField, String> {
        let a = crdt_arg(a_json, "first crdt field")?;
        let b = crdt_arg(b_json, "second crdt field")?;
        Ok(merge_fields(&Blake3Hash, &a, &b))
    })();
    respond(result)
}

/// Compute the digest of an `operations` array.
///
/// # Returns
/// JSON string: `{"ok": "<hash>"}` or `{"error": "message"}`
///
/// # Safety
/// - `operations_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `splice_string_free`
#[no_mangle]
pub unsafe extern "C" fn splice_hash_operations(operations_json: *const c_char) -> *mut c_char {
    let result = parse_arg::<Vec<OperationRow>>(operations_json, "operations")
        .map(|operations| hash_operations(&Blake3Hash, &operations));
    respond(result)
}

/// Rebuild a document from a crdt field.
///
/// # Arguments
/// - `schema_json`: JSON string of CollectionSchema (must declare a crdt field)
/// - `field_json`: JSON string of CrdtField
/// - `base_json`: JSON document whose structural fields are kept, or null
///
/// # Returns
/// JSON string: `{"ok": Document}` or `{"error": "message"}`
///
/// # Safety
/// - all arguments must be valid null-terminated C strings; `base_json` may be null
/// - Caller must free the returned string with `splice_string_free`
#[no_mangle]
pub unsafe extern "C" fn splice_rebuild(
    schema_json: *const c_char,
    field_json: *const c_char,
    base_json: *const c_char,
) -> *mut c_char {
    let result = (|| -> Result<Value, String> {
        let schema: CollectionSchema = parse_arg(schema_json, "schema")?;
        let field = crdt_arg(field_json, "crdt field")?;
        let base: Option<Value> = if base_json.is_null() {
            None
        } else {
            Some(parse_arg(base_json, "base document")?)
        };
        rebuild(&MongoQueryEngine, &schema, base.as_ref(), &field).map_err(|e| e.to_string())
    })();
    respond(result)
}

/// Run the crdt conflict handler.
///
/// # Arguments
/// - `schema_json`: JSON string of CollectionSchema (must declare a crdt field)
/// - `input_json`: `{"newDocumentState": …, "realMasterState": …}`
///
/// # Returns
/// JSON string: `{"ok": {"isEqual": true}}`,
/// `{"ok": {"isEqual": false, "documentData": …}}` or `{"error": "message"}`
///
/// # Safety
/// - `schema_json` and `input_json` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `splice_string_free`
#[no_mangle]
pub unsafe extern "C" fn splice_resolve_conflict(
    schema_json: *const c_char,
    input_json: *const c_char,
) -> *mut c_char {
    let result = (|| -> Result<ConflictResolution, String> {
        let schema: CollectionSchema = parse_arg(schema_json, "schema")?;
        let input: ConflictInput = parse_arg(input_json, "conflict input")?;
        let handler = CrdtConflictHandler::new(
            Arc::new(schema),
            Arc::new(Blake3Hash),
            Arc::new(MongoQueryEngine),
        )
        .map_err(|e| e.to_string())?;
        handler.resolve(&input).map_err(|e| e.to_string())
    })();
    respond(result)
}

/// The JSON schema fragment of a crdt field.
///
/// # Returns
/// JSON string: `{"ok": <schema>}`
///
/// # Safety
/// Caller must free the returned string with `splice_string_free`
#[no_mangle]
pub extern "C" fn splice_crdt_schema_part() -> *mut c_char {
    respond(Ok::<_, String>(crdt_schema_part()))
}

/// Get the engine version.
///
/// # Returns
/// Static string pointer (do not free)
#[no_mangle]
pub extern "C" fn splice_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema_json() -> CString {
        CString::new(
            r#"{
                "name": "items",
                "primaryKey": "id",
                "fields": [
                    {"name": "name", "fieldType": "string", "required": false}
                ],
                "crdt": {"field": "crdts"}
            }"#,
        )
        .unwrap()
    }

    fn field_json(rows: Value) -> Value {
        let operations: Vec<OperationRow> = serde_json::from_value(rows).unwrap();
        serde_json::to_value(CrdtField::new(&Blake3Hash, operations)).unwrap()
    }

    fn row(creator: &str, set: Value) -> Value {
        json!([{"body": [{"ifMatch": {"$set": set}}], "creator": creator, "time": 1}])
    }

    unsafe fn take(ptr: *mut c_char) -> Value {
        let text = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        splice_string_free(ptr);
        serde_json::from_str(&text).unwrap()
    }

    fn c(value: &Value) -> CString {
        CString::new(value.to_string()).unwrap()
    }

    #[test]
    fn ffi_merge_fields() {
        let base = row("x", json!({"id": "1"}));
        let a = field_json(json!([base.clone(), row("b", json!({"name": "b"}))]));
        let b = field_json(json!([base, row("a", json!({"name": "a"}))]));

        unsafe {
            let result = take(splice_merge_fields(c(&a).as_ptr(), c(&b).as_ptr()));
            let merged = CrdtField::from_value(&result["ok"]).unwrap();
            let creators: Vec<&str> = merged.operations[1]
                .iter()
                .map(|op| op.creator.as_str())
                .collect();
            assert_eq!(creators, vec!["a", "b"]);
        }
    }

    #[test]
    fn ffi_rejects_malformed_crdt_fields() {
        let good = field_json(json!([row("x", json!({"id": "1"}))]));
        let empty_body = json!({
            "operations": [[{"body": [], "creator": "y", "time": 5}]],
            "hash": "abc"
        });
        let schema = test_schema_json();

        unsafe {
            let result = take(splice_merge_fields(c(&good).as_ptr(), c(&empty_body).as_ptr()));
            assert!(result["error"].as_str().unwrap().contains("empty body"));

            let result = take(splice_rebuild(
                schema.as_ptr(),
                c(&empty_body).as_ptr(),
                std::ptr::null(),
            ));
            assert!(result.get("error").is_some());

            let input = json!({
                "newDocumentState": {"id": "1", "crdts": good},
                "realMasterState": {"id": "1", "crdts": empty_body}
            });
            let result = take(splice_resolve_conflict(schema.as_ptr(), c(&input).as_ptr()));
            assert!(result.get("error").is_some());
        }
    }

    #[test]
    fn ffi_hash_operations() {
        let operations = json!([row("x", json!({"id": "1"}))]);
        let expected = blake3::hash(br#"[["x"]]"#).to_hex().to_string();
        unsafe {
            let result = take(splice_hash_operations(c(&operations).as_ptr()));
            assert_eq!(result, json!({ "ok": expected }));
        }
    }

    #[test]
    fn ffi_rebuild() {
        let field = field_json(json!([row("x", json!({"id": "1", "name": "a"}))]));
        let schema = test_schema_json();
        unsafe {
            let result = take(splice_rebuild(
                schema.as_ptr(),
                c(&field).as_ptr(),
                std::ptr::null(),
            ));
            assert_eq!(result["ok"]["name"], json!("a"));
            assert_eq!(result["ok"]["_deleted"], json!(false));
            assert_eq!(result["ok"]["crdts"], field);
        }
    }

    #[test]
    fn ffi_resolve_conflict() {
        let base = row("x", json!({"id": "1"}));
        let ours = field_json(json!([base.clone(), row("x", json!({"name": "b"}))]));
        let theirs = field_json(json!([base]));
        let input = json!({
            "newDocumentState": {"id": "1", "name": "b", "crdts": ours},
            "realMasterState": {"id": "1", "crdts": theirs}
        });
        let schema = test_schema_json();

        unsafe {
            let result = take(splice_resolve_conflict(schema.as_ptr(), c(&input).as_ptr()));
            assert_eq!(result["ok"]["isEqual"], json!(false));
            assert_eq!(result["ok"]["documentData"]["name"], json!("b"));

            let same = json!({
                "newDocumentState": input["newDocumentState"],
                "realMasterState": input["newDocumentState"]
            });
            let result = take(splice_resolve_conflict(schema.as_ptr(), c(&same).as_ptr()));
            assert_eq!(result, json!({"ok": {"isEqual": true}}));
        }
    }

    #[test]
    fn ffi_errors() {
        unsafe {
            let result = take(splice_merge_fields(std::ptr::null(), std::ptr::null()));
            assert!(result["error"].as_str().unwrap().contains("first crdt field"));

            let plain = CString::new(r#"{"name": "plain", "primaryKey": "id", "fields": []}"#).unwrap();
            let input = c(&json!({"newDocumentState": {}, "realMasterState": {}}));
            let result = take(splice_resolve_conflict(plain.as_ptr(), input.as_ptr()));
            assert!(result["error"].as_str().unwrap().contains("no crdt field"));
        }
    }

    #[test]
    fn ffi_schema_part_and_version() {
        unsafe {
            let result = take(splice_crdt_schema_part());
            assert_eq!(result["ok"], crdt_schema_part());

            let version = CStr::from_ptr(splice_version()).to_str().unwrap();
            assert_eq!(version, env!("CARGO_PKG_VERSION"));
        }
    }
}
