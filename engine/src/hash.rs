//! Digest over the actor topology of an operation log.
//!
//! The digest only covers *who* wrote in each row, never *what* they wrote.
//! It is a cheap "are these two logs already the same" check for the
//! conflict handler, not a content hash and not a security primitive.

use crate::OperationRow;
use serde_json::Value;

/// A deterministic `string -> string` function supplied by the host.
///
/// Any `Fn(&str) -> String` closure is a hash function.
pub trait HashFunction: Send + Sync {
    fn hash(&self, input: &str) -> String;
}

impl<F> HashFunction for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn hash(&self, input: &str) -> String {
        self(input)
    }
}

/// Default digest: hex-encoded BLAKE3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hash;

impl HashFunction for Blake3Hash {
    fn hash(&self, input: &str) -> String {
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }
}

/// Hash the per-row creator lists of `operations`.
///
/// The hashed input is the compact JSON array of arrays of creators,
/// e.g. `[["a"],["a","b"]]`.
pub fn hash_operations(hasher: &dyn HashFunction, operations: &[OperationRow]) -> String {
    hasher.hash(&creator_topology(operations))
}

fn creator_topology(operations: &[OperationRow]) -> String {
    let rows: Vec<Value> = operations
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|op| Value::String(op.creator.clone()))
                    .collect(),
            )
        })
        .collect();
    Value::Array(rows).to_string()
}
