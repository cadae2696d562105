//! Canonical Encoder - deterministic bytes for a task's hashed fields
//!
//! Layout (all integers u64 big-endian):
//!
//! ```text
//! "salted/v1"
//! 'V' len logic_version
//! 'P' count { len name, tag, value }*     significant params, declared order
//! 'D' count { 32-byte digest }*           dependency hashes, declared order
//! ```
//!
//! Every variable-length field is length-prefixed, so field boundaries can
//! never be confused (`"ab" + "c"` vs `"a" + "bc"`).

use crate::descriptor::{ParamValue, TaskDescriptor};
use crate::hasher::ContentHash;
use thiserror::Error;

/// Scheme tag; any change here re-keys every artifact
pub const SCHEME: &[u8] = b"salted/v1";

const TAG_VERSION: u8 = b'V';
const TAG_PARAMS: u8 = b'P';
const TAG_DEPS: u8 = b'D';

const VALUE_BOOL: u8 = b'b';
const VALUE_INT: u8 = b'i';
const VALUE_FLOAT: u8 = b'f';
const VALUE_STR: u8 = b's';

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("task `{task}`: parameter `{param}` is not a finite number")]
    NonFiniteFloat { task: String, param: String },

    #[error("task `{task}`: expected {expected} dependency hashes, got {actual}")]
    ArityMismatch {
        task: String,
        expected: usize,
        actual: usize,
    },
}

/// Encode a task's version-relevant fields plus its resolved dependency hashes
pub fn encode(
    descriptor: &TaskDescriptor,
    dependency_hashes: &[ContentHash],
) -> Result<Vec<u8>, EncodingError> {
    if dependency_hashes.len() != descriptor.dependencies.len() {
        return Err(EncodingError::ArityMismatch {
            task: descriptor.task_id.clone(),
            expected: descriptor.dependencies.len(),
            actual: dependency_hashes.len(),
        });
    }

    let mut buf = Vec::with_capacity(64 + dependency_hashes.len() * ContentHash::LEN);
    buf.extend_from_slice(SCHEME);

    buf.push(TAG_VERSION);
    put_bytes(&mut buf, descriptor.logic_version.as_bytes());

    let significant: Vec<_> = descriptor
        .parameters
        .iter()
        .filter(|p| p.significant)
        .collect();

    buf.push(TAG_PARAMS);
    put_len(&mut buf, significant.len());
    for param in significant {
        put_bytes(&mut buf, param.name.as_bytes());
        match &param.value {
            ParamValue::Bool(v) => {
                buf.push(VALUE_BOOL);
                buf.push(u8::from(*v));
            }
            ParamValue::Int(v) => {
                buf.push(VALUE_INT);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            ParamValue::Float(v) => {
                if !v.is_finite() {
                    return Err(EncodingError::NonFiniteFloat {
                        task: descriptor.task_id.clone(),
                        param: param.name.clone(),
                    });
                }
                buf.push(VALUE_FLOAT);
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            ParamValue::Str(v) => {
                buf.push(VALUE_STR);
                put_bytes(&mut buf, v.as_bytes());
            }
        }
    }

    buf.push(TAG_DEPS);
    put_len(&mut buf, dependency_hashes.len());
    for hash in dependency_hashes {
        buf.extend_from_slice(hash.as_bytes());
    }

    Ok(buf)
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_be_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_len(buf, bytes.len());
    buf.extend_from_slice(bytes);
}
