//! Task encoding for transport on the child's command line.
//!
//! A task is encoded as base64 of a JSON [`TaskEnvelope`]. Tokens longer
//! than the inline threshold are spilled to a [`BlobStore`] and replaced by
//! a small envelope that references the stored payload.

use super::Task;
use super::blob::{BlobStore, TempFileStore};
use crate::error::{ForkpoolError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default inline threshold for encoded tasks (bytes).
pub const DEFAULT_MAX_INLINE_BYTES: usize = 100_000;

/// Transport envelope of an encoded task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEnvelope {
    /// The task travels inline.
    Inline { task: Task },
    /// The inline token was spilled to the blob store at `path`.
    Spilled { path: PathBuf },
}

impl TaskEnvelope {
    /// Path of the stored payload if `token` is a spilled envelope.
    ///
    /// Does not touch the blob store.
    pub fn spilled_path(token: &str) -> Option<PathBuf> {
        match parse_envelope(token).ok()? {
            TaskEnvelope::Spilled { path } => Some(path),
            TaskEnvelope::Inline { .. } => None,
        }
    }
}

/// Encodes tasks to tokens and back.
#[derive(Debug, Clone)]
pub struct TaskEncoder<S = TempFileStore> {
    store: S,
    max_inline_bytes: usize,
}

impl TaskEncoder<TempFileStore> {
    pub fn new(max_inline_bytes: usize) -> Self {
        Self::with_store(TempFileStore::new(), max_inline_bytes)
    }
}

impl Default for TaskEncoder<TempFileStore> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INLINE_BYTES)
    }
}

impl<S: BlobStore> TaskEncoder<S> {
    pub fn with_store(store: S, max_inline_bytes: usize) -> Self {
        Self {
            store,
            max_inline_bytes,
        }
    }

    pub fn max_inline_bytes(&self) -> usize {
        self.max_inline_bytes
    }

    /// Encode a task, spilling it if the token exceeds the inline threshold.
    pub fn encode(&self, task: &Task) -> Result<String> {
        let token = envelope_token(&TaskEnvelope::Inline { task: task.clone() })?;
        if token.len() <= self.max_inline_bytes {
            return Ok(token);
        }

        tracing::debug!(
            task = %task.name,
            token_bytes = token.len(),
            max_inline_bytes = self.max_inline_bytes,
            "Task payload exceeds inline threshold, spilling"
        );
        let path = self.store.put(token.as_bytes())?;
        envelope_token(&TaskEnvelope::Spilled { path })
    }

    /// Decode a token produced by [`encode`](Self::encode).
    ///
    /// Decoding a spilled token consumes the stored payload.
    pub fn decode(&self, token: &str) -> Result<Task> {
        match parse_envelope(token)? {
            TaskEnvelope::Inline { task } => Ok(task),
            TaskEnvelope::Spilled { path } => {
                let bytes = self.store.take(&path)?;
                let inner = String::from_utf8(bytes).map_err(|_| {
                    ForkpoolError::InvalidPayload(format!(
                        "spilled payload at {} is not UTF-8",
                        path.display()
                    ))
                })?;
                match parse_envelope(&inner)? {
                    TaskEnvelope::Inline { task } => Ok(task),
                    TaskEnvelope::Spilled { .. } => Err(ForkpoolError::InvalidPayload(
                        "spilled payload references another spilled payload".into(),
                    )),
                }
            }
        }
    }
}

fn envelope_token(envelope: &TaskEnvelope) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(envelope)?))
}

fn parse_envelope(token: &str) -> Result<TaskEnvelope> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ForkpoolError::InvalidPayload("empty task token".into()));
    }
    let bytes = STANDARD
        .decode(token)
        .map_err(|e| ForkpoolError::InvalidPayload(format!("task token is not base64: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn arb_args() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 _\\-]{0,40}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|map| json!(map)),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            name in "[a-z_]{1,16}",
            args in arb_args(),
            max_inline in 1usize..4096,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let encoder = TaskEncoder::with_store(TempFileStore::in_dir(dir.path()), max_inline);
            let task = Task { name, args };

            let token = encoder.encode(&task).unwrap();
            prop_assert_eq!(encoder.decode(&token).unwrap(), task);
        }
    }
}
