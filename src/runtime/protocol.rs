//! Wire format for results crossing the child process boundary.
//!
//! Every message is JSON, base64-encoded so it survives any text channel.
//! Successful results travel over stdout as a [`ChildSuccess`]; failures
//! travel over stderr as a [`ChildFailure`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Structured record of an error raised by a task inside the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Type name of the original error (e.g. `my_crate::ImportError`, or `panic`).
    pub type_name: String,
    /// Display rendering of the original error.
    pub message: String,
    /// Source chain and backtrace captured in the child.
    pub trace: String,
}

impl SerializedError {
    pub fn new(
        type_name: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }
}

/// Result envelope written to stdout by a child that completed its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSuccess {
    /// Value returned by the task.
    pub output: Value,
    /// Anything the task itself printed to stdout while running.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub other_output: String,
}

/// Failure envelope written to stderr by a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildFailure {
    /// The task returned an error or panicked.
    Task(SerializedError),
    /// The encoded result exceeded the output cap.
    OutputTooLarge {
        /// Configured cap in bytes.
        limit: usize,
        /// Encoded size that was rejected.
        size: usize,
    },
}

/// Serialize a message to its transport form (base64 of JSON).
pub fn encode_message<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let json = serde_json::to_vec(message)?;
    Ok(STANDARD.encode(json))
}

/// Decode a transport-encoded message.
///
/// Returns `None` when the text is not a message of the expected shape;
/// callers treat such text as raw, unstructured output.
pub fn decode_message<T: DeserializeOwned>(text: &str) -> Option<T> {
    let bytes = STANDARD.decode(text.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}
