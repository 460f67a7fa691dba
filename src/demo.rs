//! Built-in tasks hosted by the `forkpool` binary.
//!
//! They exist so the pool can be exercised end to end without writing a
//! host program: the CLI runs them and the integration tests use the
//! binary as the child runtime.

use crate::failure::ErrorRegistry;
use crate::task::TaskRegistry;
use serde_json::Value;
use std::convert::Infallible;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

/// Error returned by the `fail` task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DemoError(pub String);

/// Registry with every demo task.
///
/// | name           | args            | behavior                              |
/// |----------------|-----------------|---------------------------------------|
/// | `constant`     | none            | returns `2`                           |
/// | `sum`          | `[i64]`         | returns the sum                       |
/// | `sleep_ms`     | `u64`           | sleeps, returns the duration          |
/// | `fail`         | `String`        | fails with [`DemoError`]              |
/// | `panic`        | `String`        | panics with the message               |
/// | `write_stderr` | `String`        | writes the text to stderr, returns it |
/// | `noisy`        | `String`        | prints the text to stdout, returns 2  |
/// | `bytes`        | `usize`         | returns a string of that many bytes   |
/// | `echo`         | any JSON        | returns its arguments                 |
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("constant", |_: Value| Ok::<_, Infallible>(2))
        .register("sum", |numbers: Vec<i64>| {
            Ok::<_, Infallible>(numbers.iter().sum::<i64>())
        })
        .register("sleep_ms", |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok::<_, Infallible>(ms)
        })
        .register("fail", |message: String| Err::<Value, _>(DemoError(message)))
        .register("panic", |message: String| -> Result<Value, Infallible> {
            panic!("{}", message)
        })
        .register("write_stderr", |text: String| -> std::io::Result<String> {
            let mut stderr = std::io::stderr().lock();
            stderr.write_all(text.as_bytes())?;
            stderr.flush()?;
            Ok(text)
        })
        .register("noisy", |text: String| {
            println!("{}", text);
            Ok::<_, Infallible>(2)
        })
        .register("bytes", |len: usize| Ok::<_, Infallible>("x".repeat(len)))
        .register("echo", |args: Value| Ok::<_, Infallible>(args));
    registry
}

/// Error registry able to rebuild [`DemoError`].
pub fn error_registry() -> ErrorRegistry {
    let mut errors = ErrorRegistry::new();
    errors.register(|message: &str| Some(DemoError(message.to_string())));
    errors
}
