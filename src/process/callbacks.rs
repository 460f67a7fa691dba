//! Success, error and timeout callbacks attached to a runnable.

use crate::failure::ParallelFailure;
use serde_json::Value;
use std::error::Error as StdError;

type SuccessCallback = Box<dyn FnMut(&Value)>;
/// Returns whether the callback accepted the failure.
type ErrorCallback = Box<dyn FnMut(&ParallelFailure) -> bool>;
type TimeoutCallback = Box<dyn FnMut()>;

/// Callback lists of one runnable, each fired in registration order.
#[derive(Default)]
pub struct ProcessCallbacks {
    success: Vec<SuccessCallback>,
    error: Vec<ErrorCallback>,
    timeout: Vec<TimeoutCallback>,
}

impl ProcessCallbacks {
    pub fn on_success(&mut self, callback: impl FnMut(&Value) + 'static) {
        self.success.push(Box::new(callback));
    }

    /// Register a callback receiving every failure.
    pub fn on_error(&mut self, mut callback: impl FnMut(&ParallelFailure) + 'static) {
        self.error.push(Box::new(move |failure| {
            callback(failure);
            true
        }));
    }

    /// Register a callback that only receives task errors of type `E`.
    pub fn on_typed_error<E>(&mut self, mut callback: impl FnMut(&E) + 'static)
    where
        E: StdError + 'static,
    {
        self.error.push(Box::new(move |failure| {
            match failure.downcast_ref::<E>() {
                Some(err) => {
                    callback(err);
                    true
                }
                None => false,
            }
        }));
    }

    pub fn on_timeout(&mut self, callback: impl FnMut() + 'static) {
        self.timeout.push(Box::new(callback));
    }

    pub fn fire_success(&mut self, output: &Value) {
        for callback in &mut self.success {
            callback(output);
        }
    }

    /// Offer the failure to every error callback.
    ///
    /// Returns `true` if at least one callback accepted it.
    pub fn fire_error(&mut self, failure: &ParallelFailure) -> bool {
        let mut handled = false;
        for callback in &mut self.error {
            handled |= callback(failure);
        }
        handled
    }

    pub fn fire_timeout(&mut self) {
        for callback in &mut self.timeout {
            callback();
        }
    }
}

impl std::fmt::Debug for ProcessCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCallbacks")
            .field("success", &self.success.len())
            .field("error", &self.error.len())
            .field("timeout", &self.timeout.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ErrorRegistry;
    use crate::runtime::protocol::SerializedError;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("locked: {0}")]
    struct Locked(String);

    #[derive(Debug, Error)]
    #[error("other")]
    struct Other;

    #[test]
    fn test_success_callbacks_fire_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = ProcessCallbacks::default();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            callbacks.on_success(move |value| seen.borrow_mut().push(format!("{tag}:{value}")));
        }

        callbacks.fire_success(&json!(2));
        assert_eq!(*seen.borrow(), vec!["first:2", "second:2"]);
    }

    #[test]
    fn test_typed_error_callbacks_filter_by_type() {
        let mut registry = ErrorRegistry::new();
        registry.register(|msg: &str| Some(Locked(msg.to_string())));
        let failure = registry.reconstruct(SerializedError::new(
            std::any::type_name::<Locked>(),
            "row 7",
            "",
        ));

        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = ProcessCallbacks::default();
        {
            let hits = hits.clone();
            callbacks.on_typed_error(move |err: &Locked| hits.borrow_mut().push(err.0.clone()));
        }
        {
            let hits = hits.clone();
            callbacks.on_typed_error(move |_: &Other| hits.borrow_mut().push("other".into()));
        }

        assert!(callbacks.fire_error(&failure));
        assert_eq!(*hits.borrow(), vec!["row 7"]);
    }

    #[test]
    fn test_unmatched_failure_is_not_handled() {
        let mut callbacks = ProcessCallbacks::default();
        callbacks.on_typed_error(|_: &Other| {});
        assert!(!callbacks.fire_error(&ParallelFailure::Parallel("crash".into())));

        callbacks.on_error(|_| {});
        assert!(callbacks.fire_error(&ParallelFailure::Parallel("crash".into())));
    }

    #[test]
    fn test_timeout_callbacks_fire() {
        let count = Rc::new(RefCell::new(0));
        let mut callbacks = ProcessCallbacks::default();
        let c = count.clone();
        callbacks.on_timeout(move || *c.borrow_mut() += 1);
        callbacks.fire_timeout();
        assert_eq!(*count.borrow(), 1);
    }
}
