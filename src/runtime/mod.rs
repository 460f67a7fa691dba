//! Child runtime: the code that runs inside a spawned child process.
//!
//! A host binary calls [`run_child_if_requested`] first thing in `main`.
//! When the process was started by a pool, the call runs the requested
//! task and exits; otherwise it returns and the binary continues normally.
//!
//! ```no_run
//! use forkpool::{TaskRegistry, runtime};
//!
//! fn main() {
//!     let mut registry = TaskRegistry::new();
//!     registry.register("double", |n: i64| Ok::<_, std::convert::Infallible>(n * 2));
//!     runtime::run_child_if_requested(&registry);
//!
//!     // regular program
//! }
//! ```

mod child;
pub mod protocol;

pub use child::{ChildArgs, ChildRuntime, EXIT_FAILURE, EXIT_STARTUP_ERROR, EXIT_SUCCESS};
pub(crate) use child::panic_record;

use crate::task::TaskRegistry;
use std::ffi::OsString;

/// First argument that selects child-runtime mode.
pub const CHILD_RUNTIME_FLAG: &str = "--forkpool-child";

/// Whether `args` (as returned by `std::env::args_os`) request child mode.
pub fn is_child_invocation(args: &[OsString]) -> bool {
    args.get(1).is_some_and(|arg| arg == CHILD_RUNTIME_FLAG)
}

/// Run the child runtime and exit if this process is a pool child.
pub fn run_child_if_requested(registry: &TaskRegistry) {
    let args: Vec<OsString> = std::env::args_os().collect();
    if !is_child_invocation(&args) {
        return;
    }

    // Ignore SIGPIPE - a vanished parent surfaces as a write error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let code = ChildRuntime::new(registry).run(&args[2..]);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_invocation_detection() {
        let child: Vec<OsString> = ["forkpool", CHILD_RUNTIME_FLAG, "/tmp", "tok", "10"]
            .iter()
            .map(OsString::from)
            .collect();
        assert!(is_child_invocation(&child));

        let normal: Vec<OsString> = ["forkpool", "run", CHILD_RUNTIME_FLAG]
            .iter()
            .map(OsString::from)
            .collect();
        assert!(!is_child_invocation(&normal));
        assert!(!is_child_invocation(&[]));
    }
}
