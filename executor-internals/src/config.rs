//! Process-wide, one-shot configuration.
//!
//! `DebugFlag` and the chosen [`SandboxKind`] are process-wide singletons,
//! but rather than scatter `static`s across every module that needs them,
//! they are assembled once into a [`HarnessConfig`] value in `main` and
//! threaded explicitly into the things that need them (`SandboxProfile`
//! selection, the debug-channel check in `diagnostics::debug`) rather than
//! read back out of globals throughout a run.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_FLAG: AtomicBool = AtomicBool::new(false);

/// Set once at startup; never mutated concurrently with reads afterward.
pub fn set_debug(enabled: bool) {
    DEBUG_FLAG.store(enabled, Ordering::SeqCst);
}

pub fn debug_enabled() -> bool {
    DEBUG_FLAG.load(Ordering::SeqCst)
}

/// One of three privilege-dropping preludes a sandbox process runs before
/// the test body. Exactly one is active in a given harness run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    None,
    Setuid,
    Namespace,
}

impl SandboxKind {
    /// Read once at startup from the environment, since the choice of
    /// sandbox strategy is properly a build-embedding decision rather than
    /// something a test run should be able to change on the fly.
    pub fn from_env() -> Self {
        match env::var("EXECUTOR_SANDBOX").as_deref() {
            Ok("setuid") => SandboxKind::Setuid,
            Ok("namespace") => SandboxKind::Namespace,
            Ok("none") => SandboxKind::None,
            Err(_) => SandboxKind::None,
            Ok(other) => {
                tracing::warn!(value = %other, "unrecognized EXECUTOR_SANDBOX, defaulting to none");
                SandboxKind::None
            }
        }
    }
}

/// Executor builds expose `kernel_error` and drive iterations with
/// `RepeatLoop`; standalone reproducers never call `kernel_error` and may
/// drive a single iteration with `loop()` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Executor,
    Reproducer,
}

#[derive(Debug, Clone, Copy)]
pub struct HarnessConfig {
    pub sandbox: SandboxKind,
    pub variant: Variant,
}

impl HarnessConfig {
    pub fn from_env(variant: Variant) -> Self {
        let debug = env::var("EXECUTOR_DEBUG")
            .map(|v| v == "1")
            .unwrap_or(false);
        set_debug(debug);
        HarnessConfig {
            sandbox: SandboxKind::from_env(),
            variant,
        }
    }
}
