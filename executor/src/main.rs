//! Entry point for both the `executor` and `syz-repro` binaries.
//!
//! The two targets share this file; they differ only in whether the
//! `executor` feature is enabled (see `Cargo.toml`), which selects the
//! [`Variant`] and therefore whether the sandbox process drives
//! [`executor_internals::repeat_loop::run`] forever or invokes the test
//! body exactly once, standalone-reproducer style.

use executor_internals::config::{HarnessConfig, Variant};
use executor_internals::pseudo_syscall::{execute, PseudoOpcode};
use executor_internals::sandbox::SandboxProfile;
use nix::sys::wait::{waitpid, WaitStatus};
use tracing_subscriber::EnvFilter;

/// The down-call contract the generator provides: `test()` is
/// invoked once per iteration and is expected to call `execute_syscall`
/// (here, [`execute`]) repeatedly. The generator itself is an external
/// collaborator out of scope for this crate; this binary embeds a
/// placeholder that only exercises the side-effect-free probe opcode.
trait TestProgram {
    fn test(&self);
}

struct PlaceholderProgram;

impl TestProgram for PlaceholderProgram {
    fn test(&self) {
        let _ = execute(PseudoOpcode::SyzTest, [0; 9]);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
}

fn variant() -> Variant {
    if cfg!(feature = "executor") {
        Variant::Executor
    } else {
        Variant::Reproducer
    }
}

fn main() {
    init_tracing();

    let variant = variant();
    let config = HarnessConfig::from_env(variant);

    if let Err(e) = executor_internals::setup_main_process() {
        executor_internals::diagnostics::fail(&format!("main process setup failed: {}", e));
    }

    let profile = SandboxProfile::from_kind(config.sandbox);
    let program = PlaceholderProgram;

    let run_loop: Box<dyn FnOnce() -> !> = match variant {
        Variant::Executor => {
            Box::new(move || executor_internals::repeat_loop::run(move || program.test()))
        }
        Variant::Reproducer => Box::new(move || {
            program.test();
            std::process::exit(0)
        }),
    };

    // The harness main process never itself terminates with an exit class:
    // it waits on the sandbox process and mirrors its terminal status so
    // the parent supervisor sees exactly one exit code per run.
    match profile.enter(run_loop) {
        Ok(child_pid) => match waitpid(child_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => std::process::exit(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => std::process::exit(signal as i32),
            Ok(_) | Err(_) => std::process::exit(0),
        },
        Err(e) => executor_internals::diagnostics::fail(&format!("sandbox setup failed: {}", e)),
    }
}
