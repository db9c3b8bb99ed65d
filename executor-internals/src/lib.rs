//! Sandboxed, crash-safe per-program execution harness for a kernel
//! syscall fuzzer.
//!
//! This crate implements the four coupled subsystems described at the
//! module level below; [`setup_main_process`] is the one entry point an
//! embedding binary calls before choosing a [`sandbox::SandboxProfile`] and
//! handing control to [`repeat_loop::run`].

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fault_guard;
pub mod pseudo_syscall;
pub mod repeat_loop;
pub mod sandbox;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;

pub use error::{Error, Result};

/// One-shot setup the harness main process performs before entering a
/// sandbox profile: install the startup signal policy, then create and
/// enter a private scratch directory.
///
/// Returns the scratch directory's path, mostly so tests can assert on it;
/// callers otherwise only need the side effect of having `chdir`'d into it.
pub fn setup_main_process() -> Result<PathBuf> {
    reset_glibc_cancellation_signals()?;
    let scratch = create_scratch_dir()?;
    nix::unistd::chdir(&scratch)?;
    Ok(scratch)
}

/// glibc reserves signals 0x20 and 0x21 (32, 33) for internal thread
/// cancellation; a stray delivery of either can tear down the main thread
/// if a handler isn't explicitly reset to ignore at startup.
fn reset_glibc_cancellation_signals() -> Result<()> {
    let sa = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for raw in [32, 33] {
        if let Some(signal) = Signal::try_from(raw).ok() {
            unsafe { sigaction(signal, &sa)? };
        }
    }
    Ok(())
}

/// `./syzkaller.XXXXXX`, mode 0777.
fn create_scratch_dir() -> Result<PathBuf> {
    let dir = tempfile_scratch_dir()?;
    Ok(dir)
}

fn tempfile_scratch_dir() -> Result<PathBuf> {
    use nix::sys::stat::Mode;
    let template = std::ffi::CString::new("./syzkaller.XXXXXX").expect("no interior NUL");
    let mut template_bytes = template.into_bytes_with_nul();
    let path = unsafe {
        let ptr = libc::mkdtemp(template_bytes.as_mut_ptr() as *mut libc::c_char);
        if ptr.is_null() {
            return Err(Error::from(nix::errno::Errno::last()));
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };
    nix::sys::stat::fchmodat(
        None,
        path.as_str(),
        Mode::from_bits_truncate(0o777),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )?;
    Ok(PathBuf::from(path))
}
