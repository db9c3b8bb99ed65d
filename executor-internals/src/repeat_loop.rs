//! Per-iteration fork / timeout-bounded wait / working-directory
//! reclamation.
//!
//! `run` never returns: it drives iterations `0, 1, 2, …` forever, each in
//! its own forked child, until something outside this component (the
//! parent's PDEATHSIG, an iteration's own `fail`/`retry`) ends the process.

use crate::diagnostics;
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

const ITERATION_TIMEOUT: Duration = Duration::from_millis(5000);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Magic; no documented rationale for exactly 100. Kept as a named
/// constant rather than re-derived, and reused for both the unlink-busy and
/// rmdir-busy retry loops below.
const REMOVE_DIR_RETRY_CAP: usize = 100;

/// Bookkeeping for one in-flight iteration.
struct IterationContext {
    #[allow(dead_code)]
    iter: u64,
    cwd_path: String,
    child_pid: Pid,
    start: Instant,
}

/// Drives iterations forever. `test_body` is invoked once per iteration,
/// inside a freshly forked and `chdir`'d iteration child; it is expected to
/// call [`crate::pseudo_syscall::execute`] repeatedly.
pub fn run(test_body: impl Fn()) -> ! {
    let mut iter: u64 = 0;
    loop {
        run_iteration(iter, &test_body);
        iter += 1;
    }
}

fn run_iteration(iter: u64, test_body: &impl Fn()) {
    let cwd_path = format!("./{}", iter);
    if let Err(e) = nix::unistd::mkdir(cwd_path.as_str(), Mode::from_bits_truncate(0o777)) {
        diagnostics::fail(&format!("mkdir {} failed: {}", cwd_path, e));
    }

    let start = Instant::now();
    let child_pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => run_iteration_child(&cwd_path, test_body),
        Err(e) => diagnostics::fail(&format!("fork failed: {}", e)),
    };

    let ctx = IterationContext {
        iter,
        cwd_path,
        child_pid,
        start,
    };
    reap_with_timeout(&ctx);
    remove_dir(&ctx.cwd_path);
}

fn run_iteration_child(cwd_path: &str, test_body: &impl Fn()) -> ! {
    let ret =
        unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        diagnostics::fail(&format!(
            "prctl(PR_SET_PDEATHSIG) failed: {}",
            nix::errno::Errno::last()
        ));
    }
    if let Err(e) = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        diagnostics::fail(&format!("setpgrp failed: {}", e));
    }
    if let Err(e) = nix::unistd::chdir(cwd_path) {
        diagnostics::fail(&format!("chdir {} failed: {}", cwd_path, e));
    }
    test_body();
    std::process::exit(0);
}

fn reap_with_timeout(ctx: &IterationContext) {
    loop {
        match waitpid(ctx.child_pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => {
                if ctx.start.elapsed() >= ITERATION_TIMEOUT {
                    kill_iteration(ctx.child_pid);
                    let _ = waitpid(ctx.child_pid, None);
                    return;
                }
                sleep(POLL_INTERVAL);
            }
            Ok(_) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => diagnostics::fail(&format!("waitpid failed: {}", e)),
        }
    }
}

fn kill_iteration(child_pid: Pid) {
    // The child called setpgrp(), so its process group id equals its pid.
    let pgid = Pid::from_raw(-child_pid.as_raw());
    let _ = kill(pgid, Signal::SIGKILL);
    let _ = kill(child_pid, Signal::SIGKILL);
}

enum RmdirOutcome {
    Removed,
    NotEmpty,
}

fn remove_dir(path: &str) {
    if let Err(e) = remove_dir_recursive(Path::new(path)) {
        diagnostics::retry(&format!("remove_dir {} failed: {}", path, e));
    }
}

fn remove_dir_recursive(path: &Path) -> io::Result<()> {
    for _ in 0..REMOVE_DIR_RETRY_CAP {
        match try_empty_and_remove(path)? {
            RmdirOutcome::Removed => return Ok(()),
            RmdirOutcome::NotEmpty => continue,
        }
    }
    Err(io::Error::other(format!(
        "{}: exceeded {} whole-directory retries",
        path.display(),
        REMOVE_DIR_RETRY_CAP
    )))
}

fn try_empty_and_remove(path: &Path) -> io::Result<RmdirOutcome> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e)
            if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) =>
        {
            return Err(io::Error::other("too many open files"));
        }
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let child_path = entry.path();
        let meta = std::fs::symlink_metadata(&child_path)?;
        if meta.is_dir() {
            remove_dir_recursive(&child_path)?;
        } else {
            unlink_with_retries(&child_path)?;
        }
    }

    rmdir_with_retries(path)
}

fn unlink_with_retries(path: &Path) -> io::Result<()> {
    for _ in 0..REMOVE_DIR_RETRY_CAP {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                let _ = umount2(path, MntFlags::MNT_DETACH);
                continue;
            }
            Err(e) if e.raw_os_error() == Some(libc::EROFS) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other(format!(
        "{}: remained busy after {} unlink retries",
        path.display(),
        REMOVE_DIR_RETRY_CAP
    )))
}

fn rmdir_with_retries(path: &Path) -> io::Result<RmdirOutcome> {
    for _ in 0..REMOVE_DIR_RETRY_CAP {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(RmdirOutcome::Removed),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                let _ = umount2(path, MntFlags::MNT_DETACH);
                continue;
            }
            Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
                return Err(io::Error::other(format!(
                    "{}: read-only filesystem",
                    path.display()
                )))
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                return Ok(RmdirOutcome::NotEmpty)
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other(format!(
        "{}: remained busy after {} rmdir retries",
        path.display(),
        REMOVE_DIR_RETRY_CAP
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn in_scratch_dir<F: FnOnce()>(body: F) {
        let tmp = tempfile::tempdir().expect("tempdir succeeds");
        let previous = std::env::current_dir().expect("getcwd succeeds");
        std::env::set_current_dir(tmp.path()).expect("chdir succeeds");
        body();
        std::env::set_current_dir(previous).expect("restoring cwd succeeds");
    }

    #[test]
    fn remove_dir_empty_succeeds_in_one_pass() {
        in_scratch_dir(|| {
            fs::create_dir("target").unwrap();
            let outcome = try_empty_and_remove(Path::new("target"));
            assert!(matches!(outcome, Ok(RmdirOutcome::Removed)));
            assert!(!Path::new("target").exists());
        });
    }

    #[test]
    fn remove_dir_with_only_regular_files_succeeds() {
        // No mount points involved, so this never takes the EBUSY/umount
        // path.
        in_scratch_dir(|| {
            fs::create_dir("target").unwrap();
            fs::write("target/a", b"x").unwrap();
            fs::write("target/b", b"y").unwrap();
            remove_dir_recursive(Path::new("target")).expect("removal succeeds");
            assert!(!Path::new("target").exists());
        });
    }

    #[test]
    fn remove_dir_recurses_into_subdirectories() {
        in_scratch_dir(|| {
            fs::create_dir_all("target/nested/deeper").unwrap();
            fs::write("target/nested/deeper/leaf", b"x").unwrap();
            remove_dir_recursive(Path::new("target")).expect("removal succeeds");
            assert!(!Path::new("target").exists());
        });
    }
}
