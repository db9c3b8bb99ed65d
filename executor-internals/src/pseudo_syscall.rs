//! Pseudo-syscall dispatcher.
//!
//! `execute` resolves an opcode to either the raw kernel syscall entry or one
//! of a small set of composite helpers used to reach resources a single
//! kernel entry can't (device nodes, pty slaves, FUSE/FUSEBLK mounts). The
//! opcode space is closed and small, so it is modeled as a tagged enum with
//! a default "raw syscall" arm rather than a registry.
//!
//! No [`ExitClass`](crate::diagnostics::ExitClass) is ever raised here: every
//! error is returned to the caller as an encoded machine word, since a
//! failing test syscall is the test program's concern, not the harness's.

use nix::fcntl::OFlag;
use nix::mount::MsFlags;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::ffi::CStr;
use std::fmt::Write as _;

/// A machine word: either a non-negative success value (fd, syscall return)
/// or a negative encoded error.
pub type Word = i64;

/// The closed set of pseudo-syscall opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoOpcode {
    /// Forwards to the host's raw syscall entry. This is the default arm:
    /// any opcode value not matching one of the composite helpers below is
    /// a `Raw` syscall number.
    Raw(i64),
    SyzTest,
    SyzOpenDev,
    SyzOpenPts,
    SyzFuseMount,
    SyzFuseblkMount,
}

/// Up to nine machine-word arguments, `a0..a8`. Helpers that only need a
/// few slice them directly; `Raw` forwards only `a0..a5`, ignoring the rest.
pub fn execute(op: PseudoOpcode, a: [u64; 9]) -> Word {
    match op {
        PseudoOpcode::Raw(nr) => unsafe {
            libc::syscall(nr, a[0], a[1], a[2], a[3], a[4], a[5]) as Word
        },
        PseudoOpcode::SyzTest => 0,
        PseudoOpcode::SyzOpenDev => syz_open_dev(a[0], a[1], a[2]),
        PseudoOpcode::SyzOpenPts => syz_open_pts(a[0], a[1]),
        PseudoOpcode::SyzFuseMount => syz_fuse_mount(a[0], a[1], a[2], a[3], a[4], a[5]),
        PseudoOpcode::SyzFuseblkMount => {
            syz_fuseblk_mount(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7])
        }
    }
}

/// Copies a NUL-terminated C string from `src` into `dst`, truncating to
/// `dst.len() - 1` bytes and always leaving a terminator. `src` may be an
/// attacker-chosen pointer; a fault while reading it is the caller's
/// concern to guard, not this function's.
fn copy_c_string_bounded(src: *const u8, dst: &mut [u8]) -> usize {
    let cap = dst.len() - 1;
    let mut n = 0;
    while n < cap {
        let byte = unsafe { *src.add(n) };
        if byte == 0 {
            break;
        }
        dst[n] = byte;
        n += 1;
    }
    dst[n] = 0;
    n
}

/// Replaces every `#` in `buf[..len]`, left to right, with
/// `'0' + (a1 % 10)`, dividing `a1` by 10 after each substitution.
/// Terminates because `a1` strictly decreases towards 0 and `len` is
/// bounded, not because of a fixed iteration cap.
fn expand_hash_template(buf: &mut [u8], len: usize, mut a1: u64) {
    for b in buf[..len].iter_mut() {
        if *b == b'#' {
            *b = b'0' + (a1 % 10) as u8;
            a1 /= 10;
        }
    }
}

fn open_path(path: &CStr, flags: OFlag) -> Word {
    match nix::fcntl::open(path, flags, Mode::empty()) {
        Ok(fd) => fd as Word,
        Err(_) => -1,
    }
}

fn dev_node_path(kind: u64, minor_major_a: u64, minor_major_b: u64) -> String {
    let kind = if kind == 0x0c { "char" } else { "block" };
    format!(
        "/dev/{}/{}:{}",
        kind,
        minor_major_a % 256,
        minor_major_b % 256
    )
}

fn syz_open_dev(a0: u64, a1: u64, a2: u64) -> Word {
    if a0 == 0x0b || a0 == 0x0c {
        let path = dev_node_path(a0, a1, a2);
        let cpath = std::ffi::CString::new(path).expect("device path has no interior NUL");
        return open_path(&cpath, OFlag::O_RDWR);
    }

    let mut buf = [0u8; 1024];
    let len = copy_c_string_bounded(a0 as *const u8, &mut buf);
    expand_hash_template(&mut buf, len, a1);
    let cpath = match CStr::from_bytes_with_nul(&buf[..=len]) {
        Ok(c) => c,
        Err(_) => return -1,
    };
    open_path(cpath, OFlag::from_bits_truncate(a2 as i32))
}

fn syz_open_pts(a0: u64, a1: u64) -> Word {
    let fd = a0 as i32;
    let mut n: libc::c_uint = 0;
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGPTN, &mut n as *mut libc::c_uint) };
    if ret < 0 {
        return -1;
    }
    let path = format!("/dev/pts/{}", n);
    let cpath = std::ffi::CString::new(path).expect("pty path has no interior NUL");
    open_path(&cpath, OFlag::from_bits_truncate(a1 as i32))
}

fn fuse_opts(fd: i32, mode: u64, uid: u64, gid: u64, maxread: u64) -> String {
    let rootmode = mode & !0o3;
    let mut opts = String::new();
    let _ = write!(
        opts,
        "fd={},user_id={},group_id={},rootmode=0{:o}",
        fd, uid, gid, rootmode
    );
    if maxread != 0 {
        let _ = write!(opts, ",max_read={}", maxread);
    }
    if mode & 0b01 != 0 {
        opts.push_str(",default_permissions");
    }
    if mode & 0b10 != 0 {
        opts.push_str(",allow_other");
    }
    opts
}

fn read_path_arg(ptr: u64) -> Option<std::ffi::CString> {
    let mut buf = [0u8; 128];
    let len = copy_c_string_bounded(ptr as *const u8, &mut buf);
    CStr::from_bytes_with_nul(&buf[..=len])
        .ok()
        .map(|c| c.to_owned())
}

fn syz_fuse_mount(target: u64, mode: u64, uid: u64, gid: u64, maxread: u64, flags: u64) -> Word {
    let fd = match nix::fcntl::open("/dev/fuse", OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => return -1,
    };
    let opts = fuse_opts(fd, mode, uid, gid, maxread);
    if let Some(target) = read_path_arg(target) {
        // Mount result is deliberately ignored: even a half-mounted fuse
        // endpoint may produce useful fuzzing state.
        let _ = nix::mount::mount(
            Some(""),
            target.as_c_str(),
            Some("fuse"),
            MsFlags::from_bits_truncate(flags),
            Some(opts.as_str()),
        );
    }
    fd as Word
}

fn syz_fuseblk_mount(
    target: u64,
    blkdev: u64,
    mode: u64,
    uid: u64,
    gid: u64,
    maxread: u64,
    blksize: u64,
    flags: u64,
) -> Word {
    let fd = match nix::fcntl::open("/dev/fuse", OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => return -1,
    };

    let blkdev_path = match read_path_arg(blkdev) {
        Some(p) => p,
        None => return fd as Word,
    };
    let dev = makedev(7, 199);
    if mknod(
        blkdev_path.as_c_str(),
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o600),
        dev,
    )
    .is_err()
    {
        // mknod failed: return the fuse fd without attempting the mount.
        return fd as Word;
    }

    let mut opts = fuse_opts(fd, mode, uid, gid, maxread);
    if blksize != 0 {
        let _ = write!(opts, ",blksize={}", blksize);
    }
    if let Some(target) = read_path_arg(target) {
        let _ = nix::mount::mount(
            Some(""),
            target.as_c_str(),
            Some("fuseblk"),
            MsFlags::from_bits_truncate(flags),
            Some(opts.as_str()),
        );
    }
    fd as Word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syz_test_is_side_effect_free() {
        assert_eq!(execute(PseudoOpcode::SyzTest, [0; 9]), 0);
    }

    #[test]
    fn dev_node_path_formats_char_and_block() {
        assert_eq!(dev_node_path(0x0c, 1, 3), "/dev/char/1:3");
        assert_eq!(dev_node_path(0x0b, 300, 300), "/dev/block/44:44");
    }

    #[test]
    fn hash_template_expansion_is_deterministic() {
        // "/dev/loop#" with a1=27 -> "/dev/loop7" (27 % 10 = 7)
        let template = b"/dev/loop#\0";
        let mut buf = [0u8; 1024];
        buf[..template.len()].copy_from_slice(template);
        let len = template.len() - 1; // exclude the NUL from the substitution scan
        expand_hash_template(&mut buf, len, 27);
        assert_eq!(&buf[..len], b"/dev/loop7");
    }

    #[test]
    fn hash_template_expansion_replaces_every_hash_in_order() {
        let template = b"/dev/a#b#c#\0";
        let mut buf = [0u8; 1024];
        buf[..template.len()].copy_from_slice(template);
        let len = template.len() - 1;
        // a1 = 123 -> digits consumed low-to-high: 3, then 2, then 1
        expand_hash_template(&mut buf, len, 123);
        assert_eq!(&buf[..len], b"/dev/a3b2c1");
    }

    #[test]
    fn copy_c_string_bounded_truncates_and_terminates() {
        // A source longer than the buffer truncates and always leaves a
        // terminator, never reading past `dst`.
        let long = vec![b'#'; 4096];
        let mut dst = [0xffu8; 1024];
        let n = copy_c_string_bounded(long.as_ptr(), &mut dst);
        assert_eq!(n, 1023);
        assert_eq!(dst[1023], 0);
    }

    #[test]
    fn copy_c_string_bounded_stops_at_nul() {
        let short = b"hi\0garbage";
        let mut dst = [0xffu8; 16];
        let n = copy_c_string_bounded(short.as_ptr(), &mut dst);
        assert_eq!(n, 2);
        assert_eq!(&dst[..2], b"hi");
        assert_eq!(dst[2], 0);
    }

    #[test]
    fn fuse_opts_gates_flags_on_mode_bits() {
        let base = fuse_opts(3, 0, 1, 2, 0);
        assert!(base.contains("fd=3,user_id=1,group_id=2,rootmode=00"));
        assert!(!base.contains("default_permissions"));
        assert!(!base.contains("allow_other"));

        let both = fuse_opts(3, 0o3, 1, 2, 0);
        assert!(both.contains("default_permissions"));
        assert!(both.contains("allow_other"));
        // low two bits are masked off of rootmode even though they're reused
        // as option flags.
        assert!(both.contains("rootmode=00"));
    }

    #[test]
    fn fuse_opts_includes_maxread_when_nonzero() {
        let opts = fuse_opts(3, 0, 0, 0, 4096);
        assert!(opts.contains(",max_read=4096"));
        let opts0 = fuse_opts(3, 0, 0, 0, 0);
        assert!(!opts0.contains("max_read"));
    }

    #[test]
    fn unknown_opcode_falls_through_to_raw() {
        // There is no "unknown opcode" arm to reach in the Rust type at
        // all: any value that isn't one of the composite helpers is
        // constructed as `Raw`, so the type system enforces totality.
        let result = execute(PseudoOpcode::Raw(39 /* getpid on x86_64 */), [0; 9]);
        assert!(result >= 0);
    }
}
