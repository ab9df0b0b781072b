use std::convert::Infallible;
use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr;

use spin::Once;

use crate::error::{FaultError, LoaderError};

pub const PROT_NONE: i32 = libc::PROT_NONE;
pub const PROT_READ: i32 = libc::PROT_READ;
pub const PROT_WRITE: i32 = libc::PROT_WRITE;
pub const PROT_EXEC: i32 = libc::PROT_EXEC;

/// Signature of an `SA_SIGINFO` handler.
pub type SigInfoHandler = extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void);

static PAGE_SIZE: Once<usize> = Once::new();

/// Platform page granularity. Queried once, then served from the cached value
/// so the fault handler never calls `sysconf`.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

/// Startup-only: report and abort. Loader-detected fatal conditions never
/// turn into an exit code. The message reaches stderr even when logging is
/// off.
pub fn fatal(message: impl AsRef<str>) -> ! {
    let message = message.as_ref();
    if log::log_enabled!(log::Level::Error) {
        log::error!("FATAL: {message}");
    } else {
        rt_write_stderr(format!("lazyload: FATAL: {message}\n").as_bytes());
    }
    std::process::abort()
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Maps a fresh zeroed read/write page range at exactly `addr`, replacing
/// whatever was mapped there.
pub fn rt_mmap_fixed_rw(addr: usize, len: usize) -> Result<*mut u8, FaultError> {
    let ptr = unsafe {
        libc::mmap(
            addr as *mut c_void,
            len,
            PROT_READ | PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(FaultError::MapFailure { addr, errno: errno() });
    }
    if ptr as usize != addr {
        return Err(FaultError::MapFailure { addr, errno: 0 });
    }
    Ok(ptr as *mut u8)
}

/// Anonymous read/write mapping anywhere in the address space.
pub fn rt_mmap_rw(len: usize, flags: i32) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

pub fn rt_mprotect(addr: *mut u8, len: usize, prot: i32) -> Result<(), FaultError> {
    if len == 0 {
        return Ok(());
    }

    let rc = unsafe { libc::mprotect(addr as *mut c_void, len, prot) };
    if rc != 0 {
        return Err(FaultError::ProtectFailure {
            addr: addr as usize,
            errno: errno(),
        });
    }
    Ok(())
}

/// Positioned read that fills all of `buf` or fails. Never moves the shared
/// file offset.
pub fn rt_pread_exact(fd: BorrowedFd<'_>, file_offset: u64, buf: &mut [u8]) -> Result<(), FaultError> {
    let mut done = 0usize;
    while done < buf.len() {
        let off = file_offset
            .checked_add(done as u64)
            .and_then(|off| libc::off_t::try_from(off).ok())
            .ok_or(FaultError::ReadFailure {
                offset: file_offset,
                errno: libc::EOVERFLOW,
            })?;

        let rc = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                buf[done..].as_mut_ptr() as *mut c_void,
                buf.len() - done,
                off,
            )
        };

        if rc < 0 {
            let err = errno();
            if err == libc::EINTR {
                continue;
            }
            return Err(FaultError::ReadFailure {
                offset: file_offset,
                errno: err,
            });
        }
        if rc == 0 {
            return Err(FaultError::ShortRead {
                offset: file_offset,
                wanted: buf.len(),
                got: done,
            });
        }

        done += rc as usize;
    }
    Ok(())
}

/// Fills `buf` from the kernel's CSPRNG.
pub fn rt_getrandom(buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let rc = unsafe { libc::getrandom(buf[done..].as_mut_ptr() as *mut c_void, buf.len() - done, 0) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        done += rc as usize;
    }
    Ok(())
}

/// Best-effort raw write to stderr; safe to call from a signal handler.
pub fn rt_write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let rc = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if rc < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            return;
        }
        if rc == 0 {
            return;
        }
        bytes = &bytes[rc as usize..];
    }
}

/// Registers `handler` for `signum` with `SA_SIGINFO`. `SA_NODEFER` is left
/// off, so a fault raised inside the handler itself is fatal.
pub fn rt_install_handler(signum: i32, handler: SigInfoHandler) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signum, &sa, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Puts `signum` back to `SIG_DFL`. Returning from the handler afterwards
/// re-runs the faulting instruction under the default disposition.
pub fn rt_restore_default(signum: i32) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signum, &sa, ptr::null_mut());
    }
}

/// # Safety
/// `info` must be the pointer handed to an `SA_SIGINFO` handler for a
/// memory fault signal.
pub unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    unsafe { (*info).si_addr() as usize }
}

pub const ENTER_SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

/// Switches to `sp` and jumps to `entry`. Never returns on supported targets.
///
/// # Safety
/// `sp` must point at a complete initial process stack and `entry` must be
/// the image's entry point.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter(entry: u64, sp: usize) -> Result<Infallible, LoaderError> {
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor rbp, rbp",
            "jmp {target}",
            stack = in(reg) sp,
            target = in(reg) entry,
            // No exit hook for the image's libc to register.
            in("rdx") 0u64,
            options(noreturn)
        )
    }
}

/// # Safety
/// `sp` must point at a complete initial process stack and `entry` must be
/// the image's entry point.
#[cfg(target_arch = "aarch64")]
pub unsafe fn enter(entry: u64, sp: usize) -> Result<Infallible, LoaderError> {
    unsafe {
        core::arch::asm!(
            "mov sp, {stack}",
            "mov x29, xzr",
            "br {target}",
            stack = in(reg) sp,
            target = in(reg) entry,
            in("x0") 0u64,
            options(noreturn)
        )
    }
}

/// # Safety
/// Always fails on this target.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn enter(_entry: u64, _sp: usize) -> Result<Infallible, LoaderError> {
    Err(LoaderError::UnsupportedArch(std::env::consts::ARCH))
}
