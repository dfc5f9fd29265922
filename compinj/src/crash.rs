//! Last-resort handler for fatal signals raised inside an engine.
//!
//! Bundled engines report corrupt streams as errors, but a foreign engine
//! driven through [`crate::engine::Compressor`] may still fault on a flipped
//! bit. [`install`] catches `SIGSEGV` and `SIGBUS`, prints the signal and a
//! best-effort backtrace, runs the registered cleanup callbacks and exits with
//! the signal number as the process status.
//!
//! Nothing is freed on this path. `_exit` returns the original and
//! reconstructed tensors to the operating system with the rest of the process,
//! so cleanups are only for flushing output such as a diagnostic line or a
//! partially written file.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the cleanup table.
pub const MAX_CLEANUPS: usize = 16;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicUsize = AtomicUsize::new(0);

// fn pointers stored as addresses; 0 marks an unused slot
static CLEANUPS: [AtomicUsize; MAX_CLEANUPS] = [EMPTY; MAX_CLEANUPS];
static REGISTERED: AtomicUsize = AtomicUsize::new(0);

/// Registers `f` to run when a fatal signal arrives. Returns `false` if the
/// table is full.
///
/// Callbacks run inside a signal handler, so they should restrict themselves
/// to async-signal-safe work such as flushing a raw file descriptor.
pub fn register_cleanup(f: fn()) -> bool {
    let slot = REGISTERED.fetch_add(1, Ordering::AcqRel);
    if slot >= MAX_CLEANUPS {
        REGISTERED.fetch_sub(1, Ordering::AcqRel);
        return false;
    }
    CLEANUPS[slot].store(f as usize, Ordering::Release);
    true
}

fn run_cleanups() {
    let registered = REGISTERED.load(Ordering::Acquire).min(MAX_CLEANUPS);
    for slot in &CLEANUPS[..registered] {
        let addr = slot.load(Ordering::Acquire);
        if addr != 0 {
            // SAFETY: non-zero slots only ever hold addresses of `fn()` items
            let f: fn() = unsafe { std::mem::transmute::<usize, fn()>(addr) };
            f();
        }
    }
}

#[cfg(unix)]
pub fn install() -> std::io::Result<()> {
    for sig in [libc::SIGSEGV, libc::SIGBUS] {
        // SAFETY: the sigaction struct is fully initialised before use and
        // `handler` has the signature the kernel expects
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    tracing::debug!("installed fatal signal handler");
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
extern "C" fn handler(sig: libc::c_int) {
    let mut line = [b' '; 24];
    line[..14].copy_from_slice(b"Receiving Sig ");
    let len = 14 + format_decimal(sig as u32, &mut line[14..22]);
    line[len] = b':';
    line[len + 1] = b'\n';
    write_stderr(&line[..len + 2]);

    // not async-signal-safe; the process is going down either way
    eprintln!("{}", std::backtrace::Backtrace::force_capture());

    run_cleanups();
    // SAFETY: _exit never returns and skips atexit handlers
    unsafe { libc::_exit(sig) }
}

/// Unbuffered write to stderr, usable from cleanup callbacks.
#[cfg(unix)]
pub fn write_stderr(bytes: &[u8]) {
    // SAFETY: write(2) on stderr with a valid buffer
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

#[cfg(not(unix))]
pub fn write_stderr(bytes: &[u8]) {
    use std::io::Write;
    let _ = std::io::stderr().write_all(bytes);
}

/// Writes `n` in decimal at the start of `out`, returning the digit count.
#[cfg_attr(not(unix), allow(dead_code))]
fn format_decimal(mut n: u32, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 10];
    let mut len = 0;
    loop {
        digits[len] = b'0' + (n % 10) as u8;
        len += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for (dst, src) in out.iter_mut().zip(digits[..len].iter().rev()) {
        *dst = *src;
    }
    len.min(out.len())
}
