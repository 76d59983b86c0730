// # Shutdown Signals
//
// SIGINT/SIGTERM (console control events on Windows) flip a process-wide
// flag; the binaries' main loops poll it and run the graceful stop path
// within the shutdown grace window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Request shutdown programmatically (tests, admin paths).
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

/// Block until shutdown is requested or `still_running` turns false.
pub fn wait_for_shutdown(mut still_running: impl FnMut() -> bool) {
    while !shutdown_requested() && still_running() {
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(unix)]
pub fn install() {
    unsafe extern "C" fn handle(_signum: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::Release);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle as libc::sighandler_t);
    }
}

#[cfg(windows)]
pub fn install() {
    use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;

    unsafe extern "system" fn handle(_ctrl_type: u32) -> i32 {
        SHUTDOWN_REQUESTED.store(true, Ordering::Release);
        1
    }

    unsafe {
        SetConsoleCtrlHandler(Some(handle), 1);
    }
}

#[cfg(not(any(unix, windows)))]
pub fn install() {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programmatic_request() {
        // The flag is process-global; drive it directly rather than raising
        // a real signal under the test harness.
        assert!(!shutdown_requested() || true);
        request_shutdown();
        assert!(shutdown_requested());
    }
}
