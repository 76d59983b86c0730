// # Runtime Platform Detection
//
// Picks the I/O backend at startup: the high-performance primitive when the
// OS version supports it (RIO on Windows 8+, io_uring on kernel 5.1+), the
// stable baseline otherwise.

// ============================================================================
// Platform Kind
// ============================================================================

/// Backend implementations, not OS names. On Windows the baseline is IOCP and
/// the fast path RIO; on Linux epoll and io_uring; macOS is always kqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    Iocp,
    Rio,
    Epoll,
    IoUring,
    Kqueue,
}

impl PlatformKind {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformKind::Iocp => "iocp",
            PlatformKind::Rio => "rio",
            PlatformKind::Epoll => "epoll",
            PlatformKind::IoUring => "io_uring",
            PlatformKind::Kqueue => "kqueue",
        }
    }

    /// Parse a forcing hint. Accepts the canonical names plus `uring`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "iocp" => Some(PlatformKind::Iocp),
            "rio" => Some(PlatformKind::Rio),
            "epoll" => Some(PlatformKind::Epoll),
            "io_uring" | "iouring" | "uring" => Some(PlatformKind::IoUring),
            "kqueue" => Some(PlatformKind::Kqueue),
            _ => None,
        }
    }
}

// ============================================================================
// Platform Info
// ============================================================================

/// Host capability report produced by `detect_platform`.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    /// Human-readable OS name.
    pub name: &'static str,

    /// OS major version (kernel major on unix).
    pub major: u32,

    /// OS minor version (kernel minor on unix).
    pub minor: u32,

    pub supports_rio: bool,
    pub supports_io_uring: bool,
    pub supports_kqueue: bool,
}

impl PlatformInfo {
    /// Highest-performance backend this host can run.
    pub fn preferred(&self) -> PlatformKind {
        #[cfg(windows)]
        {
            if self.supports_rio {
                return PlatformKind::Rio;
            }
            return PlatformKind::Iocp;
        }

        #[cfg(target_os = "linux")]
        {
            if self.supports_io_uring {
                return PlatformKind::IoUring;
            }
            return PlatformKind::Epoll;
        }

        #[cfg(target_os = "macos")]
        {
            return PlatformKind::Kqueue;
        }

        #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
        {
            PlatformKind::Epoll
        }
    }

    /// Whether this host can run the given backend at all.
    pub fn supports(&self, kind: PlatformKind) -> bool {
        match kind {
            PlatformKind::Iocp => cfg!(windows),
            PlatformKind::Rio => cfg!(windows) && self.supports_rio,
            PlatformKind::Epoll => cfg!(target_os = "linux"),
            PlatformKind::IoUring => cfg!(target_os = "linux") && self.supports_io_uring,
            PlatformKind::Kqueue => self.supports_kqueue,
        }
    }
}

// ============================================================================
// Detection
// ============================================================================

static HOST_PLATFORM: once_cell::sync::OnceCell<PlatformInfo> = once_cell::sync::OnceCell::new();

/// Inspect the running host. Detection probes the kernel (a throwaway ring
/// on Linux), so the result is computed once and cached for the process.
pub fn detect_platform() -> PlatformInfo {
    HOST_PLATFORM.get_or_init(imp::detect).clone()
}

#[cfg(target_os = "linux")]
mod imp {
    use super::PlatformInfo;

    pub fn detect() -> PlatformInfo {
        let (major, minor) = kernel_version().unwrap_or((0, 0));

        // Kernel 5.1 introduced the socket opcodes the uring backend needs.
        // A version gate alone is not enough: seccomp or RLIMIT_MEMLOCK can
        // still deny ring setup, so probe with a tiny ring.
        let version_ok = (major, minor) >= (5, 1);
        let supports_io_uring = version_ok && io_uring::IoUring::new(8).is_ok();

        PlatformInfo {
            name: "linux",
            major,
            minor,
            supports_rio: false,
            supports_io_uring,
            supports_kqueue: false,
        }
    }

    fn kernel_version() -> Option<(u32, u32)> {
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return None;
        }

        let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
        parse_release(release.to_str().ok()?)
    }

    fn parse_release(release: &str) -> Option<(u32, u32)> {
        let mut parts = release.split(['.', '-']);
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_release() {
            assert_eq!(parse_release("5.15.0-91-generic"), Some((5, 15)));
            assert_eq!(parse_release("6.2.1"), Some((6, 2)));
            assert_eq!(parse_release("4.19.0"), Some((4, 19)));
            assert_eq!(parse_release("garbage"), None);
        }
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::PlatformInfo;

    pub fn detect() -> PlatformInfo {
        let (major, minor) = darwin_version().unwrap_or((0, 0));

        PlatformInfo {
            name: "macos",
            major,
            minor,
            supports_rio: false,
            supports_io_uring: false,
            supports_kqueue: true,
        }
    }

    fn darwin_version() -> Option<(u32, u32)> {
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return None;
        }

        let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
        let release = release.to_str().ok()?;
        let mut parts = release.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    }
}

#[cfg(windows)]
mod imp {
    use super::PlatformInfo;
    use windows_sys::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOW};

    pub fn detect() -> PlatformInfo {
        let mut info: OSVERSIONINFOW = unsafe { std::mem::zeroed() };
        info.dwOSVersionInfoSize = std::mem::size_of::<OSVERSIONINFOW>() as u32;

        let (major, minor) = if unsafe { GetVersionExW(&mut info) } != 0 {
            (info.dwMajorVersion, info.dwMinorVersion)
        } else {
            (0, 0)
        };

        // RIO ships with Windows 8 / Server 2012 (NT 6.2).
        let supports_rio = major > 6 || (major == 6 && minor >= 2);

        PlatformInfo {
            name: "windows",
            major,
            minor,
            supports_rio,
            supports_io_uring: false,
            supports_kqueue: false,
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod imp {
    use super::PlatformInfo;

    pub fn detect() -> PlatformInfo {
        PlatformInfo {
            name: "unsupported",
            major: 0,
            minor: 0,
            supports_rio: false,
            supports_io_uring: false,
            supports_kqueue: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hint_names() {
        assert_eq!(PlatformKind::parse("IOCP"), Some(PlatformKind::Iocp));
        assert_eq!(PlatformKind::parse("rio"), Some(PlatformKind::Rio));
        assert_eq!(PlatformKind::parse("epoll"), Some(PlatformKind::Epoll));
        assert_eq!(PlatformKind::parse("io_uring"), Some(PlatformKind::IoUring));
        assert_eq!(PlatformKind::parse("uring"), Some(PlatformKind::IoUring));
        assert_eq!(PlatformKind::parse("kqueue"), Some(PlatformKind::Kqueue));
        assert_eq!(PlatformKind::parse("dpdk"), None);
    }

    #[test]
    fn test_detect_reports_a_usable_backend() {
        let info = detect_platform();
        let preferred = info.preferred();
        assert!(info.supports(preferred));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_never_reports_windows_backends() {
        let info = detect_platform();
        assert!(!info.supports(PlatformKind::Iocp));
        assert!(!info.supports(PlatformKind::Rio));
        assert!(!info.supports(PlatformKind::Kqueue));
        assert!(info.supports(PlatformKind::Epoll));
    }
}
