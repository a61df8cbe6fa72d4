//! Compile-time selection of the kernel diagnostics provider
//!
//! | target_os       | provider              | tcp_info | congestion | pacing |
//! |-----------------|-----------------------|----------|------------|--------|
//! | linux           | `LinuxDiagnostics`    | yes      | yes        | yes    |
//! | freebsd         | `FreeBsdDiagnostics`  | yes      | yes        | yes    |
//! | macos / ios     | `DarwinDiagnostics`   | yes      | no         | no     |
//! | anything else   | `UnsupportedDiagnostics` | no    | no         | no     |

#[cfg(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "macos",
    target_os = "ios"
))]
use std::os::fd::RawFd;

#[cfg(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "macos",
    target_os = "ios"
))]
use super::{KernelTcpInfo, ProbeError};
use super::TcpDiagnostics;

/// Whether this build can read the full TCP diagnostics block
pub const HAS_TCP_INFO: bool = cfg!(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "macos",
    target_os = "ios"
));

/// Whether this build can read the congestion-control algorithm name
pub const HAS_CONGESTION_CONTROL: bool = cfg!(any(target_os = "linux", target_os = "freebsd"));

/// Whether this build can read `SO_MAX_PACING_RATE`
pub const HAS_MAX_PACING_RATE: bool = cfg!(any(target_os = "linux", target_os = "freebsd"));

// ============================================================================
// LINUX
// ============================================================================

/// `TCP_INFO`, `TCP_CONGESTION` and `SO_MAX_PACING_RATE` via getsockopt
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxDiagnostics;

#[cfg(target_os = "linux")]
impl TcpDiagnostics for LinuxDiagnostics {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn supports_tcp_info(&self) -> bool {
        true
    }

    fn tcp_info(&self, fd: RawFd) -> Result<KernelTcpInfo, ProbeError> {
        super::tcp_info::query(fd)
    }

    fn congestion_control(&self, fd: RawFd) -> Result<String, ProbeError> {
        super::sockopt::congestion_control(fd, libc::TCP_CONGESTION)
    }

    fn max_pacing_rate(&self, fd: RawFd) -> Result<i64, ProbeError> {
        super::sockopt::max_pacing_rate(fd, libc::SO_MAX_PACING_RATE)
    }
}

// ============================================================================
// FREEBSD
// ============================================================================

/// sys/socket.h: `#define SO_MAX_PACING_RATE 0x1018` (not exported by libc)
#[cfg(target_os = "freebsd")]
const FREEBSD_SO_MAX_PACING_RATE: libc::c_int = 0x1018;

/// FreeBSD `TCP_INFO` plus the same scalar options as Linux
#[cfg(target_os = "freebsd")]
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeBsdDiagnostics;

#[cfg(target_os = "freebsd")]
impl TcpDiagnostics for FreeBsdDiagnostics {
    fn name(&self) -> &'static str {
        "freebsd"
    }

    fn supports_tcp_info(&self) -> bool {
        true
    }

    fn tcp_info(&self, fd: RawFd) -> Result<KernelTcpInfo, ProbeError> {
        let mut buf = [0_u8; super::tcp_info::TCP_INFO_BUF_LEN];
        let len = super::sockopt::getsockopt_raw(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            "TCP_INFO",
            &mut buf,
        )?;
        super::bsd::parse_freebsd_tcp_info(&buf[..len])
    }

    fn congestion_control(&self, fd: RawFd) -> Result<String, ProbeError> {
        super::sockopt::congestion_control(fd, libc::TCP_CONGESTION)
    }

    fn max_pacing_rate(&self, fd: RawFd) -> Result<i64, ProbeError> {
        super::sockopt::max_pacing_rate(fd, FREEBSD_SO_MAX_PACING_RATE)
    }
}

// ============================================================================
// DARWIN (macOS / iOS)
// ============================================================================

/// `TCP_CONNECTION_INFO` only; Darwin exposes no congestion or pacing option
#[cfg(any(target_os = "macos", target_os = "ios"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct DarwinDiagnostics;

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl TcpDiagnostics for DarwinDiagnostics {
    fn name(&self) -> &'static str {
        "darwin"
    }

    fn supports_tcp_info(&self) -> bool {
        true
    }

    fn tcp_info(&self, fd: RawFd) -> Result<KernelTcpInfo, ProbeError> {
        let mut buf = [0_u8; super::tcp_info::TCP_INFO_BUF_LEN];
        let len = super::sockopt::getsockopt_raw(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONNECTION_INFO,
            "TCP_CONNECTION_INFO",
            &mut buf,
        )?;
        super::bsd::parse_darwin_connection_info(&buf[..len])
    }
}

// ============================================================================
// FALLBACK
// ============================================================================

/// Provider for kernels without TCP diagnostics: every probe is unsupported
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDiagnostics;

impl TcpDiagnostics for UnsupportedDiagnostics {
    fn name(&self) -> &'static str {
        "unsupported"
    }
}

// ============================================================================
// SELECTION
// ============================================================================

/// The provider for the OS this crate was built for
#[must_use]
pub fn platform() -> &'static dyn TcpDiagnostics {
    #[cfg(target_os = "linux")]
    {
        &LinuxDiagnostics
    }
    #[cfg(target_os = "freebsd")]
    {
        &FreeBsdDiagnostics
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        &DarwinDiagnostics
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "macos",
        target_os = "ios"
    )))]
    {
        &UnsupportedDiagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_matches_capability_flags() {
        let provider = platform();
        assert_eq!(provider.supports_tcp_info(), HAS_TCP_INFO);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_is_selected() {
        assert_eq!(platform().name(), "linux");
        assert!(HAS_CONGESTION_CONTROL);
        assert!(HAS_MAX_PACING_RATE);
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "macos",
        target_os = "ios"
    ))]
    #[test]
    fn test_tcp_info_on_loopback() {
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let info = platform().tcp_info(client.as_raw_fd()).unwrap();
        assert!(info.mss > 0);
        assert!(info.cwnd_bytes > 0);
        assert!(info.rto_us > 0);
    }

    #[cfg(target_os = "freebsd")]
    #[test]
    fn test_freebsd_scalar_options_on_loopback() {
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let fd = client.as_raw_fd();

        let name = FreeBsdDiagnostics.congestion_control(fd).unwrap();
        assert!(!name.is_empty());
        assert!(matches!(
            FreeBsdDiagnostics.max_pacing_rate(fd),
            Ok(_) | Err(ProbeError::Unsupported)
        ));
    }

    #[test]
    fn test_unsupported_name() {
        assert_eq!(UnsupportedDiagnostics.name(), "unsupported");
    }
}
