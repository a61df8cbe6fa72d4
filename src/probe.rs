//! Kernel TCP probes
//!
//! This module reads congestion and RTT state for a single connected socket
//! straight from the kernel with `getsockopt(2)`. Each probe is independent:
//! one failing never prevents another from running.
//!
//! # Architecture
//!
//! - `sockopt`: thin `getsockopt` wrappers, the `ProbeError` type, and the
//!   byte-level decoders for the small scalar options (congestion control
//!   name, max pacing rate)
//! - `tcp_info`: Linux `tcp_info` layout and kernel-version tolerant parsing
//! - `bsd`: FreeBSD `tcp_info` and Darwin `tcp_connection_info` layouts
//! - `platform`: the `TcpDiagnostics` providers, one per OS family, selected
//!   at compile time
//!
//! # Notes
//!
//! ## Why the layouts stay private
//!
//! Every OS names, sizes and fills its TCP diagnostics block differently:
//! - Linux: `TCP_INFO` -> `struct tcp_info` (grows with kernel version)
//! - FreeBSD: `TCP_INFO` -> its own `struct tcp_info` (cwnd in bytes)
//! - macOS/iOS: `TCP_CONNECTION_INFO` -> `struct tcp_connection_info` (ms)
//!
//! Callers only ever see the normalized [`KernelTcpInfo`]. The raw structures
//! are `pub(crate)` and are parsed in exactly one place per OS.
//!
//! ## Conditional Compilation
//!
//! The parsers are plain byte decoders and compile everywhere, so they are
//! tested on any host. Only the providers that issue syscalls are gated with
//! `#[cfg(target_os = ...)]`.

use std::os::fd::RawFd;

use crate::{TransportSocket, NOT_AVAILABLE};

// ============================================================================
// SUBMODULE DECLARATIONS
// ============================================================================

pub mod bsd; // FreeBSD / Darwin layouts (cross-platform for testing)
pub mod platform; // Per-OS TcpDiagnostics providers
pub mod sockopt; // getsockopt wrappers and ProbeError
pub mod tcp_info; // Linux tcp_info layout (cross-platform for testing)

// ============================================================================
// PUBLIC RE-EXPORTS
// ============================================================================

pub use platform::{
    platform,              // Compile-time selected provider
    UnsupportedDiagnostics, // Fallback for kernels without TCP diagnostics
    HAS_CONGESTION_CONTROL,
    HAS_MAX_PACING_RATE,
    HAS_TCP_INFO,
};
pub use sockopt::{ProbeError, TCP_CA_NAME_MAX};

#[cfg(target_os = "linux")]
pub use platform::LinuxDiagnostics;

#[cfg(target_os = "freebsd")]
pub use platform::FreeBsdDiagnostics;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use platform::DarwinDiagnostics;

// ============================================================================
// NORMALIZED KERNEL METRICS
// ============================================================================

/// TCP metrics decoded from the OS's native diagnostics block
///
/// All fields use the same units on every platform. A field the kernel
/// did not report holds [`NOT_AVAILABLE`] (`-1`).
///
/// # Units
///
/// - `rtt_us`, `rtt_var_us`, `rto_us`, `min_rtt_us`: microseconds
/// - `cwnd`, `ssthresh`: segments
/// - `cwnd_bytes`, `mss`: bytes
/// - `pacing_rate`, `delivery_rate`: bytes/second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTcpInfo {
    /// Smoothed round-trip time
    pub rtt_us: i64,
    /// RTT variance
    pub rtt_var_us: i64,
    /// Retransmission timeout
    pub rto_us: i64,
    /// Packets retransmitted over the connection lifetime
    pub total_retransmits: i64,
    /// Retransmits caused by timeout (current backoff round)
    pub timeout_retransmits: i64,
    pub mss: i64,
    pub cwnd: i64,
    pub cwnd_bytes: i64,
    pub ssthresh: i64,
    /// Lowest RTT seen on the connection (Linux 4.6+)
    pub min_rtt_us: i64,
    /// Most recent delivery rate estimate (Linux 4.6+)
    pub delivery_rate: i64,
    /// Current pacing rate (Linux 4.2+)
    pub pacing_rate: i64,
}

impl Default for KernelTcpInfo {
    fn default() -> Self {
        Self {
            rtt_us: NOT_AVAILABLE,
            rtt_var_us: NOT_AVAILABLE,
            rto_us: NOT_AVAILABLE,
            total_retransmits: NOT_AVAILABLE,
            timeout_retransmits: NOT_AVAILABLE,
            mss: NOT_AVAILABLE,
            cwnd: NOT_AVAILABLE,
            cwnd_bytes: NOT_AVAILABLE,
            ssthresh: NOT_AVAILABLE,
            min_rtt_us: NOT_AVAILABLE,
            delivery_rate: NOT_AVAILABLE,
            pacing_rate: NOT_AVAILABLE,
        }
    }
}

// ============================================================================
// CAPABILITY INTERFACE
// ============================================================================

/// A source of kernel TCP diagnostics for one OS family
///
/// Every method has the same two outcomes: a value, or a [`ProbeError`].
/// The default implementations report [`ProbeError::Unsupported`], so a
/// provider only overrides what its kernel actually offers.
///
/// Implementations must be cheap and stateless: the same provider is shared
/// by every connection in the process.
pub trait TcpDiagnostics: Send + Sync {
    /// Short provider name used in log lines
    fn name(&self) -> &'static str;

    /// Whether [`TcpDiagnostics::tcp_info`] can ever succeed on this provider
    fn supports_tcp_info(&self) -> bool {
        false
    }

    /// Read and normalize the full TCP diagnostics block
    fn tcp_info(&self, _fd: RawFd) -> Result<KernelTcpInfo, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    /// Read the active congestion-control algorithm name
    fn congestion_control(&self, _fd: RawFd) -> Result<String, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    /// Read `SO_MAX_PACING_RATE` in bytes/second, `-1` when unlimited
    fn max_pacing_rate(&self, _fd: RawFd) -> Result<i64, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

// ============================================================================
// PROBE FUNCTIONS
// ============================================================================

/// Resolve a transport into a descriptor that is worth handing to the kernel
pub(crate) fn socket_fd<S: TransportSocket + ?Sized>(sock: &S) -> Result<RawFd, ProbeError> {
    if !sock.is_valid() {
        return Err(ProbeError::InvalidSocket);
    }
    let fd = sock.native_fd();
    if fd < 0 {
        return Err(ProbeError::InvalidSocket);
    }
    Ok(fd)
}

/// Kernel's smoothed RTT estimate for the socket, in microseconds
///
/// Returns `-1` when the socket is invalid, the query fails, or the platform
/// has no TCP diagnostics. This never panics: a missing statistic is an
/// ordinary outcome early in a handshake or on exotic platforms.
///
/// # Example
///
/// ```no_run
/// use std::net::TcpStream;
///
/// let stream = TcpStream::connect("127.0.0.1:8080")?;
/// let rtt_us = transport_info::probe::read_rtt(&stream);
/// if rtt_us >= 0 {
///     println!("RTT: {:.2} ms", rtt_us as f64 / 1000.0);
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
#[must_use]
pub fn read_rtt<S: TransportSocket + ?Sized>(sock: &S) -> i64 {
    match read_tcp_info(sock) {
        Ok(info) => info.rtt_us,
        Err(err) => {
            log::debug!("RTT unavailable: {err}");
            NOT_AVAILABLE
        }
    }
}

/// Full TCP diagnostics for the socket, normalized across platforms
///
/// Only meaningful when [`HAS_TCP_INFO`] is true; elsewhere this always
/// returns [`ProbeError::Unsupported`]. On failure the OS error code is
/// available through [`ProbeError::errno`].
pub fn read_tcp_info<S: TransportSocket + ?Sized>(sock: &S) -> Result<KernelTcpInfo, ProbeError> {
    let fd = socket_fd(sock)?;
    platform().tcp_info(fd)
}

/// Name of the congestion-control algorithm in use (`"cubic"`, `"bbr"`, ...)
///
/// The name never contains NUL bytes and is at most [`TCP_CA_NAME_MAX`]
/// bytes long.
pub fn read_congestion_control<S: TransportSocket + ?Sized>(sock: &S) -> Result<String, ProbeError> {
    let fd = socket_fd(sock)?;
    platform().congestion_control(fd)
}

/// Maximum pacing rate configured on the socket, in bytes/second
///
/// `Ok(-1)` means no limit is set. A kernel that predates the option
/// reports [`ProbeError::Unsupported`]; callers treat both the same way.
pub fn read_max_pacing_rate<S: TransportSocket + ?Sized>(sock: &S) -> Result<i64, ProbeError> {
    let fd = socket_fd(sock)?;
    platform().max_pacing_rate(fd)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSocket;

    impl TransportSocket for NoSocket {
        fn native_fd(&self) -> RawFd {
            -1
        }
    }

    struct ShutSocket;

    impl TransportSocket for ShutSocket {
        fn native_fd(&self) -> RawFd {
            0
        }

        fn is_valid(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_kernel_tcp_info_default_is_sentinel() {
        let info = KernelTcpInfo::default();
        assert_eq!(info.rtt_us, NOT_AVAILABLE);
        assert_eq!(info.cwnd, NOT_AVAILABLE);
        assert_eq!(info.cwnd_bytes, NOT_AVAILABLE);
        assert_eq!(info.total_retransmits, NOT_AVAILABLE);
        assert_eq!(info.pacing_rate, NOT_AVAILABLE);
    }

    #[test]
    fn test_negative_fd_is_invalid() {
        assert!(matches!(socket_fd(&NoSocket), Err(ProbeError::InvalidSocket)));
        assert_eq!(read_rtt(&NoSocket), NOT_AVAILABLE);
        assert!(read_congestion_control(&NoSocket).is_err());
        assert!(read_max_pacing_rate(&NoSocket).is_err());
    }

    #[test]
    fn test_invalid_flag_wins_over_fd() {
        // fd 0 is stdin; the validity check must stop us before getsockopt
        assert!(matches!(read_tcp_info(&ShutSocket), Err(ProbeError::InvalidSocket)));
    }

    #[test]
    fn test_unsupported_provider_defaults() {
        let provider = UnsupportedDiagnostics;
        assert!(!provider.supports_tcp_info());
        assert!(matches!(provider.tcp_info(3), Err(ProbeError::Unsupported)));
        assert!(matches!(provider.congestion_control(3), Err(ProbeError::Unsupported)));
        assert!(matches!(provider.max_pacing_rate(3), Err(ProbeError::Unsupported)));
    }
}
