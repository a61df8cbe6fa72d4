// ============================================================================
// TRANSPORT INFO LIBRARY
// ============================================================================
// This library captures per-connection transport telemetry: the kernel's view
// of a TCP connection (RTT, retransmits, congestion window, congestion control
// algorithm, pacing rate) plus storage for the timing, addressing, TLS and
// byte-counter data that other layers of a proxy fill in.
//
// === KEY FEATURES ===
// 1. One normalized record (TransportInfo) with a documented sentinel per field
// 2. Kernel probes via getsockopt(2) on Linux, FreeBSD and macOS/iOS
// 3. Graceful degradation: a failed or unsupported probe leaves its sentinel,
//    it never fails the caller's connection handling
// 4. Serde serialization of the record for logging pipelines
//
// === SENTINELS ===
// - i64 kernel metrics: -1 (NOT_AVAILABLE)
// - i32 latencies: -1 (LATENCY_NOT_MEASURED)
// - durations: zero
// - text: empty String or None
// - counters: 0

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

// === MODULE DECLARATIONS ===
pub mod probe;
pub use probe::{KernelTcpInfo, ProbeError, TcpDiagnostics};

pub mod transport_info;
pub use transport_info::{SnapshotError, TransportInfo};

// ============================================================================
// CONSTANTS: SENTINEL VALUES
// ============================================================================

/// Kernel metric the platform or the syscall could not supply
pub const NOT_AVAILABLE: i64 = -1;

/// Byte-relative latency that was never measured
pub const LATENCY_NOT_MEASURED: i32 = -1;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// TLS session resumption state of a connection
///
/// Filled by the TLS layer after the handshake. Plain-text connections stay
/// at `NotApplicable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslResume {
    /// Full handshake, new session
    New,
    /// Abbreviated handshake, resumed session
    Resumed,
    /// Not a TLS connection
    #[default]
    NotApplicable,
}

/// Byte counters for one direction of protocol headers
///
/// `compressed` covers the compressed block plus its control information,
/// so `compressed - compressed_block` is the control overhead. Protocols
/// without header compression leave `compressed` at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeaderSize {
    pub compressed: usize,
    pub uncompressed: usize,
    pub compressed_block: usize,
}

/// Protocol-specific data attached to a [`TransportInfo`]
///
/// The transport layer treats this as opaque. The layer that creates it
/// gets it back with [`TransportInfo::protocol_info_as`].
///
/// ```
/// use std::any::Any;
/// use transport_info::ProtocolInfo;
///
/// #[derive(Debug)]
/// struct Http2Info {
///     streams: u32,
/// }
///
/// impl ProtocolInfo for Http2Info {
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
/// ```
pub trait ProtocolInfo: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// SOCKET ABSTRACTION
// ============================================================================

/// What the probes need from a transport: a native descriptor and a
/// liveness check
///
/// Implemented for `TcpStream` and `BorrowedFd`. Transports with
/// their own notion of "closed" override [`TransportSocket::is_valid`].
pub trait TransportSocket {
    fn native_fd(&self) -> RawFd;

    /// `false` stops every probe before it reaches the kernel
    fn is_valid(&self) -> bool {
        self.native_fd() >= 0
    }
}

impl TransportSocket for TcpStream {
    fn native_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl TransportSocket for BorrowedFd<'_> {
    fn native_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

impl<T: TransportSocket + ?Sized> TransportSocket for &T {
    fn native_fd(&self) -> RawFd {
        (**self).native_fd()
    }

    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which kernel probes [`TransportInfo::init_with_options`] runs
///
/// Every probe is on by default. A disabled probe leaves its fields at the
/// sentinel, exactly like an unsupported one. Deserializes from host config
/// with missing keys meaning "enabled":
///
/// ```
/// # use transport_info::ProbeOptions;
/// let opts: ProbeOptions = serde_json::from_str(r#"{"max_pacing_rate": false}"#).unwrap();
/// assert!(opts.tcp_info);
/// assert!(!opts.max_pacing_rate);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOptions {
    /// Read the full TCP diagnostics block (RTT, cwnd, retransmits)
    #[serde(default = "default_true")]
    pub tcp_info: bool,
    /// Read the congestion-control algorithm name
    #[serde(default = "default_true")]
    pub congestion_control: bool,
    /// Read `SO_MAX_PACING_RATE`
    #[serde(default = "default_true")]
    pub max_pacing_rate: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            tcp_info: true,
            congestion_control: true,
            max_pacing_rate: true,
        }
    }
}

/// Default value for boolean fields (true)
#[must_use]
pub const fn default_true() -> bool {
    true
}
