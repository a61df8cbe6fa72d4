// ============================================================================
// TRANSPORT INFO: PER-CONNECTION TELEMETRY SNAPSHOT
// ============================================================================
// One TransportInfo per connection, owned by the connection object.
//
// === LIFECYCLE ===
// 1. TransportInfo::new(): every field at its sentinel
// 2. init_with_socket(): kernel TCP fields populated (fully or partly)
// 3. Other layers fill their own fields (TLS, addresses, byte counters)
// 4. Read-only from then on; share it behind an Arc for many readers
//
// === RE-SAMPLING ===
// Calling init_with_socket() again re-reads the kernel. Every kernel field is
// reset to its sentinel first, so a probe that fails now never leaves a stale
// value from an earlier call behind. The caller serializes repeated calls;
// there is no locking in here.

use serde::{Serialize, Serializer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::probe::{self, KernelTcpInfo, ProbeError, TcpDiagnostics};
use crate::{
    HeaderSize, ProbeOptions, ProtocolInfo, SslResume, TransportSocket, LATENCY_NOT_MEASURED,
    NOT_AVAILABLE,
};

/// Errors from writing into a snapshot
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Address fields are write-once
    #[error("{0} address is already set")]
    AddressAlreadySet(&'static str),
}

// === SERDE HELPERS ===
// Durations go out as plain integers so log pipelines don't see {secs, nanos}

fn serialize_micros<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Transport-level telemetry for one connection
///
/// === FIELD GROUPS ===
/// - Timing: accept time, setup durations, byte-relative latencies
/// - Congestion/RTT: filled from the kernel by `init_with_socket()`
/// - Addressing: write-once socket addresses
/// - Security: filled by the TLS layer after the handshake
/// - Byte counters: filled by the protocol layer
///
/// === SENTINELS ===
/// Kernel metrics default to `-1`, latencies to `-1`, durations to zero,
/// counters to 0 and optional text to `None`. Kernel metrics are only
/// meaningful when `valid_tcpinfo` is true.
///
/// === SERIALIZATION ===
/// `None` values are omitted. `accept_time` (a monotonic instant) and
/// `protocol_info` (opaque) are never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    // ========================================================================
    // TIMING
    // ========================================================================
    /// When the connection handshake completed
    #[serde(skip)]
    pub accept_time: Option<Instant>,

    /// From accept until the connection was established
    #[serde(rename = "setup_time_ms", serialize_with = "serialize_millis")]
    pub setup_time: Duration,

    /// Time spent in the TLS handshake
    #[serde(rename = "ssl_setup_time_ms", serialize_with = "serialize_millis")]
    pub ssl_setup_time: Duration,

    // Byte-relative latencies in milliseconds, measured from request start.
    // The difference of two of them gives the time between the two events,
    // e.g. time_to_last_body_byte_ack - time_to_first_byte.
    /// First header byte written to the kernel send buffer
    pub time_to_first_header_byte: i32,
    /// First body byte written to the kernel send buffer
    pub time_to_first_byte: i32,
    /// Last body byte written to the kernel send buffer
    pub time_to_last_byte: i32,
    /// First body byte written by the kernel to the NIC
    pub time_to_first_byte_tx: i32,
    /// Last body byte written by the kernel to the NIC
    pub time_to_last_byte_tx: i32,
    /// TCP ACK received for the last written body byte
    pub time_to_last_body_byte_ack: i32,
    /// From the kernel sending the last byte until its ACK arrived
    pub last_byte_ack_latency: i32,
    /// Time spent inside the proxy
    pub proxy_latency: i32,
    /// From accept until the client's request headers completed
    pub client_latency: i32,
    /// Latency talking to the upstream server
    pub server_latency: i32,
    /// Time to obtain a usable upstream connection
    pub connect_latency: i32,

    /// Session offset of the first body byte (multiplexed protocols)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maybe_first_body_byte_offset: Option<u64>,
    /// Session offset of the last body byte
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maybe_last_body_byte_offset: Option<u64>,

    // ========================================================================
    // CONGESTION / RTT (kernel)
    // ========================================================================
    /// Smoothed round-trip time; zero when unknown
    #[serde(rename = "rtt_us", serialize_with = "serialize_micros")]
    pub rtt: Duration,
    /// RTT variance (microseconds)
    pub rtt_var: i64,
    /// Packets retransmitted over the connection lifetime
    pub rtx: i64,
    /// Packets retransmitted due to timeout
    pub rtx_tm: i64,
    /// Retransmission timeout (microseconds)
    pub rto: i64,
    /// Congestion window (segments)
    pub cwnd: i64,
    /// Congestion window (bytes)
    pub cwnd_bytes: i64,
    pub mss: i64,
    /// Slow start threshold (segments)
    pub ssthresh: i64,
    /// Lowest RTT the kernel has seen (microseconds)
    pub min_rtt: i64,
    /// Kernel's delivery rate estimate (bytes/second)
    pub delivery_rate: i64,
    /// Current pacing rate (bytes/second)
    pub pacing_rate: i64,
    /// Configured maximum pacing rate (bytes/second); -1 when unlimited
    pub max_pacing_rate: i64,
    /// Congestion-control algorithm ("cubic", "bbr", ...); empty when unknown
    pub ca_algo: String,
    /// True iff the full TCP info query succeeded
    pub valid_tcpinfo: bool,
    /// errno of the failed TCP info query, 0 otherwise
    pub tcpinfo_errno: i32,

    // ========================================================================
    // ADDRESSING (write-once)
    // ========================================================================
    #[serde(skip_serializing_if = "Option::is_none")]
    local_addr: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_addr: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_addr_original: Option<SocketAddr>,

    // ========================================================================
    // SECURITY (TLS layer)
    // ========================================================================
    // Use the ssl_* fields for logging only: not every security protocol
    // fills them.
    pub secure: bool,
    pub ssl_resume: SslResume,
    /// What is providing the security
    pub security_type: String,
    pub ssl_error: String,
    /// 4 bits major, 4 bits minor; 0 for plain-text
    pub ssl_version: u16,
    pub ssl_cert_size: u16,
    pub ssl_setup_bytes_written: u32,
    pub ssl_setup_bytes_read: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_ciphers: Option<String>,
    /// Client ciphers as 4-byte hex strings, e.g. "cc14"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_ciphers_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_compr_methods: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_exts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_sig_algs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_client_supported_versions: Option<String>,
    /// Hash of the client's TLS parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_server_ciphers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_sig_alg_name: Option<String>,
    /// "(os) (browser)" guessed from the TLS signature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guessed_user_agent: Option<String>,
    /// Application protocol on the transport (h2, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_fingerprint: Option<String>,
    pub tfo_succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated_token_binding_key_parameters: Option<u8>,

    // ========================================================================
    // BYTE COUNTERS
    // ========================================================================
    pub ingress_header: HeaderSize,
    pub egress_header: HeaderSize,
    pub ingress_body_size: u32,
    pub egress_body_size: u32,
    pub total_bytes: u64,
    pub status_code: u16,

    // ========================================================================
    // PROTOCOL PAYLOAD
    // ========================================================================
    #[serde(skip)]
    pub protocol_info: Option<Arc<dyn ProtocolInfo>>,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            accept_time: None,
            setup_time: Duration::ZERO,
            ssl_setup_time: Duration::ZERO,
            time_to_first_header_byte: LATENCY_NOT_MEASURED,
            time_to_first_byte: LATENCY_NOT_MEASURED,
            time_to_last_byte: LATENCY_NOT_MEASURED,
            time_to_first_byte_tx: LATENCY_NOT_MEASURED,
            time_to_last_byte_tx: LATENCY_NOT_MEASURED,
            time_to_last_body_byte_ack: LATENCY_NOT_MEASURED,
            last_byte_ack_latency: LATENCY_NOT_MEASURED,
            proxy_latency: LATENCY_NOT_MEASURED,
            client_latency: LATENCY_NOT_MEASURED,
            server_latency: LATENCY_NOT_MEASURED,
            connect_latency: LATENCY_NOT_MEASURED,
            maybe_first_body_byte_offset: None,
            maybe_last_body_byte_offset: None,
            rtt: Duration::ZERO,
            rtt_var: NOT_AVAILABLE,
            rtx: NOT_AVAILABLE,
            rtx_tm: NOT_AVAILABLE,
            rto: NOT_AVAILABLE,
            cwnd: NOT_AVAILABLE,
            cwnd_bytes: NOT_AVAILABLE,
            mss: NOT_AVAILABLE,
            ssthresh: NOT_AVAILABLE,
            min_rtt: NOT_AVAILABLE,
            delivery_rate: NOT_AVAILABLE,
            pacing_rate: NOT_AVAILABLE,
            max_pacing_rate: NOT_AVAILABLE,
            ca_algo: String::new(),
            valid_tcpinfo: false,
            tcpinfo_errno: 0,
            local_addr: None,
            remote_addr: None,
            client_addr_original: None,
            secure: false,
            ssl_resume: SslResume::NotApplicable,
            security_type: String::new(),
            ssl_error: String::new(),
            ssl_version: 0,
            ssl_cert_size: 0,
            ssl_setup_bytes_written: 0,
            ssl_setup_bytes_read: 0,
            ssl_cipher: None,
            ssl_server_name: None,
            ssl_client_ciphers: None,
            ssl_client_ciphers_hex: None,
            ssl_client_compr_methods: None,
            ssl_client_exts: None,
            ssl_client_sig_algs: None,
            ssl_client_supported_versions: None,
            ssl_signature: None,
            ssl_server_ciphers: None,
            ssl_cert_sig_alg_name: None,
            guessed_user_agent: None,
            app_protocol: None,
            tcp_signature: None,
            tcp_fingerprint: None,
            tfo_succeeded: false,
            negotiated_token_binding_key_parameters: None,
            ingress_header: HeaderSize::default(),
            egress_header: HeaderSize::default(),
            ingress_body_size: 0,
            egress_body_size: 0,
            total_bytes: 0,
            status_code: 0,
            protocol_info: None,
        }
    }
}

impl TransportInfo {
    /// A record with every field at its documented default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // KERNEL POPULATION
    // ========================================================================

    /// Populate the kernel TCP fields from a connected socket
    ///
    /// Runs the platform's probes with every probe enabled. Returns
    /// `valid_tcpinfo`: whether the full TCP info query succeeded. A `false`
    /// return is not an error to escalate: fields that could not be read
    /// simply hold their sentinel.
    ///
    /// Only kernel-derived fields are written. Timing, address, security and
    /// byte-counter fields are left alone.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::net::TcpStream;
    /// use transport_info::TransportInfo;
    ///
    /// let stream = TcpStream::connect("127.0.0.1:8080")?;
    /// let mut info = TransportInfo::new();
    /// if info.init_with_socket(&stream) {
    ///     println!("rtt={}ms cwnd={} algo={}", info.rtt_ms(), info.cwnd, info.ca_algo);
    /// }
    /// # Ok::<(), std::io::Error>(())
    /// ```
    pub fn init_with_socket<S: TransportSocket + ?Sized>(&mut self, sock: &S) -> bool {
        self.init_with_options(sock, &ProbeOptions::default())
    }

    /// [`init_with_socket`](Self::init_with_socket) with an explicit probe
    /// selection
    pub fn init_with_options<S: TransportSocket + ?Sized>(
        &mut self,
        sock: &S,
        options: &ProbeOptions,
    ) -> bool {
        self.init_with_diagnostics(sock, probe::platform(), options)
    }

    /// [`init_with_socket`](Self::init_with_socket) against a specific
    /// diagnostics provider
    ///
    /// # Steps
    ///
    /// 1. Reset every kernel field to its sentinel
    /// 2. Check the socket; an invalid one records `EBADF` and stops
    /// 3. Full TCP info (records errno on failure)
    /// 4. Congestion-control name
    /// 5. Max pacing rate
    pub fn init_with_diagnostics<S: TransportSocket + ?Sized>(
        &mut self,
        sock: &S,
        diagnostics: &dyn TcpDiagnostics,
        options: &ProbeOptions,
    ) -> bool {
        self.reset_kernel_fields();

        let fd = match probe::socket_fd(sock) {
            Ok(fd) => fd,
            Err(err) => {
                log::debug!("{}: skipping TCP probes: {err}", diagnostics.name());
                self.tcpinfo_errno = err.errno();
                return false;
            }
        };

        if options.tcp_info {
            match diagnostics.tcp_info(fd) {
                Ok(info) => self.apply_kernel_info(&info),
                // No facility on this platform: sentinels, no errno
                Err(ProbeError::Unsupported) => {}
                Err(err) => {
                    log::debug!(
                        "{}: TCP info unavailable on fd {fd}: {err}",
                        diagnostics.name()
                    );
                    self.tcpinfo_errno = err.errno();
                }
            }
        }

        if options.congestion_control {
            match diagnostics.congestion_control(fd) {
                Ok(name) => self.ca_algo = name,
                Err(ProbeError::Unsupported) => {}
                Err(err) => {
                    log::debug!(
                        "{}: congestion control unavailable on fd {fd}: {err}",
                        diagnostics.name()
                    );
                }
            }
        }

        if options.max_pacing_rate {
            match diagnostics.max_pacing_rate(fd) {
                Ok(rate) => self.max_pacing_rate = rate,
                Err(ProbeError::Unsupported) => {}
                Err(err) => {
                    log::debug!(
                        "{}: max pacing rate unavailable on fd {fd}: {err}",
                        diagnostics.name()
                    );
                }
            }
        }

        log::trace!(
            "fd {fd}: valid_tcpinfo={} rtt={}us cwnd={} rtx={} ca_algo={:?}",
            self.valid_tcpinfo,
            self.rtt.as_micros(),
            self.cwnd,
            self.rtx,
            self.ca_algo
        );

        self.valid_tcpinfo
    }

    /// Put every kernel-derived field back to its sentinel
    fn reset_kernel_fields(&mut self) {
        self.apply_kernel_metrics(&KernelTcpInfo::default());
        self.max_pacing_rate = NOT_AVAILABLE;
        self.ca_algo.clear();
        self.valid_tcpinfo = false;
        self.tcpinfo_errno = 0;
    }

    fn apply_kernel_info(&mut self, info: &KernelTcpInfo) {
        self.apply_kernel_metrics(info);
        self.valid_tcpinfo = true;
    }

    fn apply_kernel_metrics(&mut self, info: &KernelTcpInfo) {
        self.rtt = u64::try_from(info.rtt_us)
            .map(Duration::from_micros)
            .unwrap_or(Duration::ZERO);
        self.rtt_var = info.rtt_var_us;
        self.rtx = info.total_retransmits;
        self.rtx_tm = info.timeout_retransmits;
        self.rto = info.rto_us;
        self.cwnd = info.cwnd;
        self.cwnd_bytes = info.cwnd_bytes;
        self.mss = info.mss;
        self.ssthresh = info.ssthresh;
        self.min_rtt = info.min_rtt_us;
        self.delivery_rate = info.delivery_rate;
        self.pacing_rate = info.pacing_rate;
    }

    // ========================================================================
    // DERIVED ACCESSORS
    // ========================================================================

    /// RTT in whole milliseconds, truncated (1500us -> 1ms), saturating at
    /// `u64::MAX`
    ///
    /// Always returns a value; check `valid_tcpinfo` before trusting it.
    #[inline]
    #[must_use]
    pub fn rtt_ms(&self) -> u64 {
        u64::try_from(self.rtt.as_millis()).unwrap_or(u64::MAX)
    }

    /// The protocol attachment, if present and of type `T`
    #[must_use]
    pub fn protocol_info_as<T: ProtocolInfo>(&self) -> Option<&T> {
        self.protocol_info
            .as_deref()
            .and_then(|info| info.as_any().downcast_ref::<T>())
    }

    // ========================================================================
    // ADDRESSES (write-once)
    // ========================================================================

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address of the remote side: the server for a client socket, the
    /// client otherwise
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Address of the L4 proxy host when the client came through one
    /// (PROXY protocol)
    #[must_use]
    pub fn client_addr_original(&self) -> Option<SocketAddr> {
        self.client_addr_original
    }

    /// Set the local address; in a proxy's downstream transport this is
    /// the VIP
    ///
    /// # Errors
    ///
    /// [`SnapshotError::AddressAlreadySet`] if it was set before.
    pub fn set_local_addr(&mut self, addr: SocketAddr) -> Result<(), SnapshotError> {
        set_once(&mut self.local_addr, addr, "local")
    }

    /// # Errors
    ///
    /// [`SnapshotError::AddressAlreadySet`] if it was set before.
    pub fn set_remote_addr(&mut self, addr: SocketAddr) -> Result<(), SnapshotError> {
        set_once(&mut self.remote_addr, addr, "remote")
    }

    /// # Errors
    ///
    /// [`SnapshotError::AddressAlreadySet`] if it was set before.
    pub fn set_client_addr_original(&mut self, addr: SocketAddr) -> Result<(), SnapshotError> {
        set_once(&mut self.client_addr_original, addr, "original client")
    }
}

fn set_once(
    slot: &mut Option<SocketAddr>,
    addr: SocketAddr,
    which: &'static str,
) -> Result<(), SnapshotError> {
    if slot.is_some() {
        return Err(SnapshotError::AddressAlreadySet(which));
    }
    *slot = Some(addr);
    Ok(())
}
