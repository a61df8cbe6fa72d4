//! Linux `tcp_info` parsing with kernel version compatibility
//!
//! `getsockopt(fd, IPPROTO_TCP, TCP_INFO)` copies the kernel's `tcp_info`
//! structure into our buffer. The key challenge: its size varies across
//! kernel versions!
//!
//! # Notes
//!
//! ## Kernel Version Challenge
//!
//! The tcp_info structure has grown over time:
//! - Kernel 3.10: 104 bytes, basic metrics (rtt, cwnd, retransmits)
//! - Kernel 4.2: pacing rates and RFC4898 byte counters appended
//! - Kernel 4.6: min_rtt, delivery_rate appended
//! - Kernel 4.9+: busy/limited timers, bytes_sent, ... (we stop earlier)
//!
//! The kernel copies `min(optlen, sizeof(struct tcp_info))` bytes and tells
//! us how many. So we:
//! 1. Require the basic prefix (fields present in ALL kernels)
//! 2. Pick up extended fields one by one while bytes remain
//! 3. Leave anything the kernel didn't send at its default
//!
//! ## Memory Layout (repr(C))
//!
//! `TcpInfoBasic` uses `#[repr(C)]` so its field order and padding match the
//! kernel byte-for-byte. We still copy it out with `read_unaligned`: a byte
//! buffer carries no alignment guarantee.

// The parsers compile everywhere so they stay testable; only Linux calls them
#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::mem::size_of;
#[cfg(target_os = "linux")]
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
use super::sockopt::getsockopt_raw;
use super::sockopt::ProbeError;
use super::KernelTcpInfo;
use crate::NOT_AVAILABLE;

/// Large enough for every `tcp_info` revision shipped so far
pub(crate) const TCP_INFO_BUF_LEN: usize = 512;

// ============================================================================
// TCP INFO STRUCTURES
// ============================================================================

/// Basic tcp_info fields (kernel 3.10+)
///
/// Size: 104 bytes (up to and including `tcpi_total_retrans`).
///
/// # Key Metrics
///
/// - `tcpi_rtt`: Smoothed round-trip time (microseconds)
/// - `tcpi_rttvar`: RTT variance (microseconds)
/// - `tcpi_rto`: Retransmission timeout (microseconds)
/// - `tcpi_retransmits`: Timeout retransmits in the current backoff round
/// - `tcpi_snd_cwnd`: Congestion window (segments)
/// - `tcpi_snd_mss`: Sender MSS (bytes)
/// - `tcpi_total_retrans`: Total retransmits (all time)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)] // mirrors the kernel layout; not every field is consumed
pub(crate) struct TcpInfoBasic {
    // === State and options (8 bytes) ===
    pub tcpi_state: u8,
    pub tcpi_ca_state: u8,
    pub tcpi_retransmits: u8,
    pub tcpi_probes: u8,
    pub tcpi_backoff: u8,
    pub tcpi_options: u8,
    pub tcpi_snd_wscale: u8, // snd_wscale:4 | rcv_wscale:4
    pub tcpi_delivery_rate_app_limited: u8, // bitfield flags

    // === Timeouts (8 bytes) ===
    pub tcpi_rto: u32,
    pub tcpi_ato: u32,

    // === MSS (8 bytes) ===
    pub tcpi_snd_mss: u32,
    pub tcpi_rcv_mss: u32,

    // === Packet counts (20 bytes) ===
    pub tcpi_unacked: u32,
    pub tcpi_sacked: u32,
    pub tcpi_lost: u32,
    pub tcpi_retrans: u32,
    pub tcpi_fackets: u32,

    // === Times (16 bytes) ===
    pub tcpi_last_data_sent: u32,
    pub tcpi_last_ack_sent: u32,
    pub tcpi_last_data_recv: u32,
    pub tcpi_last_ack_recv: u32,

    // === Core metrics (40 bytes) ===
    pub tcpi_pmtu: u32,
    pub tcpi_rcv_ssthresh: u32,
    pub tcpi_rtt: u32,
    pub tcpi_rttvar: u32,
    pub tcpi_snd_ssthresh: u32,
    pub tcpi_snd_cwnd: u32,
    pub tcpi_advmss: u32,
    pub tcpi_reordering: u32,
    pub tcpi_rcv_rtt: u32,
    pub tcpi_rcv_space: u32,

    // === Total retransmits (4 bytes) ===
    pub tcpi_total_retrans: u32,
}

/// Extended tcp_info fields (kernel 4.2 - 4.6)
///
/// Parsed field-by-field from whatever the kernel appended after the basic
/// block. Missing fields stay 0.
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
pub(crate) struct TcpInfoExtended {
    // Kernel 4.2+
    pub tcpi_pacing_rate: u64,
    pub tcpi_max_pacing_rate: u64,
    pub tcpi_bytes_acked: u64,
    pub tcpi_bytes_received: u64,
    pub tcpi_segs_out: u32,
    pub tcpi_segs_in: u32,

    // Kernel 4.6+
    pub tcpi_notsent_bytes: u32,
    pub tcpi_min_rtt: u32,
    pub tcpi_data_segs_in: u32,
    pub tcpi_data_segs_out: u32,
    pub tcpi_delivery_rate: u64,
}

/// Parsed Linux tcp_info: basic block plus whatever extension was present
#[derive(Debug, Clone)]
pub(crate) struct TcpInfo {
    pub basic: TcpInfoBasic,
    pub extended: Option<TcpInfoExtended>,
}

// ============================================================================
// SYSCALL
// ============================================================================

/// Fetch and parse `TCP_INFO` for a Linux socket
#[cfg(target_os = "linux")]
pub(crate) fn query(fd: RawFd) -> Result<KernelTcpInfo, ProbeError> {
    let mut buf = [0_u8; TCP_INFO_BUF_LEN];
    let len = getsockopt_raw(fd, libc::IPPROTO_TCP, libc::TCP_INFO, "TCP_INFO", &mut buf)?;
    let info = parse_tcp_info(&buf[..len])?;
    Ok(tcp_info_to_kernel(&info))
}

// ============================================================================
// PARSING FUNCTIONS
// ============================================================================

/// Parse tcp_info from the bytes the kernel returned
///
/// # Strategy
///
/// 1. Check buffer has minimum size for basic fields (104 bytes)
/// 2. Copy the basic block out with an unaligned read
/// 3. If bytes remain, parse extended fields from them
///
/// # Errors
///
/// [`ProbeError::Truncated`] when the kernel sent less than the basic block.
pub(crate) fn parse_tcp_info(data: &[u8]) -> Result<TcpInfo, ProbeError> {
    let basic_size = size_of::<TcpInfoBasic>();

    if data.len() < basic_size {
        return Err(ProbeError::Truncated {
            option: "TCP_INFO",
            len: data.len(),
            min: basic_size,
        });
    }

    // SAFETY: data holds at least size_of::<TcpInfoBasic>() bytes (checked
    // above), the struct is repr(C) and made only of integers, so every bit
    // pattern is valid. read_unaligned copies without an alignment demand.
    let basic = unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<TcpInfoBasic>()) };

    let extended = if data.len() > basic_size {
        Some(parse_extended_fields(&data[basic_size..]))
    } else {
        None
    };

    Ok(TcpInfo { basic, extended })
}

/// Parse extended tcp_info fields from the remaining buffer
///
/// Fields are decoded in kernel order; parsing stops quietly at the first
/// field the buffer can't hold.
fn parse_extended_fields(data: &[u8]) -> TcpInfoExtended {
    let mut ext = TcpInfoExtended::default();
    let mut offset: usize = 0;

    macro_rules! parse_u32 {
        ($field:expr) => {
            #[allow(unused_assignments)]
            if offset + 4 <= data.len() {
                $field = u32::from_ne_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]);
                offset += 4;
            } else {
                return ext;
            }
        };
    }

    macro_rules! parse_u64 {
        ($field:expr) => {
            #[allow(unused_assignments)]
            if offset + 8 <= data.len() {
                $field = u64::from_ne_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                    data[offset + 4],
                    data[offset + 5],
                    data[offset + 6],
                    data[offset + 7],
                ]);
                offset += 8;
            } else {
                return ext;
            }
        };
    }

    // Kernel 4.2+ additions:
    parse_u64!(ext.tcpi_pacing_rate);
    parse_u64!(ext.tcpi_max_pacing_rate);
    parse_u64!(ext.tcpi_bytes_acked);
    parse_u64!(ext.tcpi_bytes_received);
    parse_u32!(ext.tcpi_segs_out);
    parse_u32!(ext.tcpi_segs_in);

    // Kernel 4.6+ additions:
    parse_u32!(ext.tcpi_notsent_bytes);
    parse_u32!(ext.tcpi_min_rtt);
    parse_u32!(ext.tcpi_data_segs_in);
    parse_u32!(ext.tcpi_data_segs_out);
    parse_u64!(ext.tcpi_delivery_rate);

    ext
}

/// Map a kernel rate to bytes/s, treating "unlimited" and 0 as unknown
fn rate_or_unknown(rate: u64) -> i64 {
    if rate == 0 || rate == u64::MAX {
        NOT_AVAILABLE
    } else {
        i64::try_from(rate).unwrap_or(NOT_AVAILABLE)
    }
}

/// Convert parsed tcp_info into the normalized form
///
/// # Conversions
///
/// - RTT, RTT variance, RTO: already microseconds, copied as-is
/// - `cwnd_bytes`: `tcpi_snd_cwnd * tcpi_snd_mss`
/// - `total_retransmits`: `tcpi_total_retrans` (lifetime)
/// - `timeout_retransmits`: `tcpi_retransmits` (current RTO backoff round)
/// - Extended metrics: `-1` when the kernel didn't send them, or sent 0
pub(crate) fn tcp_info_to_kernel(info: &TcpInfo) -> KernelTcpInfo {
    let b = &info.basic;
    let mss = i64::from(b.tcpi_snd_mss);
    let cwnd = i64::from(b.tcpi_snd_cwnd);

    let mut out = KernelTcpInfo {
        rtt_us: i64::from(b.tcpi_rtt),
        rtt_var_us: i64::from(b.tcpi_rttvar),
        rto_us: i64::from(b.tcpi_rto),
        total_retransmits: i64::from(b.tcpi_total_retrans),
        timeout_retransmits: i64::from(b.tcpi_retransmits),
        mss,
        cwnd,
        cwnd_bytes: cwnd * mss,
        ssthresh: i64::from(b.tcpi_snd_ssthresh),
        ..KernelTcpInfo::default()
    };

    if let Some(ext) = info.extended.as_ref() {
        out.pacing_rate = rate_or_unknown(ext.tcpi_pacing_rate);
        out.delivery_rate = rate_or_unknown(ext.tcpi_delivery_rate);
        // Zero min_rtt means the field isn't populated (older kernel)
        if ext.tcpi_min_rtt > 0 && ext.tcpi_min_rtt != u32::MAX {
            out.min_rtt_us = i64::from(ext.tcpi_min_rtt);
        }
    }

    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_u64(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    #[test]
    fn test_basic_layout_matches_kernel() {
        assert_eq!(size_of::<TcpInfoBasic>(), 104);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_rto), 8);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_snd_mss), 16);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_rtt), 68);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_rttvar), 72);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_snd_ssthresh), 76);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_snd_cwnd), 80);
        assert_eq!(offset_of!(TcpInfoBasic, tcpi_total_retrans), 100);
    }

    #[test]
    fn test_parse_tcp_info_too_small() {
        let data = vec![0_u8; 50];
        let err = parse_tcp_info(&data).unwrap_err();
        assert!(matches!(err, ProbeError::Truncated { len: 50, min: 104, .. }));
    }

    #[test]
    fn test_parse_tcp_info_basic_only() {
        // Kernel 3.10 sized answer
        let mut data = vec![0_u8; 104];
        put_u32(&mut data, 68, 45_000);
        let info = parse_tcp_info(&data).unwrap();
        assert!(info.extended.is_none());
        assert_eq!(info.basic.tcpi_rtt, 45_000);
    }

    #[test]
    fn test_parse_tcp_info_unaligned_buffer() {
        // Shift by one byte so the struct start is misaligned
        let mut backing = vec![0_u8; 105];
        put_u32(&mut backing[1..], 80, 10);
        let info = parse_tcp_info(&backing[1..]).unwrap();
        assert_eq!(info.basic.tcpi_snd_cwnd, 10);
    }

    #[test]
    fn test_parse_tcp_info_with_extended() {
        let mut data = vec![0_u8; 232];
        put_u32(&mut data, 68, 45_000); // rtt
        put_u32(&mut data, 80, 10); // snd_cwnd
        put_u64(&mut data, 104, 2_500_000); // pacing_rate
        put_u32(&mut data, 148, 4_000); // min_rtt
        put_u64(&mut data, 160, 1_250_000); // delivery_rate

        let info = parse_tcp_info(&data).unwrap();
        let ext = info.extended.expect("extended fields");
        assert_eq!(info.basic.tcpi_rtt, 45_000);
        assert_eq!(info.basic.tcpi_snd_cwnd, 10);
        assert_eq!(ext.tcpi_pacing_rate, 2_500_000);
        assert_eq!(ext.tcpi_min_rtt, 4_000);
        assert_eq!(ext.tcpi_delivery_rate, 1_250_000);
    }

    #[test]
    fn test_parse_extended_fields_partial() {
        // Kernel 4.2 stops before min_rtt
        let mut data = vec![0_u8; 40];
        data[0..8].copy_from_slice(&123_456_u64.to_ne_bytes());

        let ext = parse_extended_fields(&data);
        assert_eq!(ext.tcpi_pacing_rate, 123_456);
        assert_eq!(ext.tcpi_min_rtt, 0);
        assert_eq!(ext.tcpi_delivery_rate, 0);
    }

    #[test]
    fn test_parse_extended_stops_at_first_short_field() {
        // 4 stray bytes must not be read as tcpi_segs_out
        let data = 77_u32.to_ne_bytes();
        let ext = parse_extended_fields(&data);
        assert_eq!(ext.tcpi_pacing_rate, 0);
        assert_eq!(ext.tcpi_segs_out, 0);
    }

    #[test]
    fn test_tcp_info_to_kernel() {
        let mut basic = unsafe { std::mem::zeroed::<TcpInfoBasic>() };
        basic.tcpi_rtt = 50_000;
        basic.tcpi_rttvar = 5_000;
        basic.tcpi_rto = 204_000;
        basic.tcpi_retransmits = 1;
        basic.tcpi_total_retrans = 10;
        basic.tcpi_snd_mss = 1_448;
        basic.tcpi_snd_cwnd = 20;
        basic.tcpi_snd_ssthresh = 100;

        let ext = TcpInfoExtended {
            tcpi_pacing_rate: 2_000_000,
            tcpi_min_rtt: 5_000,
            tcpi_delivery_rate: 1_250_000,
            ..TcpInfoExtended::default()
        };

        let kernel = tcp_info_to_kernel(&TcpInfo {
            basic,
            extended: Some(ext),
        });

        assert_eq!(kernel.rtt_us, 50_000);
        assert_eq!(kernel.rtt_var_us, 5_000);
        assert_eq!(kernel.rto_us, 204_000);
        assert_eq!(kernel.timeout_retransmits, 1);
        assert_eq!(kernel.total_retransmits, 10);
        assert_eq!(kernel.mss, 1_448);
        assert_eq!(kernel.cwnd, 20);
        assert_eq!(kernel.cwnd_bytes, 20 * 1_448);
        assert_eq!(kernel.ssthresh, 100);
        assert_eq!(kernel.pacing_rate, 2_000_000);
        assert_eq!(kernel.min_rtt_us, 5_000);
        assert_eq!(kernel.delivery_rate, 1_250_000);
    }

    #[test]
    fn test_tcp_info_to_kernel_no_extended() {
        let mut basic = unsafe { std::mem::zeroed::<TcpInfoBasic>() };
        basic.tcpi_rtt = 30_000;
        basic.tcpi_snd_cwnd = 15;
        basic.tcpi_snd_mss = 1_000;

        let kernel = tcp_info_to_kernel(&TcpInfo {
            basic,
            extended: None,
        });

        assert_eq!(kernel.rtt_us, 30_000);
        assert_eq!(kernel.cwnd_bytes, 15_000);
        assert_eq!(kernel.total_retransmits, 0);
        assert_eq!(kernel.min_rtt_us, NOT_AVAILABLE);
        assert_eq!(kernel.delivery_rate, NOT_AVAILABLE);
        assert_eq!(kernel.pacing_rate, NOT_AVAILABLE);
    }

    #[test]
    fn test_unlimited_pacing_rate_is_unknown() {
        assert_eq!(rate_or_unknown(u64::MAX), NOT_AVAILABLE);
        assert_eq!(rate_or_unknown(0), NOT_AVAILABLE);
        assert_eq!(rate_or_unknown(42), 42);
    }
}
