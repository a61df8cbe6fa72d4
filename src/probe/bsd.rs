//! FreeBSD `tcp_info` and Darwin `tcp_connection_info` decoding
//!
//! Both kernels export a TCP diagnostics block that *looks* like Linux's but
//! differs where it matters:
//! - FreeBSD shares the Linux prefix layout, yet reports `tcpi_snd_cwnd` and
//!   `tcpi_snd_ssthresh` in bytes and keeps the lifetime retransmit counter
//!   in a FreeBSD-only tail (`tcpi_snd_rexmitpack`)
//! - Darwin (`TCP_CONNECTION_INFO`) has its own layout, with RTT and RTO in
//!   milliseconds and the window sizes in bytes
//!
//! We decode by byte offset instead of casting to a mirrored struct: the
//! layouts contain C bitfields that `repr(C)` cannot express.

// The decoders compile everywhere so they stay testable
#![cfg_attr(
    not(any(target_os = "freebsd", target_os = "macos", target_os = "ios")),
    allow(dead_code)
)]

use super::sockopt::{u32_at, u64_at, ProbeError};
use super::KernelTcpInfo;
use crate::NOT_AVAILABLE;

// ============================================================================
// FREEBSD struct tcp_info OFFSETS (netinet/tcp.h)
// ============================================================================

mod freebsd {
    pub const RTO: usize = 8;
    pub const SND_MSS: usize = 16;
    pub const RTT: usize = 68;
    pub const RTTVAR: usize = 72;
    pub const SND_SSTHRESH: usize = 76;
    pub const SND_CWND: usize = 80;
    pub const SND_REXMITPACK: usize = 120;
    /// Bytes needed to reach the end of `tcpi_snd_rexmitpack`
    pub const MIN_LEN: usize = SND_REXMITPACK + 4;
}

// ============================================================================
// DARWIN struct tcp_connection_info OFFSETS (netinet/tcp.h)
// ============================================================================

mod darwin {
    pub const RTO: usize = 12;
    pub const MAXSEG: usize = 16;
    pub const SND_SSTHRESH: usize = 20;
    pub const SND_CWND: usize = 24;
    pub const SRTT: usize = 44;
    pub const RTTVAR: usize = 48;
    pub const TXRETRANSMITPACKETS: usize = 104;
    /// `sizeof(struct tcp_connection_info)`
    pub const MIN_LEN: usize = TXRETRANSMITPACKETS + 8;
}

/// `ceil(bytes / mss)`, or unknown when the MSS isn't known
fn bytes_to_segments(bytes: i64, mss: i64) -> i64 {
    if mss > 0 && bytes >= 0 {
        (bytes + mss - 1) / mss
    } else {
        NOT_AVAILABLE
    }
}

fn truncated(len: usize, min: usize, option: &'static str) -> ProbeError {
    ProbeError::Truncated { option, len, min }
}

/// Decode a FreeBSD `TCP_INFO` answer
///
/// FreeBSD has no "timeout retransmits" counter, so `timeout_retransmits`
/// stays unknown. Byte-denominated windows are converted to segments.
pub(crate) fn parse_freebsd_tcp_info(data: &[u8]) -> Result<KernelTcpInfo, ProbeError> {
    let field = |offset| u32_at(data, offset).map(i64::from);
    let (
        Some(rto),
        Some(mss),
        Some(rtt),
        Some(rttvar),
        Some(ssthresh_bytes),
        Some(cwnd_bytes),
        Some(rexmit),
    ) = (
        field(freebsd::RTO),
        field(freebsd::SND_MSS),
        field(freebsd::RTT),
        field(freebsd::RTTVAR),
        field(freebsd::SND_SSTHRESH),
        field(freebsd::SND_CWND),
        field(freebsd::SND_REXMITPACK),
    )
    else {
        return Err(truncated(data.len(), freebsd::MIN_LEN, "TCP_INFO"));
    };

    Ok(KernelTcpInfo {
        rtt_us: rtt,
        rtt_var_us: rttvar,
        rto_us: rto,
        total_retransmits: rexmit,
        mss,
        cwnd: bytes_to_segments(cwnd_bytes, mss),
        cwnd_bytes,
        ssthresh: bytes_to_segments(ssthresh_bytes, mss),
        ..KernelTcpInfo::default()
    })
}

/// Decode a Darwin `TCP_CONNECTION_INFO` answer
///
/// Darwin reports RTT, RTT variance and RTO in milliseconds; we scale them
/// to microseconds so every platform shares one unit.
pub(crate) fn parse_darwin_connection_info(data: &[u8]) -> Result<KernelTcpInfo, ProbeError> {
    let field = |offset| u32_at(data, offset).map(i64::from);
    let (
        Some(rto_ms),
        Some(mss),
        Some(ssthresh_bytes),
        Some(cwnd_bytes),
        Some(srtt_ms),
        Some(rttvar_ms),
        Some(rexmit),
    ) = (
        field(darwin::RTO),
        field(darwin::MAXSEG),
        field(darwin::SND_SSTHRESH),
        field(darwin::SND_CWND),
        field(darwin::SRTT),
        field(darwin::RTTVAR),
        u64_at(data, darwin::TXRETRANSMITPACKETS),
    )
    else {
        return Err(truncated(data.len(), darwin::MIN_LEN, "TCP_CONNECTION_INFO"));
    };

    Ok(KernelTcpInfo {
        rtt_us: srtt_ms * 1000,
        rtt_var_us: rttvar_ms * 1000,
        rto_us: rto_ms * 1000,
        total_retransmits: i64::try_from(rexmit).unwrap_or(NOT_AVAILABLE),
        mss,
        cwnd: bytes_to_segments(cwnd_bytes, mss),
        cwnd_bytes,
        ssthresh: bytes_to_segments(ssthresh_bytes, mss),
        ..KernelTcpInfo::default()
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    #[test]
    fn test_freebsd_parse() {
        let mut data = vec![0_u8; 240];
        put_u32(&mut data, freebsd::RTO, 201_000);
        put_u32(&mut data, freebsd::SND_MSS, 1_000);
        put_u32(&mut data, freebsd::RTT, 12_500);
        put_u32(&mut data, freebsd::RTTVAR, 800);
        put_u32(&mut data, freebsd::SND_SSTHRESH, 64_000);
        put_u32(&mut data, freebsd::SND_CWND, 10_500);
        put_u32(&mut data, freebsd::SND_REXMITPACK, 3);

        let info = parse_freebsd_tcp_info(&data).unwrap();
        assert_eq!(info.rtt_us, 12_500);
        assert_eq!(info.rtt_var_us, 800);
        assert_eq!(info.rto_us, 201_000);
        assert_eq!(info.total_retransmits, 3);
        assert_eq!(info.timeout_retransmits, NOT_AVAILABLE);
        assert_eq!(info.cwnd_bytes, 10_500);
        assert_eq!(info.cwnd, 11); // rounded up
        assert_eq!(info.ssthresh, 64);
        assert_eq!(info.min_rtt_us, NOT_AVAILABLE);
    }

    #[test]
    fn test_freebsd_truncated() {
        let err = parse_freebsd_tcp_info(&[0_u8; 104]).unwrap_err();
        assert!(matches!(err, ProbeError::Truncated { len: 104, min: 124, .. }));
    }

    #[test]
    fn test_darwin_parse_scales_ms() {
        let mut data = vec![0_u8; darwin::MIN_LEN];
        put_u32(&mut data, darwin::RTO, 230);
        put_u32(&mut data, darwin::MAXSEG, 1_448);
        put_u32(&mut data, darwin::SND_SSTHRESH, 1_073_725_440);
        put_u32(&mut data, darwin::SND_CWND, 14_480);
        put_u32(&mut data, darwin::SRTT, 12);
        put_u32(&mut data, darwin::RTTVAR, 3);
        data[darwin::TXRETRANSMITPACKETS..darwin::TXRETRANSMITPACKETS + 8]
            .copy_from_slice(&7_u64.to_ne_bytes());

        let info = parse_darwin_connection_info(&data).unwrap();
        assert_eq!(info.rtt_us, 12_000);
        assert_eq!(info.rtt_var_us, 3_000);
        assert_eq!(info.rto_us, 230_000);
        assert_eq!(info.mss, 1_448);
        assert_eq!(info.cwnd_bytes, 14_480);
        assert_eq!(info.cwnd, 10);
        assert_eq!(info.total_retransmits, 7);
        assert_eq!(info.timeout_retransmits, NOT_AVAILABLE);
    }

    #[test]
    fn test_darwin_truncated() {
        let err = parse_darwin_connection_info(&[0_u8; 100]).unwrap_err();
        assert!(matches!(err, ProbeError::Truncated { len: 100, min: 112, .. }));
    }

    #[test]
    fn test_zero_mss_leaves_segments_unknown() {
        assert_eq!(bytes_to_segments(14_480, 0), NOT_AVAILABLE);
        assert_eq!(bytes_to_segments(0, 1_448), 0);
    }
}
