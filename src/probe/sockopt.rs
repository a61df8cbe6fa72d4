//! `getsockopt(2)` plumbing shared by every provider
//!
//! Provides a safe wrapper around the raw syscall plus the decoders for the
//! small scalar options (congestion-control name, max pacing rate).
//!
//! # Unsafe Rust
//!
//! `getsockopt` writes through a raw pointer, so the call itself is `unsafe`.
//! Our strategy mirrors the rest of the crate:
//! 1. Keep the unsafe block to the one syscall
//! 2. Pass a Rust slice as pointer + length, never a typed struct
//! 3. Trust only the byte count the kernel hands back
//! 4. Decode fields with `from_ne_bytes`, never by casting
//!
//! ## Why byte buffers instead of libc structs?
//!
//! The kernel fills `min(optlen, sizeof(its struct))` bytes and reports how
//! many it wrote. Reading into a byte buffer lets one binary run against old
//! and new kernels alike: parsers look at the returned length and pick up
//! only the fields that are actually there.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::NOT_AVAILABLE;

/// Longest congestion-control algorithm name the kernel reports
///
/// Matches `TCP_CA_NAME_MAX` in `include/net/tcp.h` (FreeBSD uses the same
/// value for `TCP_CA_NAME_MAX`).
pub const TCP_CA_NAME_MAX: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Why a kernel probe did not produce a value
///
/// Every variant maps to an errno-equivalent via [`ProbeError::errno`], so a
/// snapshot can keep the code around for diagnostics.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The transport reported itself invalid, or has no descriptor
    #[error("socket is not valid")]
    InvalidSocket,

    /// The platform (or the provider in use) has no such facility
    #[error("not supported on this platform")]
    Unsupported,

    /// The syscall itself failed
    #[error("getsockopt({option}) failed: {source}")]
    Os {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel answered with fewer bytes than the smallest known layout
    #[error("getsockopt({option}) returned {len} bytes (minimum {min})")]
    Truncated {
        option: &'static str,
        len: usize,
        min: usize,
    },

    /// The kernel returned an empty congestion-control name
    #[error("congestion control name is empty")]
    Empty,

    /// The congestion-control name is not valid UTF-8
    #[error("congestion control name is not valid UTF-8")]
    InvalidName,
}

impl ProbeError {
    fn from_io_error(option: &'static str, source: io::Error) -> Self {
        Self::Os { option, source }
    }

    /// errno-equivalent code for this failure
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidSocket => libc::EBADF,
            Self::Unsupported => libc::ENOPROTOOPT,
            Self::Os { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Truncated { .. } | Self::Empty | Self::InvalidName => libc::EINVAL,
        }
    }

    /// Raw OS error, if the syscall produced one
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

// ============================================================================
// SYSCALL WRAPPER
// ============================================================================

/// Read a socket option into `buf`, returning how many bytes the kernel wrote
///
/// # Errors
///
/// - [`ProbeError::InvalidSocket`] for a negative descriptor
/// - [`ProbeError::Os`] when `getsockopt` returns -1 (errno preserved)
pub(crate) fn getsockopt_raw(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    option: &'static str,
    buf: &mut [u8],
) -> Result<usize, ProbeError> {
    if fd < 0 {
        return Err(ProbeError::InvalidSocket);
    }

    let mut len = buf.len() as libc::socklen_t;

    // SAFETY: buf is valid for writes of buf.len() bytes and len says so.
    // The kernel never writes past len and updates it with the real count.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(ProbeError::from_io_error(option, err));
    }

    Ok((len as usize).min(buf.len()))
}

/// `TCP_CONGESTION` query shared by Linux and FreeBSD
#[cfg_attr(
    not(any(target_os = "linux", target_os = "freebsd")),
    allow(dead_code)
)]
pub(crate) fn congestion_control(fd: RawFd, name: libc::c_int) -> Result<String, ProbeError> {
    let mut buf = [0_u8; TCP_CA_NAME_MAX];
    let len = getsockopt_raw(fd, libc::IPPROTO_TCP, name, "TCP_CONGESTION", &mut buf)?;
    decode_ca_name(&buf[..len])
}

/// `SO_MAX_PACING_RATE` query shared by Linux and FreeBSD
///
/// Kernels without the option answer `ENOPROTOOPT`, which we fold into
/// [`ProbeError::Unsupported`].
#[cfg_attr(
    not(any(target_os = "linux", target_os = "freebsd")),
    allow(dead_code)
)]
pub(crate) fn max_pacing_rate(fd: RawFd, name: libc::c_int) -> Result<i64, ProbeError> {
    let mut buf = [0_u8; 8];
    match getsockopt_raw(fd, libc::SOL_SOCKET, name, "SO_MAX_PACING_RATE", &mut buf) {
        Ok(len) => decode_pacing_rate(&buf[..len]),
        Err(err) if err.raw_os_error() == Some(libc::ENOPROTOOPT) => Err(ProbeError::Unsupported),
        Err(err) => Err(err),
    }
}

// ============================================================================
// DECODERS
// ============================================================================

/// Turn the raw `TCP_CONGESTION` bytes into an owned name
///
/// The kernel copies a fixed-size, NUL-padded array. The name ends at the
/// first NUL or at [`TCP_CA_NAME_MAX`] bytes, whichever comes first.
pub(crate) fn decode_ca_name(raw: &[u8]) -> Result<String, ProbeError> {
    let raw = &raw[..raw.len().min(TCP_CA_NAME_MAX)];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

    let name = std::str::from_utf8(&raw[..end])
        .map_err(|_| ProbeError::InvalidName)?
        .trim();

    if name.is_empty() {
        return Err(ProbeError::Empty);
    }

    Ok(name.to_owned())
}

/// Decode `SO_MAX_PACING_RATE`, mapping "unlimited" to [`NOT_AVAILABLE`]
///
/// Linux 4.13+ answers with a u64 when asked with an 8-byte buffer; older
/// kernels (and FreeBSD) answer with a 32-bit value. The all-ones pattern
/// means "no limit configured" in both widths.
pub(crate) fn decode_pacing_rate(raw: &[u8]) -> Result<i64, ProbeError> {
    match raw.len() {
        8 => {
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(raw);
            let rate = u64::from_ne_bytes(bytes);
            if rate == u64::MAX {
                Ok(NOT_AVAILABLE)
            } else {
                Ok(i64::try_from(rate).unwrap_or(NOT_AVAILABLE))
            }
        }
        4 => {
            let mut bytes = [0_u8; 4];
            bytes.copy_from_slice(raw);
            let rate = u32::from_ne_bytes(bytes);
            if rate == u32::MAX {
                Ok(NOT_AVAILABLE)
            } else {
                Ok(i64::from(rate))
            }
        }
        len => Err(ProbeError::Truncated {
            option: "SO_MAX_PACING_RATE",
            len,
            min: 4,
        }),
    }
}

/// Native-endian u32 at `offset`, if the buffer reaches that far
#[inline]
pub(crate) fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
}

/// Native-endian u64 at `offset`, if the buffer reaches that far
#[inline]
pub(crate) fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
}

// ============================================================================
// TESTS
// ============================================================================
