//! RDMA address resolution.

use std::ffi::{CString, NulError};
use std::io::{self, Error as IoError};
use std::ptr::{self, NonNull};
use std::mem;

use log::debug;
use rdma_sys::*;
use thiserror::Error;

/// RDMA port space of a resolved endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    /// Reliable, connection-oriented transport (`RDMA_PS_TCP`).
    Tcp,
    /// Unreliable datagram transport (`RDMA_PS_UDP`).
    Udp,
}

impl PortSpace {
    pub(crate) fn as_raw(self) -> i32 {
        match self {
            PortSpace::Tcp => rdma_port_space::RDMA_PS_TCP as i32,
            PortSpace::Udp => rdma_port_space::RDMA_PS_UDP as i32,
        }
    }
}

/// Hints constraining an address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfoHints {
    /// Requested port space.
    pub port_space: PortSpace,
    /// Resolve for the passive (listening) side instead of a destination.
    pub passive: bool,
}

impl AddrInfoHints {
    /// Hints for the active (connecting) side.
    pub fn active(port_space: PortSpace) -> Self {
        Self {
            port_space,
            passive: false,
        }
    }

    /// Hints for the passive (listening) side.
    pub fn passive(port_space: PortSpace) -> Self {
        Self {
            port_space,
            passive: true,
        }
    }
}

/// Address resolution error. Fatal; resolution is never retried internally.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The node or service string contains an interior NUL byte.
    #[error("address or service string contains an interior NUL byte")]
    InvalidInput(#[from] NulError),

    /// The lookup itself failed (unknown name, unusable hints, or no RDMA
    /// device able to reach the destination).
    #[error("rdma address lookup failed")]
    LookupFailed(#[source] io::Error),
}

/// A resolved endpoint descriptor.
///
/// Owns the `rdma_addrinfo` chain returned by `rdma_getaddrinfo` and frees
/// it on drop. An instance is consumed exactly once, by
/// [`Endpoint::create`](crate::Endpoint::create) or
/// [`Listener::bind`](crate::Listener::bind).
#[derive(Debug)]
pub struct AddrInfo {
    ai: NonNull<rdma_addrinfo>,
}

impl AddrInfo {
    /// Resolve a node/service pair into an endpoint descriptor.
    ///
    /// `node = None` is only meaningful with passive hints and resolves the
    /// wildcard address for binding.
    pub fn resolve(
        node: Option<&str>,
        service: &str,
        hints: AddrInfoHints,
    ) -> Result<Self, ResolutionError> {
        let node_c = node.map(CString::new).transpose()?;
        let service_c = CString::new(service)?;

        // SAFETY: POD type.
        let mut raw_hints = unsafe { mem::zeroed::<rdma_addrinfo>() };
        raw_hints.ai_port_space = hints.port_space.as_raw();
        if hints.passive {
            raw_hints.ai_flags = RAI_PASSIVE as i32;
        }

        let node_ptr = node_c.as_ref().map_or(ptr::null(), |s| s.as_ptr());
        let mut res: *mut rdma_addrinfo = ptr::null_mut();
        // SAFETY: FFI; the C strings outlive the call and `res` is only
        // read back on success.
        let ret = unsafe { rdma_getaddrinfo(node_ptr, service_c.as_ptr(), &raw_hints, &mut res) };
        if ret != 0 {
            return Err(ResolutionError::LookupFailed(IoError::last_os_error()));
        }
        let ai =
            NonNull::new(res).ok_or_else(|| ResolutionError::LookupFailed(IoError::last_os_error()))?;

        debug!(
            "resolved {}:{} ({:?})",
            node.unwrap_or("<wildcard>"),
            service,
            hints.port_space
        );
        Ok(Self { ai })
    }

    /// Get the underlying `rdma_addrinfo` pointer.
    pub(crate) fn as_raw(&self) -> *mut rdma_addrinfo {
        self.ai.as_ptr()
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        // SAFETY: the chain was allocated by `rdma_getaddrinfo` and is
        // freed exactly once.
        unsafe { rdma_freeaddrinfo(self.ai.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_nul_is_rejected_before_lookup() {
        let err = AddrInfo::resolve(Some("bad\0host"), "9002", AddrInfoHints::active(PortSpace::Tcp))
            .unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidInput(_)));

        let err =
            AddrInfo::resolve(Some("host"), "90\002", AddrInfoHints::active(PortSpace::Tcp))
                .unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidInput(_)));
    }

    #[test]
    fn hints_constructors() {
        let active = AddrInfoHints::active(PortSpace::Tcp);
        assert!(!active.passive);
        let passive = AddrInfoHints::passive(PortSpace::Tcp);
        assert!(passive.passive);
        assert_eq!(active.port_space, passive.port_space);
    }
}
