//! Memory region registration.

use std::ffi::c_void;
use std::io::{self, Error as IoError};
use std::marker::PhantomData;
use std::ops::{BitOr, BitOrAssign, Deref, DerefMut};
use std::ptr::NonNull;

use log::trace;
use rdma_sys::*;
use thiserror::Error;

use crate::cm::endpoint::Endpoint;

/// Memory region access permissions granted to the adapter and, for the
/// remote flags, to the peer.
///
/// A pure send buffer needs no permissions at all ([`Permission::EMPTY`]);
/// a receive buffer needs [`Permission::LOCAL_WRITE`] because the adapter
/// writes the incoming payload into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission(ibv_access_flags);

impl Permission {
    pub const EMPTY: Self = Self(ibv_access_flags(0));
    pub const LOCAL_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_LOCAL_WRITE);
    pub const REMOTE_READ: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_READ);
    pub const REMOTE_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_WRITE);
    pub const REMOTE_ATOMIC: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC);
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 .0 as _
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Memory registration error. Fatal for the buffer in question; there is
/// nothing to retry.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Zero-length buffers cannot be registered.
    #[error("cannot register an empty buffer")]
    EmptyBuffer,

    /// The adapter rejected the registration (bad access-flag combination
    /// or memory pinning failure).
    #[error("memory registration failed")]
    Register(#[source] io::Error),
}

/// A registered memory region over an owned buffer.
///
/// The buffer is heap-allocated, pinned for the lifetime of the region,
/// and registered under the protection domain of the endpoint it was
/// created from. The region is deregistered on drop; the caller must have
/// drained every work request referencing it by then.
///
/// The borrow of the endpoint keeps the region from outliving the
/// protection domain it belongs to.
pub struct Mr<'a> {
    buf: Box<[u8]>,
    mr: NonNull<ibv_mr>,
    pd: *mut ibv_pd,
    _ep: PhantomData<&'a Endpoint>,
}

impl<'a> Mr<'a> {
    /// Allocate a zero-filled buffer of `len` bytes and register it.
    pub fn zeroed(ep: &'a Endpoint, len: usize, perm: Permission) -> Result<Self, RegistrationError> {
        if len == 0 {
            return Err(RegistrationError::EmptyBuffer);
        }
        Self::reg(ep, vec![0u8; len].into_boxed_slice(), perm)
    }

    /// Allocate a buffer holding a copy of `content` and register it.
    pub fn with_content(
        ep: &'a Endpoint,
        content: &[u8],
        perm: Permission,
    ) -> Result<Self, RegistrationError> {
        if content.is_empty() {
            return Err(RegistrationError::EmptyBuffer);
        }
        Self::reg(ep, content.to_vec().into_boxed_slice(), perm)
    }

    fn reg(ep: &'a Endpoint, buf: Box<[u8]>, perm: Permission) -> Result<Self, RegistrationError> {
        let pd = ep.pd().as_ptr();
        // SAFETY: FFI; `buf` is heap-pinned and outlives the registration.
        let mr = unsafe {
            ibv_reg_mr(
                pd,
                buf.as_ptr() as *mut c_void,
                buf.len(),
                perm.into(),
            )
        };
        let mr = NonNull::new(mr).ok_or_else(|| RegistrationError::Register(IoError::last_os_error()))?;
        trace!("registered {}B memory region", buf.len());
        Ok(Self {
            buf,
            mr,
            pd,
            _ep: PhantomData,
        })
    }

    /// Get the start address of the registered buffer.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }

    /// Get the length of the registered buffer.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    /// Get an [`MrSlice`] covering the whole region, usable in work
    /// requests.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice {
            addr: self.addr(),
            len: self.len(),
            lkey: self.lkey(),
            pd: self.pd,
            _marker: PhantomData,
        }
    }
}

impl Deref for Mr<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for Mr<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for Mr<'_> {
    fn drop(&mut self) {
        // SAFETY: registered exactly once, deregistered exactly once.
        let ret = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if ret != 0 {
            log::error!("cannot deregister memory region: errno {ret}");
        }
    }
}

/// A (address, length, local key) descriptor referencing a registered
/// buffer, plus the identity of the protection domain the registration
/// belongs to. Posting verifies the domain against the queue pair's.
#[derive(Debug, Clone, Copy)]
pub struct MrSlice<'a> {
    addr: *mut u8,
    len: usize,
    lkey: u32,
    pd: *mut ibv_pd,
    _marker: PhantomData<&'a ()>,
}

impl MrSlice<'_> {
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub(crate) fn pd(&self) -> *mut ibv_pd {
        self.pd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_combine() {
        let send = Permission::EMPTY;
        assert_eq!(i32::from(send), 0);

        let recv = Permission::LOCAL_WRITE;
        assert_ne!(i32::from(recv), 0);

        let mut remote = Permission::REMOTE_READ | Permission::REMOTE_WRITE;
        remote |= Permission::LOCAL_WRITE;
        let raw = i32::from(remote);
        assert_ne!(raw & i32::from(Permission::REMOTE_READ), 0);
        assert_ne!(raw & i32::from(Permission::REMOTE_WRITE), 0);
        assert_ne!(raw & i32::from(Permission::LOCAL_WRITE), 0);
        assert_eq!(raw & i32::from(Permission::REMOTE_ATOMIC), 0);
    }
}
