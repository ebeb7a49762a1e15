//! Queue pair handle, capabilities, and work request posting.

use std::io::{self, Error as IoError};
use std::ptr::NonNull;
use std::{mem, ptr};

use rdma_sys::*;
use thiserror::Error;

use crate::cm::endpoint::InvalidStateError;

use super::mr::MrSlice;

/// Work request identifier, designated by the caller to correlate a posted
/// work request with its completion entry.
pub type WrId = u64;

/// Queue pair capability attributes.
///
/// The values passed at endpoint creation are upper bounds: the adapter may
/// grant less, most notably for `max_inline_data`. The granted values are
/// read back once after creation and exposed through [`Qp::caps`]; consult
/// that snapshot, never the requested values, before relying on a
/// capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    /// Maximum number of outstanding work requests in the send queue.
    pub max_send_wr: u32,

    /// Maximum number of outstanding work requests in the receive queue.
    pub max_recv_wr: u32,

    /// Maximum number of scatter/gather elements per send work request.
    pub max_send_sge: u32,

    /// Maximum number of scatter/gather elements per receive work request.
    pub max_recv_sge: u32,

    /// Maximum payload (in bytes) that can be posted inline, i.e. copied
    /// into the command descriptor at post time instead of being fetched
    /// from the registered region.
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    /// A general-purpose setting: 128 outstanding send/recv work requests,
    /// 16 SGEs per work request, 64 bytes of inline data.
    ///
    /// **NOTE:** the underlying device may not support these values.
    fn default() -> Self {
        QpCaps {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 16,
            max_recv_sge: 16,
            max_inline_data: 64,
        }
    }
}

impl QpCaps {
    /// Build the `ibv_qp_init_attr` handed to the connection manager at
    /// endpoint creation. The CM fills in the completion queues itself.
    pub(crate) fn to_init_attr(self, sq_sig_all: bool) -> ibv_qp_init_attr {
        ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: ptr::null_mut(),
            recv_cq: ptr::null_mut(),
            srq: ptr::null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: self.max_send_wr,
                max_recv_wr: self.max_recv_wr,
                max_send_sge: self.max_send_sge,
                max_recv_sge: self.max_recv_sge,
                max_inline_data: self.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: sq_sig_all as i32,
        }
    }
}

/// Work request posting error.
#[derive(Debug, Error)]
pub enum PostError {
    /// The owning endpoint is not in a state that allows this post.
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    /// The scatter/gather list is longer than the granted capability.
    #[error("scatter-gather list has {given} elements, capability allows {allowed}")]
    TooManySges { given: usize, allowed: u32 },

    /// An inline send was requested for a payload larger than the granted
    /// `max_inline_data`.
    #[error("inline payload of {len} bytes exceeds granted maximum of {max}")]
    InlineTooLarge { len: usize, max: u32 },

    /// A slice was registered under a different protection domain than the
    /// queue pair's.
    #[error("memory region belongs to a different protection domain")]
    PdMismatch,

    /// The adapter rejected the work request.
    #[error("failed to post work request")]
    Post(#[source] io::Error),
}

/// Queue pair.
///
/// A non-owning handle to the RC queue pair the connection manager created
/// for an endpoint, together with the effective capability snapshot taken
/// right after creation. The endpoint owns the underlying `ibv_qp` and
/// destroys it; posting goes through the endpoint so that lifecycle state
/// is enforced.
#[derive(Debug)]
pub struct Qp {
    qp: NonNull<ibv_qp>,
    pd: NonNull<ibv_pd>,
    caps: QpCaps,
}

impl Qp {
    pub(crate) fn new(qp: NonNull<ibv_qp>, pd: NonNull<ibv_pd>, caps: QpCaps) -> Self {
        Self { qp, pd, caps }
    }

    /// Read the effective capabilities granted by the adapter.
    pub(crate) fn query_caps(qp: NonNull<ibv_qp>) -> io::Result<QpCaps> {
        // SAFETY: POD types.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };

        // SAFETY: FFI.
        let ret = unsafe {
            ibv_query_qp(
                qp.as_ptr(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_CAP.0 as i32,
                &mut init_attr,
            )
        };
        if ret != 0 {
            return Err(IoError::from_raw_os_error(ret));
        }
        Ok(QpCaps {
            max_send_wr: attr.cap.max_send_wr,
            max_recv_wr: attr.cap.max_recv_wr,
            max_send_sge: attr.cap.max_send_sge,
            max_recv_sge: attr.cap.max_recv_sge,
            max_inline_data: attr.cap.max_inline_data,
        })
    }

    /// Get the underlying `ibv_qp` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_qp {
        self.qp.as_ptr()
    }

    pub(crate) fn pd(&self) -> NonNull<ibv_pd> {
        self.pd
    }

    /// Get the effective capability snapshot.
    #[inline]
    pub fn caps(&self) -> QpCaps {
        self.caps
    }

    /// Whether a payload of `len` bytes fits the granted inline capability.
    #[inline]
    pub fn supports_inline(&self, len: usize) -> bool {
        len <= self.caps.max_inline_data as usize
    }

    fn check_pd(&self, local: &[MrSlice]) -> Result<(), PostError> {
        if local.iter().any(|s| s.pd() != self.pd.as_ptr()) {
            return Err(PostError::PdMismatch);
        }
        Ok(())
    }

    /// Post a send work request. A fresh descriptor is built on every call;
    /// descriptors are never reused.
    ///
    /// With `inline`, the payload is copied into the command stream at post
    /// time and the registered region may be reused immediately; the total
    /// length must fit the granted `max_inline_data`.
    pub(crate) fn post_send(
        &self,
        local: &[MrSlice],
        wr_id: WrId,
        signal: bool,
        inline: bool,
    ) -> Result<(), PostError> {
        if local.len() > self.caps.max_send_sge as usize {
            return Err(PostError::TooManySges {
                given: local.len(),
                allowed: self.caps.max_send_sge,
            });
        }
        self.check_pd(local)?;

        let total_len: usize = local.iter().map(|s| s.len()).sum();
        if inline && total_len > self.caps.max_inline_data as usize {
            return Err(PostError::InlineTooLarge {
                len: total_len,
                max: self.caps.max_inline_data,
            });
        }

        let mut sgl = build_sgl(local);
        let mut send_flags = 0;
        if signal {
            send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        if inline {
            send_flags |= ibv_send_flags::IBV_SEND_INLINE.0;
        }

        // SAFETY: POD type.
        let mut wr = ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: if sgl.is_empty() {
                ptr::null_mut()
            } else {
                sgl.as_mut_ptr()
            },
            num_sge: local.len() as i32,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags,
            ..unsafe { mem::zeroed() }
        };

        let ret = {
            let mut bad_wr = ptr::null_mut();
            // SAFETY: FFI.
            unsafe { ibv_post_send(self.qp.as_ptr(), &mut wr, &mut bad_wr) }
        };
        if ret != 0 {
            return Err(PostError::Post(IoError::from_raw_os_error(ret)));
        }
        Ok(())
    }

    /// Post a receive work request. A fresh descriptor is built on every
    /// call; descriptors are never reused.
    pub(crate) fn post_recv(&self, local: &[MrSlice], wr_id: WrId) -> Result<(), PostError> {
        if local.len() > self.caps.max_recv_sge as usize {
            return Err(PostError::TooManySges {
                given: local.len(),
                allowed: self.caps.max_recv_sge,
            });
        }
        self.check_pd(local)?;

        let mut sgl = build_sgl(local);
        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: if sgl.is_empty() {
                ptr::null_mut()
            } else {
                sgl.as_mut_ptr()
            },
            num_sge: local.len() as i32,
        };

        let ret = {
            let mut bad_wr = ptr::null_mut();
            // SAFETY: FFI.
            unsafe { ibv_post_recv(self.qp.as_ptr(), &mut wr, &mut bad_wr) }
        };
        if ret != 0 {
            return Err(PostError::Post(IoError::from_raw_os_error(ret)));
        }
        Ok(())
    }
}

fn build_sgl(local: &[MrSlice]) -> Vec<ibv_sge> {
    local
        .iter()
        .map(|s| ibv_sge {
            addr: s.addr() as u64,
            length: s.len() as u32,
            lkey: s.lkey(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps() {
        let caps = QpCaps::default();
        assert_eq!(caps.max_send_wr, 128);
        assert_eq!(caps.max_recv_wr, 128);
        assert_eq!(caps.max_send_sge, 16);
        assert_eq!(caps.max_recv_sge, 16);
        assert_eq!(caps.max_inline_data, 64);
    }

    #[test]
    fn init_attr_mirrors_caps() {
        let caps = QpCaps {
            max_send_wr: 300,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 16,
        };
        let attr = caps.to_init_attr(true);
        assert_eq!(attr.cap.max_send_wr, 300);
        assert_eq!(attr.cap.max_inline_data, 16);
        assert_eq!(attr.qp_type, ibv_qp_type::IBV_QPT_RC);
        assert_eq!(attr.sq_sig_all, 1);
        assert!(attr.send_cq.is_null());
    }
}
