//! Completion queues and work completion entries.

use std::io::{self, Error as IoError};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;
use std::{fmt, hint, mem, ptr};

use quanta::Instant;
use rdma_sys::*;
use thiserror::Error;

use super::qp::WrId;

/// Status of a completion queue entry.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum WcStatus {
    /// The work request (and every unsignaled one posted before it) finished
    /// and its buffers are ready for reuse.
    #[error("success")]
    Success,

    /// A send exceeded the port limit, or a receive buffer was too small for
    /// the incoming message.
    #[error("local length error")]
    LocLenErr,

    /// Internal QP consistency error while processing the work request.
    #[error("local QP operation error")]
    LocQpOpErr,

    #[error("local EE context operation error")]
    LocEecOpErr,

    /// A scatter/gather entry did not reference a memory region valid for
    /// the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// The work request was still outstanding when the QP transitioned into
    /// the error state.
    #[error("work request flushed")]
    WrFlushErr,

    #[error("memory window bind error")]
    MwBindErr,

    /// Unexpected transport-layer opcode from the responder.
    #[error("bad response error")]
    BadRespErr,

    #[error("local access error")]
    LocAccessErr,

    /// The responder rejected the message (unsupported operation or not
    /// enough receive buffering).
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// Protection error on the remote data buffer.
    #[error("remote access error")]
    RemAccessErr,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr,

    /// The transport retry counter was exceeded; the remote side never
    /// acknowledged the message.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// The receiver-not-ready retry count was exceeded; the remote side has
    /// no receive work request posted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    #[error("local RDD violation error")]
    LocRddViolErr,

    #[error("remote invalid RD request")]
    RemInvRdReqErr,

    #[error("remote aborted error")]
    RemAbortErr,

    #[error("invalid EE context number")]
    InvEecnErr,

    #[error("invalid EE context state error")]
    InvEecStateErr,

    /// A fatal error that may not be recoverable.
    #[error("fatal error")]
    FatalErr,

    #[error("response timeout error")]
    RespTimeoutErr,

    #[error("tag matching error")]
    TmErr,

    #[error("rendezvous request tagged buffer insufficient")]
    TmRndvIncomplete,

    /// Any other adapter-reported error.
    #[error("general error")]
    GeneralErr,
}

impl From<u32> for WcStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => WcStatus::LocQpOpErr,
            ibv_wc_status::IBV_WC_LOC_EEC_OP_ERR => WcStatus::LocEecOpErr,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
            ibv_wc_status::IBV_WC_MW_BIND_ERR => WcStatus::MwBindErr,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => WcStatus::BadRespErr,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => WcStatus::LocAccessErr,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
            ibv_wc_status::IBV_WC_REM_OP_ERR => WcStatus::RemOpErr,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
            ibv_wc_status::IBV_WC_LOC_RDD_VIOL_ERR => WcStatus::LocRddViolErr,
            ibv_wc_status::IBV_WC_REM_INV_RD_REQ_ERR => WcStatus::RemInvRdReqErr,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => WcStatus::RemAbortErr,
            ibv_wc_status::IBV_WC_INV_EECN_ERR => WcStatus::InvEecnErr,
            ibv_wc_status::IBV_WC_INV_EEC_STATE_ERR => WcStatus::InvEecStateErr,
            ibv_wc_status::IBV_WC_FATAL_ERR => WcStatus::FatalErr,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => WcStatus::RespTimeoutErr,
            ibv_wc_status::IBV_WC_TM_ERR => WcStatus::TmErr,
            ibv_wc_status::IBV_WC_TM_RNDV_INCOMPLETE => WcStatus::TmRndvIncomplete,
            _ => WcStatus::GeneralErr,
        }
    }
}

/// Completion queue polling error.
///
/// A [`PollError::WorkCompletion`] is fatal for the owning queue pair: the
/// adapter has moved it into the error state and it must be torn down, not
/// reused.
#[derive(Debug, Error)]
pub enum PollError {
    /// The poll call itself failed.
    #[error("completion queue poll failed")]
    Poll(#[source] io::Error),

    /// A polled entry reported a non-success status.
    #[error("work request {wr_id:#x} failed")]
    WorkCompletion {
        wr_id: WrId,
        #[source]
        status: WcStatus,
    },

    /// The deadline passed with completions still outstanding.
    #[error("timed out waiting for completions ({missing} of {wanted} outstanding)")]
    Timeout { wanted: usize, missing: usize },
}

/// Work completion entry.
///
/// Transparently wraps an `ibv_wc` polled from a completion queue. The
/// `wr_id` correlates the entry with the work request that produced it.
#[repr(transparent)]
pub struct Wc(ibv_wc);

impl Wc {
    /// Get the identifier of the originating work request.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.0.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from(self.0.status)
    }

    /// Get the number of bytes transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.0.byte_len as usize
    }

    /// Get the completion status as a `Result`, carrying the transferred
    /// byte count on success.
    #[inline]
    pub fn result(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }
}

impl Default for Wc {
    /// Create a zeroed work completion entry.
    fn default() -> Self {
        // SAFETY: POD type.
        unsafe { mem::zeroed() }
    }
}

impl Clone for Wc {
    fn clone(&self) -> Self {
        // SAFETY: `ibv_wc` is trivially copyable.
        unsafe {
            let mut wc = mem::zeroed();
            ptr::copy_nonoverlapping(&self.0, &mut wc, 1);
            Wc(wc)
        }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Completion queue.
///
/// A non-owning view of one of the completion queues the connection
/// manager created alongside the queue pair. The borrow ties it to the
/// endpoint so it cannot outlive the queue it polls.
///
/// Polling is non-blocking; [`Cq::drain`] and [`Cq::poll_one`] busy-wait
/// with an optional deadline, which is the only way the asynchronous
/// hardware completion becomes observable to the caller.
#[derive(Debug, Clone, Copy)]
pub struct Cq<'a> {
    cq: NonNull<ibv_cq>,
    _marker: PhantomData<&'a ()>,
}

impl<'a> Cq<'a> {
    pub(crate) fn new(cq: NonNull<ibv_cq>) -> Self {
        Self {
            cq,
            _marker: PhantomData,
        }
    }

    /// Get the underlying `ibv_cq` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Non-blocking poll.
    ///
    /// Return the number of entries written into `wc`, possibly zero. The
    /// status of each returned entry is not checked.
    pub fn poll(&self, wc: &mut [Wc]) -> Result<usize, PollError> {
        // SAFETY: FFI; `Wc` is a transparent wrapper of `ibv_wc`.
        let num = unsafe {
            ibv_poll_cq(self.cq.as_ptr(), wc.len() as i32, wc.as_mut_ptr().cast())
        };
        if num < 0 {
            return Err(PollError::Poll(IoError::last_os_error()));
        }
        Ok(num as usize)
    }

    /// Busy-poll until a single completion arrives and return it.
    ///
    /// Fails with [`PollError::WorkCompletion`] if the entry carries an
    /// error status, or [`PollError::Timeout`] once `timeout` has elapsed.
    /// `None` spins without bound.
    pub fn poll_one(&self, timeout: Option<Duration>) -> Result<Wc, PollError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut wc = [Wc::default()];
        loop {
            if self.poll(&mut wc)? > 0 {
                let entry = wc[0].clone();
                entry.result().map_err(|status| PollError::WorkCompletion {
                    wr_id: entry.wr_id(),
                    status,
                })?;
                return Ok(entry);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(PollError::Timeout {
                    wanted: 1,
                    missing: 1,
                });
            }
            hint::spin_loop();
        }
    }

    /// Busy-poll until `count` successful completions have been consumed.
    ///
    /// The first entry with an error status aborts the drain with
    /// [`PollError::WorkCompletion`]. With a `timeout`, the wait is bounded
    /// and fails with [`PollError::Timeout`]; `None` spins without bound.
    pub fn drain(&self, count: usize, timeout: Option<Duration>) -> Result<(), PollError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut wc = vec![Wc::default(); count];
        let mut done = 0;
        while done < count {
            let polled = self.poll(&mut wc[..count - done])?;
            if polled == 0 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(PollError::Timeout {
                        wanted: count,
                        missing: count - done,
                    });
                }
                hint::spin_loop();
                continue;
            }
            for entry in &wc[..polled] {
                entry.result().map_err(|status| PollError::WorkCompletion {
                    wr_id: entry.wr_id(),
                    status,
                })?;
            }
            done += polled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wc_with(wr_id: WrId, status: u32, byte_len: u32) -> Wc {
        let mut raw: ibv_wc = unsafe { mem::zeroed() };
        raw.wr_id = wr_id;
        raw.status = status;
        raw.byte_len = byte_len;
        Wc(raw)
    }

    #[test]
    fn zeroed_wc_is_success() {
        let wc = Wc::default();
        assert_eq!(wc.status(), WcStatus::Success);
        assert_eq!(wc.result().unwrap(), 0);
    }

    #[test]
    fn wc_correlates_and_reports_bytes() {
        let wc = wc_with(42, ibv_wc_status::IBV_WC_SUCCESS, 24);
        assert_eq!(wc.wr_id(), 42);
        assert_eq!(wc.result().unwrap(), 24);
    }

    #[test]
    fn errored_wc_surfaces_status() {
        let wc = wc_with(7, ibv_wc_status::IBV_WC_RETRY_EXC_ERR, 0);
        assert_eq!(wc.result().unwrap_err(), WcStatus::RetryExcErr);

        let wc = wc_with(8, ibv_wc_status::IBV_WC_WR_FLUSH_ERR, 0);
        assert_eq!(wc.result().unwrap_err(), WcStatus::WrFlushErr);
    }

    #[test]
    fn unknown_status_maps_to_general_error() {
        assert_eq!(WcStatus::from(0xdead), WcStatus::GeneralErr);
    }
}
