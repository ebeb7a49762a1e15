//! Connected endpoints and the listener that produces them.

use std::cell::Cell;
use std::io::{self, Error as IoError};
use std::ptr::{self, NonNull};

use log::debug;
use rdma_sys::*;
use thiserror::Error;

use crate::rdma::cq::Cq;
use crate::rdma::mr::MrSlice;
use crate::rdma::qp::{PostError, Qp, QpCaps, WrId};

use super::addrinfo::AddrInfo;

/// Lifecycle state of a connection endpoint.
///
/// Transitions are one-way: `Created → Connected → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Endpoint and queue pair allocated; not yet connected. Receive work
    /// requests may already be posted.
    Created,
    /// Handshake completed; sends and receives may be posted.
    Connected,
    /// Connection torn down; no further posting is allowed.
    Disconnected,
}

/// An operation was attempted in a lifecycle state that does not allow it.
/// This is a programmer error, not a runtime condition to recover from.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{op} is invalid in the {state:?} state")]
pub struct InvalidStateError {
    /// The rejected operation.
    pub op: &'static str,
    /// The state the endpoint was in.
    pub state: EndpointState,
}

fn expect_state(
    actual: EndpointState,
    allowed: &[EndpointState],
    op: &'static str,
) -> Result<(), InvalidStateError> {
    if allowed.contains(&actual) {
        return Ok(());
    }
    Err(InvalidStateError { op, state: actual })
}

/// Endpoint or listener allocation error. Fatal.
#[derive(Debug, Error)]
pub enum CreationError {
    /// `rdma_create_ep` failed.
    #[error("failed to create CM endpoint")]
    Endpoint(#[source] io::Error),

    /// `rdma_listen` failed.
    #[error("failed to listen on CM endpoint")]
    Listen(#[source] io::Error),

    /// The CM handed back an endpoint without the named resource.
    #[error("CM endpoint is missing its {0}")]
    Incomplete(&'static str),

    /// Reading back the granted capabilities failed.
    #[error("failed to query effective queue pair capabilities")]
    CapabilityQuery(#[source] io::Error),
}

/// Connection establishment or teardown error.
///
/// Handshake failures (timeout, rejection, transport failure) may be
/// retried by the caller with a fresh endpoint; nothing is retried here.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    /// The connect or accept handshake failed.
    #[error("connection handshake failed")]
    Handshake(#[source] io::Error),

    /// Waiting for an incoming connection request failed.
    #[error("waiting for a connection request failed")]
    Request(#[source] io::Error),

    /// `rdma_disconnect` failed.
    #[error("disconnect failed")]
    Disconnect(#[source] io::Error),

    /// An accepted endpoint could not be wrapped.
    #[error(transparent)]
    Creation(#[from] CreationError),
}

/// A reliable-connected endpoint.
///
/// Couples the CM identifier with the queue pair allocated for it and
/// drives the connect/disconnect handshake. Created either actively from a
/// resolved address ([`Endpoint::create`]) or passively from an incoming
/// request ([`Listener::get_request`]).
///
/// A single endpoint is driven by a single thread: all operations take
/// `&self` and the lifecycle state lives in a [`Cell`], so the type is
/// deliberately not `Sync`. The only blocking points are the handshake
/// calls; completion is observed by busy-polling the queues returned by
/// [`Endpoint::send_cq`] and [`Endpoint::recv_cq`].
#[derive(Debug)]
pub struct Endpoint {
    id: NonNull<rdma_cm_id>,
    qp: Qp,
    send_cq: NonNull<ibv_cq>,
    recv_cq: NonNull<ibv_cq>,
    state: Cell<EndpointState>,
}

impl Endpoint {
    /// Create an endpoint from a resolved address, consuming it.
    ///
    /// `caps` are upper bounds; the granted values are read back and
    /// exposed through [`Endpoint::qp`]. With `sq_sig_all`, every posted
    /// send generates a completion entry; otherwise only explicitly
    /// signaled ones do.
    pub fn create(ai: AddrInfo, caps: QpCaps, sq_sig_all: bool) -> Result<Self, CreationError> {
        let mut init_attr = caps.to_init_attr(sq_sig_all);
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        // SAFETY: FFI.
        let ret =
            unsafe { rdma_create_ep(&mut id, ai.as_raw(), ptr::null_mut(), &mut init_attr) };
        if ret != 0 {
            return Err(CreationError::Endpoint(IoError::last_os_error()));
        }
        let id = NonNull::new(id).ok_or_else(|| CreationError::Endpoint(IoError::last_os_error()))?;
        Self::from_cm_id(id)
    }

    /// Wrap a CM identifier that already carries a queue pair.
    pub(crate) fn from_cm_id(id: NonNull<rdma_cm_id>) -> Result<Self, CreationError> {
        // SAFETY: `id` was initialized by the CM; null members are checked
        // before use.
        let (qp, pd, send_cq, recv_cq) = unsafe {
            let raw = id.as_ptr();
            ((*raw).qp, (*raw).pd, (*raw).send_cq, (*raw).recv_cq)
        };
        let qp = NonNull::new(qp).ok_or(CreationError::Incomplete("queue pair"))?;
        let pd = NonNull::new(pd).ok_or(CreationError::Incomplete("protection domain"))?;
        let send_cq = NonNull::new(send_cq).ok_or(CreationError::Incomplete("send CQ"))?;
        let recv_cq = NonNull::new(recv_cq).ok_or(CreationError::Incomplete("recv CQ"))?;

        let caps = Qp::query_caps(qp).map_err(CreationError::CapabilityQuery)?;
        debug!(
            "endpoint created; granted caps: {} send WRs, {} recv WRs, {}B inline",
            caps.max_send_wr, caps.max_recv_wr, caps.max_inline_data
        );

        Ok(Self {
            id,
            qp: Qp::new(qp, pd, caps),
            send_cq,
            recv_cq,
            state: Cell::new(EndpointState::Created),
        })
    }

    /// Get the current lifecycle state.
    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state.get()
    }

    /// Get the queue pair handle, including the granted capability
    /// snapshot.
    #[inline]
    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    pub(crate) fn pd(&self) -> NonNull<ibv_pd> {
        self.qp.pd()
    }

    /// Get the send completion queue.
    #[inline]
    pub fn send_cq(&self) -> Cq<'_> {
        Cq::new(self.send_cq)
    }

    /// Get the receive completion queue.
    #[inline]
    pub fn recv_cq(&self) -> Cq<'_> {
        Cq::new(self.recv_cq)
    }

    /// Run the connect handshake with the remote peer.
    ///
    /// Blocks until the handshake completes or fails. One-shot: valid only
    /// in the `Created` state.
    ///
    /// A receive work request meant to capture the peer's first message
    /// must be posted *before* this call (see [`Endpoint::post_recv`]).
    pub fn connect(&self) -> Result<(), ConnectionError> {
        expect_state(self.state.get(), &[EndpointState::Created], "connect")?;
        // SAFETY: FFI; blocks in the CM until the handshake resolves.
        let ret = unsafe { rdma_connect(self.id.as_ptr(), ptr::null_mut()) };
        if ret != 0 {
            return Err(ConnectionError::Handshake(IoError::last_os_error()));
        }
        self.state.set(EndpointState::Connected);
        debug!("connected");
        Ok(())
    }

    /// Accept an incoming connection on a passively created endpoint.
    ///
    /// Same contract as [`Endpoint::connect`]: blocks, one-shot, and any
    /// receive buffer for the peer's first message must already be posted.
    pub fn accept(&self) -> Result<(), ConnectionError> {
        expect_state(self.state.get(), &[EndpointState::Created], "accept")?;
        // SAFETY: FFI.
        let ret = unsafe { rdma_accept(self.id.as_ptr(), ptr::null_mut()) };
        if ret != 0 {
            return Err(ConnectionError::Handshake(IoError::last_os_error()));
        }
        self.state.set(EndpointState::Connected);
        debug!("accepted");
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Work requests still outstanding are flushed by the adapter and
    /// complete with [`WcStatus::WrFlushErr`](crate::WcStatus::WrFlushErr);
    /// the regions they referenced remain valid for reuse.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        expect_state(self.state.get(), &[EndpointState::Connected], "disconnect")?;
        // SAFETY: FFI.
        let ret = unsafe { rdma_disconnect(self.id.as_ptr()) };
        if ret != 0 {
            return Err(ConnectionError::Disconnect(IoError::last_os_error()));
        }
        self.state.set(EndpointState::Disconnected);
        debug!("disconnected");
        Ok(())
    }

    /// Post a send work request.
    ///
    /// Valid only while connected. See [`Qp`] for the capability and
    /// protection-domain checks applied.
    pub fn post_send(
        &self,
        local: &[MrSlice],
        wr_id: WrId,
        signal: bool,
        inline: bool,
    ) -> Result<(), PostError> {
        expect_state(self.state.get(), &[EndpointState::Connected], "post_send")?;
        self.qp.post_send(local, wr_id, signal, inline)
    }

    /// Post a receive work request.
    ///
    /// Valid from creation onward (until disconnect), so that a buffer for
    /// the peer's first message can be in place before the handshake
    /// completes; an inbound message with no matching receive is dropped or
    /// kills the connection, depending on the adapter.
    pub fn post_recv(&self, local: &[MrSlice], wr_id: WrId) -> Result<(), PostError> {
        expect_state(
            self.state.get(),
            &[EndpointState::Created, EndpointState::Connected],
            "post_recv",
        )?;
        self.qp.post_recv(local, wr_id)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.state.get() == EndpointState::Connected {
            // SAFETY: FFI; best-effort teardown.
            unsafe { rdma_disconnect(self.id.as_ptr()) };
        }
        // SAFETY: destroys the QP and the CM identifier exactly once.
        unsafe { rdma_destroy_ep(self.id.as_ptr()) };
    }
}

/// A passive endpoint waiting for connection requests.
///
/// The queue-pair capabilities given at bind time are applied to every
/// endpoint produced by [`Listener::get_request`].
#[derive(Debug)]
pub struct Listener {
    id: NonNull<rdma_cm_id>,
}

impl Listener {
    /// Bind to a passively resolved address and start listening.
    pub fn bind(ai: AddrInfo, caps: QpCaps, sq_sig_all: bool) -> Result<Self, CreationError> {
        let mut init_attr = caps.to_init_attr(sq_sig_all);
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        // SAFETY: FFI.
        let ret =
            unsafe { rdma_create_ep(&mut id, ai.as_raw(), ptr::null_mut(), &mut init_attr) };
        if ret != 0 {
            return Err(CreationError::Endpoint(IoError::last_os_error()));
        }
        let id = NonNull::new(id).ok_or_else(|| CreationError::Endpoint(IoError::last_os_error()))?;

        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(id.as_ptr(), 0) };
        if ret != 0 {
            // SAFETY: the identifier is ours and carries no connection.
            unsafe { rdma_destroy_ep(id.as_ptr()) };
            return Err(CreationError::Listen(IoError::last_os_error()));
        }
        debug!("listening");
        Ok(Self { id })
    }

    /// Block until a connection request arrives and wrap it.
    ///
    /// The returned endpoint is in the `Created` state; post its first
    /// receive buffer, then [`Endpoint::accept`] it.
    pub fn get_request(&self) -> Result<Endpoint, ConnectionError> {
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        // SAFETY: FFI; blocks until a request arrives.
        let ret = unsafe { rdma_get_request(self.id.as_ptr(), &mut id) };
        if ret != 0 {
            return Err(ConnectionError::Request(IoError::last_os_error()));
        }
        let id = NonNull::new(id).ok_or_else(|| ConnectionError::Request(IoError::last_os_error()))?;
        Ok(Endpoint::from_cm_id(id)?)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // SAFETY: destroys the listening identifier exactly once.
        unsafe { rdma_destroy_ep(self.id.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_gate_allows_listed_states() {
        assert!(expect_state(
            EndpointState::Created,
            &[EndpointState::Created, EndpointState::Connected],
            "post_recv",
        )
        .is_ok());
        assert!(expect_state(EndpointState::Connected, &[EndpointState::Connected], "post_send").is_ok());
    }

    #[test]
    fn state_gate_rejects_post_after_disconnect() {
        let err = expect_state(
            EndpointState::Disconnected,
            &[EndpointState::Connected],
            "post_send",
        )
        .unwrap_err();
        assert_eq!(err.op, "post_send");
        assert_eq!(err.state, EndpointState::Disconnected);
        assert_eq!(
            err.to_string(),
            "post_send is invalid in the Disconnected state"
        );
    }

    #[test]
    fn state_gate_rejects_second_connect() {
        let err = expect_state(EndpointState::Connected, &[EndpointState::Created], "connect")
            .unwrap_err();
        assert_eq!(err.state, EndpointState::Connected);
    }
}
