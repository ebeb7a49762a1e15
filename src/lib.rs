//! A minimal RDMA point-to-point messaging latency benchmark built on the
//! connection-manager path of the [`rdma-sys`] crate.
//!
//! The library wraps the handful of primitives the benchmark needs:
//! address resolution ([`AddrInfo`]), the connected endpoint lifecycle
//! ([`Endpoint`], [`Listener`]), memory registration ([`Mr`]), work
//! request posting, and completion polling ([`Cq`]). The [`bench`] module
//! drives them. Everything is synchronous from the caller's
//! perspective: the only blocking points are the connect handshake and the
//! busy-polled completion waits, and a single connection is meant to be
//! driven by a single thread.
//!
//! # Example
//!
//! ```no_run
//! use rcping::{AddrInfo, AddrInfoHints, BenchConfig, Endpoint, Mr, Permission, PortSpace};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let cfg = BenchConfig::default();
//!     let ai = AddrInfo::resolve(
//!         Some(&cfg.server),
//!         &cfg.service(),
//!         AddrInfoHints::active(PortSpace::Tcp),
//!     )?;
//!     let ep = Endpoint::create(ai, cfg.caps(), true)?;
//!
//!     let recv_buf = Mr::zeroed(&ep, cfg.msg_len, Permission::LOCAL_WRITE)?;
//!     ep.post_recv(&[recv_buf.as_slice()], 1)?;
//!     ep.connect()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

mod cm;
mod config;
mod rdma;

pub use cm::{addrinfo::*, endpoint::*};
pub use config::*;
pub use rdma::{cq::*, mr::*, qp::*};

/// Benchmark drivers.
pub mod bench;
