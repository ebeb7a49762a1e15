//! Verbs-level resources: queue pairs, memory regions, and completion
//! queues.
//!
//! The connection manager owns the underlying `ibv_*` objects; the types
//! here add capability checking, protection-domain tracking, and polling
//! discipline on top of them.

pub mod cq;
pub mod mr;
pub mod qp;
