//! Benchmark drivers: the timed client and the echo-server peer it
//! measures against.

mod client;
mod server;

pub use self::client::{Bench, BenchReport, PingPongReport, PostLoopReport};
pub use self::server::EchoServer;

use thiserror::Error;

use crate::cm::addrinfo::ResolutionError;
use crate::cm::endpoint::{ConnectionError, CreationError};
use crate::rdma::cq::PollError;
use crate::rdma::mr::RegistrationError;
use crate::rdma::qp::{PostError, WrId};

pub(crate) const SEND_WR_ID: WrId = 0x73656e64;
pub(crate) const RECV_WR_ID: WrId = 0x72656376;

/// Benchmark failure.
///
/// Every underlying error is surfaced unchanged; the drivers never retry.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Iterator over the batch sizes of a repeated-post run.
///
/// Never yields a batch larger than `depth`, so a driver that drains the
/// completion queue between batches keeps the number of outstanding work
/// requests within the queue pair capability at all times.
#[derive(Debug, Clone)]
pub struct PostPlan {
    remaining: usize,
    depth: usize,
}

impl PostPlan {
    /// Plan `total` posts against a queue of the given `depth`.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is zero.
    pub fn new(total: usize, depth: usize) -> Self {
        assert!(depth > 0, "queue depth must be nonzero");
        Self {
            remaining: total,
            depth,
        }
    }
}

impl Iterator for PostPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let batch = self.remaining.min(self.depth);
        self.remaining -= batch;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_into_capability_sized_batches() {
        let batches: Vec<_> = PostPlan::new(856, 300).collect();
        assert_eq!(batches, vec![300, 300, 256]);
    }

    #[test]
    fn plan_never_exceeds_depth_and_preserves_total() {
        for (total, depth) in [(856, 300), (1, 1), (5, 8), (300, 300), (601, 300)] {
            let batches: Vec<_> = PostPlan::new(total, depth).collect();
            assert!(batches.iter().all(|&b| b > 0 && b <= depth));
            assert_eq!(batches.iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn empty_plan_yields_nothing() {
        assert_eq!(PostPlan::new(0, 4).count(), 0);
    }

    #[test]
    #[should_panic(expected = "queue depth must be nonzero")]
    fn zero_depth_is_rejected() {
        let _ = PostPlan::new(10, 0);
    }
}
