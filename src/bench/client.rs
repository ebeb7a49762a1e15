//! The timed benchmark client.

use std::time::Duration;

use log::{debug, warn};
use quanta::Instant;

use crate::cm::addrinfo::{AddrInfo, AddrInfoHints, PortSpace};
use crate::cm::endpoint::Endpoint;
use crate::config::BenchConfig;
use crate::rdma::mr::{Mr, Permission};

use super::{BenchError, PostPlan, RECV_WR_ID, SEND_WR_ID};

/// Result of a single timed round trip.
#[derive(Debug, Clone, Copy)]
pub struct PingPongReport {
    /// Wall time from posting the send to observing both completions.
    pub elapsed: Duration,
    /// Bytes delivered into the receive buffer.
    pub bytes: usize,
    /// Whether the echoed payload matched the sent one.
    pub payload_ok: bool,
    /// Whether the send went out inline.
    pub inline: bool,
}

impl PingPongReport {
    /// Elapsed time in microseconds.
    pub fn micros(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1e6
    }
}

/// Result of a repeated-post run.
#[derive(Debug, Clone, Copy)]
pub struct PostLoopReport {
    /// Wall time across all post/drain batches.
    pub elapsed: Duration,
    /// Number of sends posted.
    pub iters: usize,
    /// Number of capability-bounded batches the sends were split into.
    pub batches: usize,
    /// Whether the sends went out inline.
    pub inline: bool,
}

impl PostLoopReport {
    /// Aggregate per-send latency, in microseconds.
    pub fn micros_per_post(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / self.iters as f64 / 1e3
    }
}

/// Outcome of [`Bench::run`], depending on the configured mode.
#[derive(Debug, Clone, Copy)]
pub enum BenchReport {
    PingPong(PingPongReport),
    PostLoop(PostLoopReport),
}

/// The benchmark client.
///
/// Resolves the configured server, brings up a reliable-connected
/// endpoint, and measures either one full round trip (`iters == 1`) or the
/// aggregate post-to-completion cost of a send loop (`iters > 1`). In both
/// modes the receive buffer for the server's echo is posted before the
/// connect handshake, and exactly as many completions are drained as work
/// requests were posted before disconnecting.
#[derive(Debug)]
pub struct Bench {
    cfg: BenchConfig,
}

impl Bench {
    pub fn new(cfg: BenchConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    /// Run the mode the configuration selects.
    pub fn run(&self) -> Result<BenchReport, BenchError> {
        if self.cfg.iters <= 1 {
            Ok(BenchReport::PingPong(self.run_pingpong()?))
        } else {
            Ok(BenchReport::PostLoop(self.run_post_loop()?))
        }
    }

    fn connect_endpoint(&self) -> Result<Endpoint, BenchError> {
        let ai = AddrInfo::resolve(
            Some(&self.cfg.server),
            &self.cfg.service(),
            AddrInfoHints::active(PortSpace::Tcp),
        )?;
        Ok(Endpoint::create(ai, self.cfg.caps(), self.cfg.sq_sig_all)?)
    }

    fn pick_inline(&self, ep: &Endpoint) -> bool {
        let inline = ep.qp().supports_inline(self.cfg.msg_len);
        if !inline {
            warn!(
                "device grants {}B of inline data, using gather sends for {}B messages",
                ep.qp().caps().max_inline_data,
                self.cfg.msg_len
            );
        }
        inline
    }

    /// One timed send/receive round trip.
    pub fn run_pingpong(&self) -> Result<PingPongReport, BenchError> {
        let cfg = &self.cfg;
        let ep = self.connect_endpoint()?;
        let inline = self.pick_inline(&ep);
        let timeout = cfg.poll_timeout();

        let recv_buf = Mr::zeroed(&ep, cfg.msg_len, Permission::LOCAL_WRITE)?;
        let send_buf = Mr::with_content(&ep, &vec![cfg.fill; cfg.msg_len], Permission::EMPTY)?;

        ep.post_recv(&[recv_buf.as_slice()], RECV_WR_ID)?;
        ep.connect()?;

        let start = Instant::now();
        ep.post_send(&[send_buf.as_slice()], SEND_WR_ID, true, inline)?;
        let send_wc = ep.send_cq().poll_one(timeout)?;
        let recv_wc = ep.recv_cq().poll_one(timeout)?;
        let elapsed = start.elapsed();

        debug!(
            "send wr {:#x} and recv wr {:#x} completed, {} bytes in",
            send_wc.wr_id(),
            recv_wc.wr_id(),
            recv_wc.bytes()
        );
        ep.disconnect()?;

        let payload_ok = recv_wc.bytes() == send_buf.len() && recv_buf[..] == send_buf[..];
        Ok(PingPongReport {
            elapsed,
            bytes: recv_wc.bytes(),
            payload_ok,
            inline,
        })
    }

    /// Post `iters` sends in capability-bounded batches, draining the send
    /// queue between batches, and time the aggregate.
    ///
    /// The single pre-posted receive captures the server's terminating
    /// echo after the loop; it is outside the timed region.
    pub fn run_post_loop(&self) -> Result<PostLoopReport, BenchError> {
        let cfg = &self.cfg;
        let ep = self.connect_endpoint()?;
        let inline = self.pick_inline(&ep);
        let timeout = cfg.poll_timeout();
        let depth = ep.qp().caps().max_send_wr.max(1) as usize;

        let recv_buf = Mr::zeroed(&ep, cfg.msg_len, Permission::LOCAL_WRITE)?;
        let send_buf = Mr::with_content(&ep, &vec![cfg.fill; cfg.msg_len], Permission::EMPTY)?;

        ep.post_recv(&[recv_buf.as_slice()], RECV_WR_ID)?;
        ep.connect()?;

        let mut batches = 0;
        let start = Instant::now();
        for batch in PostPlan::new(cfg.iters, depth) {
            for _ in 0..batch {
                ep.post_send(&[send_buf.as_slice()], SEND_WR_ID, true, inline)?;
            }
            ep.send_cq().drain(batch, timeout)?;
            batches += 1;
        }
        let elapsed = start.elapsed();

        ep.recv_cq().poll_one(timeout)?;
        ep.disconnect()?;

        debug!(
            "{} sends drained over {} batches at depth {}",
            cfg.iters, batches, depth
        );
        Ok(PostLoopReport {
            elapsed,
            iters: cfg.iters,
            batches,
            inline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pingpong_report_scales_to_micros() {
        let report = PingPongReport {
            elapsed: Duration::from_micros(1234),
            bytes: 24,
            payload_ok: true,
            inline: true,
        };
        assert!((report.micros() - 1234.0).abs() < 1e-6);
    }

    #[test]
    fn post_loop_report_scales_nanos_per_iteration() {
        let report = PostLoopReport {
            elapsed: Duration::from_nanos(856_000),
            iters: 856,
            batches: 3,
            inline: true,
        };
        assert!((report.micros_per_post() - 1.0).abs() < 1e-9);
    }
}
