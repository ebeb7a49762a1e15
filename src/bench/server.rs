//! The echo-server peer of the benchmark.

use log::debug;

use crate::cm::addrinfo::{AddrInfo, AddrInfoHints, PortSpace};
use crate::cm::endpoint::Listener;
use crate::config::BenchConfig;
use crate::rdma::mr::{Mr, Permission};

use super::{BenchError, PostPlan, RECV_WR_ID, SEND_WR_ID};

/// The passive side of a benchmark run.
///
/// Serves exactly one connection: consumes the configured number of
/// incoming messages (re-posting receives in capability-bounded batches)
/// and answers with a single echo of the last payload, which the client's
/// pre-posted receive captures. `iters` must match the client's.
#[derive(Debug)]
pub struct EchoServer {
    bind: Option<String>,
    cfg: BenchConfig,
}

impl EchoServer {
    /// `bind = None` listens on the wildcard address.
    pub fn new(bind: Option<String>, cfg: BenchConfig) -> Self {
        Self { bind, cfg }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    /// Serve one connection to completion.
    pub fn run(&self) -> Result<(), BenchError> {
        let cfg = &self.cfg;
        let ai = AddrInfo::resolve(
            self.bind.as_deref(),
            &cfg.service(),
            AddrInfoHints::passive(PortSpace::Tcp),
        )?;
        let listener = Listener::bind(ai, cfg.caps(), cfg.sq_sig_all)?;

        let ep = listener.get_request()?;
        let depth = ep.qp().caps().max_recv_wr.max(1) as usize;
        let timeout = cfg.poll_timeout();

        // Every receive lands in the same region; only the final payload
        // is echoed back.
        let buf = Mr::zeroed(&ep, cfg.msg_len, Permission::LOCAL_WRITE)?;

        let mut plan = PostPlan::new(cfg.iters, depth);
        let first = plan.next().unwrap_or(0);
        for _ in 0..first {
            ep.post_recv(&[buf.as_slice()], RECV_WR_ID)?;
        }
        ep.accept()?;

        if first > 0 {
            ep.recv_cq().drain(first, timeout)?;
        }
        for batch in plan {
            for _ in 0..batch {
                ep.post_recv(&[buf.as_slice()], RECV_WR_ID)?;
            }
            ep.recv_cq().drain(batch, timeout)?;
        }
        debug!("consumed {} messages, echoing", cfg.iters);

        let inline = ep.qp().supports_inline(cfg.msg_len);
        ep.post_send(&[buf.as_slice()], SEND_WR_ID, true, inline)?;
        ep.send_cq().poll_one(timeout)?;

        ep.disconnect()?;
        Ok(())
    }
}
