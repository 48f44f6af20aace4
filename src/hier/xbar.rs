use log::trace;
use serde::Serialize;
use std::ops::AddAssign;

use super::config::XbarConfig;
use super::request::{Reject, RejectReason};
use crate::timeq::{
    normalize_retry, Backpressure, Cycle, ServerConfig, ServiceRequest, Ticket, TimedServer,
};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct XbarStats {
    pub routed: u64,
    pub bytes_routed: u64,
    pub queue_full_rejects: u64,
    pub busy_rejects: u64,
}

impl AddAssign<&XbarStats> for XbarStats {
    fn add_assign(&mut self, other: &XbarStats) {
        self.routed = self.routed.saturating_add(other.routed);
        self.bytes_routed = self.bytes_routed.saturating_add(other.bytes_routed);
        self.queue_full_rejects = self
            .queue_full_rejects
            .saturating_add(other.queue_full_rejects);
        self.busy_rejects = self.busy_rejects.saturating_add(other.busy_rejects);
    }
}

/// Arbitrates N upstream senders onto M downstream accept queues.  Each
/// crossing pays the arbitration latency plus a width-limited transfer term.
/// Same-cycle contention resolves in ascending upstream-port order because
/// the hierarchy services pending work in that fixed order; the crossbar
/// itself only serializes whoever reaches it first.  A full downstream
/// queue pushes the sender back with a concrete retry cycle; nothing is
/// dropped.
#[derive(Debug)]
pub struct Crossbar {
    name: String,
    lanes: Vec<TimedServer<usize>>,
    stats: XbarStats,
}

impl Crossbar {
    pub fn new(name: impl Into<String>, config: &XbarConfig, downstream_ports: usize) -> Self {
        assert!(downstream_ports > 0, "crossbar needs a downstream port");
        let server_config = ServerConfig {
            base_latency: config.arbitration_latency,
            bytes_per_cycle: config.width_bytes,
            queue_capacity: config.queue_capacity,
        };
        Self {
            name: name.into(),
            lanes: (0..downstream_ports)
                .map(|_| TimedServer::new(server_config))
                .collect(),
            stats: XbarStats::default(),
        }
    }

    pub fn downstream_ports(&self) -> usize {
        self.lanes.len()
    }

    pub fn stats(&self) -> XbarStats {
        self.stats
    }

    /// Claim a slot on the `to_port` accept queue.  The returned ticket
    /// names the delivery cycle at the downstream component.
    pub fn try_route(
        &mut self,
        now: Cycle,
        from_port: usize,
        to_port: usize,
        bytes: u32,
    ) -> Result<Ticket, Reject> {
        let lane = &mut self.lanes[to_port];
        match lane.try_enqueue(now, ServiceRequest::new(from_port, bytes)) {
            Ok(ticket) => {
                self.stats.routed += 1;
                self.stats.bytes_routed += bytes as u64;
                trace!(
                    "{}: port {} -> {} accepted at {}, delivery {}",
                    self.name,
                    from_port,
                    to_port,
                    now,
                    ticket.ready_at()
                );
                Ok(ticket)
            }
            Err(Backpressure::Busy { available_at, .. }) => {
                self.stats.busy_rejects += 1;
                Err(Reject::new(
                    normalize_retry(now, available_at),
                    RejectReason::Busy,
                ))
            }
            Err(Backpressure::QueueFull { .. }) => {
                self.stats.queue_full_rejects += 1;
                let hint = lane
                    .oldest_ticket()
                    .map(|ticket| ticket.ready_at())
                    .unwrap_or_else(|| lane.available_at());
                Err(Reject::new(
                    normalize_retry(now, hint),
                    RejectReason::QueueFull,
                ))
            }
        }
    }

    /// Release accept-queue slots whose transfers completed by `now`.
    pub fn tick(&mut self, now: Cycle) {
        for lane in &mut self.lanes {
            lane.service_ready(now, |_| {});
        }
    }

    pub fn outstanding(&self, to_port: usize) -> usize {
        self.lanes[to_port].outstanding()
    }
}
