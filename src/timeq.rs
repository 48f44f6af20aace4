/*
Timed-resource primitives for the memory hierarchy model.

Every shared resource with a service rate -- a crossbar lane, a DRAM channel,
an MSHR admission path -- is wrapped by a TimedServer that enforces a service
law: a fixed base latency plus a throughput component expressed in
bytes-per-cycle.

Accepting a request yields a Ticket naming the cycle at which the payload
becomes visible downstream.  When the server cannot accept more work it
returns a Backpressure carrying the request back to the caller together with
a concrete cycle at which a retry can succeed, so stall reasons propagate
upstream instead of being dropped.
*/

use std::collections::VecDeque;

pub type Cycle = u64;

/// Result of queueing a request with a timed server.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle, size_bytes: u32) -> Self {
        Self {
            issued_at,
            ready_at,
            size_bytes,
        }
    }

    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    /// Cycle at which the payload becomes visible to the downstream consumer.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }

    /// Cycles left until the ticket is ready; zero if already ready.
    pub fn remaining(&self, now: Cycle) -> Cycle {
        self.ready_at.saturating_sub(now)
    }
}

/// Payload plus the metadata needed to compute its service time.
#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self {
            payload,
            size_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

/// Why the server refused a request.  The request rides along so the caller
/// can park it and retry without cloning.
#[derive(Debug)]
pub enum Backpressure<T> {
    /// The bounded FIFO is full.
    QueueFull {
        request: ServiceRequest<T>,
        capacity: usize,
    },
    /// The server has residual occupancy from already-drained work.
    Busy {
        request: ServiceRequest<T>,
        available_at: Cycle,
    },
}

impl<T> Backpressure<T> {
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
            Backpressure::Busy { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Fixed latency added to every request.
    pub base_latency: Cycle,
    /// Throughput of the resource.
    pub bytes_per_cycle: u32,
    /// Maximum number of outstanding requests the server will hold.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

/// Single-lane FIFO server enforcing the configured latency/bandwidth budget.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
        }
    }

    /// Attempt to enqueue a request at `now`.  Returns the completion Ticket
    /// on success or a Backpressure describing the refusal.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let available_at = self.busy_until.max(now);
        if available_at > now && self.inflight.is_empty() {
            return Err(Backpressure::Busy {
                request,
                available_at,
            });
        }

        let ready_at = self.next_ready_cycle(available_at, request.size_bytes);
        let ticket = Ticket::new(now, ready_at, request.size_bytes);

        self.busy_until = ready_at;
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });
        Ok(ticket)
    }

    /// Drain requests that completed by `now`, invoking `callback` on each in
    /// FIFO order.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(ServiceResult<T>),
    {
        while let Some(front) = self.inflight.front() {
            if !front.ticket.is_ready(now) {
                break;
            }
            let inflight = self.inflight.pop_front().expect("front just checked");
            callback(ServiceResult {
                payload: inflight.payload,
                ticket: inflight.ticket,
            });
        }

        if self.inflight.is_empty() && now > self.busy_until {
            self.busy_until = now;
        }
    }

    /// Earliest cycle at which a new request could begin service.
    pub fn available_at(&self) -> Cycle {
        self.busy_until
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.inflight.front().map(|inflight| &inflight.ticket)
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    fn next_ready_cycle(&self, start: Cycle, size_bytes: u32) -> Cycle {
        let service_cycles = ceil_div(size_bytes as u64, self.config.bytes_per_cycle as u64);
        start
            .saturating_add(self.config.base_latency)
            .saturating_add(service_cycles)
    }
}

/// Clamp a retry hint so the caller always waits at least one cycle.
pub fn normalize_retry(now: Cycle, hint: Cycle) -> Cycle {
    hint.max(now.saturating_add(1))
}

pub fn ceil_div(nom: u64, denom: u64) -> u64 {
    debug_assert!(denom > 0);
    (nom + denom - 1) / denom
}
