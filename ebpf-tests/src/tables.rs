//! In-memory stand-ins for the kernel maps

use std::collections::HashSet;
use std::net::Ipv4Addr;

use sipsieve_ebpf::{addr_key, CounterSnapshot, SieveTables};

/// Block set, allow set and registered AF_XDP queues.
#[derive(Debug, Clone, Default)]
pub struct MockTables {
    blocked: HashSet<u32>,
    allowed: HashSet<u32>,
    queues: HashSet<u32>,
}

impl MockTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocked(mut self, ip: Ipv4Addr) -> Self {
        self.blocked.insert(addr_key(ip.octets()));
        self
    }

    pub fn with_allowed(mut self, ip: Ipv4Addr) -> Self {
        self.allowed.insert(addr_key(ip.octets()));
        self
    }

    /// Pretend a socket is bound on `rx_queue`.
    pub fn with_queue(mut self, rx_queue: u32) -> Self {
        self.queues.insert(rx_queue);
        self
    }

    pub fn unregister_queue(&mut self, rx_queue: u32) {
        self.queues.remove(&rx_queue);
    }
}

impl SieveTables for MockTables {
    fn is_blocked(&self, addr: u32) -> bool {
        self.blocked.contains(&addr)
    }

    fn is_allowed(&self, addr: u32) -> bool {
        self.allowed.contains(&addr)
    }

    fn has_redirect_target(&self, rx_queue: u32) -> bool {
        self.queues.contains(&rx_queue)
    }
}

/// One counter bank per execution context, summed the way the agent sums
/// per-CPU values.
#[derive(Debug, Clone)]
pub struct CpuCounters {
    banks: Vec<CounterSnapshot>,
}

impl CpuCounters {
    pub fn new(cpus: usize) -> Self {
        Self {
            banks: vec![CounterSnapshot::new(); cpus],
        }
    }

    pub fn cpu(&mut self, cpu: usize) -> &mut CounterSnapshot {
        &mut self.banks[cpu]
    }

    pub fn summed(&self) -> CounterSnapshot {
        let mut total = CounterSnapshot::new();
        for bank in &self.banks {
            total.merge(bank);
        }
        total
    }
}
