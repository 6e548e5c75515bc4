//! eBPF map management
//!
//! Owns the userspace handles of the classifier's maps once they have been
//! taken out of the loaded object. Everything here is a thin, typed layer
//! over aya's map API: keys are converted to and from [`Ipv4Addr`] and
//! per-CPU counters are summed into a [`CounterSnapshot`].

use aya::maps::{Array, HashMap, MapData, PerCpuArray};
use aya::Ebpf;
use sipsieve_common::error::{ErrorContext, IntoInternal, Result};
use sipsieve_ebpf::{
    addr_key, key_octets,
    limits::{MAX_ALLOWED_IPS, MAX_BLOCKED_IPS},
    map_names, Counter, CounterSnapshot, SieveConfig, MEMBER,
};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// One of the two source-address membership maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSet {
    Blocked,
    Allowed,
}

impl AddressSet {
    pub const ALL: [AddressSet; 2] = [AddressSet::Blocked, AddressSet::Allowed];

    /// Label used in logs and metrics
    pub fn name(self) -> &'static str {
        match self {
            AddressSet::Blocked => "blocked",
            AddressSet::Allowed => "allowed",
        }
    }

    /// Maximum entries the kernel map holds
    pub fn capacity(self) -> usize {
        match self {
            AddressSet::Blocked => MAX_BLOCKED_IPS as usize,
            AddressSet::Allowed => MAX_ALLOWED_IPS as usize,
        }
    }

    fn map_name(self) -> &'static str {
        match self {
            AddressSet::Blocked => map_names::BLOCKED_IPS,
            AddressSet::Allowed => map_names::ALLOWED_IPS,
        }
    }
}

/// Entry counts for status reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct MapStats {
    pub blocked_ips: usize,
    pub allowed_ips: usize,
}

/// eBPF map manager
pub struct MapManager {
    blocked_ips: HashMap<MapData, u32, u8>,
    allowed_ips: HashMap<MapData, u32, u8>,
    config: Array<MapData, SieveConfig>,
    counters: PerCpuArray<MapData, u64>,
}

impl MapManager {
    /// Take ownership of the classifier's maps out of a loaded object.
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self> {
        let blocked_ips = HashMap::try_from(take(ebpf, AddressSet::Blocked.map_name())?)
            .map_err(|e| e.internal_with_context("BLOCKED_IPS has an unexpected type"))?;
        let allowed_ips = HashMap::try_from(take(ebpf, AddressSet::Allowed.map_name())?)
            .map_err(|e| e.internal_with_context("ALLOWED_IPS has an unexpected type"))?;
        let config = Array::try_from(take(ebpf, map_names::SIEVE_CONFIG)?)
            .map_err(|e| e.internal_with_context("SIEVE_CONFIG has an unexpected type"))?;
        let counters = PerCpuArray::try_from(take(ebpf, map_names::XDP_COUNTERS)?)
            .map_err(|e| e.internal_with_context("XDP_COUNTERS has an unexpected type"))?;

        Ok(Self {
            blocked_ips,
            allowed_ips,
            config,
            counters,
        })
    }

    fn set(&self, set: AddressSet) -> &HashMap<MapData, u32, u8> {
        match set {
            AddressSet::Blocked => &self.blocked_ips,
            AddressSet::Allowed => &self.allowed_ips,
        }
    }

    fn set_mut(&mut self, set: AddressSet) -> &mut HashMap<MapData, u32, u8> {
        match set {
            AddressSet::Blocked => &mut self.blocked_ips,
            AddressSet::Allowed => &mut self.allowed_ips,
        }
    }

    /// Addresses currently present in a membership map
    pub fn members(&self, set: AddressSet) -> Result<BTreeSet<Ipv4Addr>> {
        let mut members = BTreeSet::new();
        for key in self.set(set).keys() {
            let key = key.map_err(|e| e.internal_with_context("Failed to iterate address map"))?;
            members.insert(Ipv4Addr::from(key_octets(key)));
        }
        Ok(members)
    }

    /// Add an address to a membership map
    pub fn insert(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()> {
        debug!(set = set.name(), ip = %addr, "Adding address");
        self.set_mut(set)
            .insert(addr_key(addr.octets()), MEMBER, 0)
            .map_err(|e| {
                e.internal_with_context(format!("Failed to add {} to {} set", addr, set.name()))
            })
    }

    /// Remove an address from a membership map
    pub fn remove(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()> {
        debug!(set = set.name(), ip = %addr, "Removing address");
        self.set_mut(set)
            .remove(&addr_key(addr.octets()))
            .map_err(|e| {
                e.internal_with_context(format!("Failed to remove {} from {} set", addr, set.name()))
            })
    }

    /// Replace the classifier's runtime switches
    pub fn write_config(&mut self, config: SieveConfig) -> Result<()> {
        self.config
            .set(0, config, 0)
            .map_err(|e| e.internal_with_context("Failed to write SIEVE_CONFIG"))
    }

    pub fn read_config(&self) -> Result<SieveConfig> {
        self.config
            .get(&0, 0)
            .map_err(|e| e.internal_with_context("Failed to read SIEVE_CONFIG"))
    }

    /// Read every counter slot and sum it over all CPUs
    pub fn read_counters(&self) -> Result<CounterSnapshot> {
        let mut snapshot = CounterSnapshot::new();
        for counter in Counter::ALL {
            let per_cpu = self
                .counters
                .get(&counter.slot(), 0)
                .map_err(|e| {
                    e.internal_with_context(format!("Failed to read counter {}", counter.name()))
                })?;
            accumulate(&mut snapshot, counter, &per_cpu);
        }
        Ok(snapshot)
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            blocked_ips: self.blocked_ips.keys().filter(|k| k.is_ok()).count(),
            allowed_ips: self.allowed_ips.keys().filter(|k| k.is_ok()).count(),
        }
    }
}

fn take(ebpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map> {
    ebpf.take_map(name)
        .with_context(|| format!("Map {} not found in object", name))
}

/// Add one slot's per-CPU values to a snapshot
pub fn accumulate(snapshot: &mut CounterSnapshot, counter: Counter, per_cpu: &[u64]) {
    for value in per_cpu {
        snapshot.add(counter, *value);
    }
}
