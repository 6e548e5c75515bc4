//! Policy synchronisation
//!
//! The blocked and allowed maps are shared with the control plane, which
//! edits them through the pinned paths. By default a sync only inserts the
//! configured addresses and removes the ones this agent inserted earlier.
//! With `policy.authoritative` the configured sets replace the map contents,
//! removals first so a full map never rejects a replacement.

use crate::ebpf::maps::{AddressSet, MapManager};
use sipsieve_common::config::PolicyConfig;
use sipsieve_common::error::{Error, Result};
use sipsieve_common::metrics::POLICY_ENTRIES;
use sipsieve_ebpf::SieveConfig;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::info;

/// Map operations needed to apply a policy
pub trait PolicyStore {
    fn members(&self, set: AddressSet) -> Result<BTreeSet<Ipv4Addr>>;
    fn insert(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()>;
    fn remove(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()>;
    fn write_config(&mut self, config: SieveConfig) -> Result<()>;
}

impl PolicyStore for MapManager {
    fn members(&self, set: AddressSet) -> Result<BTreeSet<Ipv4Addr>> {
        MapManager::members(self, set)
    }

    fn insert(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()> {
        MapManager::insert(self, set, addr)
    }

    fn remove(&mut self, set: AddressSet, addr: Ipv4Addr) -> Result<()> {
        MapManager::remove(self, set, addr)
    }

    fn write_config(&mut self, config: SieveConfig) -> Result<()> {
        MapManager::write_config(self, config)
    }
}

/// Validated policy, ready to be written to the maps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredPolicy {
    pub blocked: BTreeSet<Ipv4Addr>,
    pub allowed: BTreeSet<Ipv4Addr>,
    pub config: SieveConfig,
    pub authoritative: bool,
}

impl DesiredPolicy {
    pub fn from_config(policy: &PolicyConfig) -> Result<Self> {
        let desired = Self {
            blocked: policy.blocked_addrs()?,
            allowed: policy.allowed_addrs()?,
            config: SieveConfig::new().with_strict_protocol(policy.strict_protocol),
            authoritative: policy.authoritative,
        };

        for set in AddressSet::ALL {
            let len = desired.addrs(set).len();
            if len > set.capacity() {
                return Err(Error::validation(format!(
                    "policy.{}: {} addresses exceed the map capacity of {}",
                    set.name(),
                    len,
                    set.capacity()
                )));
            }
        }

        Ok(desired)
    }

    pub fn addrs(&self, set: AddressSet) -> &BTreeSet<Ipv4Addr> {
        match set {
            AddressSet::Blocked => &self.blocked,
            AddressSet::Allowed => &self.allowed,
        }
    }
}

/// Addresses this agent inserted and may therefore remove again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedEntries {
    blocked: BTreeSet<Ipv4Addr>,
    allowed: BTreeSet<Ipv4Addr>,
}

impl OwnedEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, set: AddressSet) -> &BTreeSet<Ipv4Addr> {
        match set {
            AddressSet::Blocked => &self.blocked,
            AddressSet::Allowed => &self.allowed,
        }
    }

    fn get_mut(&mut self, set: AddressSet) -> &mut BTreeSet<Ipv4Addr> {
        match set {
            AddressSet::Blocked => &mut self.blocked,
            AddressSet::Allowed => &mut self.allowed,
        }
    }
}

/// Changes to one address set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetPlan {
    pub insert: Vec<Ipv4Addr>,
    pub remove: Vec<Ipv4Addr>,
}

impl SetPlan {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.remove.is_empty()
    }
}

/// Diff the current contents of a map against the desired set
pub fn plan(current: &BTreeSet<Ipv4Addr>, desired: &BTreeSet<Ipv4Addr>) -> SetPlan {
    SetPlan {
        insert: desired.difference(current).copied().collect(),
        remove: current.difference(desired).copied().collect(),
    }
}

/// Like [`plan`], but only entries in `owned` are candidates for removal
pub fn plan_owned(
    current: &BTreeSet<Ipv4Addr>,
    desired: &BTreeSet<Ipv4Addr>,
    owned: &BTreeSet<Ipv4Addr>,
) -> SetPlan {
    SetPlan {
        insert: desired.difference(current).copied().collect(),
        remove: owned
            .intersection(current)
            .filter(|addr| !desired.contains(addr))
            .copied()
            .collect(),
    }
}

/// Result of syncing one address set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetSync {
    /// Entries in the map after the sync
    pub entries: usize,
    pub inserted: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub blocked: SetSync,
    pub allowed: SetSync,
}

/// Bring the maps in line with `desired`.
///
/// `owned` is updated as entries are inserted and removed, so it stays
/// accurate even when a map operation fails part way.
pub fn apply<S: PolicyStore + ?Sized>(
    store: &mut S,
    desired: &DesiredPolicy,
    owned: &mut OwnedEntries,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    for set in AddressSet::ALL {
        let target = desired.addrs(set);
        let current = store.members(set)?;
        let changes = if desired.authoritative {
            plan(&current, target)
        } else {
            plan_owned(&current, target, owned.get(set))
        };

        let owned_set = owned.get_mut(set);
        for addr in &changes.remove {
            store.remove(set, *addr)?;
            owned_set.remove(addr);
        }
        for addr in &changes.insert {
            store.insert(set, *addr)?;
            owned_set.insert(*addr);
        }
        owned_set.retain(|addr| target.contains(addr));
        if desired.authoritative {
            owned_set.extend(target.iter().copied());
        }

        let entries = current.len() - changes.remove.len() + changes.insert.len();
        if !changes.is_empty() {
            info!(
                set = set.name(),
                added = changes.insert.len(),
                removed = changes.remove.len(),
                entries,
                authoritative = desired.authoritative,
                "Address set updated"
            );
        }

        let entry = SetSync {
            entries,
            inserted: changes.insert.len(),
            removed: changes.remove.len(),
        };
        match set {
            AddressSet::Blocked => report.blocked = entry,
            AddressSet::Allowed => report.allowed = entry,
        }
        POLICY_ENTRIES
            .with_label_values(&[set.name()])
            .set(entries as i64);
    }

    store.write_config(desired.config)?;

    Ok(report)
}
