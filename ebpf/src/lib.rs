//! SIP Sieve eBPF/XDP Library
//!
//! Shared types and the classification pipeline for the `xdp_sip` program.
//! The pipeline is written against two small traits ([`PacketView`] and
//! [`SieveTables`]) so the exact same code runs inside the kernel and in
//! host-side tests.
//!
//! # Pipeline
//!
//! 1. Header decoder: Ethernet -> IPv4 -> UDP/5060, fail open on anything else
//! 2. DoS gate: drop sources present in `BLOCKED_IPS`
//! 3. Stealth filter: `OPTIONS ` only from sources present in `ALLOWED_IPS`
//! 4. Structural validator: `SIP/2.0` within the first 64 payload bytes
//! 5. Dispatch: redirect to the AF_XDP socket of the receive queue, or pass
//!
//! Every terminal decision maps to exactly one [`Counter`] slot.

#![cfg_attr(not(test), no_std)]

pub mod classify;

pub use classify::{
    classify, decode, sieve, Action, MalformedReason, Outcome, PacketView, SieveTables,
    SipDatagram,
};

// ============================================================================
// Counters
// ============================================================================

/// Outcome counters, one slot each in the per-CPU `XDP_COUNTERS` array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    /// `OPTIONS` probe from a source outside the allow set
    OptionsDropped = 0,
    /// Handed to the AF_XDP socket of the receive queue
    Redirected = 1,
    /// Valid SIP passed to the kernel stack
    Passed = 2,
    /// Source present in the block set
    Blocked = 3,
    /// Too short or missing the `SIP/2.0` marker
    Malformed = 4,
}

/// Number of counter slots.
pub const COUNTER_SLOTS: u32 = 5;

impl Counter {
    /// All counters in slot order.
    pub const ALL: [Counter; COUNTER_SLOTS as usize] = [
        Counter::OptionsDropped,
        Counter::Redirected,
        Counter::Passed,
        Counter::Blocked,
        Counter::Malformed,
    ];

    #[inline(always)]
    pub const fn slot(self) -> u32 {
        self as u32
    }

    /// Stable lowercase name, used as a metrics label.
    pub const fn name(self) -> &'static str {
        match self {
            Counter::OptionsDropped => "options_dropped",
            Counter::Redirected => "redirected",
            Counter::Passed => "passed",
            Counter::Blocked => "blocked",
            Counter::Malformed => "malformed",
        }
    }

    pub fn from_slot(slot: u32) -> Option<Counter> {
        Counter::ALL.get(slot as usize).copied()
    }
}

/// Receiver for counter increments.
///
/// The XDP program implements this over the per-CPU array; host code uses
/// [`CounterSnapshot`] directly.
pub trait CounterSink {
    fn increment(&mut self, counter: Counter);
}

/// Summed (or single-context) view of all counter slots.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub values: [u64; COUNTER_SLOTS as usize],
}

impl CounterSnapshot {
    pub const fn new() -> Self {
        Self {
            values: [0; COUNTER_SLOTS as usize],
        }
    }

    #[inline(always)]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.slot() as usize]
    }

    /// Add `amount` to a slot. Wraps like the kernel-side increment does.
    #[inline(always)]
    pub fn add(&mut self, counter: Counter, amount: u64) {
        let slot = &mut self.values[counter.slot() as usize];
        *slot = slot.wrapping_add(amount);
    }

    /// Fold another snapshot (typically another CPU's) into this one.
    pub fn merge(&mut self, other: &CounterSnapshot) {
        for counter in Counter::ALL {
            self.add(counter, other.get(counter));
        }
    }

    /// Per-slot difference against an earlier snapshot.
    ///
    /// A slot that went backwards was reset (program reloaded, map
    /// recreated), so everything it now holds is new and is reported whole.
    pub fn delta_since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        let mut delta = CounterSnapshot::new();
        for counter in Counter::ALL {
            let (now, then) = (self.get(counter), earlier.get(counter));
            delta.values[counter.slot() as usize] = if now >= then { now - then } else { now };
        }
        delta
    }

    /// Sum over all slots, i.e. packets that reached a terminal decision.
    pub fn total(&self) -> u64 {
        self.values.iter().fold(0u64, |acc, v| acc.wrapping_add(*v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.iter().map(move |c| (*c, self.get(*c)))
    }
}

impl CounterSink for CounterSnapshot {
    #[inline(always)]
    fn increment(&mut self, counter: Counter) {
        self.add(counter, 1);
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Runtime switches read from the single-entry `SIEVE_CONFIG` array.
///
/// A zeroed value is the default behaviour, so an unwritten map entry is safe.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SieveConfig {
    pub flags: u32,
}

impl SieveConfig {
    /// Require IPv4 protocol == UDP before interpreting the transport header.
    pub const FLAG_STRICT_PROTOCOL: u32 = 0x0001;

    pub const fn new() -> Self {
        Self { flags: 0 }
    }

    pub const fn with_strict_protocol(mut self, strict: bool) -> Self {
        if strict {
            self.flags |= Self::FLAG_STRICT_PROTOCOL;
        } else {
            self.flags &= !Self::FLAG_STRICT_PROTOCOL;
        }
        self
    }

    #[inline(always)]
    pub const fn strict_protocol(&self) -> bool {
        self.flags & Self::FLAG_STRICT_PROTOCOL != 0
    }
}

// SAFETY: plain #[repr(C)] integers, no padding.
#[cfg(feature = "user")]
unsafe impl aya::Pod for SieveConfig {}

// ============================================================================
// Protocol Constants
// ============================================================================

pub mod protocol {
    /// Ethernet
    pub mod eth {
        pub const HDR_LEN: usize = 14;
        pub const ETHERTYPE_OFFSET: usize = 12;
        pub const P_IP: u16 = 0x0800;
    }

    /// IPv4
    pub mod ip {
        pub const MIN_HDR_LEN: usize = 20;
        pub const MIN_IHL: u8 = 5;
        pub const VERSION: u8 = 4;
        pub const PROTOCOL_OFFSET: usize = 9;
        pub const SADDR_OFFSET: usize = 12;
        pub const PROTO_UDP: u8 = 17;
    }

    /// UDP
    pub mod udp {
        pub const HDR_LEN: usize = 8;
        pub const DEST_OFFSET: usize = 2;
        pub const LEN_OFFSET: usize = 4;
    }

    /// SIP text markers
    pub mod sip {
        pub const PORT: u16 = 5060;
        pub const OPTIONS: [u8; 8] = *b"OPTIONS ";
        pub const REGISTER: [u8; 9] = *b"REGISTER ";
        pub const VERSION_LEN: usize = 7;
        pub const VERSION: [u8; VERSION_LEN] = *b"SIP/2.0";
        /// Shortest REGISTER that can hold a request line.
        pub const MIN_REGISTER_LEN: usize = 20;
        /// Payloads shorter than this are not checked for the marker.
        pub const MIN_PAYLOAD_LEN: usize = 20;
        /// Only this many leading payload bytes are searched for the marker.
        pub const VERSION_WINDOW: usize = 64;
    }
}

// ============================================================================
// Map Sizes and Names (for userspace coordination)
// ============================================================================

pub mod limits {
    /// AF_XDP sockets, one per receive queue.
    pub const MAX_QUEUES: u32 = 64;
    pub const MAX_ALLOWED_IPS: u32 = 256;
    pub const MAX_BLOCKED_IPS: u32 = 1024;
}

pub mod map_names {
    pub const XSKS_MAP: &str = "XSKS_MAP";
    pub const ALLOWED_IPS: &str = "ALLOWED_IPS";
    pub const BLOCKED_IPS: &str = "BLOCKED_IPS";
    pub const SIEVE_CONFIG: &str = "SIEVE_CONFIG";
    pub const XDP_COUNTERS: &str = "XDP_COUNTERS";
}

/// Name of the XDP program inside the object file.
pub const PROGRAM_NAME: &str = "xdp_sip";

/// Value stored for members of `ALLOWED_IPS` / `BLOCKED_IPS`.
pub const MEMBER: u8 = 1;

/// Key for an IPv4 address in the membership maps.
///
/// The kernel side uses the four address bytes exactly as they sit on the
/// wire, so the key is the octets reinterpreted in native order.
#[inline(always)]
pub const fn addr_key(octets: [u8; 4]) -> u32 {
    u32::from_ne_bytes(octets)
}

/// Inverse of [`addr_key`].
#[inline(always)]
pub const fn key_octets(key: u32) -> [u8; 4] {
    key.to_ne_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_slots_are_dense() {
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.slot() as usize, i);
            assert_eq!(Counter::from_slot(i as u32), Some(*counter));
        }
        assert_eq!(Counter::from_slot(COUNTER_SLOTS), None);
    }

    #[test]
    fn test_snapshot_merge_and_delta() {
        let mut cpu0 = CounterSnapshot::new();
        cpu0.increment(Counter::Passed);
        cpu0.increment(Counter::Passed);
        let mut cpu1 = CounterSnapshot::new();
        cpu1.increment(Counter::Blocked);

        let mut total = CounterSnapshot::new();
        total.merge(&cpu0);
        total.merge(&cpu1);
        assert_eq!(total.get(Counter::Passed), 2);
        assert_eq!(total.get(Counter::Blocked), 1);
        assert_eq!(total.total(), 3);

        let mut later = total;
        later.add(Counter::Passed, 5);
        let delta = later.delta_since(&total);
        assert_eq!(delta.get(Counter::Passed), 5);
        assert_eq!(delta.get(Counter::Blocked), 0);

        // A reset map never produces a huge wrapped delta.
        assert_eq!(CounterSnapshot::new().delta_since(&later).total(), 0);

        // Counts taken after a reset are all new.
        let mut reset = CounterSnapshot::new();
        reset.add(Counter::Passed, 3);
        reset.add(Counter::Blocked, 4);
        let delta = reset.delta_since(&later);
        assert_eq!(delta.get(Counter::Passed), 3);
        assert_eq!(delta.get(Counter::Blocked), 3);
    }

    #[test]
    fn test_config_flags() {
        let config = SieveConfig::new();
        assert!(!config.strict_protocol());
        let strict = config.with_strict_protocol(true);
        assert!(strict.strict_protocol());
        assert!(!strict.with_strict_protocol(false).strict_protocol());
    }

    #[test]
    fn test_addr_key_roundtrip_keeps_wire_order() {
        let octets = [10, 0, 0, 9];
        assert_eq!(key_octets(addr_key(octets)), octets);
        assert_eq!(addr_key(octets).to_ne_bytes()[0], 10);
    }
}
