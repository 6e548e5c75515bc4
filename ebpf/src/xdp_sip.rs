//! XDP SIP Sieve Program
//!
//! Classifies SIP signaling on UDP/5060 before the kernel stack sees it:
//! - Sources in `BLOCKED_IPS` are dropped before the payload is touched
//! - `OPTIONS ` probes from sources outside `ALLOWED_IPS` are silently dropped
//! - Payloads without `SIP/2.0` in their first 64 bytes are dropped
//! - Surviving requests go to the AF_XDP socket of the receive queue, or to
//!   the kernel stack when no socket is registered
//!
//! Everything else passes untouched and uncounted.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, HashMap, PerCpuArray, XskMap},
    programs::XdpContext,
};
use aya_log_ebpf::debug;
use sipsieve_ebpf::{
    decode,
    limits::{MAX_ALLOWED_IPS, MAX_BLOCKED_IPS, MAX_QUEUES},
    sieve, Action, Counter, CounterSink, MalformedReason, Outcome, PacketView, SieveConfig,
    SieveTables, COUNTER_SLOTS,
};

// ============================================================================
// eBPF Maps
// ============================================================================

/// AF_XDP sockets by receive queue. Filled by the SIP proxy.
#[map]
static XSKS_MAP: XskMap = XskMap::pinned(MAX_QUEUES, 0);

/// Sources allowed to send unsolicited OPTIONS.
#[map]
static ALLOWED_IPS: HashMap<u32, u8> = HashMap::pinned(MAX_ALLOWED_IPS, 0);

/// Sources whose UDP/5060 traffic is dropped outright.
#[map]
static BLOCKED_IPS: HashMap<u32, u8> = HashMap::pinned(MAX_BLOCKED_IPS, 0);

/// Runtime switches
#[map]
static SIEVE_CONFIG: Array<SieveConfig> = Array::with_max_entries(1, 0);

/// Outcome counters per CPU (summed in userspace)
#[map]
static XDP_COUNTERS: PerCpuArray<u64> = PerCpuArray::pinned(COUNTER_SLOTS, 0);

// ============================================================================
// Kernel Bindings for the Pipeline
// ============================================================================

struct XdpFrame<'a> {
    ctx: &'a XdpContext,
}

impl PacketView for XdpFrame<'_> {
    #[inline(always)]
    fn frame_len(&self) -> usize {
        self.ctx.data_end() - self.ctx.data()
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let start = self.ctx.data();
        let end = self.ctx.data_end();

        if start + offset + N > end {
            return None;
        }

        Some(unsafe { core::ptr::read_unaligned((start + offset) as *const [u8; N]) })
    }
}

struct KernelTables;

impl SieveTables for KernelTables {
    #[inline(always)]
    fn is_blocked(&self, addr: u32) -> bool {
        unsafe { BLOCKED_IPS.get(&addr) }.is_some()
    }

    #[inline(always)]
    fn is_allowed(&self, addr: u32) -> bool {
        unsafe { ALLOWED_IPS.get(&addr) }.is_some()
    }

    #[inline(always)]
    fn has_redirect_target(&self, rx_queue: u32) -> bool {
        XSKS_MAP.get(rx_queue).is_some()
    }
}

struct PerCpuCounters;

impl CounterSink for PerCpuCounters {
    #[inline(always)]
    fn increment(&mut self, counter: Counter) {
        if let Some(slot) = XDP_COUNTERS.get_ptr_mut(counter.slot()) {
            unsafe {
                *slot += 1;
            }
        }
    }
}

// ============================================================================
// Main XDP Entry Point
// ============================================================================

#[xdp]
pub fn xdp_sip(ctx: XdpContext) -> u32 {
    let frame = XdpFrame { ctx: &ctx };
    let rx_queue = unsafe { (*ctx.ctx).rx_queue_index };
    let config = get_config();

    let outcome = sieve(&frame, rx_queue, &KernelTables, &config, &mut PerCpuCounters);

    match outcome.action() {
        Action::Pass => xdp_action::XDP_PASS,
        Action::Drop => {
            // Only reached for frames that decoded, so the source is there.
            if let Some(dgram) = decode(&frame, &config) {
                debug!(
                    &ctx,
                    "sip drop {:i}: {} (queue {})",
                    u32::from_be(dgram.source),
                    drop_reason(&outcome),
                    rx_queue
                );
            }
            xdp_action::XDP_DROP
        }
        // Socket unregistered since the lookup: fall back to the stack.
        Action::Redirect { rx_queue } => {
            match XSKS_MAP.redirect(rx_queue, xdp_action::XDP_PASS as u64) {
                Ok(action) => action,
                Err(_) => xdp_action::XDP_PASS,
            }
        }
    }
}

#[inline(always)]
fn get_config() -> SieveConfig {
    match SIEVE_CONFIG.get(0) {
        Some(config) => *config,
        None => SieveConfig::new(),
    }
}

#[inline(always)]
fn drop_reason(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Blocked => "blocked source",
        Outcome::OptionsDropped => "options from unknown peer",
        Outcome::Malformed(MalformedReason::ShortRegister) => "short register",
        Outcome::Malformed(MalformedReason::RegisterWithoutVersion) => "register without version",
        Outcome::Malformed(MalformedReason::MissingVersion) => "missing version",
        _ => "unknown",
    }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
