//! Per-packet classification pipeline
//!
//! Every read goes through [`PacketView::load`], which returns `None` unless
//! the whole range lies inside the frame. Loops have constant trip counts so
//! the verifier can bound them. Nothing here allocates or keeps state between
//! calls.

use crate::protocol::{eth, ip, sip, udp};
use crate::{addr_key, Counter, CounterSink, SieveConfig};

/// Bounds-checked, read-only access to a received frame.
pub trait PacketView {
    /// Number of bytes between the start and the end of the frame.
    fn frame_len(&self) -> usize;

    /// Copy `N` bytes starting at `offset`, or `None` if any of them lies
    /// outside the frame.
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    /// True when `len` bytes starting at `offset` are inside the frame.
    #[inline(always)]
    fn contains(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.frame_len(),
            None => false,
        }
    }
}

impl PacketView for [u8] {
    #[inline(always)]
    fn frame_len(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        let bytes = self.get(offset..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }
}

/// Read-only membership lookups. Absence is an ordinary answer, not a fault.
pub trait SieveTables {
    /// Source (network byte order key) is on the DoS blocklist.
    fn is_blocked(&self, addr: u32) -> bool;
    /// Source may send unsolicited `OPTIONS`.
    fn is_allowed(&self, addr: u32) -> bool;
    /// A fast-path socket is registered for this receive queue.
    fn has_redirect_target(&self, rx_queue: u32) -> bool;
}

/// A UDP/5060 datagram located by [`decode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SipDatagram {
    /// IPv4 source, keyed as in the membership maps (see [`addr_key`]).
    pub source: u32,
    /// Offset of the first payload byte from the start of the frame.
    pub payload_offset: usize,
    /// Bytes from the payload start to the end of the frame.
    pub payload_len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedReason {
    /// `REGISTER ` payload shorter than the minimum request.
    ShortRegister,
    /// `REGISTER ` payload without `SIP/2.0` in the window.
    RegisterWithoutVersion,
    /// Any other payload long enough to check but without `SIP/2.0`.
    MissingVersion,
}

/// Terminal decision for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Not IPv4/UDP to port 5060, or truncated before the payload.
    NotApplicable,
    Blocked,
    OptionsDropped,
    Malformed(MalformedReason),
    Redirect { rx_queue: u32 },
    Pass,
}

/// What the host runtime should do with the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Pass,
    Drop,
    Redirect { rx_queue: u32 },
}

impl Outcome {
    /// The counter slot this outcome increments. `NotApplicable` traffic is
    /// not ours and is never counted.
    #[inline(always)]
    pub fn counter(&self) -> Option<Counter> {
        match self {
            Outcome::NotApplicable => None,
            Outcome::Blocked => Some(Counter::Blocked),
            Outcome::OptionsDropped => Some(Counter::OptionsDropped),
            Outcome::Malformed(_) => Some(Counter::Malformed),
            Outcome::Redirect { .. } => Some(Counter::Redirected),
            Outcome::Pass => Some(Counter::Passed),
        }
    }

    #[inline(always)]
    pub fn action(&self) -> Action {
        match self {
            Outcome::NotApplicable | Outcome::Pass => Action::Pass,
            Outcome::Blocked | Outcome::OptionsDropped | Outcome::Malformed(_) => Action::Drop,
            Outcome::Redirect { rx_queue } => Action::Redirect {
                rx_queue: *rx_queue,
            },
        }
    }
}

// ============================================================================
// Header Decoder
// ============================================================================

/// Walk Ethernet, IPv4 and UDP headers and locate the SIP payload.
///
/// Returns `None` for anything this classifier does not own: wrong
/// ethertype, IPv4 version/IHL, destination port, a UDP length field below
/// the header size, or a frame that ends inside any header.
#[inline(always)]
pub fn decode<P: PacketView + ?Sized>(pkt: &P, config: &SieveConfig) -> Option<SipDatagram> {
    // L2
    let eth_hdr: [u8; eth::HDR_LEN] = pkt.load(0)?;
    let ethertype = u16::from_be_bytes([
        eth_hdr[eth::ETHERTYPE_OFFSET],
        eth_hdr[eth::ETHERTYPE_OFFSET + 1],
    ]);
    if ethertype != eth::P_IP {
        return None;
    }

    // L3
    let ip_hdr: [u8; ip::MIN_HDR_LEN] = pkt.load(eth::HDR_LEN)?;
    let version = ip_hdr[0] >> 4;
    let ihl = ip_hdr[0] & 0x0f;
    if ihl < ip::MIN_IHL || version != ip::VERSION {
        return None;
    }
    let ip_len = ihl as usize * 4;
    if !pkt.contains(eth::HDR_LEN, ip_len) {
        return None;
    }
    if config.strict_protocol() && ip_hdr[ip::PROTOCOL_OFFSET] != ip::PROTO_UDP {
        return None;
    }
    let source = addr_key([
        ip_hdr[ip::SADDR_OFFSET],
        ip_hdr[ip::SADDR_OFFSET + 1],
        ip_hdr[ip::SADDR_OFFSET + 2],
        ip_hdr[ip::SADDR_OFFSET + 3],
    ]);

    // L4
    let udp_offset = eth::HDR_LEN + ip_len;
    let udp_hdr: [u8; udp::HDR_LEN] = pkt.load(udp_offset)?;
    let dest = u16::from_be_bytes([udp_hdr[udp::DEST_OFFSET], udp_hdr[udp::DEST_OFFSET + 1]]);
    if dest != sip::PORT {
        return None;
    }
    let udp_len = u16::from_be_bytes([udp_hdr[udp::LEN_OFFSET], udp_hdr[udp::LEN_OFFSET + 1]]);
    if (udp_len as usize) < udp::HDR_LEN {
        return None;
    }

    let payload_offset = udp_offset + udp::HDR_LEN;
    Some(SipDatagram {
        source,
        payload_offset,
        payload_len: pkt.frame_len().saturating_sub(payload_offset),
    })
}

// ============================================================================
// Payload Checks
// ============================================================================

/// Marker start offsets searched: the marker must end inside the window.
const VERSION_CANDIDATES: usize = sip::VERSION_WINDOW - sip::VERSION_LEN + 1;

#[inline(always)]
fn payload_starts_with<P: PacketView + ?Sized, const N: usize>(
    pkt: &P,
    payload_offset: usize,
    literal: &[u8; N],
) -> bool {
    match pkt.load::<N>(payload_offset) {
        Some(head) => head == *literal,
        None => false,
    }
}

/// Search the first [`sip::VERSION_WINDOW`] payload bytes for `SIP/2.0`.
///
/// The window is clipped to the frame: the first candidate that would run
/// past the end stops the search.
#[inline(always)]
fn has_version_marker<P: PacketView + ?Sized>(pkt: &P, payload_offset: usize) -> bool {
    for i in 0..VERSION_CANDIDATES {
        match pkt.load::<{ sip::VERSION_LEN }>(payload_offset + i) {
            Some(candidate) if candidate == sip::VERSION => return true,
            Some(_) => {}
            None => return false,
        }
    }
    false
}

#[inline(always)]
fn validate<P: PacketView + ?Sized>(pkt: &P, dgram: &SipDatagram) -> Option<MalformedReason> {
    if payload_starts_with(pkt, dgram.payload_offset, &sip::REGISTER) {
        if dgram.payload_len < sip::MIN_REGISTER_LEN {
            return Some(MalformedReason::ShortRegister);
        }
        if !has_version_marker(pkt, dgram.payload_offset) {
            return Some(MalformedReason::RegisterWithoutVersion);
        }
        // Same window, same literal, floor already met: the generic check
        // below could only repeat this result.
        return None;
    }

    if dgram.payload_len >= sip::MIN_PAYLOAD_LEN && !has_version_marker(pkt, dgram.payload_offset) {
        return Some(MalformedReason::MissingVersion);
    }

    None
}

// ============================================================================
// Pipeline
// ============================================================================

/// Run every stage and return the terminal outcome. Does not count.
#[inline(always)]
pub fn classify<P, T>(pkt: &P, rx_queue: u32, tables: &T, config: &SieveConfig) -> Outcome
where
    P: PacketView + ?Sized,
    T: SieveTables + ?Sized,
{
    let dgram = match decode(pkt, config) {
        Some(dgram) => dgram,
        None => return Outcome::NotApplicable,
    };

    // DoS gate: before a single payload byte is read.
    if tables.is_blocked(dgram.source) {
        return Outcome::Blocked;
    }

    // Stealth: unsolicited OPTIONS only from known peers.
    if payload_starts_with(pkt, dgram.payload_offset, &sip::OPTIONS)
        && !tables.is_allowed(dgram.source)
    {
        return Outcome::OptionsDropped;
    }

    if let Some(reason) = validate(pkt, &dgram) {
        return Outcome::Malformed(reason);
    }

    if tables.has_redirect_target(rx_queue) {
        Outcome::Redirect { rx_queue }
    } else {
        Outcome::Pass
    }
}

/// [`classify`] and record the outcome in `counters`.
#[inline(always)]
pub fn sieve<P, T, C>(
    pkt: &P,
    rx_queue: u32,
    tables: &T,
    config: &SieveConfig,
    counters: &mut C,
) -> Outcome
where
    P: PacketView + ?Sized,
    T: SieveTables + ?Sized,
    C: CounterSink + ?Sized,
{
    let outcome = classify(pkt, rx_queue, tables, config);
    if let Some(counter) = outcome.counter() {
        counters.increment(counter);
    }
    outcome
}
