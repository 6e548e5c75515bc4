//! End-to-end classification of generated frames, driven the way the XDP
//! program drives the pipeline.

use std::net::Ipv4Addr;

use sipsieve_ebpf::{
    decode, sieve, Action, Counter, CounterSink, CounterSnapshot, MalformedReason, Outcome,
    SieveConfig,
};
use sipsieve_ebpf_tests::packet_generator::{ETH_P_ARP, IPPROTO_TCP, SIP_PORT};
use sipsieve_ebpf_tests::{
    create_sip_packet, create_udp_packet, CpuCounters, EthernetFrame, Ipv4Packet, MockTables,
    RecordingFrame, SipRequest, UdpDatagram,
};

const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
const QUEUE: u32 = 3;

fn run(frame: &[u8], tables: &MockTables) -> (Outcome, CounterSnapshot) {
    run_with(frame, tables, &SieveConfig::new())
}

fn run_with(frame: &[u8], tables: &MockTables, config: &SieveConfig) -> (Outcome, CounterSnapshot) {
    let mut counters = CounterSnapshot::new();
    let outcome = sieve(frame, QUEUE, tables, config, &mut counters);
    (outcome, counters)
}

fn only(counter: Counter) -> CounterSnapshot {
    let mut expected = CounterSnapshot::new();
    expected.add(counter, 1);
    expected
}

/// Wrap a prebuilt UDP datagram in IPv4 and Ethernet.
fn wrap(udp: Vec<u8>, ip: Ipv4Packet) -> Vec<u8> {
    EthernetFrame::new().with_payload(ip.with_payload(udp).build()).build()
}

fn sip_udp(payload: &[u8]) -> Vec<u8> {
    UdpDatagram::new().with_payload(payload.to_vec()).build()
}

// ============================================================================
// Header decoding
// ============================================================================

#[test]
fn test_non_ipv4_passes_uncounted() {
    let ip = Ipv4Packet::new()
        .with_src_ip(PEER)
        .with_payload(sip_udp(b"OPTIONS sip:x SIP/2.0\r\n"))
        .build();
    let frame = EthernetFrame::new()
        .with_ether_type(ETH_P_ARP)
        .with_payload(ip)
        .build();

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::NotApplicable);
    assert_eq!(outcome.action(), Action::Pass);
    assert_eq!(counters.total(), 0);
}

#[test]
fn test_other_udp_port_passes_uncounted() {
    let frame = create_udp_packet(PEER, SERVER, 5060, 5061, b"OPTIONS sip:x SIP/2.0\r\n".to_vec());
    let tables = MockTables::new().with_blocked(PEER);

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::NotApplicable);
    assert_eq!(counters.total(), 0);
}

#[test]
fn test_truncated_headers_pass_uncounted() {
    let frame = create_sip_packet(PEER, b"REGISTER sip:x SIP/2.0\r\n");
    let tables = MockTables::new().with_blocked(PEER);

    // Inside Ethernet, inside the minimum IPv4 header, inside UDP.
    for len in [0, 13, 14, 33, 34, 41] {
        let (outcome, counters) = run(&frame[..len], &tables);
        assert_eq!(outcome, Outcome::NotApplicable, "truncated at {}", len);
        assert_eq!(counters.total(), 0, "truncated at {}", len);
    }
}

#[test]
fn test_truncated_ip_options_pass_uncounted() {
    let frame = wrap(
        sip_udp(b"REGISTER sip:x SIP/2.0\r\n"),
        Ipv4Packet::new().with_src_ip(PEER).with_options(vec![1, 1, 1, 1]),
    );

    // 14 + 24 bytes of IPv4 header; cut one byte short of the options.
    let (outcome, counters) = run(&frame[..37], &MockTables::new());
    assert_eq!(outcome, Outcome::NotApplicable);
    assert_eq!(counters.total(), 0);

    // UDP header cut short after the options.
    let (outcome, _) = run(&frame[..45], &MockTables::new());
    assert_eq!(outcome, Outcome::NotApplicable);
}

#[test]
fn test_ip_options_shift_udp_header() {
    let payload = b"REGISTER sip:x SIP/2.0\r\n";
    let frame = wrap(
        sip_udp(payload),
        Ipv4Packet::new().with_src_ip(PEER).with_options(vec![1, 1, 1, 1]),
    );

    let dgram = decode(frame.as_slice(), &SieveConfig::new()).unwrap();
    assert_eq!(dgram.payload_offset, 14 + 24 + 8);
    assert_eq!(dgram.payload_len, payload.len());

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));
}

#[test]
fn test_bad_ihl_or_version_passes_uncounted() {
    let udp = sip_udp(b"INVITE sip:x HTTP/1.1 no marker here\r\n");

    for ip in [
        Ipv4Packet::new().with_ihl(4),
        Ipv4Packet::new().with_ihl(0),
        Ipv4Packet::new().with_version(6),
    ] {
        let frame = wrap(udp.clone(), ip.with_src_ip(PEER));
        let (outcome, counters) = run(&frame, &MockTables::new());
        assert_eq!(outcome, Outcome::NotApplicable);
        assert_eq!(counters.total(), 0);
    }
}

#[test]
fn test_udp_length_below_header_passes_uncounted() {
    let udp = UdpDatagram::new()
        .with_length(7)
        .with_payload(b"INVITE sip:x HTTP/1.1 no marker here\r\n".to_vec())
        .build();
    let frame = wrap(udp, Ipv4Packet::new().with_src_ip(PEER));

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::NotApplicable);
    assert_eq!(counters.total(), 0);
}

#[test]
fn test_protocol_field_only_checked_when_strict() {
    let frame = wrap(
        sip_udp(b"REGISTER sip:x SIP/2.0\r\n"),
        Ipv4Packet::new().with_src_ip(PEER).with_protocol(IPPROTO_TCP),
    );
    let tables = MockTables::new();

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));

    let strict = SieveConfig::new().with_strict_protocol(true);
    let (outcome, counters) = run_with(&frame, &tables, &strict);
    assert_eq!(outcome, Outcome::NotApplicable);
    assert_eq!(counters.total(), 0);

    // Strict mode leaves real UDP alone.
    let udp_frame = create_sip_packet(PEER, b"REGISTER sip:x SIP/2.0\r\n");
    let (outcome, _) = run_with(&udp_frame, &tables, &strict);
    assert_eq!(outcome, Outcome::Pass);
}

// ============================================================================
// DoS gate
// ============================================================================

#[test]
fn test_blocked_source_dropped_regardless_of_payload() {
    let tables = MockTables::new().with_blocked(PEER).with_allowed(PEER).with_queue(QUEUE);

    for payload in [
        &b"REGISTER sip:x SIP/2.0\r\n"[..],
        b"OPTIONS sip:x SIP/2.0\r\n",
        b"garbage garbage garbage garbage",
        b"",
        b"REG",
    ] {
        let frame = create_sip_packet(PEER, payload);
        let (outcome, counters) = run(&frame, &tables);
        assert_eq!(outcome, Outcome::Blocked);
        assert_eq!(outcome.action(), Action::Drop);
        assert_eq!(counters, only(Counter::Blocked));
    }
}

#[test]
fn test_blocked_source_payload_never_read() {
    let frame = create_sip_packet(PEER, b"REGISTER sip:x SIP/2.0\r\n");
    let view = RecordingFrame::new(&frame);
    let tables = MockTables::new().with_blocked(PEER);

    let mut counters = CounterSnapshot::new();
    let outcome = sieve(&view, QUEUE, &tables, &SieveConfig::new(), &mut counters);

    assert_eq!(outcome, Outcome::Blocked);
    assert_eq!(counters.get(Counter::Blocked), 1);
    assert_eq!(view.furthest_read(), 14 + 20 + 8);
}

#[test]
fn test_other_sources_unaffected_by_block() {
    let tables = MockTables::new().with_blocked(Ipv4Addr::new(10, 0, 0, 10));
    let frame = create_sip_packet(PEER, b"REGISTER sip:x SIP/2.0\r\n");

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));
}

// ============================================================================
// Stealth filter
// ============================================================================

#[test]
fn test_options_from_unknown_peer_dropped() {
    let frame = create_sip_packet(PEER, &SipRequest::options().build());
    let tables = MockTables::new().with_queue(QUEUE);

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::OptionsDropped);
    assert_eq!(outcome.action(), Action::Drop);
    assert_eq!(counters, only(Counter::OptionsDropped));
}

#[test]
fn test_options_from_allowed_peer_dispatched() {
    let frame = create_sip_packet(PEER, &SipRequest::options().build());

    let tables = MockTables::new().with_allowed(PEER);
    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));

    let tables = tables.with_queue(QUEUE);
    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Redirect { rx_queue: QUEUE });
    assert_eq!(counters, only(Counter::Redirected));
}

#[test]
fn test_options_prefix_must_be_exact() {
    let tables = MockTables::new();

    // No trailing space: an ordinary payload with a marker.
    let frame = create_sip_packet(PEER, b"OPTIONSsip:x SIP/2.0\r\n");
    assert_eq!(run(&frame, &tables).0, Outcome::Pass);

    // Fewer than eight bytes.
    let frame = create_sip_packet(PEER, b"OPTIONS");
    assert_eq!(run(&frame, &tables).0, Outcome::Pass);

    // Exactly the eight-byte prefix is enough.
    let frame = create_sip_packet(PEER, b"OPTIONS ");
    assert_eq!(run(&frame, &tables).0, Outcome::OptionsDropped);

    // Case matters.
    let frame = create_sip_packet(PEER, b"options sip:x SIP/2.0\r\n");
    assert_eq!(run(&frame, &tables).0, Outcome::Pass);
}

// ============================================================================
// Structural validation
// ============================================================================

#[test]
fn test_short_register_dropped() {
    let tables = MockTables::new().with_queue(QUEUE);

    for payload in [&b"REGISTER sip:a SIP/"[..], b"REGISTER sipSIP/2.0", b"REGISTER "] {
        assert!(payload.len() <= 19);
        let frame = create_sip_packet(PEER, payload);
        let (outcome, counters) = run(&frame, &tables);
        assert_eq!(outcome, Outcome::Malformed(MalformedReason::ShortRegister));
        assert_eq!(counters, only(Counter::Malformed));
    }
}

#[test]
fn test_register_at_length_floor_dispatched() {
    let payload = b"REGISTER sip:SIP/2.0";
    assert_eq!(payload.len(), 20);
    let frame = create_sip_packet(PEER, payload);

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));
}

#[test]
fn test_register_without_marker_dropped() {
    let frame = create_sip_packet(PEER, b"REGISTER sip:registrar.example.com XYZ/9.9\r\n");
    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Malformed(MalformedReason::RegisterWithoutVersion));
    assert_eq!(counters, only(Counter::Malformed));

    // Marker present, but past the first 64 bytes.
    let uri = format!("sip:{}", "a".repeat(60));
    let request = SipRequest::new().with_method("REGISTER").with_uri(&uri).build();
    let frame = create_sip_packet(PEER, &request);
    let (outcome, _) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Malformed(MalformedReason::RegisterWithoutVersion));
}

#[test]
fn test_register_with_marker_dispatched() {
    let frame = create_sip_packet(PEER, &SipRequest::register().build());
    let tables = MockTables::new().with_queue(QUEUE);

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Redirect { rx_queue: QUEUE });
    assert_eq!(counters, only(Counter::Redirected));
}

#[test]
fn test_other_payload_without_marker_dropped() {
    let frame = create_sip_packet(PEER, b"INVITE sip:bob@example.com HTTP/1.1\r\n");

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Malformed(MalformedReason::MissingVersion));
    assert_eq!(outcome.action(), Action::Drop);
    assert_eq!(counters, only(Counter::Malformed));
}

#[test]
fn test_marker_must_end_inside_window() {
    let mut payload = vec![b'x'; 57];
    payload.extend_from_slice(b"SIP/2.0");
    let frame = create_sip_packet(PEER, &payload);
    assert_eq!(run(&frame, &MockTables::new()).0, Outcome::Pass);

    let mut payload = vec![b'x'; 58];
    payload.extend_from_slice(b"SIP/2.0");
    let frame = create_sip_packet(PEER, &payload);
    assert_eq!(
        run(&frame, &MockTables::new()).0,
        Outcome::Malformed(MalformedReason::MissingVersion)
    );
}

#[test]
fn test_marker_in_body_past_window_ignored() {
    let request = SipRequest::new()
        .with_version("SIP/3.0")
        .with_header("From", "<sip:alice@example.com>")
        .with_body(b"v=0\r\ns=SIP/2.0 session\r\n");
    let payload = request.build();
    let marker_at = payload
        .windows(7)
        .position(|w| w == b"SIP/2.0")
        .unwrap();
    assert!(marker_at > 64);

    let frame = create_sip_packet(PEER, &payload);
    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Malformed(MalformedReason::MissingVersion));
    assert_eq!(counters, only(Counter::Malformed));

    let frame = create_sip_packet(PEER, &request.with_version("SIP/2.0").build());
    assert_eq!(run(&frame, &MockTables::new()).0, Outcome::Pass);
}

#[test]
fn test_short_payload_without_marker_dispatched() {
    for payload in [&b""[..], b"hello", b"INVITE no marker.."] {
        assert!(payload.len() < 20);
        let frame = create_sip_packet(PEER, payload);
        let (outcome, counters) = run(&frame, &MockTables::new());
        assert_eq!(outcome, Outcome::Pass);
        assert_eq!(counters, only(Counter::Passed));
    }
}

// ============================================================================
// Dispatch and counters
// ============================================================================

#[test]
fn test_dispatch_follows_queue_registration() {
    let frame = create_sip_packet(PEER, &SipRequest::new().build());
    let mut tables = MockTables::new().with_queue(QUEUE);

    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Redirect { rx_queue: QUEUE });
    assert_eq!(outcome.action(), Action::Redirect { rx_queue: QUEUE });
    assert_eq!(counters, only(Counter::Redirected));

    tables.unregister_queue(QUEUE);
    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));

    // A socket on another queue does not count.
    let tables = MockTables::new().with_queue(QUEUE + 1);
    assert_eq!(run(&frame, &tables).0, Outcome::Pass);
}

#[test]
fn test_same_bytes_same_outcome() {
    let tables = MockTables::new().with_queue(QUEUE);
    let mut counters = CounterSnapshot::new();

    for payload in [
        SipRequest::register().build(),
        SipRequest::options().build(),
        b"INVITE sip:bob@example.com HTTP/1.1\r\n".to_vec(),
    ] {
        let frame = create_sip_packet(PEER, &payload);

        let before = counters;
        let first = sieve(frame.as_slice(), QUEUE, &tables, &SieveConfig::new(), &mut counters);
        let first_delta = counters.delta_since(&before);

        let before = counters;
        let second = sieve(frame.as_slice(), QUEUE, &tables, &SieveConfig::new(), &mut counters);
        let second_delta = counters.delta_since(&before);

        assert_eq!(first, second);
        assert_eq!(first_delta, second_delta);
        assert_eq!(first_delta.total(), 1);
    }
}

#[test]
fn test_register_scenario() {
    let payload = b"REGISTER sip:x SIP/2.0\r\n";
    let frame = create_sip_packet(PEER, payload);

    let (outcome, counters) = run(&frame, &MockTables::new());
    assert_eq!(outcome, Outcome::Pass);
    assert_eq!(counters, only(Counter::Passed));

    let tables = MockTables::new().with_blocked(PEER);
    let (outcome, counters) = run(&frame, &tables);
    assert_eq!(outcome, Outcome::Blocked);
    assert_eq!(counters.get(Counter::Blocked), 1);
    assert_eq!(counters.total(), 1);
}

#[test]
fn test_per_cpu_banks_sum_to_outcomes() {
    let blocked = Ipv4Addr::new(203, 0, 113, 66);
    let tables = MockTables::new().with_blocked(blocked).with_queue(0).with_queue(2);
    let config = SieveConfig::new();

    let traffic = [
        create_sip_packet(PEER, &SipRequest::register().build()),
        create_sip_packet(PEER, &SipRequest::options().build()),
        create_sip_packet(blocked, &SipRequest::register().build()),
        create_sip_packet(PEER, b"INVITE sip:bob@example.com HTTP/1.1\r\n"),
        create_sip_packet(PEER, b"REGISTER sip:a SIP/"),
        create_udp_packet(PEER, SERVER, 40000, 53, vec![0; 32]),
    ];

    let mut banks = CpuCounters::new(4);
    let mut expected = CounterSnapshot::new();

    for round in 0..25usize {
        for (i, frame) in traffic.iter().enumerate() {
            let cpu = (round + i) % 4;
            let rx_queue = cpu as u32;
            let outcome = sieve(frame.as_slice(), rx_queue, &tables, &config, banks.cpu(cpu));
            if let Some(counter) = outcome.counter() {
                expected.increment(counter);
            }
        }
    }

    let summed = banks.summed();
    assert_eq!(summed, expected);
    // The non-SIP datagram never reaches a counter.
    assert_eq!(summed.total(), 25 * (traffic.len() as u64 - 1));
    assert_eq!(summed.get(Counter::Blocked), 25);
    assert_eq!(summed.get(Counter::OptionsDropped), 25);
    assert_eq!(summed.get(Counter::Malformed), 50);
    assert_eq!(
        summed.get(Counter::Redirected) + summed.get(Counter::Passed),
        25
    );
}

#[test]
fn test_sip_port_constant_matches_classifier() {
    assert_eq!(SIP_PORT, sipsieve_ebpf::protocol::sip::PORT);
}
