//! Host-side harness for the SIP sieve classifier
//!
//! The classifier is generic over its packet and table access, so tests feed
//! it plain byte buffers and [`MockTables`] instead of a live XDP context.

pub mod frame;
pub mod packet_generator;
pub mod tables;

pub use frame::RecordingFrame;
pub use packet_generator::{
    create_sip_packet, create_udp_packet, EthernetFrame, Ipv4Packet, SipRequest, UdpDatagram,
};
pub use tables::{CpuCounters, MockTables};
