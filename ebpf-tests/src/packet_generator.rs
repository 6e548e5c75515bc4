//! Packet generation utilities for testing the XDP classifier
//!
//! Builders for Ethernet/IPv4/UDP frames and SIP request payloads.

use std::net::Ipv4Addr;

/// Ethernet header constants
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_ARP: u16 = 0x0806;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// SIP signaling port
pub const SIP_PORT: u16 = 5060;

/// Header lengths, for computing payload offsets in tests
pub const ETH_HLEN: usize = 14;
pub const IP_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

/// Ethernet frame builder
#[derive(Debug, Clone)]
pub struct EthernetFrame {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

impl Default for EthernetFrame {
    fn default() -> Self {
        Self {
            dst_mac: [0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            src_mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            ether_type: ETH_P_IP,
            payload: Vec::new(),
        }
    }
}

impl EthernetFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = ether_type;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ETH_HLEN + self.payload.len());
        packet.extend_from_slice(&self.dst_mac);
        packet.extend_from_slice(&self.src_mac);
        packet.extend_from_slice(&self.ether_type.to_be_bytes());
        packet.extend_from_slice(&self.payload);
        packet
    }
}

/// IPv4 packet builder
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub version: u8,
    /// Header length in 32-bit words; `None` derives it from the options.
    pub ihl: Option<u8>,
    pub tos: u8,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Default for Ipv4Packet {
    fn default() -> Self {
        Self {
            version: 4,
            ihl: None,
            tos: 0,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: IPPROTO_UDP,
            src_ip: Ipv4Addr::new(192, 168, 1, 100),
            dst_ip: Ipv4Addr::new(192, 168, 1, 1),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }
}

impl Ipv4Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_src_ip(mut self, ip: Ipv4Addr) -> Self {
        self.src_ip = ip;
        self
    }

    pub fn with_dst_ip(mut self, ip: Ipv4Addr) -> Self {
        self.dst_ip = ip;
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Force the IHL field regardless of the options actually present.
    pub fn with_ihl(mut self, ihl: u8) -> Self {
        self.ihl = Some(ihl);
        self
    }

    /// Options are zero-padded to a 32-bit boundary.
    pub fn with_options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let header_len = IP_HLEN + self.options.len().div_ceil(4) * 4;
        let ihl = self.ihl.unwrap_or((header_len / 4) as u8);
        let total_len = header_len + self.payload.len();

        let mut packet = Vec::with_capacity(total_len);

        // Version + IHL
        packet.push((self.version << 4) | (ihl & 0x0f));
        // TOS
        packet.push(self.tos);
        // Total length
        packet.extend_from_slice(&(total_len as u16).to_be_bytes());
        // Identification
        packet.extend_from_slice(&self.identification.to_be_bytes());
        // Flags + Fragment offset
        let frag_field = ((self.flags as u16) << 13) | (self.fragment_offset & 0x1fff);
        packet.extend_from_slice(&frag_field.to_be_bytes());
        // TTL
        packet.push(self.ttl);
        // Protocol
        packet.push(self.protocol);
        // Checksum (computed below)
        packet.extend_from_slice(&[0, 0]);
        // Source IP
        packet.extend_from_slice(&self.src_ip.octets());
        // Destination IP
        packet.extend_from_slice(&self.dst_ip.octets());
        // Options
        packet.extend_from_slice(&self.options);
        while packet.len() < header_len {
            packet.push(0);
        }

        let checksum = compute_ip_checksum(&packet[..header_len]);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(&self.payload);

        packet
    }
}

/// UDP datagram builder
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    /// Length field; `None` derives it from the payload.
    pub length: Option<u16>,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl Default for UdpDatagram {
    fn default() -> Self {
        Self {
            src_port: 5060,
            dst_port: SIP_PORT,
            length: None,
            checksum: 0,
            payload: Vec::new(),
        }
    }
}

impl UdpDatagram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Force the length field, e.g. to something smaller than the header.
    pub fn with_length(mut self, length: u16) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(UDP_HLEN + self.payload.len());

        // Source port
        datagram.extend_from_slice(&self.src_port.to_be_bytes());
        // Destination port
        datagram.extend_from_slice(&self.dst_port.to_be_bytes());
        // Length
        let len = self
            .length
            .unwrap_or((UDP_HLEN + self.payload.len()) as u16);
        datagram.extend_from_slice(&len.to_be_bytes());
        // Checksum
        datagram.extend_from_slice(&self.checksum.to_be_bytes());
        // Payload
        datagram.extend_from_slice(&self.payload);

        datagram
    }
}

/// SIP request builder (request line, headers, optional body)
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for SipRequest {
    fn default() -> Self {
        Self {
            method: "INVITE".to_string(),
            uri: "sip:bob@example.com".to_string(),
            version: "SIP/2.0".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl SipRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = uri.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    pub fn options() -> Self {
        Self::new()
            .with_method("OPTIONS")
            .with_uri("sip:probe@example.com")
            .with_header("Via", "SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bK776asdhds")
            .with_header("Max-Forwards", "70")
            .with_header("CSeq", "1 OPTIONS")
    }

    pub fn register() -> Self {
        Self::new()
            .with_method("REGISTER")
            .with_uri("sip:registrar.example.com")
            .with_header("Via", "SIP/2.0/UDP 198.51.100.7:5060;branch=z9hG4bKnashds7")
            .with_header("To", "<sip:alice@example.com>")
            .with_header("CSeq", "1826 REGISTER")
    }

    pub fn build(&self) -> Vec<u8> {
        let mut message = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            message.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            message.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        message.push_str("\r\n");

        let mut bytes = message.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Compute IP header checksum
fn compute_ip_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Sum 16-bit words
    for i in (0..header.len()).step_by(2) {
        if i == 10 {
            continue; // Skip checksum field
        }
        let word = if i + 1 < header.len() {
            ((header[i] as u32) << 8) | (header[i + 1] as u32)
        } else {
            (header[i] as u32) << 8
        };
        sum += word;
    }

    // Fold carries
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    // One's complement
    !sum as u16
}

/// Create a complete UDP packet with Ethernet, IP, and UDP headers
pub fn create_udp_packet(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
) -> Vec<u8> {
    let udp = UdpDatagram::new()
        .with_src_port(src_port)
        .with_dst_port(dst_port)
        .with_payload(payload)
        .build();

    let ip = Ipv4Packet::new()
        .with_src_ip(src_ip)
        .with_dst_ip(dst_ip)
        .with_protocol(IPPROTO_UDP)
        .with_payload(udp)
        .build();

    EthernetFrame::new()
        .with_ether_type(ETH_P_IP)
        .with_payload(ip)
        .build()
}

/// Create a UDP/5060 packet from `src_ip` carrying `payload` verbatim
pub fn create_sip_packet(src_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    create_udp_packet(
        src_ip,
        Ipv4Addr::new(192, 0, 2, 10),
        SIP_PORT,
        SIP_PORT,
        payload.to_vec(),
    )
}
