//! Fixed-layout headers exchanged with the switch's CPU port.
//!
//! Every packet-in and packet-out carries a CPU header in front of the
//! Ethernet frame:
//!
//! ```text
//! [8 x 0x00][reason:u16][port:u16] | Ethernet (14B) | ARP (28B) or IPv4
//! ```
//!
//! All multi-byte fields are in network byte order. Decoding checks lengths
//! (and the CPU header's zero sentinel) but not field values; callers decide
//! what to do with unexpected opcodes or reasons.

use smoltcp::wire::{EthernetAddress, EthernetProtocol};
use std::net::Ipv4Addr;
use thiserror::Error;

/// CPU header size
pub const CPU_HEADER_LEN: usize = 12;

/// Ethernet header size
pub const ETHERNET_HEADER_LEN: usize = 14;

/// ARP header size (Ethernet/IPv4)
pub const ARP_HEADER_LEN: usize = 28;

/// Minimum IPv4 header size (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Number of leading zero bytes framing a CPU header
const CPU_SENTINEL_LEN: usize = 8;

/// Offset of the destination address inside an IPv4 header
const IPV4_DST_OFFSET: usize = 16;

/// ARP hardware type for Ethernet
pub const ARP_HW_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const ARP_PROTO_IPV4: u16 = 0x0800;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{header} header truncated: need {needed} bytes, have {actual}")]
    Truncated {
        header: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("CPU header sentinel is not all zeros")]
    BadSentinel,
}

pub type Result<T> = std::result::Result<T, CodecError>;

fn check_len(header: &'static str, buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            header,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    )
}

fn read_mac(buf: &[u8], offset: usize) -> EthernetAddress {
    EthernetAddress::from_bytes(&buf[offset..offset + 6])
}

/// Why the switch sent a packet to (or should treat a packet from) the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CpuReason {
    /// IPv4 packet whose next hop has no `forward` entry yet
    NoArpEntry = 0,
    /// ARP request or reply
    ArpMsg = 1,
    /// Data packet reinjected after resolution
    DataPkt = 2,
}

impl CpuReason {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(CpuReason::NoArpEntry),
            1 => Some(CpuReason::ArpMsg),
            2 => Some(CpuReason::DataPkt),
            _ => None,
        }
    }
}

/// CPU header: zero sentinel, reason code and logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuHeader {
    pub reason: u16,
    pub port: u16,
}

impl CpuHeader {
    pub fn new(reason: CpuReason, port: u16) -> Self {
        Self {
            reason: reason as u16,
            port,
        }
    }

    /// Known reason code, if any.
    pub fn reason(&self) -> Option<CpuReason> {
        CpuReason::from_u16(self.reason)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("CPU", buf, CPU_HEADER_LEN)?;
        if buf[..CPU_SENTINEL_LEN].iter().any(|&b| b != 0) {
            return Err(CodecError::BadSentinel);
        }
        Ok(Self {
            reason: read_u16(buf, CPU_SENTINEL_LEN),
            port: read_u16(buf, CPU_SENTINEL_LEN + 2),
        })
    }

    /// Write the header into the first `CPU_HEADER_LEN` bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) -> Result<()> {
        check_len("CPU", buf, CPU_HEADER_LEN)?;
        buf[..CPU_HEADER_LEN].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; CPU_HEADER_LEN] {
        let mut out = [0u8; CPU_HEADER_LEN];
        out[8..10].copy_from_slice(&self.reason.to_be_bytes());
        out[10..12].copy_from_slice(&self.port.to_be_bytes());
        out
    }
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: EthernetAddress,
    pub src: EthernetAddress,
    pub ethertype: EthernetProtocol,
}

impl EthernetHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("Ethernet", buf, ETHERNET_HEADER_LEN)?;
        Ok(Self {
            dst: read_mac(buf, 0),
            src: read_mac(buf, 6),
            ethertype: EthernetProtocol::from(read_u16(buf, 12)),
        })
    }

    pub fn emit(&self, buf: &mut [u8]) -> Result<()> {
        check_len("Ethernet", buf, ETHERNET_HEADER_LEN)?;
        buf[0..6].copy_from_slice(self.dst.as_bytes());
        buf[6..12].copy_from_slice(self.src.as_bytes());
        buf[12..14].copy_from_slice(&u16::from(self.ethertype).to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ETHERNET_HEADER_LEN] {
        let mut out = [0u8; ETHERNET_HEADER_LEN];
        out[0..6].copy_from_slice(self.dst.as_bytes());
        out[6..12].copy_from_slice(self.src.as_bytes());
        out[12..14].copy_from_slice(&u16::from(self.ethertype).to_be_bytes());
        out
    }
}

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// ARP header for Ethernet/IPv4.
///
/// The type and length fields are kept as decoded so that a decode/encode
/// cycle reproduces the wire bytes exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpHeader {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_len: u8,
    pub proto_len: u8,
    pub opcode: u16,
    pub src_mac: EthernetAddress,
    pub src_ip: Ipv4Addr,
    pub dst_mac: EthernetAddress,
    pub dst_ip: Ipv4Addr,
}

impl ArpHeader {
    /// Ethernet/IPv4 ARP header with the given operation and addresses.
    pub fn new(
        op: ArpOp,
        src_mac: EthernetAddress,
        src_ip: Ipv4Addr,
        dst_mac: EthernetAddress,
        dst_ip: Ipv4Addr,
    ) -> Self {
        Self {
            hw_type: ARP_HW_ETHERNET,
            proto_type: ARP_PROTO_IPV4,
            hw_len: 6,
            proto_len: 4,
            opcode: op as u16,
            src_mac,
            src_ip,
            dst_mac,
            dst_ip,
        }
    }

    pub fn op(&self) -> Option<ArpOp> {
        ArpOp::from_u16(self.opcode)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("ARP", buf, ARP_HEADER_LEN)?;
        Ok(Self {
            hw_type: read_u16(buf, 0),
            proto_type: read_u16(buf, 2),
            hw_len: buf[4],
            proto_len: buf[5],
            opcode: read_u16(buf, 6),
            src_mac: read_mac(buf, 8),
            src_ip: read_ipv4(buf, 14),
            dst_mac: read_mac(buf, 18),
            dst_ip: read_ipv4(buf, 24),
        })
    }

    pub fn emit(&self, buf: &mut [u8]) -> Result<()> {
        check_len("ARP", buf, ARP_HEADER_LEN)?;
        buf[..ARP_HEADER_LEN].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ARP_HEADER_LEN] {
        let mut out = [0u8; ARP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.hw_type.to_be_bytes());
        out[2..4].copy_from_slice(&self.proto_type.to_be_bytes());
        out[4] = self.hw_len;
        out[5] = self.proto_len;
        out[6..8].copy_from_slice(&self.opcode.to_be_bytes());
        out[8..14].copy_from_slice(self.src_mac.as_bytes());
        out[14..18].copy_from_slice(&self.src_ip.octets());
        out[18..24].copy_from_slice(self.dst_mac.as_bytes());
        out[24..28].copy_from_slice(&self.dst_ip.octets());
        out
    }
}

/// Destination address of the IPv4 header at the start of `buf`.
pub fn ipv4_destination(buf: &[u8]) -> Result<Ipv4Addr> {
    check_len("IPv4", buf, IPV4_MIN_HEADER_LEN)?;
    Ok(read_ipv4(buf, IPV4_DST_OFFSET))
}

/// Build a complete CPU + Ethernet + ARP frame.
pub fn build_arp_frame(cpu: CpuHeader, eth: EthernetHeader, arp: ArpHeader) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CPU_HEADER_LEN + ETHERNET_HEADER_LEN + ARP_HEADER_LEN);
    frame.extend_from_slice(&cpu.to_bytes());
    frame.extend_from_slice(&eth.to_bytes());
    frame.extend_from_slice(&arp.to_bytes());
    frame
}

/// Rewrite a queued frame for reinjection: new CPU header, new destination MAC.
///
/// The rest of the frame (source MAC, ethertype, payload) is left untouched.
pub fn rewrite_for_reinjection(
    frame: &mut [u8],
    cpu: CpuHeader,
    dst_mac: EthernetAddress,
) -> Result<()> {
    check_len("CPU+Ethernet", frame, CPU_HEADER_LEN + ETHERNET_HEADER_LEN)?;
    cpu.emit(frame)?;
    frame[CPU_HEADER_LEN..CPU_HEADER_LEN + 6].copy_from_slice(dst_mac.as_bytes());
    Ok(())
}
