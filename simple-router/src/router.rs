//! Router state machine.
//!
//! Owns the interfaces, the next-hop table and the per-next-hop queues of
//! packets waiting for ARP resolution, and keeps the switch tables in step
//! with them. Every method here runs on the executor task.

use crate::config::DeviceExtras;
use crate::device::entry::{ipv4_bytes, mac_bytes, u16_bytes};
use crate::device::{CounterData, DeviceApi, DeviceError, EntrySpec, MatchSpec, Switch};
use crate::p4info::DeviceDescription;
use crate::packet::{
    self, ArpHeader, ArpOp, CPU_HEADER_LEN, CodecError, CpuHeader, CpuReason,
    ETHERNET_HEADER_LEN, EthernetHeader,
};
use crate::packet_io::{PacketIoError, PacketSender};
use ipnet::Ipv4Net;
use smoltcp::wire::{EthernetAddress, EthernetProtocol};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Packet out failed: {0}")]
    PacketOut(#[from] PacketIoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device rejected {errors} update(s) on table {table}")]
    WriteRejected { table: &'static str, errors: usize },

    #[error("Interface already exists on port {0}")]
    DuplicateInterface(u16),

    #[error("Invalid ARP opcode {0}")]
    InvalidArpOpcode(u16),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// A router-facing port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub mac: EthernetAddress,
}

impl Interface {
    pub fn new(port: u16, ip: Ipv4Addr, mac: EthernetAddress) -> Self {
        Self { port, ip, mac }
    }
}

/// A static route: `prefix` is reached through `nhop` on `port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub prefix: Ipv4Net,
    pub nhop: Ipv4Addr,
    pub port: u16,
}

impl Route {
    pub fn new(prefix: Ipv4Net, nhop: Ipv4Addr, port: u16) -> Self {
        Self { prefix, nhop, port }
    }
}

/// Seed routes installed by [`Router::static_config`].
pub fn static_routes() -> [Route; 2] {
    let a = Ipv4Addr::new(10, 0, 0, 10);
    let b = Ipv4Addr::new(10, 0, 1, 10);
    [
        Route::new(Ipv4Net::from(a), a, 1),
        Route::new(Ipv4Net::from(b), b, 2),
    ]
}

/// Seed interfaces installed by [`Router::static_config`].
pub fn static_interfaces() -> [Interface; 2] {
    [
        Interface::new(
            1,
            Ipv4Addr::new(10, 0, 0, 1),
            EthernetAddress([0x00, 0xaa, 0xbb, 0x00, 0x00, 0x00]),
        ),
        Interface::new(
            2,
            Ipv4Addr::new(10, 0, 1, 1),
            EthernetAddress([0x00, 0xaa, 0xbb, 0x00, 0x00, 0x01]),
        ),
    ]
}

pub struct Router<D> {
    pub(crate) switch: Switch<D>,
    pub(crate) description: DeviceDescription,
    pub(crate) packets: PacketSender,
    pub(crate) extras: DeviceExtras,
    pub(crate) assigned: bool,
    interfaces: Vec<Interface>,
    routes: Vec<Route>,
    /// Next-hop address -> egress port. Exact match, unlike the device's LPM table.
    next_hops: HashMap<Ipv4Addr, u16>,
    /// Raw packets (CPU header included) waiting for a next hop's MAC
    pending: HashMap<Ipv4Addr, Vec<Vec<u8>>>,
}

impl<D: DeviceApi> Router<D> {
    pub fn new(
        switch: Switch<D>,
        description: DeviceDescription,
        packets: PacketSender,
        extras: DeviceExtras,
    ) -> Self {
        Self {
            switch,
            description,
            packets,
            extras,
            assigned: false,
            interfaces: Vec::new(),
            routes: Vec::new(),
            next_hops: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn switch(&self) -> &Switch<D> {
        &self.switch
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn next_hop(&self, addr: Ipv4Addr) -> Option<u16> {
        self.next_hops.get(&addr).copied()
    }

    /// Packets queued for `addr`, if a queue exists.
    pub fn pending(&self, addr: Ipv4Addr) -> Option<&[Vec<u8>]> {
        self.pending.get(&addr).map(Vec::as_slice)
    }

    async fn write(&mut self, table: &'static str, spec: EntrySpec<'_>) -> Result<()> {
        let errors = self.switch.write_entry(&self.description, &spec).await?;
        if errors > 0 {
            return Err(RouterError::WriteRejected { table, errors });
        }
        Ok(())
    }

    // === Routes ===

    pub fn apply_route_controller(&mut self, route: &Route) {
        self.next_hops.insert(route.nhop, route.port);
        if !self.routes.contains(route) {
            self.routes.push(*route);
        }
    }

    pub async fn apply_route_device(&mut self, route: &Route) -> Result<()> {
        let spec = EntrySpec::new("ipv4_lpm", "set_nhop")
            .with_match(MatchSpec::lpm(
                "ipv4.dstAddr",
                ipv4_bytes(route.prefix.network()),
                route.prefix.prefix_len(),
            ))
            .with_param("nhop_ipv4", ipv4_bytes(route.nhop))
            .with_param("port", u16_bytes(route.port));
        self.write("ipv4_lpm", spec).await
    }

    /// Install a route in both controller and device state.
    pub async fn add_route(&mut self, route: Route) -> Result<()> {
        info!(prefix = %route.prefix, nhop = %route.nhop, port = route.port, "Adding route");
        self.apply_route_controller(&route);
        self.apply_route_device(&route).await
    }

    // === Interfaces ===

    pub fn apply_interface_controller(&mut self, iface: &Interface) -> Result<()> {
        if self.interfaces.iter().any(|i| i.port == iface.port) {
            return Err(RouterError::DuplicateInterface(iface.port));
        }
        self.interfaces.push(*iface);
        Ok(())
    }

    pub async fn apply_interface_device(&mut self, iface: &Interface) -> Result<()> {
        let spec = EntrySpec::new("send_frame", "rewrite_mac")
            .with_match(MatchSpec::exact(
                "standard_metadata.egress_port",
                u16_bytes(iface.port),
            ))
            .with_param("smac", mac_bytes(iface.mac));
        self.write("send_frame", spec).await
    }

    /// Install an interface in both controller and device state.
    pub async fn add_interface(&mut self, iface: Interface) -> Result<()> {
        info!(port = iface.port, ip = %iface.ip, mac = %iface.mac, "Adding interface");
        self.apply_interface_controller(&iface)?;
        self.apply_interface_device(&iface).await
    }

    /// Install the seed routes and interfaces.
    pub async fn static_config(&mut self) -> Result<()> {
        for route in static_routes() {
            self.add_route(route).await?;
        }
        for iface in static_interfaces() {
            self.add_interface(iface).await?;
        }
        Ok(())
    }

    /// Re-program the device from controller state after a config swap.
    pub async fn replay_device_state(&mut self) -> Result<()> {
        for route in self.routes.clone() {
            self.apply_route_device(&route).await?;
        }
        for iface in self.interfaces.clone() {
            self.apply_interface_device(&iface).await?;
        }
        Ok(())
    }

    /// Map a resolved next hop to its MAC in the `forward` table.
    ///
    /// Returns the number of updates the device rejected.
    pub async fn add_arp_entry(&mut self, addr: Ipv4Addr, mac: EthernetAddress) -> Result<usize> {
        let spec = EntrySpec::new("forward", "set_dmac")
            .with_match(MatchSpec::exact(
                "routing_metadata.nhop_ipv4",
                ipv4_bytes(addr),
            ))
            .with_param("dmac", mac_bytes(mac));
        Ok(self.switch.write_entry(&self.description, &spec).await?)
    }

    /// Read one cell of a counter array from the device.
    pub async fn read_counter(
        &mut self,
        name: &str,
        index: u64,
    ) -> std::result::Result<CounterData, DeviceError> {
        self.switch
            .read_counter(&self.description, name, index)
            .await
    }

    /// Send an arbitrary frame (CPU header included) to the switch.
    pub fn send_packet(&self, frame: Vec<u8>) -> Result<()> {
        Ok(self.packets.send_packet(frame)?)
    }

    // === Packet-in ===

    /// Dispatch a packet-in on its CPU reason code.
    pub async fn handle_packet_in(&mut self, cpu: CpuHeader, frame: Vec<u8>) -> Result<()> {
        let l3 = CPU_HEADER_LEN + ETHERNET_HEADER_LEN;
        if frame.len() < l3 {
            debug!(len = frame.len(), "Dropping short packet-in");
            return Ok(());
        }

        match cpu.reason() {
            Some(CpuReason::NoArpEntry) => match packet::ipv4_destination(&frame[l3..]) {
                Ok(dst) => self.handle_ip(frame, dst),
                Err(e) => {
                    debug!(error = %e, "Dropping packet-in");
                    Ok(())
                }
            },
            Some(CpuReason::ArpMsg) => match ArpHeader::decode(&frame[l3..]) {
                Ok(arp) => self.handle_arp(&arp).await,
                Err(e) => {
                    debug!(error = %e, "Dropping packet-in");
                    Ok(())
                }
            },
            _ => {
                debug!(reason = cpu.reason, port = cpu.port, "Ignoring packet-in");
                Ok(())
            }
        }
    }

    /// Queue a packet for an unresolved next hop and ask for its MAC.
    fn handle_ip(&mut self, frame: Vec<u8>, dst: Ipv4Addr) -> Result<()> {
        let Some(&port) = self.next_hops.get(&dst) else {
            trace!(dst = %dst, "No route, dropping");
            return Ok(());
        };
        self.pending.entry(dst).or_default().push(frame);
        self.send_arp_request(port, dst)
    }

    fn send_arp_request(&self, port: u16, dst: Ipv4Addr) -> Result<()> {
        let Some(iface) = self.interfaces.iter().find(|i| i.port == port) else {
            debug!(port, "No interface for port, not sending ARP request");
            return Ok(());
        };
        let frame = packet::build_arp_frame(
            CpuHeader::new(CpuReason::ArpMsg, port),
            EthernetHeader {
                dst: EthernetAddress::BROADCAST,
                src: iface.mac,
                ethertype: EthernetProtocol::Arp,
            },
            ArpHeader::new(
                ArpOp::Request,
                iface.mac,
                iface.ip,
                EthernetAddress::BROADCAST,
                dst,
            ),
        );
        info!(port, target = %dst, "Sending ARP request");
        self.send_packet(frame)
    }

    async fn handle_arp(&mut self, arp: &ArpHeader) -> Result<()> {
        match arp.op() {
            Some(ArpOp::Request) => {
                debug!(sender = %arp.src_ip, target = %arp.dst_ip, "ARP request");
                self.handle_arp_request(arp)
            }
            Some(ArpOp::Reply) => {
                debug!(sender = %arp.src_ip, mac = %arp.src_mac, "ARP reply");
                self.handle_arp_reply(arp).await
            }
            None => {
                error!(opcode = arp.opcode, "Invalid ARP opcode");
                Err(RouterError::InvalidArpOpcode(arp.opcode))
            }
        }
    }

    fn handle_arp_request(&self, arp: &ArpHeader) -> Result<()> {
        let Some(iface) = self.interfaces.iter().find(|i| i.ip == arp.dst_ip) else {
            return Ok(());
        };
        let frame = packet::build_arp_frame(
            CpuHeader::new(CpuReason::ArpMsg, iface.port),
            EthernetHeader {
                dst: arp.src_mac,
                src: iface.mac,
                ethertype: EthernetProtocol::Arp,
            },
            ArpHeader::new(ArpOp::Reply, iface.mac, iface.ip, arp.src_mac, arp.src_ip),
        );
        info!(port = iface.port, target = %arp.src_ip, "Sending ARP reply");
        self.send_packet(frame)
    }

    async fn handle_arp_reply(&mut self, arp: &ArpHeader) -> Result<()> {
        let addr = arp.src_ip;
        let mac = arp.src_mac;
        let errors = self.add_arp_entry(addr, mac).await?;
        if errors > 0 {
            warn!(nhop = %addr, errors, "ARP entry not installed");
        }

        let Some(queue) = self.pending.remove(&addr) else {
            return Ok(());
        };
        let Some(port) = self.next_hop(addr) else {
            debug!(nhop = %addr, dropped = queue.len(), "Next hop vanished, dropping queue");
            return Ok(());
        };
        let cpu = CpuHeader::new(CpuReason::DataPkt, port);
        for mut frame in queue {
            packet::rewrite_for_reinjection(&mut frame, cpu, mac)?;
            info!(port, nhop = %addr, "Reinjecting data packet");
            self.send_packet(frame)?;
        }
        Ok(())
    }
}
