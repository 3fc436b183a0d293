//! Test utilities: an in-memory switch and packet builders.
//!
//! Shared by the unit tests and the integration tests under `tests/`.

use crate::config::DeviceExtras;
use crate::device::{DeviceApi, Switch};
use crate::p4info::DeviceDescription;
use crate::packet::{
    self, ArpHeader, ArpOp, CpuHeader, CpuReason, EthernetHeader, IPV4_MIN_HEADER_LEN,
};
use crate::packet_io::PacketSender;
use crate::proto::p4::tmp::{
    CounterData, CounterEntry, CounterReadRequest, CounterReadResponse, DeviceAssignRequest,
    DeviceUpdateEndRequest, DeviceUpdateStartRequest,
};
use crate::proto::p4::{PacketOutUpdate, TableWriteRequest, TableWriteResponse, packet_out_update};
use crate::proto::{CODE_OK, RpcStatus};
use crate::router::Router;
use async_trait::async_trait;
use smoltcp::wire::{EthernetAddress, EthernetProtocol};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// bmv2 JSON of the simple router program
pub const SIMPLE_ROUTER_JSON: &str = include_str!("../config/simple_router.json");

/// MAC of the host behind port 1 in the test topology
pub const HOST_MAC: EthernetAddress = EthernetAddress([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);

/// Parsed [`SIMPLE_ROUTER_JSON`].
pub fn description() -> DeviceDescription {
    DeviceDescription::parse(SIMPLE_ROUTER_JSON.as_bytes())
        .expect("bundled description must parse")
}

#[derive(Default)]
struct FakeState {
    assigns: Vec<DeviceAssignRequest>,
    update_starts: Vec<DeviceUpdateStartRequest>,
    update_ends: usize,
    table_writes: Vec<TableWriteRequest>,
    counter_reads: Vec<CounterReadRequest>,
    assign_status: i32,
    update_start_status: i32,
    update_end_status: i32,
    reject_writes: usize,
    fail_rpcs: bool,
    counters: Vec<CounterEntry>,
}

/// In-memory switch recording every request.
///
/// Clones share state, so a test keeps one clone for inspection while the
/// router owns another.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn assigns(&self) -> Vec<DeviceAssignRequest> {
        self.state().assigns.clone()
    }

    pub fn update_starts(&self) -> Vec<DeviceUpdateStartRequest> {
        self.state().update_starts.clone()
    }

    pub fn update_ends(&self) -> usize {
        self.state().update_ends
    }

    pub fn table_writes(&self) -> Vec<TableWriteRequest> {
        self.state().table_writes.clone()
    }

    pub fn counter_reads(&self) -> Vec<CounterReadRequest> {
        self.state().counter_reads.clone()
    }

    pub fn set_assign_status(&self, code: i32) {
        self.state().assign_status = code;
    }

    pub fn set_update_start_status(&self, code: i32) {
        self.state().update_start_status = code;
    }

    pub fn set_update_end_status(&self, code: i32) {
        self.state().update_end_status = code;
    }

    /// Report one error for each of the next `n` table writes.
    pub fn reject_next_writes(&self, n: usize) {
        self.state().reject_writes = n;
    }

    /// Fail every RPC at the transport level.
    pub fn fail_rpcs(&self, fail: bool) {
        self.state().fail_rpcs = fail;
    }

    pub fn set_counter(&self, counter_id: u32, index: u64, packets: u64, bytes: u64) {
        self.state().counters.push(CounterEntry {
            counter_id,
            index,
            data: Some(CounterData { bytes, packets }),
        });
    }

    fn check_transport(state: &FakeState) -> Result<(), tonic::Status> {
        if state.fail_rpcs {
            return Err(tonic::Status::unavailable("fake device unreachable"));
        }
        Ok(())
    }
}

fn status(code: i32) -> RpcStatus {
    RpcStatus {
        code,
        message: if code == CODE_OK {
            String::new()
        } else {
            format!("fake error {code}")
        },
    }
}

#[async_trait]
impl DeviceApi for FakeDevice {
    async fn device_assign(&mut self, req: DeviceAssignRequest) -> Result<RpcStatus, tonic::Status> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.assigns.push(req);
        Ok(status(state.assign_status))
    }

    async fn device_update_start(
        &mut self,
        req: DeviceUpdateStartRequest,
    ) -> Result<RpcStatus, tonic::Status> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.update_starts.push(req);
        Ok(status(state.update_start_status))
    }

    async fn device_update_end(
        &mut self,
        _req: DeviceUpdateEndRequest,
    ) -> Result<RpcStatus, tonic::Status> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.update_ends += 1;
        Ok(status(state.update_end_status))
    }

    async fn table_write(
        &mut self,
        req: TableWriteRequest,
    ) -> Result<TableWriteResponse, tonic::Status> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        let errors = if state.reject_writes > 0 {
            state.reject_writes -= 1;
            req.updates.iter().map(|_| status(6)).collect()
        } else {
            Vec::new()
        };
        state.table_writes.push(req);
        Ok(TableWriteResponse { errors })
    }

    async fn counter_read(
        &mut self,
        req: CounterReadRequest,
    ) -> Result<CounterReadResponse, tonic::Status> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        let entries = state
            .counters
            .iter()
            .filter(|e| req.counter_ids.contains(&e.counter_id))
            .cloned()
            .collect();
        state.counter_reads.push(req);
        Ok(CounterReadResponse { entries })
    }
}

/// A router over a fresh [`FakeDevice`] (device id 0, default extras), plus
/// the packet-out receiver.
pub fn test_router() -> (
    Router<FakeDevice>,
    FakeDevice,
    mpsc::UnboundedReceiver<PacketOutUpdate>,
) {
    let fake = FakeDevice::new();
    let (packets, rx) = PacketSender::channel();
    let router = Router::new(
        Switch::new(fake.clone(), 0),
        description(),
        packets,
        DeviceExtras::default(),
    );
    (router, fake, rx)
}

/// Payload of a packet-out message, `None` for `Init`.
pub fn payload_of(update: &PacketOutUpdate) -> Option<&[u8]> {
    match &update.update {
        Some(packet_out_update::Update::Packet(p)) => Some(p.payload.as_slice()),
        _ => None,
    }
}

/// Every packet-out payload queued so far.
pub fn drain_payloads(rx: &mut mpsc::UnboundedReceiver<PacketOutUpdate>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        if let Some(payload) = payload_of(&update) {
            out.push(payload.to_vec());
        }
    }
    out
}

/// A NO_ARP_ENTRY packet-in carrying a small UDP datagram to `dst`.
pub fn ipv4_packet_in(dst: Ipv4Addr) -> Vec<u8> {
    let mut frame = CpuHeader::new(CpuReason::NoArpEntry, 0).to_bytes().to_vec();
    frame.extend_from_slice(
        &EthernetHeader {
            dst: EthernetAddress([0x00, 0xaa, 0xbb, 0x00, 0x00, 0x01]),
            src: EthernetAddress([0xde, 0xad, 0xbe, 0xef, 0x00, 0x02]),
            ethertype: EthernetProtocol::Ipv4,
        }
        .to_bytes(),
    );

    let payload = [0x13, 0x88, 0x13, 0x89, 0x00, 0x08, 0x00, 0x00];
    let total_len = (IPV4_MIN_HEADER_LEN + payload.len()) as u16;
    let mut ip = [0u8; IPV4_MIN_HEADER_LEN];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&[10, 0, 1, 10]);
    ip[16..20].copy_from_slice(&dst.octets());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&payload);
    frame
}

/// An ARP_MSG packet-in received on port 1.
pub fn arp_packet_in(
    op: ArpOp,
    src_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_mac: EthernetAddress,
    dst_ip: Ipv4Addr,
) -> Vec<u8> {
    let eth_dst = match op {
        ArpOp::Request => EthernetAddress::BROADCAST,
        ArpOp::Reply => dst_mac,
    };
    packet::build_arp_frame(
        CpuHeader::new(CpuReason::ArpMsg, 1),
        EthernetHeader {
            dst: eth_dst,
            src: src_mac,
            ethertype: EthernetProtocol::Arp,
        },
        ArpHeader::new(op, src_mac, src_ip, dst_mac, dst_ip),
    )
}
