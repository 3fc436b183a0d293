//! End-to-end controller flow against an in-process fake switch.

mod common;

use common::FakeSwitch;
use simple_router::config_sync::ConfigError;
use simple_router::device::CounterData;
use simple_router::packet::{
    ArpHeader, ArpOp, CPU_HEADER_LEN, CpuHeader, CpuReason, ETHERNET_HEADER_LEN, EthernetHeader,
};
use simple_router::proto::p4::packet_out_update::{Init, Update};
use simple_router::proto::p4::PacketOutUpdate;
use simple_router::test_util::{
    FakeDevice, HOST_MAC, SIMPLE_ROUTER_JSON, arp_packet_in, description, ipv4_packet_in,
    payload_of,
};
use simple_router::{Controller, ControllerConfig, QueryError};
use smoltcp::wire::{EthernetAddress, EthernetProtocol};
use std::net::Ipv4Addr;

const NHOP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
const PORT1_MAC: EthernetAddress = EthernetAddress([0x00, 0xaa, 0xbb, 0x00, 0x00, 0x00]);

fn decode(update: &PacketOutUpdate) -> (CpuHeader, EthernetHeader, Vec<u8>) {
    let frame = payload_of(update).expect("packet-out carries a packet");
    let cpu = CpuHeader::decode(frame).unwrap();
    let eth = EthernetHeader::decode(&frame[CPU_HEADER_LEN..]).unwrap();
    (cpu, eth, frame[CPU_HEADER_LEN + ETHERNET_HEADER_LEN..].to_vec())
}

async fn connected(switch: &mut FakeSwitch) -> Controller {
    let config = ControllerConfig::default()
        .with_grpc_addr(switch.addr.clone())
        .with_device_id(7);
    let controller = Controller::connect(&config, description()).await.unwrap();

    let init = switch.next_packet_out().await;
    assert_eq!(init.update, Some(Update::Init(Init { device_id: 7 })));

    let handle = controller.handle();
    handle.set_default_entries().await.unwrap();
    handle.static_config().await.unwrap();
    controller
}

#[tokio::test]
async fn test_assign_and_bootstrap() {
    let mut switch = FakeSwitch::start().await;
    let controller = connected(&mut switch).await;

    let assigns = switch.device.assigns();
    assert_eq!(assigns.len(), 1);
    assert_eq!(assigns[0].device_id, 7);
    let kv = &assigns[0].extras.as_ref().unwrap().kv;
    assert_eq!(kv["port"], "9090");
    assert_eq!(kv["notifications"], "ipc:///tmp/bmv2-0-notifications.ipc");
    assert_eq!(kv["cpu_iface"], "veth251");

    // default entry + 2 routes + 2 interfaces
    let writes = switch.device.table_writes();
    assert_eq!(writes.len(), 5);
    assert!(writes.iter().all(|w| w.device_id == 7));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_arp_resolution_and_reinjection() {
    let mut switch = FakeSwitch::start().await;
    let controller = connected(&mut switch).await;

    let data = ipv4_packet_in(NHOP);
    switch.inject(data.clone()).await;

    let (cpu, eth, rest) = decode(&switch.next_packet_out().await);
    assert_eq!(cpu, CpuHeader::new(CpuReason::ArpMsg, 1));
    assert_eq!(eth.dst, EthernetAddress::BROADCAST);
    assert_eq!(eth.src, PORT1_MAC);
    let request = ArpHeader::decode(&rest).unwrap();
    assert_eq!(request.op(), Some(ArpOp::Request));
    assert_eq!(request.dst_ip, NHOP);

    switch
        .inject(arp_packet_in(
            ArpOp::Reply,
            HOST_MAC,
            NHOP,
            PORT1_MAC,
            Ipv4Addr::new(10, 0, 0, 1),
        ))
        .await;

    let (cpu, eth, rest) = decode(&switch.next_packet_out().await);
    assert_eq!(cpu, CpuHeader::new(CpuReason::DataPkt, 1));
    assert_eq!(eth.dst, HOST_MAC);
    assert_eq!(eth.ethertype, EthernetProtocol::Ipv4);
    assert_eq!(rest, data[CPU_HEADER_LEN + ETHERNET_HEADER_LEN..].to_vec());

    let writes = switch.device.table_writes();
    assert_eq!(writes.len(), 6);
    let desc = description();
    let entry = writes[5].updates[0].table_entry.as_ref().unwrap();
    assert_eq!(Some(entry.table_id), desc.table_id("forward"));

    // A second reply finds no queue: entry written again, nothing reinjected
    switch
        .inject(arp_packet_in(
            ArpOp::Reply,
            HOST_MAC,
            NHOP,
            PORT1_MAC,
            Ipv4Addr::new(10, 0, 0, 1),
        ))
        .await;
    switch.expect_no_packet_out().await;

    controller.shutdown().await;
}

#[tokio::test]
async fn test_arp_requests_for_router_addresses() {
    let mut switch = FakeSwitch::start().await;
    let controller = connected(&mut switch).await;

    switch
        .inject(arp_packet_in(
            ArpOp::Request,
            HOST_MAC,
            NHOP,
            EthernetAddress([0; 6]),
            Ipv4Addr::new(10, 0, 0, 1),
        ))
        .await;
    let (cpu, eth, rest) = decode(&switch.next_packet_out().await);
    assert_eq!(cpu, CpuHeader::new(CpuReason::ArpMsg, 1));
    assert_eq!(eth.dst, HOST_MAC);
    let reply = ArpHeader::decode(&rest).unwrap();
    assert_eq!(reply.op(), Some(ArpOp::Reply));
    assert_eq!(reply.src_mac, PORT1_MAC);
    assert_eq!(reply.dst_ip, NHOP);

    // Not one of ours
    switch
        .inject(arp_packet_in(
            ArpOp::Request,
            HOST_MAC,
            NHOP,
            EthernetAddress([0; 6]),
            Ipv4Addr::new(10, 0, 0, 2),
        ))
        .await;
    // Garbage is dropped without disturbing the stream
    switch.inject(vec![0xff; 40]).await;
    switch.expect_no_packet_out().await;

    controller.shutdown().await;
}

#[tokio::test]
async fn test_counter_queries() {
    let mut switch = FakeSwitch::start().await;
    let desc = description();
    let counter = desc.counter_id("port_counter").unwrap();
    switch.device.set_counter(counter, 2, 42, 4200);
    let controller = connected(&mut switch).await;
    let handle = controller.handle();

    let data = handle.query_counter("port_counter", 2).await.unwrap();
    assert_eq!(data, CounterData { packets: 42, bytes: 4200 });

    assert!(matches!(
        handle.query_counter("no_such_counter", 0).await,
        Err(QueryError::CounterUnavailable { .. })
    ));
    assert!(matches!(
        handle.query_counter("port_counter", 3).await,
        Err(QueryError::CounterUnavailable { .. })
    ));

    let h = handle.clone();
    let data = tokio::task::spawn_blocking(move || h.query_counter_blocking("port_counter", 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.packets, 42);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_config_update() {
    let mut switch = FakeSwitch::start().await;
    let controller = connected(&mut switch).await;
    let handle = controller.handle();

    handle
        .update_config(SIMPLE_ROUTER_JSON.as_bytes().to_vec())
        .await
        .unwrap();
    let starts = switch.device.update_starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].device_id, 7);
    assert!(starts[0].p4info.is_some());
    assert_eq!(switch.device.update_ends(), 1);
    // 5 at bootstrap, then default entry + 2 routes + 2 interfaces again
    assert_eq!(switch.device.table_writes().len(), 10);

    switch.device.set_update_start_status(3);
    assert!(matches!(
        handle.update_config(SIMPLE_ROUTER_JSON.as_bytes().to_vec()).await,
        Err(QueryError::Config(ConfigError::Start(_)))
    ));
    assert_eq!(switch.device.update_ends(), 1);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_rejected_assignment_fails_connect() {
    let device = FakeDevice::new();
    device.set_assign_status(2);
    let switch = FakeSwitch::start_with(device).await;

    let config = ControllerConfig::default().with_grpc_addr(switch.addr.clone());
    let result = Controller::connect(&config, description()).await;
    assert!(matches!(
        result,
        Err(QueryError::Config(ConfigError::Assign(_)))
    ));
}
