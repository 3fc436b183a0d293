//! In-process fake switch for integration tests.
//!
//! Serves the `Runtime`, `Device` and `Resource` services on a loopback
//! listener. Unary RPCs are answered by a [`FakeDevice`]; packet-outs are
//! collected on a channel and packet-ins can be injected into the open stream.

#![allow(dead_code)]

use simple_router::device::DeviceApi;
use simple_router::proto::RpcStatus;
use simple_router::proto::p4::runtime_server::{Runtime, RuntimeServer};
use simple_router::proto::p4::tmp::device_server::{Device, DeviceServer};
use simple_router::proto::p4::tmp::resource_server::{Resource, ResourceServer};
use simple_router::proto::p4::tmp::{
    CounterReadRequest, CounterReadResponse, DeviceAssignRequest, DeviceUpdateEndRequest,
    DeviceUpdateStartRequest,
};
use simple_router::proto::p4::{
    PacketIn, PacketInUpdate, PacketOutUpdate, TableWriteRequest, TableWriteResponse,
};
use simple_router::test_util::FakeDevice;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

const WAIT: Duration = Duration::from_secs(5);

type PacketInSender = mpsc::Sender<Result<PacketInUpdate, Status>>;

#[derive(Clone)]
struct SwitchService {
    device: FakeDevice,
    packet_out: mpsc::UnboundedSender<PacketOutUpdate>,
    packet_in: Arc<Mutex<Option<PacketInSender>>>,
}

#[tonic::async_trait]
impl Runtime for SwitchService {
    async fn table_write(
        &self,
        request: Request<TableWriteRequest>,
    ) -> Result<Response<TableWriteResponse>, Status> {
        let mut device = self.device.clone();
        device.table_write(request.into_inner()).await.map(Response::new)
    }

    type PacketStreamStream = ReceiverStream<Result<PacketInUpdate, Status>>;

    async fn packet_stream(
        &self,
        request: Request<Streaming<PacketOutUpdate>>,
    ) -> Result<Response<Self::PacketStreamStream>, Status> {
        let mut outbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        *self.packet_in.lock().unwrap() = Some(tx);

        let packet_out = self.packet_out.clone();
        tokio::spawn(async move {
            while let Some(Ok(update)) = outbound.next().await {
                if packet_out.send(update).is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tonic::async_trait]
impl Device for SwitchService {
    async fn device_assign(
        &self,
        request: Request<DeviceAssignRequest>,
    ) -> Result<Response<RpcStatus>, Status> {
        let mut device = self.device.clone();
        device.device_assign(request.into_inner()).await.map(Response::new)
    }

    async fn device_update_start(
        &self,
        request: Request<DeviceUpdateStartRequest>,
    ) -> Result<Response<RpcStatus>, Status> {
        let mut device = self.device.clone();
        device
            .device_update_start(request.into_inner())
            .await
            .map(Response::new)
    }

    async fn device_update_end(
        &self,
        request: Request<DeviceUpdateEndRequest>,
    ) -> Result<Response<RpcStatus>, Status> {
        let mut device = self.device.clone();
        device
            .device_update_end(request.into_inner())
            .await
            .map(Response::new)
    }
}

#[tonic::async_trait]
impl Resource for SwitchService {
    async fn counter_read(
        &self,
        request: Request<CounterReadRequest>,
    ) -> Result<Response<CounterReadResponse>, Status> {
        let mut device = self.device.clone();
        device.counter_read(request.into_inner()).await.map(Response::new)
    }
}

/// A fake switch listening on an ephemeral loopback port.
pub struct FakeSwitch {
    pub addr: String,
    pub device: FakeDevice,
    packet_out: mpsc::UnboundedReceiver<PacketOutUpdate>,
    packet_in: Arc<Mutex<Option<PacketInSender>>>,
    server: JoinHandle<()>,
}

impl FakeSwitch {
    pub async fn start() -> Self {
        Self::start_with(FakeDevice::new()).await
    }

    /// Start serving with a pre-scripted device.
    pub async fn start_with(device: FakeDevice) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let (packet_out_tx, packet_out) = mpsc::unbounded_channel();
        let packet_in = Arc::new(Mutex::new(None));
        let service = SwitchService {
            device: device.clone(),
            packet_out: packet_out_tx,
            packet_in: Arc::clone(&packet_in),
        };

        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(RuntimeServer::new(service.clone()))
                .add_service(DeviceServer::new(service.clone()))
                .add_service(ResourceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        Self {
            addr,
            device,
            packet_out,
            packet_in,
            server,
        }
    }

    /// Next message the controller wrote to the packet stream.
    pub async fn next_packet_out(&mut self) -> PacketOutUpdate {
        timeout(WAIT, self.packet_out.recv())
            .await
            .expect("timed out waiting for packet-out")
            .expect("packet stream closed")
    }

    /// Assert nothing is written to the packet stream for a short while.
    pub async fn expect_no_packet_out(&mut self) {
        let next = timeout(Duration::from_millis(200), self.packet_out.recv()).await;
        assert!(next.is_err(), "unexpected packet-out: {next:?}");
    }

    /// Send a packet-in to the controller.
    pub async fn inject(&self, payload: Vec<u8>) {
        let tx = self
            .packet_in
            .lock()
            .unwrap()
            .clone()
            .expect("packet stream not open");
        tx.send(Ok(PacketInUpdate {
            packet: Some(PacketIn { payload }),
        }))
        .await
        .unwrap();
    }
}

impl Drop for FakeSwitch {
    fn drop(&mut self) {
        self.server.abort();
    }
}
