//! Serialized executor and the query bridge into it.
//!
//! One task owns the [`Router`] and runs [`Command`]s strictly in the order
//! they were posted. [`RouterHandle`] is the posting side: commands that
//! produce a result carry a oneshot responder, and callers await (or block on)
//! it. A command that waits on a device RPC holds up everything behind it.

use crate::config::ControllerConfig;
use crate::config_sync::ConfigError;
use crate::device::{CounterData, DeviceApi, DeviceError, GrpcDevice, Switch};
use crate::p4info::DeviceDescription;
use crate::packet::CpuHeader;
use crate::packet_io::{self, PacketSender};
use crate::router::{Interface, Route, Router, RouterError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors seen by callers posting to the executor.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Executor is not running")]
    ExecutorGone,

    #[error("Counter {name}[{index}] unavailable")]
    CounterUnavailable { name: String, index: u64 },

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Device connection failed: {0}")]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, QueryError>;

type Responder<T> = oneshot::Sender<T>;

/// Work posted to the executor.
#[derive(Debug)]
pub enum Command {
    PacketIn {
        cpu: CpuHeader,
        frame: Vec<u8>,
    },
    AddRoute {
        route: Route,
        responder: Responder<std::result::Result<(), RouterError>>,
    },
    AddInterface {
        iface: Interface,
        responder: Responder<std::result::Result<(), RouterError>>,
    },
    StaticConfig {
        responder: Responder<std::result::Result<(), RouterError>>,
    },
    SendPacket {
        frame: Vec<u8>,
        responder: Responder<std::result::Result<(), RouterError>>,
    },
    Assign {
        responder: Responder<std::result::Result<(), ConfigError>>,
    },
    SetDefaultEntries {
        responder: Responder<std::result::Result<(), ConfigError>>,
    },
    /// Answered with [`CounterData::UNAVAILABLE`] on failure
    QueryCounter {
        name: String,
        index: u64,
        responder: Responder<CounterData>,
    },
    UpdateConfig {
        raw: Vec<u8>,
        responder: Responder<std::result::Result<(), ConfigError>>,
    },
}

/// The task owning the router.
pub struct Executor<D> {
    router: Router<D>,
    commands: mpsc::Receiver<Command>,
}

impl<D: DeviceApi> Executor<D> {
    pub fn new(router: Router<D>, commands: mpsc::Receiver<Command>) -> Self {
        Self { router, commands }
    }

    /// Run commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("Executor running");
        while let Some(cmd) = self.commands.recv().await {
            self.handle_command(cmd).await;
        }
        info!("Executor: channel closed, shutting down");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PacketIn { cpu, frame } => {
                if let Err(e) = self.router.handle_packet_in(cpu, frame).await {
                    warn!(error = %e, "Packet-in handling failed");
                }
            }
            Command::AddRoute { route, responder } => {
                let _ = responder.send(self.router.add_route(route).await);
            }
            Command::AddInterface { iface, responder } => {
                let _ = responder.send(self.router.add_interface(iface).await);
            }
            Command::StaticConfig { responder } => {
                let _ = responder.send(self.router.static_config().await);
            }
            Command::SendPacket { frame, responder } => {
                let _ = responder.send(self.router.send_packet(frame));
            }
            Command::Assign { responder } => {
                let _ = responder.send(self.router.assign().await);
            }
            Command::SetDefaultEntries { responder } => {
                let _ = responder.send(self.router.set_default_entries().await);
            }
            Command::QueryCounter {
                name,
                index,
                responder,
            } => {
                let data = match self.router.read_counter(&name, index).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(counter = %name, index, error = %e, "Counter read failed");
                        CounterData::UNAVAILABLE
                    }
                };
                let _ = responder.send(data);
            }
            Command::UpdateConfig { raw, responder } => {
                let result = self.router.update_config(&raw).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Config update failed");
                }
                let _ = responder.send(result);
            }
        }
    }
}

/// Spawn an executor for `router` on the current runtime.
pub fn spawn<D: DeviceApi>(router: Router<D>, capacity: usize) -> (RouterHandle, JoinHandle<()>) {
    let (handle, commands) = RouterHandle::detached(capacity);
    let task = tokio::spawn(Executor::new(router, commands).run());
    (handle, task)
}

/// Cloneable handle posting commands to the executor.
///
/// The `*_blocking` variants are for plain threads; calling them from within
/// an async context panics.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    /// A handle plus the raw command receiver, for driving an executor by hand.
    ///
    /// A zero `capacity` is raised to 1.
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn request<T>(&self, make: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| QueryError::ExecutorGone)?;
        rx.await.map_err(|_| QueryError::ExecutorGone)
    }

    fn request_blocking<T>(&self, make: impl FnOnce(Responder<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .blocking_send(make(tx))
            .map_err(|_| QueryError::ExecutorGone)?;
        rx.blocking_recv().map_err(|_| QueryError::ExecutorGone)
    }

    /// Post a decoded packet-in. Does not wait for it to be handled.
    pub async fn packet_in(&self, cpu: CpuHeader, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(Command::PacketIn { cpu, frame })
            .await
            .map_err(|_| QueryError::ExecutorGone)
    }

    pub async fn add_route(&self, route: Route) -> Result<()> {
        Ok(self
            .request(|responder| Command::AddRoute { route, responder })
            .await??)
    }

    pub async fn add_interface(&self, iface: Interface) -> Result<()> {
        Ok(self
            .request(|responder| Command::AddInterface { iface, responder })
            .await??)
    }

    pub async fn static_config(&self) -> Result<()> {
        Ok(self
            .request(|responder| Command::StaticConfig { responder })
            .await??)
    }

    /// Send a raw frame (CPU header included) from the executor.
    pub async fn send_packet(&self, frame: Vec<u8>) -> Result<()> {
        Ok(self
            .request(|responder| Command::SendPacket { frame, responder })
            .await??)
    }

    pub async fn assign(&self) -> Result<()> {
        Ok(self
            .request(|responder| Command::Assign { responder })
            .await??)
    }

    pub async fn set_default_entries(&self) -> Result<()> {
        Ok(self
            .request(|responder| Command::SetDefaultEntries { responder })
            .await??)
    }

    pub async fn query_counter(&self, name: &str, index: u64) -> Result<CounterData> {
        let data = self
            .request(|responder| Command::QueryCounter {
                name: name.to_string(),
                index,
                responder,
            })
            .await?;
        counter_result(name, index, data)
    }

    pub fn query_counter_blocking(&self, name: &str, index: u64) -> Result<CounterData> {
        let data = self.request_blocking(|responder| Command::QueryCounter {
            name: name.to_string(),
            index,
            responder,
        })?;
        counter_result(name, index, data)
    }

    /// Push a new bmv2 JSON configuration through the three-phase replace.
    pub async fn update_config(&self, raw: Vec<u8>) -> Result<()> {
        Ok(self
            .request(|responder| Command::UpdateConfig { raw, responder })
            .await??)
    }

    pub fn update_config_blocking(&self, raw: Vec<u8>) -> Result<()> {
        Ok(self.request_blocking(|responder| Command::UpdateConfig { raw, responder })??)
    }
}

fn counter_result(name: &str, index: u64, data: CounterData) -> Result<CounterData> {
    if data.is_unavailable() {
        return Err(QueryError::CounterUnavailable {
            name: name.to_string(),
            index,
        });
    }
    Ok(data)
}

/// A running controller: executor plus packet receive loop.
pub struct Controller {
    handle: RouterHandle,
    executor: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl Controller {
    /// Connect to the switch, assign the device and open the packet stream.
    pub async fn connect(config: &ControllerConfig, description: DeviceDescription) -> Result<Self> {
        let mut device = GrpcDevice::connect(&config.grpc_addr).await?;
        let (packets, outbound) = PacketSender::channel();
        let router = Router::new(
            Switch::new(device.clone(), config.device_id),
            description,
            packets,
            config.extras.clone(),
        );
        let (handle, executor) = spawn(router, config.command_capacity);

        // Assignment queues the stream's Init message.
        if let Err(e) = handle.assign().await {
            executor.abort();
            return Err(e);
        }
        let receiver = match packet_io::open(&mut device, outbound, handle.clone()).await {
            Ok(receiver) => receiver,
            Err(e) => {
                executor.abort();
                return Err(e.into());
            }
        };

        info!(addr = %config.grpc_addr, device_id = config.device_id, "Controller connected");
        Ok(Self {
            handle,
            executor,
            receiver,
        })
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Stop the receive loop and the executor.
    pub async fn shutdown(self) {
        debug!("Shutting down controller");
        self.receiver.abort();
        self.executor.abort();
        let _ = self.receiver.await;
        let _ = self.executor.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CpuReason;
    use crate::test_util::{HOST_MAC, drain_payloads, ipv4_packet_in, test_router};
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_zero_capacity_is_usable() {
        let (router, _fake, _rx) = test_router();
        let (handle, task) = spawn(router, 0);

        handle.static_config().await.unwrap();

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let (router, fake, mut rx) = test_router();
        let (handle, task) = spawn(router, 16);

        handle.static_config().await.unwrap();
        let frame = ipv4_packet_in(Ipv4Addr::new(10, 0, 0, 10));
        let cpu = CpuHeader::decode(&frame).unwrap();
        handle.packet_in(cpu, frame).await.unwrap();
        // Round trip through the executor: the packet-in above has been handled
        handle.set_default_entries().await.unwrap();

        assert_eq!(drain_payloads(&mut rx).len(), 1);
        assert_eq!(fake.table_writes().len(), 5);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_counter() {
        let (router, fake, _rx) = test_router();
        let id = router.description().counter_id("port_counter").unwrap();
        fake.set_counter(id, 1, 10, 1500);
        let (handle, _task) = spawn(router, 16);

        let data = handle.query_counter("port_counter", 1).await.unwrap();
        assert_eq!(data, CounterData { packets: 10, bytes: 1500 });

        let err = handle.query_counter("nope", 0).await.unwrap_err();
        assert!(matches!(err, QueryError::CounterUnavailable { index: 0, .. }));

        let err = handle.query_counter("port_counter", 3).await.unwrap_err();
        assert!(matches!(err, QueryError::CounterUnavailable { index: 3, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_bridge() {
        let (router, fake, _rx) = test_router();
        let id = router.description().counter_id("ipv4_lpm_counter").unwrap();
        fake.set_counter(id, 0, 1, 64);
        let (handle, _task) = spawn(router, 16);

        let h = handle.clone();
        let data = tokio::task::spawn_blocking(move || h.query_counter_blocking("ipv4_lpm_counter", 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.bytes, 64);

        let h = handle.clone();
        let result = tokio::task::spawn_blocking(move || h.update_config_blocking(b"{".to_vec()))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(QueryError::Config(ConfigError::Description(_)))
        ));
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_executor() {
        let (router, _fake, mut rx) = test_router();
        let (handle, _task) = spawn(router, 16);

        // Invalid opcode: logged, the executor keeps going
        let mut frame = crate::test_util::arp_packet_in(
            crate::packet::ArpOp::Request,
            HOST_MAC,
            Ipv4Addr::new(10, 0, 0, 10),
            HOST_MAC,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        frame[crate::packet::CPU_HEADER_LEN + crate::packet::ETHERNET_HEADER_LEN + 7] = 7;
        handle
            .packet_in(CpuHeader::new(CpuReason::ArpMsg, 1), frame)
            .await
            .unwrap();

        handle.send_packet(vec![0; 4]).await.unwrap();
        assert_eq!(drain_payloads(&mut rx), vec![vec![0u8; 4]]);
    }

    #[tokio::test]
    async fn test_executor_gone() {
        let (handle, rx) = RouterHandle::detached(1);
        drop(rx);
        assert!(matches!(
            handle.static_config().await,
            Err(QueryError::ExecutorGone)
        ));
        assert!(matches!(
            handle.packet_in(CpuHeader::new(CpuReason::DataPkt, 0), vec![]).await,
            Err(QueryError::ExecutorGone)
        ));
    }

    #[tokio::test]
    async fn test_router_errors_are_returned() {
        let (router, fake, _rx) = test_router();
        let (handle, _task) = spawn(router, 16);
        fake.reject_next_writes(1);
        let err = handle
            .add_interface(Interface::new(3, Ipv4Addr::new(10, 0, 2, 1), HOST_MAC))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Router(RouterError::WriteRejected { table: "send_frame", .. })
        ));
    }
}
