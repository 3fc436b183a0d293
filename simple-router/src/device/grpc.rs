//! gRPC implementation of [`DeviceApi`].

use super::{DeviceApi, DeviceError, Result};
use crate::proto::RpcStatus;
use crate::proto::p4::runtime_client::RuntimeClient;
use crate::proto::p4::{PacketInUpdate, PacketOutUpdate, TableWriteRequest, TableWriteResponse};
use crate::proto::p4::tmp::device_client::DeviceClient;
use crate::proto::p4::tmp::resource_client::ResourceClient;
use crate::proto::p4::tmp::{
    CounterReadRequest, CounterReadResponse, DeviceAssignRequest, DeviceUpdateEndRequest,
    DeviceUpdateStartRequest,
};
use async_trait::async_trait;
use tokio_stream::Stream;
use tonic::Streaming;
use tonic::transport::Channel;
use tracing::info;

/// Clients for all switch services over one channel.
#[derive(Clone)]
pub struct GrpcDevice {
    runtime: RuntimeClient<Channel>,
    device: DeviceClient<Channel>,
    resource: ResourceClient<Channel>,
}

impl GrpcDevice {
    pub fn new(channel: Channel) -> Self {
        Self {
            runtime: RuntimeClient::new(channel.clone()),
            device: DeviceClient::new(channel.clone()),
            resource: ResourceClient::new(channel),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        info!(addr, "Connecting to switch");
        let endpoint =
            Channel::from_shared(addr.to_string()).map_err(|e| DeviceError::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let channel = endpoint.connect().await?;
        Ok(Self::new(channel))
    }

    /// Open the bidirectional packet stream, sending everything `outbound`
    /// yields and returning the inbound half.
    pub async fn packet_stream<S>(&mut self, outbound: S) -> Result<Streaming<PacketInUpdate>>
    where
        S: Stream<Item = PacketOutUpdate> + Send + 'static,
    {
        let response = self.runtime.packet_stream(outbound).await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl DeviceApi for GrpcDevice {
    async fn device_assign(
        &mut self,
        req: DeviceAssignRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status> {
        Ok(self.device.device_assign(req).await?.into_inner())
    }

    async fn device_update_start(
        &mut self,
        req: DeviceUpdateStartRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status> {
        Ok(self.device.device_update_start(req).await?.into_inner())
    }

    async fn device_update_end(
        &mut self,
        req: DeviceUpdateEndRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status> {
        Ok(self.device.device_update_end(req).await?.into_inner())
    }

    async fn table_write(
        &mut self,
        req: TableWriteRequest,
    ) -> std::result::Result<TableWriteResponse, tonic::Status> {
        Ok(self.runtime.table_write(req).await?.into_inner())
    }

    async fn counter_read(
        &mut self,
        req: CounterReadRequest,
    ) -> std::result::Result<CounterReadResponse, tonic::Status> {
        Ok(self.resource.counter_read(req).await?.into_inner())
    }
}
