//! RPC seam to the forwarding device.
//!
//! [`DeviceApi`] is the raw request/response surface (implemented over gRPC by
//! [`GrpcDevice`] and in memory by `test_util::FakeDevice`). [`Switch`] binds
//! it to a device id and turns statuses into [`DeviceError`]s.

pub mod entry;
pub mod grpc;

pub use entry::{EntrySpec, MatchKind, MatchSpec, build_entry};
pub use grpc::GrpcDevice;

use crate::p4info::DeviceDescription;
use crate::proto::RpcStatus;
use crate::proto::p4::{TableUpdate, TableWriteRequest, TableWriteResponse, table_update};
use crate::proto::p4::tmp::{
    CounterReadRequest, CounterReadResponse, DeviceAssignRequest, DeviceUpdateEndRequest,
    DeviceUpdateStartRequest, device_assign_request,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Invalid device address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("{op} rejected by device: code {code}: {message}")]
    Rejected {
        op: &'static str,
        code: i32,
        message: String,
    },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown action {action} for table {table}")]
    UnknownAction { table: String, action: String },

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Unknown parameter {param} for action {action}")]
    UnknownParam { action: String, param: String },

    #[error("Unknown counter: {0}")]
    UnknownCounter(String),

    #[error("No entry for counter {name} at index {index}")]
    CounterEntryMissing { name: String, index: u64 },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Raw device RPCs. Transport failures come back as `tonic::Status`; the
/// in-band status of lifecycle calls is left for the caller to inspect.
#[async_trait]
pub trait DeviceApi: Send + 'static {
    async fn device_assign(
        &mut self,
        req: DeviceAssignRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status>;

    async fn device_update_start(
        &mut self,
        req: DeviceUpdateStartRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status>;

    async fn device_update_end(
        &mut self,
        req: DeviceUpdateEndRequest,
    ) -> std::result::Result<RpcStatus, tonic::Status>;

    async fn table_write(
        &mut self,
        req: TableWriteRequest,
    ) -> std::result::Result<TableWriteResponse, tonic::Status>;

    async fn counter_read(
        &mut self,
        req: CounterReadRequest,
    ) -> std::result::Result<CounterReadResponse, tonic::Status>;
}

/// Packet and byte count of one counter cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterData {
    pub packets: u64,
    pub bytes: u64,
}

impl CounterData {
    /// Marks a failed read on its way back from the executor.
    pub const UNAVAILABLE: CounterData = CounterData {
        packets: u64::MAX,
        bytes: 0,
    };

    pub fn is_unavailable(&self) -> bool {
        self.packets == u64::MAX
    }
}

fn check_status(op: &'static str, status: RpcStatus) -> Result<()> {
    if status.code != crate::proto::CODE_OK {
        return Err(DeviceError::Rejected {
            op,
            code: status.code,
            message: status.message,
        });
    }
    Ok(())
}

/// A device RPC client bound to one device id.
pub struct Switch<D> {
    api: D,
    device_id: i32,
}

impl<D: DeviceApi> Switch<D> {
    pub fn new(api: D, device_id: i32) -> Self {
        Self { api, device_id }
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn api(&self) -> &D {
        &self.api
    }

    /// Assign the device with its description and extra parameters.
    pub async fn assign(
        &mut self,
        desc: &DeviceDescription,
        extras: HashMap<String, String>,
    ) -> Result<()> {
        let req = DeviceAssignRequest {
            device_id: self.device_id,
            p4info: Some(desc.to_proto()),
            extras: Some(device_assign_request::Extras { kv: extras }),
        };
        let status = self.api.device_assign(req).await?;
        check_status("DeviceAssign", status)
    }

    /// Insert one table entry. Returns the number of per-update errors the
    /// device reported (0 on success).
    pub async fn write_entry(
        &mut self,
        desc: &DeviceDescription,
        spec: &EntrySpec<'_>,
    ) -> Result<usize> {
        let entry = build_entry(desc, spec)?;
        let req = TableWriteRequest {
            device_id: self.device_id,
            updates: vec![TableUpdate {
                r#type: table_update::Type::Insert as i32,
                table_entry: Some(entry),
            }],
        };
        let resp = self.api.table_write(req).await?;
        for err in &resp.errors {
            warn!(
                table = spec.table,
                action = spec.action,
                code = err.code,
                "Table write rejected: {}",
                err.message
            );
        }
        Ok(resp.errors.len())
    }

    /// Read one cell of a counter array.
    pub async fn read_counter(
        &mut self,
        desc: &DeviceDescription,
        name: &str,
        index: u64,
    ) -> Result<CounterData> {
        let counter_id = desc
            .counter_id(name)
            .ok_or_else(|| DeviceError::UnknownCounter(name.to_string()))?;
        let req = CounterReadRequest {
            device_id: self.device_id,
            counter_ids: vec![counter_id],
        };
        let resp = self.api.counter_read(req).await?;
        debug!(counter = name, entries = resp.entries.len(), "Counter read");
        resp.entries
            .into_iter()
            .find(|e| e.counter_id == counter_id && e.index == index)
            .and_then(|e| e.data)
            .map(|d| CounterData {
                packets: d.packets,
                bytes: d.bytes,
            })
            .ok_or_else(|| DeviceError::CounterEntryMissing {
                name: name.to_string(),
                index,
            })
    }

    /// First phase of a configuration replace.
    pub async fn update_start(&mut self, desc: &DeviceDescription, raw: &[u8]) -> Result<()> {
        let req = DeviceUpdateStartRequest {
            device_id: self.device_id,
            p4info: Some(desc.to_proto()),
            device_data: raw.to_vec(),
        };
        let status = self.api.device_update_start(req).await?;
        check_status("DeviceUpdateStart", status)
    }

    /// Final phase of a configuration replace.
    pub async fn update_end(&mut self) -> Result<()> {
        let req = DeviceUpdateEndRequest {
            device_id: self.device_id,
        };
        let status = self.api.device_update_end(req).await?;
        check_status("DeviceUpdateEnd", status)
    }
}
