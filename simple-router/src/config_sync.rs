//! Device assignment and configuration replace.
//!
//! A replace runs in three phases, each a device RPC: start (push the new
//! program), reapply (default entries plus routes and interfaces, device side
//! only) and end. The first failure aborts the sequence; nothing is rolled
//! back.

use crate::device::{DeviceApi, DeviceError, EntrySpec};
use crate::p4info::{DescriptionError, DeviceDescription};
use crate::packet_io::PacketIoError;
use crate::router::{Router, RouterError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors, one per phase.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid device description: {0}")]
    Description(#[from] DescriptionError),

    #[error("Device assignment failed: {0}")]
    Assign(#[source] DeviceError),

    #[error("Packet stream unavailable: {0}")]
    PacketStream(#[from] PacketIoError),

    #[error("Installing default entries failed: {0}")]
    DefaultEntries(#[source] RouterError),

    #[error("Config update start failed: {0}")]
    Start(#[source] DeviceError),

    #[error("Reapplying device state failed: {0}")]
    Reapply(#[source] RouterError),

    #[error("Config update end failed: {0}")]
    End(#[source] DeviceError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl<D: DeviceApi> Router<D> {
    /// Assign the device and queue the packet stream `Init` message.
    ///
    /// A no-op once the device is assigned.
    pub async fn assign(&mut self) -> Result<()> {
        if self.assigned {
            debug!("Device already assigned");
            return Ok(());
        }
        let device_id = self.switch.device_id();
        info!(device_id, "Assigning device");
        self.switch
            .assign(&self.description, self.extras.to_kv())
            .await
            .map_err(ConfigError::Assign)?;
        self.assigned = true;
        self.packets.send_init(device_id)?;
        Ok(())
    }

    async fn write_default_entries(&mut self) -> std::result::Result<(), RouterError> {
        let spec = EntrySpec::default_action("forward", "_drop");
        let errors = self.switch.write_entry(&self.description, &spec).await?;
        if errors > 0 {
            warn!(table = "forward", errors, "Default entry rejected");
            return Err(RouterError::WriteRejected {
                table: "forward",
                errors,
            });
        }
        Ok(())
    }

    /// Install the miss action of the `forward` table.
    pub async fn set_default_entries(&mut self) -> Result<()> {
        self.write_default_entries()
            .await
            .map_err(ConfigError::DefaultEntries)
    }

    /// Replace the program on the device with `raw` (bmv2 JSON).
    ///
    /// The new description becomes active only once the device has accepted
    /// the start phase; controller-side routes and interfaces are kept.
    pub async fn update_config(&mut self, raw: &[u8]) -> Result<()> {
        info!(len = raw.len(), "Updating config");
        let description = DeviceDescription::parse(raw)?;

        self.switch
            .update_start(&description, raw)
            .await
            .map_err(ConfigError::Start)?;
        self.description = description;

        self.write_default_entries()
            .await
            .map_err(ConfigError::Reapply)?;
        self.replay_device_state()
            .await
            .map_err(ConfigError::Reapply)?;

        self.switch.update_end().await.map_err(ConfigError::End)?;
        info!("Config updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::p4::packet_out_update::{Init, Update};
    use crate::test_util::{SIMPLE_ROUTER_JSON, test_router};

    /// Same program without the egress table
    const NO_SEND_FRAME_JSON: &str = r#"{
        "header_types": [
            {"name": "ipv4_t", "fields": [["dstAddr", 32]]},
            {"name": "routing_metadata_t", "fields": [["nhop_ipv4", 32]]}
        ],
        "headers": [
            {"name": "ipv4", "header_type": "ipv4_t"},
            {"name": "routing_metadata", "header_type": "routing_metadata_t"}
        ],
        "actions": [
            {"name": "_drop", "runtime_data": []},
            {"name": "set_nhop", "runtime_data": [
                {"name": "nhop_ipv4", "bitwidth": 32}, {"name": "port", "bitwidth": 9}
            ]},
            {"name": "set_dmac", "runtime_data": [{"name": "dmac", "bitwidth": 48}]}
        ],
        "pipelines": [{"name": "ingress", "tables": [
            {"name": "ipv4_lpm", "max_size": 1024, "actions": ["set_nhop", "_drop"],
             "key": [{"match_type": "lpm", "target": ["ipv4", "dstAddr"]}]},
            {"name": "forward", "max_size": 512, "actions": ["set_dmac", "_drop"],
             "key": [{"match_type": "exact", "target": ["routing_metadata", "nhop_ipv4"]}]}
        ]}]
    }"#;

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let (mut router, fake, mut rx) = test_router();
        router.assign().await.unwrap();
        router.assign().await.unwrap();

        let assigns = fake.assigns();
        assert_eq!(assigns.len(), 1);
        let kv = &assigns[0].extras.as_ref().unwrap().kv;
        assert_eq!(kv["port"], "9090");
        assert_eq!(kv["cpu_iface"], "veth251");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.update, Some(Update::Init(Init { device_id: 0 })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_assign_rejected() {
        let (mut router, fake, mut rx) = test_router();
        fake.set_assign_status(2);
        let err = router.assign().await.unwrap_err();
        assert!(matches!(err, ConfigError::Assign(DeviceError::Rejected { .. })));
        assert!(rx.try_recv().is_err());

        fake.set_assign_status(0);
        router.assign().await.unwrap();
        assert_eq!(fake.assigns().len(), 2);
    }

    #[tokio::test]
    async fn test_set_default_entries() {
        let (mut router, fake, _rx) = test_router();
        router.set_default_entries().await.unwrap();
        let writes = fake.table_writes();
        assert_eq!(writes.len(), 1);
        let entry = writes[0].updates[0].table_entry.as_ref().unwrap();
        assert_eq!(Some(entry.table_id), router.description().table_id("forward"));
        assert!(entry.r#match.is_empty());

        fake.reject_next_writes(1);
        assert!(matches!(
            router.set_default_entries().await,
            Err(ConfigError::DefaultEntries(RouterError::WriteRejected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_update_config_phases() {
        let (mut router, fake, _rx) = test_router();
        router.static_config().await.unwrap();

        router
            .update_config(SIMPLE_ROUTER_JSON.as_bytes())
            .await
            .unwrap();

        assert_eq!(fake.update_starts().len(), 1);
        assert_eq!(
            fake.update_starts()[0].device_data,
            SIMPLE_ROUTER_JSON.as_bytes()
        );
        // 4 static + 1 default + 4 replayed
        assert_eq!(fake.table_writes().len(), 9);
        assert_eq!(fake.update_ends(), 1);
        assert_eq!(router.interfaces().len(), 2);
    }

    #[tokio::test]
    async fn test_update_config_invalid_json() {
        let (mut router, fake, _rx) = test_router();
        let err = router.update_config(b"not json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Description(_)));
        assert!(fake.update_starts().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejected_keeps_description() {
        let (mut router, fake, _rx) = test_router();
        fake.set_update_start_status(9);
        let err = router
            .update_config(NO_SEND_FRAME_JSON.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Start(_)));
        assert!(router.description().table_id("send_frame").is_some());
        assert!(fake.table_writes().is_empty());
        assert_eq!(fake.update_ends(), 0);
    }

    #[tokio::test]
    async fn test_reapply_failure_aborts() {
        let (mut router, fake, _rx) = test_router();
        router.static_config().await.unwrap();

        let err = router
            .update_config(NO_SEND_FRAME_JSON.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Reapply(RouterError::Device(DeviceError::UnknownTable(_)))
        ));
        assert!(router.description().table_id("send_frame").is_none());
        assert_eq!(fake.update_ends(), 0);
    }

    #[tokio::test]
    async fn test_end_rejected() {
        let (mut router, fake, _rx) = test_router();
        fake.set_update_end_status(13);
        let err = router
            .update_config(SIMPLE_ROUTER_JSON.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::End(_)));
    }
}
