//! Packet I/O channel: the long-lived bidirectional packet stream.
//!
//! The outbound half is fed from an unbounded channel whose sender
//! ([`PacketSender`]) is owned by the executor. The inbound half is drained by
//! [`receive_loop`] on its own task, which decodes the CPU header and posts
//! each packet to the executor.

use crate::device::{GrpcDevice, Result as DeviceResult};
use crate::executor::RouterHandle;
use crate::packet::CpuHeader;
use crate::proto::p4::{PacketInUpdate, PacketOut, PacketOutUpdate, packet_out_update};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketIoError {
    #[error("Packet stream closed")]
    Closed,
}

/// Sending side of the packet stream.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<PacketOutUpdate>,
}

impl PacketSender {
    /// New sender plus the receiver to hand to [`open`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PacketOutUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue the stream initialization message.
    pub fn send_init(&self, device_id: i32) -> Result<(), PacketIoError> {
        self.send(packet_out_update::Update::Init(packet_out_update::Init {
            device_id,
        }))
    }

    /// Queue one packet-out.
    pub fn send_packet(&self, payload: Vec<u8>) -> Result<(), PacketIoError> {
        trace!(len = payload.len(), "Packet out");
        self.send(packet_out_update::Update::Packet(PacketOut { payload }))
    }

    fn send(&self, update: packet_out_update::Update) -> Result<(), PacketIoError> {
        self.tx
            .send(PacketOutUpdate {
                update: Some(update),
            })
            .map_err(|_| PacketIoError::Closed)
    }
}

/// Open the packet stream on `device` and spawn the receive loop.
///
/// Whatever was queued on the sender before this call (the `Init` message
/// sent by device assignment) goes out first.
pub async fn open(
    device: &mut GrpcDevice,
    outbound: mpsc::UnboundedReceiver<PacketOutUpdate>,
    handle: RouterHandle,
) -> DeviceResult<JoinHandle<()>> {
    let inbound = device
        .packet_stream(UnboundedReceiverStream::new(outbound))
        .await?;
    info!("Packet stream open");
    Ok(tokio::spawn(receive_loop(inbound, handle)))
}

/// Read packet-ins until the stream ends or the executor goes away.
pub async fn receive_loop<S>(mut inbound: S, handle: RouterHandle)
where
    S: Stream<Item = Result<PacketInUpdate, tonic::Status>> + Unpin,
{
    while let Some(msg) = inbound.next().await {
        let update = match msg {
            Ok(update) => update,
            Err(status) => {
                error!(error = %status, "Packet stream failed");
                break;
            }
        };
        let Some(packet) = update.packet else {
            continue;
        };
        let payload = packet.payload;
        let cpu = match CpuHeader::decode(&payload) {
            Ok(cpu) => cpu,
            Err(e) => {
                debug!(error = %e, len = payload.len(), "Dropping packet-in");
                continue;
            }
        };
        if handle.packet_in(cpu, payload).await.is_err() {
            debug!("Executor stopped, leaving receive loop");
            break;
        }
    }
    info!("Packet stream closed");
}
