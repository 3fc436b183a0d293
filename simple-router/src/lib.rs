//! Control plane for a P4 "simple router".
//!
//! The controller owns the forwarding and ARP state of a virtual router built
//! on a programmable switch and keeps the switch's match-action tables in sync
//! with it. All state lives on a single executor task; packet-ins, counter
//! queries and configuration pushes are posted to it as commands.

pub mod config;
pub mod config_sync;
pub mod device;
pub mod executor;
pub mod p4info;
pub mod packet;
pub mod packet_io;
pub mod proto;
pub mod router;
pub mod test_util;

pub use config::{ControllerConfig, DeviceExtras};
pub use executor::{Controller, QueryError, RouterHandle};
pub use p4info::DeviceDescription;
pub use router::{Interface, Route, Router, RouterError};

// Re-export tonic for external tests that need matching versions
pub use tonic;
