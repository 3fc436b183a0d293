//! Generated protobuf types for the switch RPC surface.

#![allow(clippy::enum_variant_names)]

/// Status messages shared by all device RPCs
pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

/// Table programming and packet streaming
pub mod p4 {
    tonic::include_proto!("p4");

    /// Serialized device description
    pub mod config {
        tonic::include_proto!("p4.config");
    }

    /// Device lifecycle and resource reads
    pub mod tmp {
        tonic::include_proto!("p4.tmp");
    }
}

pub use google::rpc::Status as RpcStatus;

/// `google.rpc.Code.OK`
pub const CODE_OK: i32 = 0;
