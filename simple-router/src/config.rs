use std::collections::HashMap;

/// Default switch gRPC endpoint
pub const DEFAULT_GRPC_ADDR: &str = "http://localhost:50051";

/// Default thrift port of the switch
pub const DEFAULT_THRIFT_PORT: u16 = 9090;

/// Default notifications socket
pub const DEFAULT_NOTIFICATIONS: &str = "ipc:///tmp/bmv2-0-notifications.ipc";

/// Default interface the switch uses as its CPU port
pub const DEFAULT_CPU_IFACE: &str = "veth251";

/// Default depth of the executor command queue
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// Extra parameters passed to the switch on device assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceExtras {
    pub thrift_port: u16,
    pub notifications: String,
    pub cpu_iface: String,
}

impl Default for DeviceExtras {
    fn default() -> Self {
        Self {
            thrift_port: DEFAULT_THRIFT_PORT,
            notifications: DEFAULT_NOTIFICATIONS.to_string(),
            cpu_iface: DEFAULT_CPU_IFACE.to_string(),
        }
    }
}

impl DeviceExtras {
    pub fn with_thrift_port(mut self, port: u16) -> Self {
        self.thrift_port = port;
        self
    }

    pub fn with_notifications(mut self, addr: impl Into<String>) -> Self {
        self.notifications = addr.into();
        self
    }

    pub fn with_cpu_iface(mut self, iface: impl Into<String>) -> Self {
        self.cpu_iface = iface.into();
        self
    }

    /// Key/value form carried by the assign request.
    pub fn to_kv(&self) -> HashMap<String, String> {
        HashMap::from([
            ("port".to_string(), self.thrift_port.to_string()),
            ("notifications".to_string(), self.notifications.clone()),
            ("cpu_iface".to_string(), self.cpu_iface.clone()),
        ])
    }
}

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub grpc_addr: String,
    pub device_id: i32,
    pub extras: DeviceExtras,
    pub command_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: DEFAULT_GRPC_ADDR.to_string(),
            device_id: 0,
            extras: DeviceExtras::default(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

impl ControllerConfig {
    pub fn with_grpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.grpc_addr = addr.into();
        self
    }

    pub fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_extras(mut self, extras: DeviceExtras) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }
}
