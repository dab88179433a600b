use std::io::ErrorKind;
use std::net::TcpListener;

use super::PortError;

/// Asks the OS whether a TCP port is bound.
pub trait PortProbe: Send + Sync {
    fn in_use(&self, host: &str, port: u16) -> Result<bool, PortError>;

    /// Best-effort description of the process listening on `port`.
    fn owner(&self, _port: u16) -> Option<String> {
        None
    }
}

/// Probes by attempting to bind the port.
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn in_use(&self, host: &str, port: u16) -> Result<bool, PortError> {
        match TcpListener::bind((host, port)) {
            Ok(_) => Ok(false),
            // Privileged ports are as unusable as occupied ones
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                Ok(true)
            }
            Err(e) => Err(PortError::Probe {
                host: host.to_string(),
                port,
                source: e,
            }),
        }
    }

    fn owner(&self, port: u16) -> Option<String> {
        crate::platform::identify_port_owner(port)
    }
}
