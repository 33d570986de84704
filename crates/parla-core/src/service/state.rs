//! Lifecycle state of the locally hosted model service.

use crate::settings::{Device, LocalModel};
use serde::Serialize;
use std::fmt;

/// One process-wide service, one state machine.
///
/// `Error` is reachable from any non-terminal state; recovery goes back to
/// `Stopped` when the installed artifacts are still valid, or to
/// `Uninstalled` to force a re-download.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Uninstalled,
    Downloading,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Uninstalled => "uninstalled",
            ServiceState::Downloading => "downloading",
            ServiceState::Installed => "installed",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
        }
    }

    /// States from which `start()` may proceed.
    pub fn can_start(&self) -> bool {
        matches!(self, ServiceState::Installed | ServiceState::Stopped)
    }

    /// States with a container to tear down.
    pub fn has_container(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time snapshot handed to the boundary on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub model: LocalModel,
    pub model_id: String,
    pub device: Device,
    pub service_url: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
