pub mod container;
pub mod manager;
pub mod state;

pub use container::{ContainerRuntime, DockerCli, RunSpec};
pub use manager::{HealthProbe, HttpHealthProbe, LocalServiceManager, ServicePaths};
pub use state::{ServiceState, ServiceStatus};
