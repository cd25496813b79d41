//! Service Deployment Manager.
//!
//! Units can publish long-running network services (dashboards, APIs) as a
//! side effect. [`ServiceManager`] allocates a port from a fixed pool, writes
//! the app source into its own directory, launches it as an owned child
//! process and polls the port until the service accepts connections.

pub mod app;
pub mod manager;
pub mod ports;
pub mod process;

pub use manager::{DeployError, DeployedService, ServiceHealth, ServiceManager, ServiceStatus};
pub use ports::PortPool;
