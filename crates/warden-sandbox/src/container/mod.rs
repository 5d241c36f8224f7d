//! Container backend - ephemeral, hardened Docker containers
//!
//! Every run creates a fresh container from [`DockerConfig`], waits for it
//! to exit, collects its logs and force-removes it. Removal runs under its
//! own short deadline on every exit path, including caller cancellation.

mod config;
mod docker;
mod mount;
mod network;


pub use self::config::DockerConfig;
pub use docker::{DockerSandbox, SANDBOX_LABEL};
pub use mount::DockerMount;
pub use network::NetworkMode;
