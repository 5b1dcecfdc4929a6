pub mod client;
pub mod discovery;
pub mod server;
pub mod types;

pub use client::McpSession;
pub use discovery::{ConnectedProvider, StartupReport, connect_providers, register_provider};
pub use server::{McpServer, Prompt};
