pub mod client;
pub mod error;
pub mod server;
pub mod tls;
pub mod token;
pub mod wire;

pub use client::{import_bundle, ImportOptions, ImportOutcome};
pub use error::TransportError;
pub use server::{ExportAuth, ExportServer, ExportServerConfig};
pub use wire::{AuthMethod, ExportInfo, StatusResponse};
