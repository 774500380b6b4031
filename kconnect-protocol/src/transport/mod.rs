//! KDE Connect Transport Layer
//!
//! TCP + TLS streams between devices, and the secondary TLS streams used for
//! payloads.

pub mod payload;
pub mod tls;
pub mod tls_config;

pub use payload::{FileTransferInfo, PayloadClient, PayloadServer};
pub use tls::{EstablishedConnection, TlsListener, TlsTransport};
pub use tls_config::TlsConfig;
