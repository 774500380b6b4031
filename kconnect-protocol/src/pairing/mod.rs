//! Device Pairing
//!
//! Pairing decides which devices may exchange plugin packets with us. Every
//! connection is TLS with self-signed certificates; pairing is the step where
//! both users compare a verification key and the peer's certificate is stored.
//!
//! ## Pairing Protocol
//!
//! 1. **Connection**: identity exchange and TLS, see [`crate::transport`]
//! 2. **Pairing Request**: one side sends `kdeconnect.pair` with `pair: true`
//! 3. **User Verification**: both sides show the same verification key
//! 4. **Pairing Response**: `pair: true` accepts, `pair: false` rejects
//! 5. **Trust**: the certificate presented on the session is stored
//!
//! A later session from a paired device must present the stored certificate.
//! Either side ends the pairing with `pair: false`.

mod certificate;
mod events;
mod handler;
mod service;
mod store;

pub use certificate::{verification_key, CertificateInfo, CERTIFICATE_FILE, PRIVATE_KEY_FILE};
pub use events::PairingEvent;
pub use handler::{
    PairingDirection, PairingPacket, PairingRequest, PairingStatus, PAIRING_TIMEOUT,
};
pub use service::{PairingConfig, PairingService};
pub use store::TrustStore;
