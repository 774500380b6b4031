//! Device certificate
//!
//! Every device has a self-signed certificate whose Common Name is its device
//! id. The certificate is used for TLS on every connection; trust comes from
//! pairing, not from a CA.
//!
//! ## Certificate Contents
//!
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: device id
//! - **Validity**: from one year back to ten years ahead

use crate::{ProtocolError, Result};
use chrono::{Datelike, Utc};
use rcgen::{date_time_ymd, Certificate, CertificateParams, DistinguishedName, DnType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// File name of our certificate inside the certificate directory
pub const CERTIFICATE_FILE: &str = "certificate.pem";

/// File name of our private key inside the certificate directory
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// Our certificate and private key
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded PKCS#8 private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of the certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// ```
    /// use kconnect_protocol::CertificateInfo;
    ///
    /// let cert = CertificateInfo::generate("desktop_1").unwrap();
    /// assert_eq!(cert.fingerprint.split(':').count(), 32);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();
        let year = Utc::now().year();

        let mut params = CertificateParams::new(vec![device_id.clone()]);
        let mut name = DistinguishedName::new();
        name.push(DnType::OrganizationName, CERT_ORG);
        name.push(DnType::OrganizationalUnitName, CERT_ORG_UNIT);
        name.push(DnType::CommonName, device_id.as_str());
        params.distinguished_name = name;
        params.not_before = date_time_ymd(year - 1, 1, 1);
        params.not_after = date_time_ymd(year + 10, 1, 1);

        let cert = Certificate::from_params(params)?;
        let certificate = cert.serialize_der()?;
        let private_key = cert.serialize_private_key_der();
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load our certificate from `dir`, generating and saving one if absent
    pub fn load_or_generate(device_id: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERTIFICATE_FILE);
        let key_path = dir.join(PRIVATE_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            debug!("Loading existing certificate for device {}", device_id);
            Self::load_from_files(device_id, &cert_path, &key_path)
        } else {
            let cert = Self::generate(device_id)?;
            cert.save_to_files(&cert_path, &key_path)?;
            Ok(cert)
        }
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns colon separated upper-case hex bytes.
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        Sha256::digest(cert_der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        fs::write(cert_path, encode_pem("CERTIFICATE", &self.certificate))?;
        fs::write(key_path, encode_pem("PRIVATE KEY", &self.private_key))?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        device_id: impl Into<String>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let certificate = read_pem(cert_path.as_ref(), "CERTIFICATE")?;
        let private_key = read_pem(key_path.as_ref(), "PRIVATE KEY")?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        Ok(Self {
            device_id: device_id.into(),
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Certificate in the form rustls expects
    pub fn certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate.clone())
    }

    /// Private key in the form rustls expects
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.clone()))
    }
}

/// Key both users compare before accepting a pairing
///
/// Hex SHA-256 over the two certificates, the larger one first, so both
/// ends compute the same value.
pub fn verification_key(own_cert: &[u8], peer_cert: &[u8]) -> String {
    let (first, second) = if own_cert >= peer_cert {
        (own_cert, peer_cert)
    } else {
        (peer_cert, own_cert)
    };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    hex::encode(hasher.finalize())
}

pub(crate) fn encode_pem(tag: &str, der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(tag, der.to_vec()))
}

pub(crate) fn read_pem(path: &Path, expected_tag: &str) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    let parsed = pem::parse(&data).map_err(|e| {
        ProtocolError::CertificateValidation(format!("{}: {}", path.display(), e))
    })?;

    if parsed.tag() != expected_tag {
        return Err(ProtocolError::CertificateValidation(format!(
            "{}: expected {}, found {}",
            path.display(),
            expected_tag,
            parsed.tag()
        )));
    }

    Ok(parsed.contents().to_vec())
}
