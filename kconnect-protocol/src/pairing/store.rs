//! Trust store
//!
//! Certificates of paired devices, one `<device_id>.pem` file each. A device
//! is trusted exactly when its file exists.
//!
//! Ids made only of ASCII letters, digits, `_` and `-` are used as the file
//! name directly. Any other id is stored as `%<hex of the id>.pem`.

use super::certificate::{encode_pem, read_pem, CertificateInfo};
use crate::Result;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ENCODED_PREFIX: char = '%';

fn is_plain(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn file_stem(device_id: &str) -> String {
    if is_plain(device_id) {
        device_id.to_string()
    } else {
        format!("{}{}", ENCODED_PREFIX, hex::encode(device_id))
    }
}

fn device_id_from_stem(stem: &str) -> Option<String> {
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|id| !is_plain(id)),
        None => is_plain(stem).then(|| stem.to_string()),
    }
}

/// Persistent set of trusted peer certificates
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    certificates: HashMap<String, Vec<u8>>,
}

impl TrustStore {
    /// Open the store at `dir`, loading every certificate in it
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut certificates = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("pem") {
                continue;
            }
            let Some(device_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(device_id_from_stem)
            else {
                continue;
            };

            match read_pem(&path, "CERTIFICATE") {
                Ok(der) => {
                    certificates.insert(device_id, der);
                }
                Err(e) => warn!("Skipping unreadable trusted certificate {:?}: {}", path, e),
            }
        }

        info!("Loaded {} trusted device certificates", certificates.len());
        Ok(Self { dir, certificates })
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", file_stem(device_id)))
    }

    /// Trust `certificate` for `device_id`, replacing any previous one
    pub fn store(&mut self, device_id: &str, certificate: &[u8]) -> Result<()> {
        let path = self.path_for(device_id);
        fs::write(&path, encode_pem("CERTIFICATE", certificate))?;
        self.certificates
            .insert(device_id.to_string(), certificate.to_vec());
        debug!("Stored certificate for device {} at {:?}", device_id, path);
        Ok(())
    }

    /// Forget a device; returns whether it was trusted
    pub fn remove(&mut self, device_id: &str) -> Result<bool> {
        let path = self.path_for(device_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let removed = self.certificates.remove(device_id).is_some();
        if removed {
            debug!("Removed certificate for device {}", device_id);
        }
        Ok(removed)
    }

    /// Stored certificate of a device
    pub fn get(&self, device_id: &str) -> Option<&[u8]> {
        self.certificates.get(device_id).map(Vec::as_slice)
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.certificates.contains_key(device_id)
    }

    /// Whether `certificate` is the one stored for `device_id`
    pub fn matches(&self, device_id: &str, certificate: &[u8]) -> bool {
        self.get(device_id) == Some(certificate)
    }

    /// Fingerprint of the stored certificate
    pub fn fingerprint(&self, device_id: &str) -> Option<String> {
        self.get(device_id).map(CertificateInfo::calculate_fingerprint)
    }

    /// Ids of all trusted devices
    pub fn trusted_devices(&self) -> impl Iterator<Item = &str> {
        self.certificates.keys().map(String::as_str)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
