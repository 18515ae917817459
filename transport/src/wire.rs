use crate::TransportError;
use chrono::{DateTime, Utc};
use dse_core::crypto::{self, KeyManager};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    User,
}

/// The signed handshake a server hands to importers.
///
/// The Ed25519 signature covers the canonical JSON of this structure with
/// `signature` set to the empty string, so it is reproducible across
/// implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInfo {
    pub host: String,
    pub port: u16,
    pub bundle_id: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub signature: String,
    pub expires: DateTime<Utc>,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    pub cert_fingerprint: String,
    /// Exporter's Ed25519 verifying key, hex. Pinned on first contact the
    /// same way the certificate fingerprint is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<String>,
}

impl ExportInfo {
    /// Sign the handshake with the local signing key.
    pub fn sign(&mut self, keys: &KeyManager) -> Result<(), TransportError> {
        self.signature = String::new();
        let value = serde_json::to_value(&self).map_err(dse_core::Error::from)?;
        self.signature = keys.sign_value(&value)?;
        Ok(())
    }

    /// Verify the handshake signature with the exporter's verifying key.
    pub fn verify_signature(&self, public_key_hex: &str) -> Result<(), TransportError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let value = serde_json::to_value(&unsigned).map_err(dse_core::Error::from)?;
        crypto::verify_value(&value, &self.signature, public_key_hex)?;
        Ok(())
    }

    /// Reject a handshake whose export window or token has lapsed.
    pub fn check_freshness(&self, now: DateTime<Utc>) -> Result<(), TransportError> {
        if now > self.expires {
            return Err(TransportError::Expired("export".to_string()));
        }
        if let Some(token_expiry) = self.token_expiry {
            if now > token_expiry {
                return Err(TransportError::Expired("token".to_string()));
            }
        }
        Ok(())
    }
}

/// `GET /status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub downloads: usize,
    pub max_downloads: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downloaded: Vec<String>,
    pub info: ExportInfo,
}

/// `POST /key-exchange` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    pub public_key: String,
}

/// `POST /key-exchange` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    pub status: String,
    pub public_key: String,
    pub signing_public_key: String,
    pub key_exchange_id: String,
}

pub const HEADER_PASSWORD: &str = "x-password";
pub const HEADER_USER: &str = "x-user";
pub const HEADER_TOKEN: &str = "x-one-time-token";

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::GlobalStore;

    fn sample() -> ExportInfo {
        ExportInfo {
            host: "exporter".to_string(),
            port: 9443,
            bundle_id: "20260801120000".to_string(),
            auth_method: AuthMethod::Password,
            users: None,
            password: Some("secret".to_string()),
            signature: String::new(),
            expires: Utc::now() + chrono::Duration::hours(1),
            encrypted: true,
            token: Some("tok".to_string()),
            token_expiry: Some(Utc::now() + chrono::Duration::minutes(5)),
            cert_fingerprint: "ab".repeat(32),
            signing_public_key: None,
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = GlobalStore::with_root(dir.path());
        let keys = KeyManager::new(&store).unwrap();
        keys.init_keys().unwrap();

        let mut info = sample();
        info.sign(&keys).unwrap();
        assert!(!info.signature.is_empty());

        let public = keys.signing_public_key().unwrap();
        info.verify_signature(&public).unwrap();

        // Any field mutation invalidates the signature.
        let mut forged = info.clone();
        forged.bundle_id = "20990101000000".to_string();
        assert!(forged.verify_signature(&public).is_err());
    }

    #[test]
    fn freshness_checks() {
        let mut info = sample();
        info.check_freshness(Utc::now()).unwrap();

        info.token_expiry = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(matches!(
            info.check_freshness(Utc::now()).unwrap_err(),
            TransportError::Expired(_)
        ));

        let mut stale = sample();
        stale.expires = Utc::now() - chrono::Duration::minutes(1);
        assert!(stale.check_freshness(Utc::now()).is_err());
    }

    #[test]
    fn wire_field_names_are_stable() {
        let info = sample();
        let value = serde_json::to_value(&info).unwrap();
        for key in [
            "host",
            "port",
            "bundle_id",
            "auth_method",
            "password",
            "signature",
            "expires",
            "encrypted",
            "token",
            "token_expiry",
            "cert_fingerprint",
        ] {
            assert!(value.get(key).is_some(), "missing wire field {key}");
        }
        assert_eq!(value["auth_method"], "password");
    }
}
