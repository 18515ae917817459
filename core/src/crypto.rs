use crate::{Error, GlobalStore, Result};
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// A peer who can receive public-key encrypted bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub key_id: String,
    pub key: String,
    pub added: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub trusted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientsConfig {
    pub recipients: Vec<Recipient>,
}

/// Local identity keys and the recipient registry.
///
/// Holds the X25519 encryption identity, the Ed25519 signing pair, and the
/// self-signed TLS certificate used by the export server. Key files are
/// created with owner-only permissions and never overwritten.
pub struct KeyManager {
    store: GlobalStore,
    config: RecipientsConfig,
}

impl KeyManager {
    pub fn new(store: &GlobalStore) -> Result<Self> {
        std::fs::create_dir_all(store.keys_dir().join("private"))?;
        std::fs::create_dir_all(store.keys_dir().join("public").join("recipients"))?;

        let config_path = store.keys_dir().join("recipients.yaml");
        let config = if config_path.exists() {
            serde_yaml::from_str(&std::fs::read_to_string(&config_path)?)?
        } else {
            let config = RecipientsConfig::default();
            std::fs::write(&config_path, serde_yaml::to_string(&config)?)?;
            config
        };

        Ok(Self {
            store: store.clone(),
            config,
        })
    }

    fn identity_path(&self) -> PathBuf {
        self.store.keys_dir().join("private").join("identity.key")
    }

    fn identity_pub_path(&self) -> PathBuf {
        self.store.keys_dir().join("private").join("identity.pub")
    }

    fn signing_key_path(&self) -> PathBuf {
        self.store.keys_dir().join("private").join("signing.key")
    }

    fn signing_pub_path(&self) -> PathBuf {
        self.store.keys_dir().join("private").join("signing.pub")
    }

    fn recipients_config_path(&self) -> PathBuf {
        self.store.keys_dir().join("recipients.yaml")
    }

    fn save_config(&self) -> Result<()> {
        std::fs::write(
            self.recipients_config_path(),
            serde_yaml::to_string(&self.config)?,
        )?;
        Ok(())
    }

    /// Generate whatever local key material is still missing. Existing keys
    /// are left untouched.
    pub fn init_keys(&self) -> Result<()> {
        if !self.identity_path().exists() {
            self.generate_identity()?;
        }
        if !self.signing_key_path().exists() {
            self.generate_signing_key()?;
        }
        self.ensure_local_tls_cert()?;
        Ok(())
    }

    /// Generate the X25519 encryption identity.
    pub fn generate_identity(&self) -> Result<()> {
        let path = self.identity_path();
        if path.exists() {
            return Err(Error::already_exists("identity key", path.display().to_string()));
        }
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        let body = format!(
            "# created: {}\n# public key: {}\n{}\n",
            Utc::now().to_rfc3339(),
            recipient,
            identity.to_string().expose_secret()
        );
        write_private(&path, body.as_bytes())?;
        std::fs::write(self.identity_pub_path(), format!("{recipient}\n"))?;
        Ok(())
    }

    fn identity(&self) -> Result<age::x25519::Identity> {
        let path = self.identity_path();
        let data = std::fs::read_to_string(&path)
            .map_err(|_| Error::not_found("identity key", path.display().to_string()))?;
        let line = data
            .lines()
            .find(|l| l.starts_with("AGE-SECRET-KEY-"))
            .ok_or_else(|| Error::Invariant("identity key file is malformed".to_string()))?;
        line.parse::<age::x25519::Identity>()
            .map_err(|e| Error::Invariant(format!("identity key file is malformed: {e}")))
    }

    /// The local `age1…` public encryption key.
    pub fn public_key(&self) -> Result<String> {
        Ok(self.identity()?.to_public().to_string())
    }

    /// Generate the Ed25519 signing pair.
    pub fn generate_signing_key(&self) -> Result<()> {
        let path = self.signing_key_path();
        if path.exists() {
            return Err(Error::already_exists("signing key", path.display().to_string()));
        }
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        write_private(&path, hex::encode(key.to_bytes()).as_bytes())?;
        std::fs::write(
            self.signing_pub_path(),
            hex::encode(key.verifying_key().to_bytes()),
        )?;
        Ok(())
    }

    fn signing_key(&self) -> Result<SigningKey> {
        let path = self.signing_key_path();
        let data = std::fs::read_to_string(&path)
            .map_err(|_| Error::not_found("signing key", path.display().to_string()))?;
        let bytes: [u8; 32] = hex::decode(data.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Invariant("signing key file is malformed".to_string()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    /// Hex of the local Ed25519 verifying key.
    pub fn signing_public_key(&self) -> Result<String> {
        let path = self.signing_pub_path();
        let data = std::fs::read_to_string(&path)
            .map_err(|_| Error::not_found("signing key", path.display().to_string()))?;
        Ok(data.trim().to_string())
    }

    /// Sign the canonical JSON of a value; returns a base64 signature.
    pub fn sign_value(&self, value: &Value) -> Result<String> {
        let key = self.signing_key()?;
        let message = canonical_json(value);
        let signature = key.sign(message.as_bytes());
        Ok(B64.encode(signature.to_bytes()))
    }

    // Recipient registry -----------------------------------------------------

    pub fn add_recipient(&mut self, name: &str, key: &str) -> Result<&Recipient> {
        key.parse::<age::x25519::Recipient>()
            .map_err(|e| Error::Config(format!("invalid public key for {name}: {e}")))?;
        if self.config.recipients.iter().any(|r| r.name == name) {
            return Err(Error::already_exists("recipient", name));
        }
        let key_id = format!("{name}-{}", Utc::now().timestamp());
        std::fs::write(
            self.store
                .keys_dir()
                .join("public")
                .join("recipients")
                .join(format!("{key_id}.pub")),
            key,
        )?;
        self.config.recipients.push(Recipient {
            name: name.to_string(),
            key_id,
            key: key.to_string(),
            added: Utc::now(),
            notes: None,
            trusted: true,
        });
        self.save_config()?;
        Ok(self.config.recipients.last().expect("recipient was just pushed"))
    }

    /// Add or refresh a recipient entry; used by the key exchange where a
    /// returning peer re-announces its key.
    pub fn upsert_recipient(&mut self, name: &str, key: &str) -> Result<()> {
        if let Some(existing) = self.config.recipients.iter_mut().find(|r| r.name == name) {
            existing.key = key.to_string();
            self.save_config()?;
            return Ok(());
        }
        self.add_recipient(name, key)?;
        Ok(())
    }

    pub fn get_recipient(&self, name: &str) -> Result<&Recipient> {
        self.config
            .recipients
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::not_found("recipient", name))
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.config.recipients
    }

    pub fn remove_recipient(&mut self, name: &str) -> Result<()> {
        let idx = self
            .config
            .recipients
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::not_found("recipient", name))?;
        let removed = self.config.recipients.remove(idx);
        let key_file = self
            .store
            .keys_dir()
            .join("public")
            .join("recipients")
            .join(format!("{}.pub", removed.key_id));
        match std::fs::remove_file(key_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.save_config()
    }

    // Public-key encryption --------------------------------------------------

    /// Encrypt for one or more named recipients (X25519).
    pub fn encrypt_for(&self, names: &[String], data: &[u8]) -> Result<Vec<u8>> {
        if names.is_empty() {
            return Err(Error::Config("no recipients specified".to_string()));
        }
        let mut recipients: Vec<Box<dyn age::Recipient + Send>> = Vec::new();
        for name in names {
            let recipient = self.get_recipient(name)?;
            let key = recipient
                .key
                .parse::<age::x25519::Recipient>()
                .map_err(|e| Error::Config(format!("invalid key for recipient {name}: {e}")))?;
            recipients.push(Box::new(key));
        }

        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| Error::Config("no recipients specified".to_string()))?;
        let mut out = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut out)
            .map_err(|e| Error::Invariant(format!("encryption failed: {e}")))?;
        writer.write_all(data)?;
        writer.finish()?;
        Ok(out)
    }

    /// Decrypt a ciphertext addressed to the local identity.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let decryptor = match age::Decryptor::new(data)
            .map_err(|e| Error::Protocol(format!("invalid ciphertext: {e}")))?
        {
            age::Decryptor::Recipients(d) => d,
            age::Decryptor::Passphrase(_) => {
                return Err(Error::Protocol(
                    "ciphertext is passphrase-encrypted, not recipient-encrypted".to_string(),
                ))
            }
        };
        let identity = self.identity()?;
        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|e| Error::Auth(format!("unable to decrypt: {e}")))?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    // TLS material -----------------------------------------------------------

    /// Generate the self-signed local TLS certificate if it does not exist.
    ///
    /// ECDSA P-256, ten-year validity, SANs for localhost, the machine's
    /// hostname, `*.local`, and the loopback addresses.
    pub fn ensure_local_tls_cert(&self) -> Result<()> {
        let cert_path = self.store.cert_path();
        if cert_path.exists() {
            return Ok(());
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut params = rcgen::CertificateParams::new(vec![
            "localhost".to_string(),
            host.clone(),
            "*.local".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ])
        .map_err(|e| Error::Invariant(format!("certificate generation failed: {e}")))?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::OrganizationName, "DSE Local Network");
        dn.push(rcgen::DnType::CommonName, host.as_str());
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::Invariant(format!("certificate generation failed: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Invariant(format!("certificate generation failed: {e}")))?;

        std::fs::write(&cert_path, cert.pem())?;
        write_private(&self.store.cert_key_path(), key_pair.serialize_pem().as_bytes())?;
        Ok(())
    }

    pub fn certificate_paths(&self) -> (PathBuf, PathBuf) {
        (self.store.cert_path(), self.store.cert_key_path())
    }

    /// SHA-256 fingerprint of the local certificate's DER encoding.
    pub fn certificate_fingerprint(&self) -> Result<String> {
        let path = self.store.cert_path();
        let pem = std::fs::read(&path)
            .map_err(|_| Error::not_found("certificate", path.display().to_string()))?;
        let mut reader = std::io::BufReader::new(&pem[..]);
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| Error::Invariant("certificate file holds no certificate".to_string()))?
            .map_err(Error::Io)?;
        Ok(fingerprint_der(der.as_ref()))
    }
}

/// SHA-256 of a DER-encoded certificate, lowercase hex.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Verify a base64 Ed25519 signature over the canonical JSON of a value,
/// using a hex-encoded verifying key.
pub fn verify_value(value: &Value, signature_b64: &str, public_key_hex: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex.trim())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Auth("malformed signing public key".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::Auth("malformed signing public key".to_string()))?;
    let sig_bytes: [u8; 64] = B64
        .decode(signature_b64)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Auth("malformed signature".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    key.verify(canonical_json(value).as_bytes(), &signature)
        .map_err(|_| Error::Auth("invalid signature".to_string()))
}

/// Canonical JSON: recursively sorted object keys, minimal separators, UTF-8.
/// Signatures computed over this form are reproducible across
/// implementations.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).expect("leaf serializes")),
    }
}

// Passphrase envelope --------------------------------------------------------

const ENVELOPE_MAGIC: &[u8; 4] = b"DSE1";
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeHeader {
    kdf: String,
    log_n: u8,
    r: u32,
    p: u32,
    salt: String,
    payload_nonce: String,
    recipients: Vec<WrappedKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WrappedKey {
    nonce: String,
    key: String,
}

/// Seal a payload so that any one of the given passphrases can open it.
///
/// One random payload key encrypts the payload once; each passphrase derives
/// a wrapping key via scrypt over a shared salt and seals the payload key
/// into its own recipient slot.
pub fn encrypt_with_passphrases(passphrases: &[String], data: &[u8]) -> Result<Vec<u8>> {
    if passphrases.is_empty() {
        return Err(Error::Config("no passphrases specified".to_string()));
    }

    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut payload_key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut payload_key);

    let payload_cipher = ChaCha20Poly1305::new(Key::from_slice(&payload_key));
    let payload_nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = payload_cipher
        .encrypt(&payload_nonce, data)
        .map_err(|e| Error::Invariant(format!("encryption failed: {e}")))?;

    let mut recipients = Vec::with_capacity(passphrases.len());
    for passphrase in passphrases {
        let kek = derive_key(passphrase.as_bytes(), &salt)?;
        let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
        let wrapped = wrap_cipher
            .encrypt(&nonce, payload_key.as_slice())
            .map_err(|e| Error::Invariant(format!("encryption failed: {e}")))?;
        recipients.push(WrappedKey {
            nonce: hex::encode(nonce),
            key: hex::encode(wrapped),
        });
    }

    let header = EnvelopeHeader {
        kdf: "scrypt".to_string(),
        log_n: SCRYPT_LOG_N,
        r: SCRYPT_R,
        p: SCRYPT_P,
        salt: hex::encode(salt),
        payload_nonce: hex::encode(payload_nonce),
        recipients,
    };
    let header_bytes = serde_json::to_vec(&header)?;

    let mut out = Vec::with_capacity(4 + 4 + header_bytes.len() + ciphertext.len());
    out.extend_from_slice(ENVELOPE_MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a passphrase envelope. Every recipient slot is tried; failure of all
/// of them means the passphrase is wrong.
pub fn decrypt_with_passphrase(passphrase: &str, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 8 || &data[..4] != ENVELOPE_MAGIC {
        return Err(Error::Protocol("not a passphrase envelope".to_string()));
    }
    let header_len = u32::from_le_bytes(data[4..8].try_into().expect("four bytes")) as usize;
    if data.len() < 8 + header_len {
        return Err(Error::Protocol("truncated passphrase envelope".to_string()));
    }
    let header: EnvelopeHeader = serde_json::from_slice(&data[8..8 + header_len])
        .map_err(|_| Error::Protocol("malformed envelope header".to_string()))?;
    if header.kdf != "scrypt" {
        return Err(Error::Protocol(format!("unsupported kdf: {}", header.kdf)));
    }
    let ciphertext = &data[8 + header_len..];

    let salt = hex::decode(&header.salt)
        .map_err(|_| Error::Protocol("malformed envelope header".to_string()))?;
    let kek = derive_key_params(passphrase.as_bytes(), &salt, header.log_n, header.r, header.p)?;
    let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));

    let mut payload_key = None;
    for slot in &header.recipients {
        let (Ok(nonce), Ok(wrapped)) = (hex::decode(&slot.nonce), hex::decode(&slot.key)) else {
            return Err(Error::Protocol("malformed envelope header".to_string()));
        };
        if let Ok(key) = wrap_cipher.decrypt(Nonce::from_slice(&nonce), wrapped.as_slice()) {
            payload_key = Some(key);
            break;
        }
    }
    let payload_key =
        payload_key.ok_or_else(|| Error::Auth("unable to decrypt with the provided passphrase".to_string()))?;

    let payload_nonce = hex::decode(&header.payload_nonce)
        .map_err(|_| Error::Protocol("malformed envelope header".to_string()))?;
    let payload_cipher = ChaCha20Poly1305::new(Key::from_slice(&payload_key));
    payload_cipher
        .decrypt(Nonce::from_slice(&payload_nonce), ciphertext)
        .map_err(|_| Error::Auth("unable to decrypt with the provided passphrase".to_string()))
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    derive_key_params(passphrase, salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)
}

fn derive_key_params(passphrase: &[u8], salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<[u8; 32]> {
    let params = scrypt::Params::new(log_n, r, p, 32)
        .map_err(|e| Error::Protocol(format!("invalid scrypt parameters: {e}")))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(passphrase, salt, &params, &mut out)
        .map_err(|e| Error::Invariant(format!("key derivation failed: {e}")))?;
    Ok(out)
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (tempfile::TempDir, KeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = GlobalStore::with_root(dir.path());
        let km = KeyManager::new(&store).unwrap();
        km.init_keys().unwrap();
        (dir, km)
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": [1, 2], "m": "x"}, "c": null});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":"x","z":[1,2]},"b":1,"c":null}"#
        );
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (_dir, km) = manager();
        let value = json!({"host": "peer", "port": 9443, "signature": ""});
        let signature = km.sign_value(&value).unwrap();
        let public = km.signing_public_key().unwrap();

        verify_value(&value, &signature, &public).unwrap();

        let tampered = json!({"host": "mallory", "port": 9443, "signature": ""});
        assert!(verify_value(&tampered, &signature, &public).is_err());
    }

    #[test]
    fn keys_are_never_overwritten() {
        let (_dir, km) = manager();
        assert!(matches!(
            km.generate_identity().unwrap_err(),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            km.generate_signing_key().unwrap_err(),
            Error::AlreadyExists { .. }
        ));
        // Re-running init is a no-op on existing material.
        km.init_keys().unwrap();
    }

    #[test]
    fn recipient_encryption_roundtrip() {
        let (_dir, mut km) = manager();
        let own_key = km.public_key().unwrap();
        km.add_recipient("self", &own_key).unwrap();

        let ciphertext = km.encrypt_for(&["self".to_string()], b"bundle bytes").unwrap();
        assert_eq!(km.decrypt(&ciphertext).unwrap(), b"bundle bytes");
    }

    #[test]
    fn recipient_name_collision_rejected() {
        let (_dir, mut km) = manager();
        let key = km.public_key().unwrap();
        km.add_recipient("peer", &key).unwrap();
        assert!(matches!(
            km.add_recipient("peer", &key).unwrap_err(),
            Error::AlreadyExists { .. }
        ));
        km.remove_recipient("peer").unwrap();
        assert!(km.get_recipient("peer").is_err());
    }

    #[test]
    fn passphrase_envelope_multi_recipient() {
        let token_a = "p-token-aaaa".to_string();
        let token_b = "p-token-bbbb".to_string();
        let sealed =
            encrypt_with_passphrases(&[token_a.clone(), token_b.clone()], b"secret payload")
                .unwrap();

        assert_eq!(decrypt_with_passphrase(&token_a, &sealed).unwrap(), b"secret payload");
        assert_eq!(decrypt_with_passphrase(&token_b, &sealed).unwrap(), b"secret payload");
        assert!(matches!(
            decrypt_with_passphrase("p-token-cccc", &sealed).unwrap_err(),
            Error::Auth(_)
        ));
    }

    #[test]
    fn envelope_rejects_garbage() {
        assert!(matches!(
            decrypt_with_passphrase("p", b"not an envelope").unwrap_err(),
            Error::Protocol(_)
        ));
    }

    #[test]
    fn tls_cert_is_generated_once() {
        let (_dir, km) = manager();
        let first = km.certificate_fingerprint().unwrap();
        assert_eq!(first.len(), 64);
        km.ensure_local_tls_cert().unwrap();
        assert_eq!(km.certificate_fingerprint().unwrap(), first);
    }
}
