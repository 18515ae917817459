use crate::error::TransportError;
use crate::tls;
use crate::wire::{
    AuthMethod, ExportInfo, KeyExchangeRequest, KeyExchangeResponse, StatusResponse,
    HEADER_PASSWORD, HEADER_TOKEN, HEADER_USER,
};
use chrono::{DateTime, Utc};
use dse_core::crypto::{self, KeyManager};
use dse_core::hosts::{Host, HostManager};
use dse_core::repos::{self, RepoManager};
use dse_core::tracking::TrackingConfig;
use dse_core::{archive, GlobalStore, RepoConfig, RepoContext};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Caller credentials for an import.
#[derive(Debug, Clone)]
pub enum ImportAuth {
    Password(String),
    User(String),
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub host: String,
    pub port: u16,
    pub auth: ImportAuth,
    pub repo_name: String,
    pub repo_root: PathBuf,
    pub set_default: bool,
    pub skip_key_exchange: bool,
}

#[derive(Debug)]
pub struct ImportOutcome {
    pub bundle_id: String,
    pub bundle_path: PathBuf,
    pub changes: usize,
    pub dsp_dir: String,
}

/// Download, verify, and install a bundle from an export server, creating a
/// new repository at the requested root.
pub async fn import_bundle(
    store: &GlobalStore,
    opts: &ImportOptions,
) -> Result<ImportOutcome, TransportError> {
    let (tls_config, captured) = tls::pinning_client_config();
    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .build()?;

    // Step 1: fetch the signed handshake.
    let status = fetch_status(&client, opts).await?;
    let info = &status.info;

    // Step 2: pin the presented certificate.
    let der = take_captured(&captured)?;
    let fingerprint = crypto::fingerprint_der(&der);
    let (valid_from, valid_to) = certificate_validity(&der)?;
    let mut hosts = HostManager::new(store)?;
    check_certificate_pin(&mut hosts, &opts.host, &fingerprint, valid_from, valid_to, info)?;

    // Step 3: verify the handshake signature and freshness.
    let signing_key = exporter_signing_key(&hosts, &opts.host, info)?;
    info.verify_signature(&signing_key)?;
    info.check_freshness(Utc::now())?;
    validate_export_info(info, &opts.auth)?;

    // Step 4: exchange keys so future transfers can use public-key
    // encryption. Failure here does not abort a password-mode import.
    if !opts.skip_key_exchange {
        match key_exchange(&client, store, opts, info).await {
            Ok(response) => {
                info!(key_exchange_id = %response.key_exchange_id, "key exchange completed")
            }
            Err(e) => warn!("key exchange failed, continuing with password transfer: {e}"),
        }
    }

    // Step 5: download to a temporary file.
    let staging = tempfile::tempdir()?;
    let download_path = staging.path().join("bundle.download");
    download(&client, opts, info, &download_path).await?;

    // The certificate must not change mid-session.
    let der_after = take_captured(&captured)?;
    if crypto::fingerprint_der(&der_after) != fingerprint {
        return Err(TransportError::Auth(
            "server certificate changed between status and download".to_string(),
        ));
    }

    let mut data = tokio::fs::read(&download_path).await?;
    if info.encrypted {
        let (ImportAuth::Password(password), Some(token)) = (&opts.auth, &info.token) else {
            return Err(TransportError::Protocol(
                "server sent an encrypted payload without a token".to_string(),
            ));
        };
        let passphrase = format!("{password}{token}");
        data = tokio::task::spawn_blocking(move || {
            crypto::decrypt_with_passphrase(&passphrase, &data)
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    }

    // Step 6: load and verify the archive.
    let archive_path = staging.path().join(archive::archive_name(&info.bundle_id));
    tokio::fs::write(&archive_path, &data).await?;
    let bundle = archive::load(&archive_path)?;
    if bundle.id != info.bundle_id {
        return Err(TransportError::Protocol(format!(
            "downloaded bundle {} does not match announced bundle {}",
            bundle.id, info.bundle_id
        )));
    }

    // Step 7: create the repository and install the bundle.
    install(store, opts, &archive_path, &bundle).await
}

async fn fetch_status(
    client: &reqwest::Client,
    opts: &ImportOptions,
) -> Result<StatusResponse, TransportError> {
    let url = format!("https://{}:{}/status", opts.host, opts.port);
    let request = with_auth(client.get(&url).timeout(STATUS_TIMEOUT), &opts.auth);
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(map_http_status(response.status(), "status"));
    }
    Ok(response.json().await?)
}

async fn key_exchange(
    client: &reqwest::Client,
    store: &GlobalStore,
    opts: &ImportOptions,
    info: &ExportInfo,
) -> Result<KeyExchangeResponse, TransportError> {
    let mut keys = KeyManager::new(store)?;
    keys.init_keys()?;

    let url = format!("https://{}:{}/key-exchange", opts.host, opts.port);
    let request = with_auth(client.post(&url).timeout(STATUS_TIMEOUT), &opts.auth).json(
        &KeyExchangeRequest {
            public_key: keys.public_key()?,
        },
    );
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(map_http_status(response.status(), "key exchange"));
    }
    let exchange: KeyExchangeResponse = response.json().await?;

    let mut hosts = HostManager::new(store)?;
    let mut entry = hosts
        .get(&opts.host)
        .cloned()
        .unwrap_or_else(|_| Host::new(opts.host.clone(), exchange.public_key.clone()));
    entry.public_key = exchange.public_key.clone();
    entry.signing_key = Some(exchange.signing_public_key.clone());
    entry.ip_address = Some(info.host.clone());
    entry.last_port = Some(info.port);
    hosts.upsert(entry)?;
    keys.upsert_recipient(&opts.host, &exchange.public_key)?;
    Ok(exchange)
}

async fn download(
    client: &reqwest::Client,
    opts: &ImportOptions,
    info: &ExportInfo,
    dest: &std::path::Path,
) -> Result<(), TransportError> {
    let url = format!("https://{}:{}/download", opts.host, opts.port);
    let mut request = with_auth(client.get(&url).timeout(DOWNLOAD_TIMEOUT), &opts.auth);
    if let Some(token) = &info.token {
        request = request.header(HEADER_TOKEN, token);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(map_http_status(response.status(), "download"));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn install(
    store: &GlobalStore,
    opts: &ImportOptions,
    archive_path: &std::path::Path,
    bundle: &dse_core::Bundle,
) -> Result<ImportOutcome, TransportError> {
    let repo = &bundle.repository;
    if repos::is_repository(&opts.repo_root, &repo.dsp_dir) {
        return Err(TransportError::Core(dse_core::Error::already_exists(
            "repository",
            opts.repo_root.display().to_string(),
        )));
    }

    std::fs::create_dir_all(&opts.repo_root).map_err(TransportError::Io)?;
    let config = RepoConfig {
        dsp_dir: repo.dsp_dir.clone(),
        data_dir: repo.data_dir.clone(),
        hash_algorithm: repo.config.hash_algorithm,
        compression_level: repo.config.compression_level,
    };
    let ctx = RepoContext::init(&opts.repo_root, &opts.repo_name, config)?;

    let mut manager = RepoManager::new(store)?;
    manager.register(&opts.repo_root, &opts.repo_name, opts.set_default, &repo.dsp_dir)?;

    // The bundle's tracked paths become the new repository's tracking
    // document; its lifecycle state starts fresh.
    let tracking = TrackingConfig {
        state: Default::default(),
        paths: repo.tracking_config.paths.clone(),
    };
    tracking.save(&ctx.tracking_path())?;

    let final_path = ctx.bundles_dir().join(archive::archive_name(&bundle.id));
    if tokio::fs::rename(archive_path, &final_path).await.is_err() {
        // Rename across devices: copy and unlink.
        tokio::fs::copy(archive_path, &final_path).await?;
        tokio::fs::remove_file(archive_path).await.ok();
    }

    info!(bundle = %bundle.id, repo = %opts.repo_root.display(), "import completed");
    Ok(ImportOutcome {
        bundle_id: bundle.id.clone(),
        bundle_path: final_path,
        changes: bundle.changes.len(),
        dsp_dir: repo.dsp_dir.clone(),
    })
}

fn with_auth(request: reqwest::RequestBuilder, auth: &ImportAuth) -> reqwest::RequestBuilder {
    match auth {
        ImportAuth::Password(password) => request.header(HEADER_PASSWORD, password),
        ImportAuth::User(user) => request.header(HEADER_USER, user),
    }
}

fn take_captured(captured: &Arc<Mutex<Option<Vec<u8>>>>) -> Result<Vec<u8>, TransportError> {
    captured
        .lock()
        .expect("verifier mutex")
        .clone()
        .ok_or_else(|| TransportError::Auth("no certificate presented by server".to_string()))
}

fn certificate_validity(der: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), TransportError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| TransportError::Auth(format!("unparseable server certificate: {e}")))?;
    let validity = cert.validity();
    let from = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| TransportError::Auth("certificate validity out of range".to_string()))?;
    let to = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| TransportError::Auth("certificate validity out of range".to_string()))?;
    Ok((from, to))
}

/// Enforce the pinning policy for a presented certificate.
///
/// Known pin: the fingerprint must match; a renewal (different fingerprint,
/// validity moving forward) is accepted only when the signed handshake
/// vouches for the new fingerprint. Rollback is always refused. First
/// contact: the fingerprint must match the handshake, and is then pinned.
fn check_certificate_pin(
    hosts: &mut HostManager,
    host_name: &str,
    fingerprint: &str,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    info: &ExportInfo,
) -> Result<(), TransportError> {
    match hosts.get(host_name) {
        Ok(entry) => {
            let mut entry = entry.clone();
            match entry.verify_certificate(fingerprint, valid_from, valid_to) {
                Ok(()) => {
                    if entry.cert_info.is_none() && fingerprint != info.cert_fingerprint {
                        return Err(TransportError::Auth(
                            "certificate fingerprint mismatch with export info".to_string(),
                        ));
                    }
                    entry.update_certificate(fingerprint, valid_from, valid_to);
                    hosts.update(entry)?;
                    Ok(())
                }
                Err(e) => {
                    let pinned = entry.cert_info.clone();
                    if let Some(pinned) = pinned {
                        let renewal = valid_to >= pinned.valid_to
                            && fingerprint == info.cert_fingerprint
                            && fingerprint != pinned.fingerprint;
                        if renewal {
                            entry.update_certificate(fingerprint, valid_from, valid_to);
                            hosts.update(entry)?;
                            return Ok(());
                        }
                    }
                    Err(e.into())
                }
            }
        }
        Err(_) => {
            if fingerprint != info.cert_fingerprint {
                return Err(TransportError::Auth(
                    "certificate fingerprint mismatch with export info".to_string(),
                ));
            }
            let mut entry = Host::new(host_name, String::new());
            entry.update_certificate(fingerprint, valid_from, valid_to);
            hosts.add(entry)?;
            Ok(())
        }
    }
}

/// The exporter's Ed25519 verifying key: from a completed key exchange if
/// the host is known, otherwise trust-on-first-use from the handshake.
fn exporter_signing_key(
    hosts: &HostManager,
    host_name: &str,
    info: &ExportInfo,
) -> Result<String, TransportError> {
    if let Ok(entry) = hosts.get(host_name) {
        if let Some(key) = &entry.signing_key {
            return Ok(key.clone());
        }
    }
    info.signing_public_key.clone().ok_or_else(|| {
        TransportError::Auth("no known signing key for exporter".to_string())
    })
}

fn validate_export_info(info: &ExportInfo, auth: &ImportAuth) -> Result<(), TransportError> {
    match auth {
        ImportAuth::Password(password) => {
            if info.auth_method != AuthMethod::Password {
                return Err(TransportError::Protocol(
                    "server does not use password authentication".to_string(),
                ));
            }
            if info.password.as_deref() != Some(password.as_str()) {
                return Err(TransportError::Auth("password mismatch".to_string()));
            }
            if info.token.is_none() || info.token_expiry.is_none() {
                return Err(TransportError::Protocol(
                    "server did not assign a download token".to_string(),
                ));
            }
        }
        ImportAuth::User(user) => {
            if info.auth_method != AuthMethod::User {
                return Err(TransportError::Protocol(
                    "server does not use user authentication".to_string(),
                ));
            }
            let known = info
                .users
                .as_ref()
                .is_some_and(|users| users.iter().any(|u| u == user));
            if !known {
                return Err(TransportError::Auth(format!("unknown user: {user}")));
            }
        }
    }
    Ok(())
}

fn map_http_status(status: reqwest::StatusCode, operation: &str) -> TransportError {
    match status.as_u16() {
        401 => TransportError::Auth(format!("{operation} rejected by server")),
        403 => TransportError::Quota,
        404 => TransportError::NotFound("bundle".to_string()),
        400 => TransportError::Protocol(format!("{operation} request rejected")),
        other => TransportError::Protocol(format!("{operation} failed with HTTP {other}")),
    }
}
