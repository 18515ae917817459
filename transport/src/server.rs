use crate::error::TransportError;
use crate::token::TokenPool;
use crate::wire::{
    AuthMethod, ExportInfo, KeyExchangeRequest, KeyExchangeResponse, StatusResponse,
    HEADER_PASSWORD, HEADER_TOKEN, HEADER_USER,
};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use dse_core::crypto::{self, KeyManager};
use dse_core::hosts::{Host, HostManager};
use dse_core::{archive, GlobalStore};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 5 * 60;
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Authentication policy for one export session.
#[derive(Debug, Clone)]
pub enum ExportAuth {
    /// Shared password; downloads are token-gated and the payload is
    /// encrypted against `password ∥ token`.
    Password(String),
    /// Named users; each downloads at most once, payload is served as-is.
    Users(Vec<String>),
}

impl ExportAuth {
    fn method(&self) -> AuthMethod {
        match self {
            ExportAuth::Password(_) => AuthMethod::Password,
            ExportAuth::Users(_) => AuthMethod::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportServerConfig {
    pub bundle_path: PathBuf,
    pub port: u16,
    pub auth: ExportAuth,
    pub max_downloads: usize,
    pub timeout: Duration,
    pub token_ttl: chrono::Duration,
}

impl ExportServerConfig {
    pub fn new(bundle_path: PathBuf, port: u16, auth: ExportAuth, max_downloads: usize) -> Self {
        Self {
            bundle_path,
            port,
            auth,
            max_downloads,
            timeout: DEFAULT_SERVER_TIMEOUT,
            token_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }
}

/// Mutable server state, linearized under one mutex: the token map, the
/// download counter, and the per-user ledger.
struct ServerState {
    tokens: Option<TokenPool>,
    downloads: usize,
    downloaded_users: HashSet<String>,
}

struct SharedServer {
    state: Mutex<ServerState>,
    auth: ExportAuth,
    encrypted: bool,
    bundle_path: PathBuf,
    max_downloads: usize,
    info_template: ExportInfo,
    store: GlobalStore,
    cancel: CancellationToken,
}

/// TLS server distributing one bundle with token-gated, optionally
/// encrypted downloads.
///
/// The server shuts down when the download limit is reached (password
/// mode), when every named user has downloaded (user mode), or when the
/// configured timeout elapses.
pub struct ExportServer {
    shared: Arc<SharedServer>,
    port: u16,
    timeout: Duration,
    export_info: ExportInfo,
}

impl ExportServer {
    pub async fn new(store: &GlobalStore, config: ExportServerConfig) -> Result<Self, TransportError> {
        // Refuse to serve anything that fails verification.
        let bundle = archive::load(&config.bundle_path)?;
        let bundle_id = bundle.id.clone();

        let keys = KeyManager::new(store)?;
        keys.init_keys()?;
        let cert_fingerprint = keys.certificate_fingerprint()?;
        let signing_public_key = keys.signing_public_key()?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        let (tokens, encrypted, users, password) = match &config.auth {
            ExportAuth::Password(password) => (
                Some(TokenPool::generate(config.max_downloads, config.token_ttl)),
                true,
                None,
                Some(password.clone()),
            ),
            ExportAuth::Users(users) => (None, false, Some(users.clone()), None),
        };

        let info_template = ExportInfo {
            host,
            port: config.port,
            bundle_id,
            auth_method: config.auth.method(),
            users,
            password,
            signature: String::new(),
            expires: Utc::now()
                + chrono::Duration::from_std(config.timeout)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
            encrypted,
            token: None,
            token_expiry: None,
            cert_fingerprint,
            signing_public_key: Some(signing_public_key),
        };
        let mut export_info = info_template.clone();
        export_info.sign(&keys)?;

        let shared = Arc::new(SharedServer {
            state: Mutex::new(ServerState {
                tokens,
                downloads: 0,
                downloaded_users: HashSet::new(),
            }),
            auth: config.auth,
            encrypted,
            bundle_path: config.bundle_path,
            max_downloads: config.max_downloads,
            info_template,
            store: store.clone(),
            cancel: CancellationToken::new(),
        });

        Ok(Self {
            shared,
            port: config.port,
            timeout: config.timeout,
            export_info,
        })
    }

    /// The signed handshake to hand to importers out of band.
    pub fn export_info(&self) -> &ExportInfo {
        &self.export_info
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/key-exchange", post(handle_key_exchange))
            .route("/download", get(handle_download))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.shared))
    }

    /// Run the server until a shutdown condition fires.
    pub async fn serve(&self) -> Result<(), TransportError> {
        let keys = KeyManager::new(&self.shared.store)?;
        let (cert_path, key_path) = keys.certificate_paths();
        let tls = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(TransportError::Io)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let handle = axum_server::Handle::new();

        let cancel = self.shared.cancel.clone();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            // Let in-flight downloads drain before closing the listener.
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        let cancel = self.shared.cancel.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("server timeout elapsed, shutting down");
            cancel.cancel();
        });

        info!(%addr, "export server listening");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router().into_make_service_with_connect_info::<SocketAddr>())
            .await?;
        Ok(())
    }
}

/// Authenticate a request; returns the user name in user mode.
fn authenticate(auth: &ExportAuth, headers: &HeaderMap) -> Result<Option<String>, TransportError> {
    match auth {
        ExportAuth::Password(password) => {
            let presented = headers
                .get(HEADER_PASSWORD)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| TransportError::Auth("missing password".to_string()))?;
            if presented != password {
                return Err(TransportError::Auth("invalid password".to_string()));
            }
            Ok(None)
        }
        ExportAuth::Users(users) => {
            let presented = headers
                .get(HEADER_USER)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| TransportError::Auth("missing user".to_string()))?;
            if !users.iter().any(|u| u == presented) {
                return Err(TransportError::Auth(format!("unknown user: {presented}")));
            }
            Ok(Some(presented.to_string()))
        }
    }
}

async fn handle_status(
    State(srv): State<Arc<SharedServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, TransportError> {
    authenticate(&srv.auth, &headers)?;
    let client_ip = addr.ip().to_string();

    let mut info = srv.info_template.clone();
    let (downloads, downloaded) = {
        let mut state = srv.state.lock().await;
        if let Some(tokens) = state.tokens.as_mut() {
            let assigned = tokens.assign(&client_ip)?;
            info.token = Some(assigned.token);
            info.token_expiry = Some(assigned.expiry);
        }
        (
            state.downloads,
            state.downloaded_users.iter().cloned().collect::<Vec<_>>(),
        )
    };

    let keys = KeyManager::new(&srv.store)?;
    info.sign(&keys)?;

    Ok(Json(StatusResponse {
        downloads,
        max_downloads: srv.max_downloads,
        downloaded,
        info,
    }))
}

async fn handle_key_exchange(
    State(srv): State<Arc<SharedServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<KeyExchangeRequest>>,
) -> Result<Json<KeyExchangeResponse>, TransportError> {
    authenticate(&srv.auth, &headers)?;
    let Some(Json(request)) = body else {
        return Err(TransportError::Protocol("missing request body".to_string()));
    };
    if !request.public_key.starts_with("age1") {
        return Err(TransportError::Protocol("invalid public key format".to_string()));
    }
    let client_ip = addr.ip().to_string();

    let mut hosts = HostManager::new(&srv.store)?;
    let mut entry = hosts
        .get(&client_ip)
        .cloned()
        .unwrap_or_else(|_| Host::new(client_ip.clone(), request.public_key.clone()));
    entry.public_key = request.public_key.clone();
    entry.ip_address = Some(client_ip.clone());
    entry.last_port = Some(srv.info_template.port);
    entry.trusted = true;
    hosts.upsert(entry)?;

    let mut keys = KeyManager::new(&srv.store)?;
    keys.upsert_recipient(&client_ip, &request.public_key)?;

    info!(client = %client_ip, "key exchange completed");
    Ok(Json(KeyExchangeResponse {
        status: "success".to_string(),
        public_key: keys.public_key()?,
        signing_public_key: keys.signing_public_key()?,
        key_exchange_id: format!("keyx-{}", srv.info_template.bundle_id),
    }))
}

async fn handle_download(
    State(srv): State<Arc<SharedServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, TransportError> {
    let user = authenticate(&srv.auth, &headers)?;
    let client_ip = addr.ip().to_string();

    if !srv.bundle_path.exists() {
        return Err(TransportError::NotFound("bundle".to_string()));
    }

    match &srv.auth {
        ExportAuth::Password(password) => {
            let token = headers
                .get(HEADER_TOKEN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| TransportError::Protocol("missing one-time token".to_string()))?;

            // First phase under the mutex: check the token can be spent and
            // snapshot the outstanding recipients; consumption waits until
            // the payload is sealed.
            let passphrases = {
                let state = srv.state.lock().await;
                if state.downloads >= srv.max_downloads {
                    srv.cancel.cancel();
                    return Err(TransportError::Quota);
                }
                let tokens = state
                    .tokens
                    .as_ref()
                    .expect("password mode has a token pool");
                tokens.validate(&token, &client_ip)?;
                tokens
                    .outstanding()
                    .iter()
                    .map(|t| format!("{password}{}", t.token))
                    .collect::<Vec<_>>()
            };

            let raw = tokio::fs::read(&srv.bundle_path).await?;
            let body = if srv.encrypted {
                tokio::task::spawn_blocking(move || {
                    crypto::encrypt_with_passphrases(&passphrases, &raw)
                })
                .await
                .map_err(|e| {
                    TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })??
            } else {
                raw
            };

            // Second phase: consume the token and count the download
            // atomically with the shutdown decision.
            let shutdown = {
                let mut state = srv.state.lock().await;
                state
                    .tokens
                    .as_mut()
                    .expect("password mode has a token pool")
                    .consume(&token, &client_ip)?;
                state.downloads += 1;
                state.downloads >= srv.max_downloads
            };
            if shutdown {
                info!("download limit reached, shutting down");
                srv.cancel.cancel();
            }

            Ok(octet_stream(body))
        }
        ExportAuth::Users(users) => {
            let user = user.expect("user mode authenticated a user");
            let body = tokio::fs::read(&srv.bundle_path).await?;

            let shutdown = {
                let mut state = srv.state.lock().await;
                state.downloads += 1;
                state.downloaded_users.insert(user);
                users.iter().all(|u| state.downloaded_users.contains(u))
            };
            if shutdown {
                info!("all users have downloaded, shutting down");
                srv.cancel.cancel();
            }

            Ok(octet_stream(body))
        }
    }
}

fn octet_stream(body: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::bundle::Bundle;
    use dse_core::snapshot::create_snapshot;
    use dse_core::tracking::TrackingConfig;
    use dse_core::{RepoConfig, RepoContext};

    struct Fixture {
        _repo_dir: tempfile::TempDir,
        _global_dir: tempfile::TempDir,
        store: GlobalStore,
        archive_path: PathBuf,
        archive_bytes: Vec<u8>,
    }

    async fn fixture() -> Fixture {
        let repo_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(repo_dir.path().join("data")).unwrap();
        std::fs::write(repo_dir.path().join("data/a.txt"), b"hello\n").unwrap();

        let ctx = RepoContext::init(repo_dir.path(), "demo", RepoConfig::default()).unwrap();
        let mut tracking = TrackingConfig::default();
        tracking
            .add_path(repo_dir.path(), &repo_dir.path().join("data"), vec![])
            .unwrap();
        let snap =
            create_snapshot(&tracking.paths, "alice", "", ctx.config.hash_algorithm).unwrap();
        let bundle = Bundle::create(&ctx, &tracking, None, &snap, "alice", None)
            .await
            .unwrap();
        let archive_path = ctx.bundles_dir().join(format!("{}.archive", bundle.id));
        dse_core::archive::pack(&bundle, &archive_path).unwrap();
        let archive_bytes = std::fs::read(&archive_path).unwrap();

        let global_dir = tempfile::tempdir().unwrap();
        let store = GlobalStore::with_root(global_dir.path());
        KeyManager::new(&store).unwrap().init_keys().unwrap();

        Fixture {
            _repo_dir: repo_dir,
            _global_dir: global_dir,
            store,
            archive_path,
            archive_bytes,
        }
    }

    fn password_headers(password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_PASSWORD, password.parse().unwrap());
        headers
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 40000 + n as u16))
    }

    async fn password_server(f: &Fixture, max_downloads: usize) -> ExportServer {
        ExportServer::new(
            &f.store,
            ExportServerConfig::new(
                f.archive_path.clone(),
                9443,
                ExportAuth::Password("secret".to_string()),
                max_downloads,
            ),
        )
        .await
        .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn status_assigns_tokens_until_pool_is_dry() {
        let f = fixture().await;
        let server = password_server(&f, 3).await;
        let state = Arc::clone(&server.shared);

        let mut tokens = Vec::new();
        for n in 1..=3 {
            let response = handle_status(
                State(Arc::clone(&state)),
                ConnectInfo(peer(n)),
                password_headers("secret"),
            )
            .await
            .unwrap();
            let info = &response.0.info;
            tokens.push(info.token.clone().unwrap());
            assert!(info.token_expiry.unwrap() > Utc::now());
        }
        assert_eq!(
            tokens.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );

        // Fourth and fifth distinct clients find the pool exhausted.
        for n in 4..=5 {
            let err = handle_status(
                State(Arc::clone(&state)),
                ConnectInfo(peer(n)),
                password_headers("secret"),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, TransportError::Exhausted));
        }
    }

    #[tokio::test]
    async fn status_rejects_bad_password() {
        let f = fixture().await;
        let server = password_server(&f, 1).await;
        let err = handle_status(
            State(Arc::clone(&server.shared)),
            ConnectInfo(peer(1)),
            password_headers("wrong"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
    }

    #[tokio::test]
    async fn status_response_is_signed_over_the_assigned_token() {
        let f = fixture().await;
        let server = password_server(&f, 1).await;
        let response = handle_status(
            State(Arc::clone(&server.shared)),
            ConnectInfo(peer(1)),
            password_headers("secret"),
        )
        .await
        .unwrap();

        let keys = KeyManager::new(&f.store).unwrap();
        let public = keys.signing_public_key().unwrap();
        response.0.info.verify_signature(&public).unwrap();
        assert!(response.0.info.token.is_some());
    }

    #[tokio::test]
    async fn download_consumes_token_and_shuts_down_at_limit() {
        let f = fixture().await;
        let server = password_server(&f, 2).await;
        let state = Arc::clone(&server.shared);

        let mut assigned = Vec::new();
        for n in 1..=2 {
            let response = handle_status(
                State(Arc::clone(&state)),
                ConnectInfo(peer(n)),
                password_headers("secret"),
            )
            .await
            .unwrap();
            assigned.push(response.0.info.token.clone().unwrap());
        }

        for (i, token) in assigned.iter().enumerate() {
            let mut headers = password_headers("secret");
            headers.insert(HEADER_TOKEN, token.parse().unwrap());
            let response = handle_download(
                State(Arc::clone(&state)),
                ConnectInfo(peer(i as u8 + 1)),
                headers,
            )
            .await
            .unwrap();
            let body = body_bytes(response).await;

            // Payload decrypts with password ∥ token, and with that pair only.
            let plain =
                crypto::decrypt_with_passphrase(&format!("secret{token}"), &body).unwrap();
            assert_eq!(plain, f.archive_bytes);
            assert!(crypto::decrypt_with_passphrase("secretwrong", &body).is_err());
        }

        assert_eq!(state.state.lock().await.downloads, 2);
        assert!(server.shared.cancel.is_cancelled());

        // A spent token cannot be replayed.
        let mut headers = password_headers("secret");
        headers.insert(HEADER_TOKEN, assigned[0].parse().unwrap());
        let err = handle_download(State(Arc::clone(&state)), ConnectInfo(peer(1)), headers)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Auth(_) | TransportError::Quota
        ));
    }

    #[tokio::test]
    async fn download_rejects_token_from_other_client() {
        let f = fixture().await;
        let server = password_server(&f, 2).await;
        let state = Arc::clone(&server.shared);

        let response = handle_status(
            State(Arc::clone(&state)),
            ConnectInfo(peer(1)),
            password_headers("secret"),
        )
        .await
        .unwrap();
        let token = response.0.info.token.clone().unwrap();

        let mut headers = password_headers("secret");
        headers.insert(HEADER_TOKEN, token.parse().unwrap());
        let err = handle_download(State(Arc::clone(&state)), ConnectInfo(peer(2)), headers)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
        assert_eq!(state.state.lock().await.downloads, 0);
    }

    #[tokio::test]
    async fn download_without_token_is_a_protocol_error() {
        let f = fixture().await;
        let server = password_server(&f, 1).await;
        let err = handle_download(
            State(Arc::clone(&server.shared)),
            ConnectInfo(peer(1)),
            password_headers("secret"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn ciphertext_opens_for_every_outstanding_token() {
        let f = fixture().await;
        let server = password_server(&f, 2).await;
        let state = Arc::clone(&server.shared);

        let mut assigned = Vec::new();
        for n in 1..=2 {
            let response = handle_status(
                State(Arc::clone(&state)),
                ConnectInfo(peer(n)),
                password_headers("secret"),
            )
            .await
            .unwrap();
            assigned.push(response.0.info.token.clone().unwrap());
        }

        // Client 1 downloads while client 2's token is still outstanding:
        // the same ciphertext must open for both (password, token) pairs.
        let mut headers = password_headers("secret");
        headers.insert(HEADER_TOKEN, assigned[0].parse().unwrap());
        let response = handle_download(State(Arc::clone(&state)), ConnectInfo(peer(1)), headers)
            .await
            .unwrap();
        let body = body_bytes(response).await;

        for token in &assigned {
            let plain =
                crypto::decrypt_with_passphrase(&format!("secret{token}"), &body).unwrap();
            assert_eq!(plain, f.archive_bytes);
        }
    }

    #[tokio::test]
    async fn user_mode_tracks_downloads_and_shuts_down_when_complete() {
        let f = fixture().await;
        let server = ExportServer::new(
            &f.store,
            ExportServerConfig::new(
                f.archive_path.clone(),
                9443,
                ExportAuth::Users(vec!["alice".to_string(), "bob".to_string()]),
                2,
            ),
        )
        .await
        .unwrap();
        let state = Arc::clone(&server.shared);

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER, "mallory".parse().unwrap());
        assert!(matches!(
            handle_download(State(Arc::clone(&state)), ConnectInfo(peer(9)), headers)
                .await
                .unwrap_err(),
            TransportError::Auth(_)
        ));

        for (n, user) in ["alice", "bob"].iter().enumerate() {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_USER, user.parse().unwrap());
            let response =
                handle_download(State(Arc::clone(&state)), ConnectInfo(peer(n as u8 + 1)), headers)
                    .await
                    .unwrap();
            // User mode serves the archive unencrypted.
            assert_eq!(body_bytes(response).await, f.archive_bytes);
        }
        assert!(server.shared.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn key_exchange_registers_recipient_and_host() {
        let f = fixture().await;
        let server = password_server(&f, 1).await;

        let importer_key = {
            // A second party's identity, generated in its own store.
            let dir = tempfile::tempdir().unwrap();
            let store = GlobalStore::with_root(dir.path());
            let keys = KeyManager::new(&store).unwrap();
            keys.init_keys().unwrap();
            keys.public_key().unwrap()
        };

        let response = handle_key_exchange(
            State(Arc::clone(&server.shared)),
            ConnectInfo(peer(7)),
            password_headers("secret"),
            Some(Json(KeyExchangeRequest {
                public_key: importer_key.clone(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(response.0.status, "success");
        assert!(response.0.public_key.starts_with("age1"));
        assert!(response.0.key_exchange_id.starts_with("keyx-"));

        let hosts = HostManager::new(&f.store).unwrap();
        let entry = hosts.get("10.0.0.7").unwrap();
        assert_eq!(entry.public_key, importer_key);

        let keys = KeyManager::new(&f.store).unwrap();
        assert!(keys.get_recipient("10.0.0.7").is_ok());
    }

    #[tokio::test]
    async fn key_exchange_rejects_malformed_key() {
        let f = fixture().await;
        let server = password_server(&f, 1).await;
        let err = handle_key_exchange(
            State(Arc::clone(&server.shared)),
            ConnectInfo(peer(7)),
            password_headers("secret"),
            Some(Json(KeyExchangeRequest {
                public_key: "ssh-rsa AAAA".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
