use crate::{Error, GlobalStore, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Pinned certificate material for a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub fingerprint: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
}

/// A known peer, persisted as one JSON file per host.
///
/// Created on first successful key exchange; the certificate pin is updated
/// only when a newer certificate validates against the pinning policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub public_key: String,
    pub added_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub trusted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_info: Option<CertificateInfo>,
}

impl Host {
    pub fn new(name: impl Into<String>, public_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            public_key: public_key.into(),
            added_at: now,
            last_used: now,
            trusted: true,
            description: None,
            ip_address: None,
            last_port: None,
            alias: None,
            tags: Vec::new(),
            signing_key: None,
            cert_info: None,
        }
    }

    /// Check a presented certificate against the stored pin.
    ///
    /// No stored pin means first contact; the caller validates against the
    /// fingerprint carried in the signed handshake instead. A certificate
    /// whose `valid_to` predates the pinned one is a rollback and is always
    /// refused.
    pub fn verify_certificate(
        &self,
        fingerprint: &str,
        _valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
    ) -> Result<()> {
        let Some(pinned) = &self.cert_info else {
            return Ok(());
        };
        if valid_to < pinned.valid_to {
            return Err(Error::Auth(format!(
                "certificate for host {} expires before the pinned certificate (rollback refused)",
                self.name
            )));
        }
        if pinned.fingerprint != fingerprint {
            return Err(Error::Auth(format!(
                "certificate fingerprint mismatch for host {}",
                self.name
            )));
        }
        if Utc::now() > pinned.valid_to {
            return Err(Error::Expired(format!(
                "pinned certificate for host {}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn update_certificate(
        &mut self,
        fingerprint: &str,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
    ) {
        self.cert_info = Some(CertificateInfo {
            fingerprint: fingerprint.to_string(),
            valid_from,
            valid_to,
            last_verified: Utc::now(),
        });
    }
}

/// The host registry under `<global>/hosts/`.
///
/// A host file that fails to parse aborts the registry load so callers
/// notice the corruption instead of silently dropping a pin.
#[derive(Debug)]
pub struct HostManager {
    hosts_dir: PathBuf,
    hosts: HashMap<String, Host>,
}

impl HostManager {
    pub fn new(store: &GlobalStore) -> Result<Self> {
        let hosts_dir = store.hosts_dir();
        std::fs::create_dir_all(&hosts_dir)?;

        let mut hosts = HashMap::new();
        for entry in std::fs::read_dir(&hosts_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path)?;
            let host: Host = serde_json::from_slice(&data).map_err(|e| {
                Error::Invariant(format!(
                    "host file {} is corrupt: {e}",
                    path.display()
                ))
            })?;
            hosts.insert(host.name.clone(), host);
        }

        Ok(Self { hosts_dir, hosts })
    }

    fn host_path(&self, name: &str) -> PathBuf {
        self.hosts_dir.join(format!("{name}.json"))
    }

    fn persist(&self, host: &Host) -> Result<()> {
        let data = serde_json::to_vec_pretty(host)?;
        std::fs::write(self.host_path(&host.name), data)?;
        Ok(())
    }

    pub fn add(&mut self, host: Host) -> Result<()> {
        if self.hosts.contains_key(&host.name) {
            return Err(Error::already_exists("host", host.name));
        }
        self.persist(&host)?;
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    pub fn update(&mut self, mut host: Host) -> Result<()> {
        if !self.hosts.contains_key(&host.name) {
            return Err(Error::not_found("host", host.name));
        }
        host.last_used = Utc::now();
        self.persist(&host)?;
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    /// Insert or refresh a host entry; used by the key exchange.
    pub fn upsert(&mut self, host: Host) -> Result<()> {
        if self.hosts.contains_key(&host.name) {
            self.update(host)
        } else {
            self.add(host)
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.hosts.remove(name).is_none() {
            return Err(Error::not_found("host", name));
        }
        match std::fs::remove_file(self.host_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Host> {
        self.hosts
            .get(name)
            .ok_or_else(|| Error::not_found("host", name))
    }

    /// Resolve by name first, then by alias.
    pub fn resolve(&self, name_or_alias: &str) -> Result<&Host> {
        if let Some(host) = self.hosts.get(name_or_alias) {
            return Ok(host);
        }
        self.hosts
            .values()
            .find(|h| h.alias.as_deref() == Some(name_or_alias))
            .ok_or_else(|| Error::not_found("host", name_or_alias))
    }

    pub fn by_tag(&self, tag: &str) -> Vec<&Host> {
        self.hosts
            .values()
            .filter(|h| h.tags.iter().any(|t| t == tag))
            .collect()
    }

    pub fn list(&self) -> Vec<&Host> {
        let mut hosts: Vec<&Host> = self.hosts.values().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    pub fn set_trusted(&mut self, name: &str, trusted: bool) -> Result<()> {
        let mut host = self.get(name)?.clone();
        host.trusted = trusted;
        self.update(host)
    }

    pub fn set_alias(&mut self, name: &str, alias: Option<String>) -> Result<()> {
        let mut host = self.get(name)?.clone();
        host.alias = alias;
        self.update(host)
    }

    pub fn add_tag(&mut self, name: &str, tag: &str) -> Result<()> {
        let mut host = self.get(name)?.clone();
        if !host.tags.iter().any(|t| t == tag) {
            host.tags.push(tag.to_string());
        }
        self.update(host)
    }

    pub fn remove_tag(&mut self, name: &str, tag: &str) -> Result<()> {
        let mut host = self.get(name)?.clone();
        host.tags.retain(|t| t != tag);
        self.update(host)
    }
}
