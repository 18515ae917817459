use crate::TransportError;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::{HashMap, VecDeque};

/// A one-time download token bound to a client IP.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub used: bool,
    pub client_ip: String,
    pub assigned_at: DateTime<Utc>,
}

/// FIFO pool of one-time tokens.
///
/// Lifecycle of a token: `pooled → assigned(ip, expiry) → used | expired`.
/// Assignment happens on `/status`, consumption exactly once on a
/// successful `/download`. An expired, unused assignment does not block the
/// client from receiving a fresh token while the pool lasts; a consumed
/// token is never re-issued.
#[derive(Debug)]
pub struct TokenPool {
    pooled: VecDeque<String>,
    assigned: HashMap<String, TokenInfo>,
    ttl: Duration,
}

impl TokenPool {
    /// Generate `count` random 32-byte URL-safe tokens.
    pub fn generate(count: usize, ttl: Duration) -> Self {
        let mut pooled = VecDeque::with_capacity(count);
        for _ in 0..count {
            let mut raw = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            pooled.push_back(base64::engine::general_purpose::URL_SAFE.encode(raw));
        }
        Self {
            pooled,
            assigned: HashMap::new(),
            ttl,
        }
    }

    /// Assign a token to a client, reusing its live assignment if one
    /// exists.
    pub fn assign(&mut self, client_ip: &str) -> Result<TokenInfo, TransportError> {
        let now = Utc::now();
        if let Some(existing) = self
            .assigned
            .values()
            .find(|t| t.client_ip == client_ip && !t.used && now < t.expiry)
        {
            return Ok(existing.clone());
        }

        let token = self.pooled.pop_front().ok_or(TransportError::Exhausted)?;
        let info = TokenInfo {
            token: token.clone(),
            expiry: now + self.ttl,
            used: false,
            client_ip: client_ip.to_string(),
            assigned_at: now,
        };
        self.assigned.insert(token, info.clone());
        Ok(info)
    }

    /// Check that a token may be spent by this client, without consuming it.
    pub fn validate(&self, token: &str, client_ip: &str) -> Result<(), TransportError> {
        let info = self
            .assigned
            .get(token)
            .ok_or_else(|| TransportError::Auth("invalid token".to_string()))?;
        if info.used {
            return Err(TransportError::Auth("token already used".to_string()));
        }
        if Utc::now() > info.expiry {
            return Err(TransportError::Expired("token".to_string()));
        }
        if info.client_ip != client_ip {
            return Err(TransportError::Auth(
                "token assigned to a different client".to_string(),
            ));
        }
        Ok(())
    }

    /// Consume a token. Validation is re-run so the consumption is correct
    /// even when the check and the spend are separated by other work.
    pub fn consume(&mut self, token: &str, client_ip: &str) -> Result<(), TransportError> {
        self.validate(token, client_ip)?;
        self.assigned
            .get_mut(token)
            .expect("validated token exists")
            .used = true;
        Ok(())
    }

    /// Tokens that could still be spent: assigned, unused, unexpired.
    pub fn outstanding(&self) -> Vec<&TokenInfo> {
        let now = Utc::now();
        self.assigned
            .values()
            .filter(|t| !t.used && now < t.expiry)
            .collect()
    }

    pub fn consumed_count(&self) -> usize {
        self.assigned.values().filter(|t| t.used).count()
    }

    pub fn pooled_count(&self) -> usize {
        self.pooled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> TokenPool {
        TokenPool::generate(count, Duration::minutes(5))
    }

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let pool = pool(8);
        let mut seen = std::collections::HashSet::new();
        for token in &pool.pooled {
            assert!(seen.insert(token.clone()));
            assert!(!token.contains('+') && !token.contains('/'));
        }
    }

    #[test]
    fn pool_exhaustion_after_max_assignments() {
        let mut pool = pool(3);
        for i in 0..3 {
            pool.assign(&format!("10.0.0.{i}")).unwrap();
        }
        assert!(matches!(
            pool.assign("10.0.0.9").unwrap_err(),
            TransportError::Exhausted
        ));
    }

    #[test]
    fn repeated_status_reuses_assignment() {
        let mut pool = pool(2);
        let first = pool.assign("10.0.0.1").unwrap();
        let second = pool.assign("10.0.0.1").unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn consume_is_at_most_once() {
        let mut pool = pool(1);
        let info = pool.assign("10.0.0.1").unwrap();
        pool.consume(&info.token, "10.0.0.1").unwrap();
        assert!(matches!(
            pool.consume(&info.token, "10.0.0.1").unwrap_err(),
            TransportError::Auth(_)
        ));
        assert_eq!(pool.consumed_count(), 1);
    }

    #[test]
    fn ip_mismatch_rejected() {
        let mut pool = pool(1);
        let info = pool.assign("10.0.0.1").unwrap();
        assert!(matches!(
            pool.validate(&info.token, "10.0.0.2").unwrap_err(),
            TransportError::Auth(_)
        ));
    }

    #[test]
    fn unknown_token_rejected() {
        let pool = pool(1);
        assert!(pool.validate("bogus", "10.0.0.1").is_err());
    }

    #[test]
    fn expired_token_rejected_and_client_reassigned() {
        let mut pool = TokenPool::generate(2, Duration::milliseconds(-1));
        let info = pool.assign("10.0.0.1").unwrap();
        assert!(matches!(
            pool.validate(&info.token, "10.0.0.1").unwrap_err(),
            TransportError::Expired(_)
        ));

        // The dead assignment does not satisfy reuse, so the client gets the
        // next pooled token.
        let fresh = pool.assign("10.0.0.1").unwrap();
        assert_ne!(fresh.token, info.token);
    }

    #[test]
    fn outstanding_excludes_used_tokens() {
        let mut pool = pool(3);
        let a = pool.assign("10.0.0.1").unwrap();
        let _b = pool.assign("10.0.0.2").unwrap();
        pool.consume(&a.token, "10.0.0.1").unwrap();
        let outstanding = pool.outstanding();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].client_ip, "10.0.0.2");
    }
}
