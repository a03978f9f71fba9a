//! Security layer: authentication, per-action authorization and sealed messages
//!
//! Each swarm carries an optional [`SecurityContext`]. Tokens are random
//! 32-byte values encoded as URL-safe base64 and compared in constant time.
//! Authorization never raises: callers branch on the returned boolean and
//! every decision is written to the swarm's access log.

use crate::{
    config::SecurityConfig,
    crypto::{decrypt_message, encrypt_with_metadata, MessageEnvelope, SharedKey},
    error::{SwarmError, SwarmResult},
    swarm::Swarm,
    telemetry::names,
    types::AgentId,
};
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use subtle::ConstantTimeEq;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;
use zeroize::{Zeroize, ZeroizeOnDrop};

const TOKEN_BYTES: usize = 32;

/// Security requirements attached to a swarm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Actions require a valid, unexpired token
    pub authentication_required: bool,
    /// Messages must be sealed with the shared key
    pub encryption_required: bool,
}

/// Effect of an access rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// Allow or deny an action pattern, optionally for specific agents
///
/// Patterns are `*`, an exact action name, or a prefix ending in `*`
/// such as `state.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub action: String,
    pub effect: PolicyEffect,
    /// Agents the rule applies to, all agents when empty
    #[serde(default)]
    pub agents: Vec<AgentId>,
}

impl AccessRule {
    pub fn allow(action: impl Into<String>) -> Self {
        Self { action: action.into(), effect: PolicyEffect::Allow, agents: Vec::new() }
    }

    pub fn deny(action: impl Into<String>) -> Self {
        Self { action: action.into(), effect: PolicyEffect::Deny, agents: Vec::new() }
    }

    pub fn for_agents(mut self, agents: impl IntoIterator<Item = impl Into<AgentId>>) -> Self {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    fn matches(&self, agent_id: &str, action: &str) -> bool {
        if !self.agents.is_empty() && !self.agents.iter().any(|a| a == agent_id) {
            return false;
        }
        match self.action.strip_suffix('*') {
            Some(prefix) => action.starts_with(prefix),
            None => self.action == action,
        }
    }
}

/// Per-action allow/deny rules; an explicit deny overrides any allow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Effect when no rule matches
    pub default_effect: PolicyEffect,
    pub rules: Vec<AccessRule>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            default_effect: PolicyEffect::Allow,
            rules: Vec::new(),
        }
    }
}

impl AccessPolicy {
    pub fn deny_by_default() -> Self {
        Self {
            default_effect: PolicyEffect::Deny,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: AccessRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn evaluate(&self, agent_id: &str, action: &str) -> PolicyEffect {
        let mut allowed = false;
        for rule in self.rules.iter().filter(|r| r.matches(agent_id, action)) {
            match rule.effect {
                PolicyEffect::Deny => return PolicyEffect::Deny,
                PolicyEffect::Allow => allowed = true,
            }
        }
        if allowed {
            PolicyEffect::Allow
        } else {
            self.default_effect
        }
    }
}

/// Token issued after successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub agent_id: AgentId,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome recorded for each authorization decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub action: String,
    pub allowed: bool,
    pub reason: String,
}

/// Security state of one swarm
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub policy: SecurityPolicy,
    pub access: AccessPolicy,
    tokens: HashMap<AgentId, IssuedToken>,
    access_log: VecDeque<AccessLogEntry>,
}

impl SecurityContext {
    fn new(policy: SecurityPolicy, access: AccessPolicy) -> Self {
        Self {
            policy,
            access,
            tokens: HashMap::new(),
            access_log: VecDeque::new(),
        }
    }

    fn log(&mut self, entry: AccessLogEntry, cap: usize) {
        self.access_log.push_back(entry);
        while self.access_log.len() > cap {
            self.access_log.pop_front();
        }
    }

    /// Token check; `Err` carries the denial reason
    fn check_token(&self, agent_id: &str, presented: Option<&str>, now: DateTime<Utc>) -> Result<(), &'static str> {
        let presented = presented.ok_or("missing token")?;
        let issued = self.tokens.get(agent_id).ok_or("no token issued")?;
        let same: bool = issued.token.as_bytes().ct_eq(presented.as_bytes()).into();
        if !same {
            return Err("token mismatch");
        }
        if issued.is_expired(now) {
            return Err("token expired");
        }
        Ok(())
    }
}

/// Opaque secret presented by an agent
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    secret: Vec<u8>,
}

impl Credentials {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(..)")
    }
}

/// External credential check
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` for rejected credentials, `Err` for verifier faults
    async fn verify(&self, agent_id: &str, credentials: &Credentials) -> SwarmResult<bool>;
}

/// Verifier over registered Argon2id secret hashes
///
/// Each secret is stored as a salted PHC string. Hashing and verification
/// run on the blocking pool.
#[derive(Default)]
pub struct StaticCredentialVerifier {
    hashes: DashMap<AgentId, String>,
}

impl std::fmt::Debug for StaticCredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialVerifier")
            .field("agents", &self.hashes.len())
            .finish()
    }
}

impl StaticCredentialVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `secret` with a fresh salt and store it for `agent_id`
    pub fn register(&self, agent_id: impl Into<AgentId>, secret: &[u8]) -> SwarmResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let phc = Argon2::default()
            .hash_password(secret, &salt)
            .map_err(|e| SwarmError::Other(anyhow::anyhow!("hashing secret failed: {e}")))?
            .to_string();
        self.hashes.insert(agent_id.into(), phc);
        Ok(())
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.hashes.remove(agent_id).is_some()
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, agent_id: &str, credentials: &Credentials) -> SwarmResult<bool> {
        let Some(phc) = self.hashes.get(agent_id).map(|h| h.clone()) else {
            return Ok(false);
        };
        let secret = Zeroizing::new(credentials.secret().to_vec());
        tokio::task::spawn_blocking(move || verify_secret(&phc, &secret))
            .await
            .map_err(|e| SwarmError::Other(e.into()))?
    }
}

fn verify_secret(phc: &str, secret: &[u8]) -> SwarmResult<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| SwarmError::Other(anyhow::anyhow!("stored hash unreadable: {e}")))?;
    match Argon2::default().verify_password(secret, &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(SwarmError::Other(anyhow::anyhow!("verification failed: {e}"))),
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Issues tokens, evaluates access and seals messages for swarms
pub struct SecurityManager {
    verifier: Arc<dyn CredentialVerifier>,
    config: SecurityConfig,
}

impl SecurityManager {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, config: SecurityConfig) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self { verifier, config })
    }

    /// Attach a policy and an empty token store, replacing any previous context
    pub async fn initialize_security(&self, swarm: &Swarm, policy: SecurityPolicy) -> SwarmResult<()> {
        *swarm.security().write().await =
            Some(SecurityContext::new(policy, self.config.access.clone()));
        info!(
            "Security initialized for swarm {} (authentication: {}, encryption: {})",
            swarm.id(),
            policy.authentication_required,
            policy.encryption_required
        );
        Ok(())
    }

    /// Replace the access rules of an initialized swarm
    pub async fn set_access_policy(&self, swarm: &Swarm, access: AccessPolicy) -> SwarmResult<()> {
        let mut guard = swarm.security().write().await;
        let context = guard.as_mut().ok_or_else(|| uninitialized(swarm, "set access policy"))?;
        context.access = access;
        Ok(())
    }

    pub async fn policy(&self, swarm: &Swarm) -> Option<SecurityPolicy> {
        swarm.security().read().await.as_ref().map(|c| c.policy)
    }

    /// Verify credentials and issue a token with expiry
    pub async fn authenticate_agent(
        &self,
        swarm: &Swarm,
        agent_id: &str,
        credentials: &Credentials,
    ) -> SwarmResult<IssuedToken> {
        if swarm.security().read().await.is_none() {
            return Err(uninitialized(swarm, "authenticate agents"));
        }

        let verdict = timeout(
            self.config.verify_timeout(),
            self.verifier.verify(agent_id, credentials),
        )
        .await
        .map_err(|_| SwarmError::Timeout {
            operation: "credential verification",
            after_ms: self.config.verify_timeout_ms,
        })??;

        if !verdict {
            counter!(names::AUTH_FAILURES, "swarm" => swarm.id().to_string()).increment(1);
            warn!("Rejected credentials for agent {} in swarm {}", agent_id, swarm.id());
            return Err(SwarmError::InvalidCredentials(agent_id.to_string()));
        }

        let now = Utc::now();
        let issued = IssuedToken {
            agent_id: agent_id.to_string(),
            token: generate_token(),
            issued_at: now,
            expires_at: now + self.config.token_ttl(),
        };

        let mut guard = swarm.security().write().await;
        let context = guard
            .as_mut()
            .ok_or_else(|| uninitialized(swarm, "authenticate agents"))?;
        context.tokens.insert(agent_id.to_string(), issued.clone());
        info!("Agent {} authenticated in swarm {}", agent_id, swarm.id());
        Ok(issued)
    }

    /// Whether `agent_id` may perform `action`
    ///
    /// Returns false for swarms without security initialized.
    pub async fn authorize_action(
        &self,
        swarm: &Swarm,
        agent_id: &str,
        action: &str,
        token: Option<&str>,
    ) -> bool {
        let mut guard = swarm.security().write().await;
        let Some(context) = guard.as_mut() else {
            warn!("Authorization for {} in swarm {} without security context", agent_id, swarm.id());
            return false;
        };

        let now = Utc::now();
        let token_check = if context.policy.authentication_required {
            context.check_token(agent_id, token, now)
        } else {
            Ok(())
        };

        let (allowed, reason) = match token_check {
            Err(reason) => (false, reason.to_string()),
            Ok(()) => match context.access.evaluate(agent_id, action) {
                PolicyEffect::Allow => (true, "allowed by policy".to_string()),
                PolicyEffect::Deny => (false, "denied by policy".to_string()),
            },
        };

        debug!(
            "Authorization {} for {} to {} in swarm {}: {}",
            if allowed { "granted" } else { "denied" },
            agent_id,
            action,
            swarm.id(),
            reason
        );
        context.log(
            AccessLogEntry {
                timestamp: now,
                agent_id: agent_id.to_string(),
                action: action.to_string(),
                allowed,
                reason,
            },
            self.config.max_access_log,
        );
        allowed
    }

    /// Drop an agent's token; returns whether one existed
    pub async fn revoke_token(&self, swarm: &Swarm, agent_id: &str) -> bool {
        let mut guard = swarm.security().write().await;
        let revoked = guard
            .as_mut()
            .is_some_and(|c| c.tokens.remove(agent_id).is_some());
        if revoked {
            info!("Revoked token of agent {} in swarm {}", agent_id, swarm.id());
        }
        revoked
    }

    /// Remove expired tokens, returning how many were dropped
    pub async fn purge_expired_tokens(&self, swarm: &Swarm) -> usize {
        let mut guard = swarm.security().write().await;
        let Some(context) = guard.as_mut() else {
            return 0;
        };
        let now = Utc::now();
        let before = context.tokens.len();
        context.tokens.retain(|_, t| !t.is_expired(now));
        before - context.tokens.len()
    }

    pub async fn access_log(&self, swarm: &Swarm) -> Vec<AccessLogEntry> {
        swarm
            .security()
            .read()
            .await
            .as_ref()
            .map(|c| c.access_log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Encrypt when the swarm requires it, otherwise wrap as plaintext
    pub async fn seal(&self, swarm: &Swarm, message: &[u8], key: &SharedKey) -> SwarmResult<MessageEnvelope> {
        self.seal_with_metadata(swarm, message, BTreeMap::new(), key)
            .await
    }

    /// Like [`seal`](Self::seal), binding `metadata` to the ciphertext when encrypting
    pub async fn seal_with_metadata(
        &self,
        swarm: &Swarm,
        message: &[u8],
        metadata: BTreeMap<String, String>,
        key: &SharedKey,
    ) -> SwarmResult<MessageEnvelope> {
        if self.encryption_required(swarm).await {
            encrypt_with_metadata(message, metadata, key).map_err(|e| e.in_swarm(swarm.id()))
        } else {
            let mut envelope = MessageEnvelope::plaintext(message);
            envelope.metadata = metadata;
            Ok(envelope)
        }
    }

    /// Recover the message bytes of an envelope
    pub async fn open(&self, swarm: &Swarm, envelope: &MessageEnvelope, key: &SharedKey) -> SwarmResult<Vec<u8>> {
        if envelope.encrypted {
            return decrypt_message(envelope, key);
        }
        self.check_envelope(swarm, envelope).await?;
        Ok(envelope.payload.clone())
    }

    /// Refuse plaintext envelopes in swarms that require encryption
    pub async fn check_envelope(&self, swarm: &Swarm, envelope: &MessageEnvelope) -> SwarmResult<()> {
        if !envelope.encrypted && self.encryption_required(swarm).await {
            return Err(SwarmError::EncryptionRequired(swarm.id().to_string()));
        }
        Ok(())
    }

    async fn encryption_required(&self, swarm: &Swarm) -> bool {
        swarm
            .security()
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.policy.encryption_required)
    }
}

fn uninitialized(swarm: &Swarm, operation: &'static str) -> SwarmError {
    SwarmError::InvalidState {
        swarm_id: swarm.id().to_string(),
        status: "UNSECURED".to_string(),
        operation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_overrides_allow() {
        let policy = AccessPolicy::default()
            .with_rule(AccessRule::allow("trade.*"))
            .with_rule(AccessRule::deny("trade.withdraw").for_agents(["a2"]));

        assert_eq!(policy.evaluate("a1", "trade.withdraw"), PolicyEffect::Allow);
        assert_eq!(policy.evaluate("a2", "trade.withdraw"), PolicyEffect::Deny);
        assert_eq!(policy.evaluate("a2", "trade.quote"), PolicyEffect::Allow);
    }

    #[test]
    fn test_default_effect() {
        let policy = AccessPolicy::deny_by_default().with_rule(AccessRule::allow("read_state"));
        assert_eq!(policy.evaluate("a1", "read_state"), PolicyEffect::Allow);
        assert_eq!(policy.evaluate("a1", "write_state"), PolicyEffect::Deny);
        assert_eq!(
            AccessPolicy::default().with_rule(AccessRule::deny("*")).evaluate("a1", "x"),
            PolicyEffect::Deny
        );
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticCredentialVerifier::new();
        verifier.register("a1", b"hunter2").unwrap();
        assert!(verifier.verify("a1", &Credentials::new("hunter2")).await.unwrap());
        assert!(!verifier.verify("a1", &Credentials::new("hunter3")).await.unwrap());
        assert!(!verifier.verify("a9", &Credentials::new("hunter2")).await.unwrap());
        assert!(verifier.unregister("a1"));
    }

    #[tokio::test]
    async fn test_stored_hashes_are_salted() {
        let verifier = StaticCredentialVerifier::new();
        verifier.register("a1", b"same secret").unwrap();
        verifier.register("a2", b"same secret").unwrap();

        let a1 = verifier.hashes.get("a1").unwrap().clone();
        let a2 = verifier.hashes.get("a2").unwrap().clone();
        assert!(a1.starts_with("$argon2id$"));
        assert_ne!(a1, a2);
        assert!(!a1.contains("same secret"));
        assert!(verifier.verify("a2", &Credentials::new("same secret")).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_hash_is_a_fault() {
        let verifier = StaticCredentialVerifier::new();
        verifier.hashes.insert("a1".into(), "not-a-phc-string".into());
        assert!(verifier.verify("a1", &Credentials::new("x")).await.is_err());
    }

    #[test]
    fn test_tokens_are_unique_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
