//! HashiCorp Vault backend.
//!
//! Each trust domain maps to a Vault namespace. Credentials are obtained by
//! AppRole login inside that namespace, so a token only ever sees its own
//! domain. Secrets live in the KV v2 engine as a small map:
//!
//! - `value`: the secret bytes, base64 encoded
//! - `key_ref`: the key the secret is encrypted with
//! - `tags`: JSON object of string tags
//!
//! Key policies are stored as canonical JSON under `policy_prefix/<key_ref>`
//! in the same KV mount.
//!
//! # Security
//!
//! - Tokens and values are never logged
//! - AppRole secret ids are read from the environment at exchange time

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

use super::client::{
    IssuedCredential, KeyManagement, NewSecret, ScopedCredential, SecretDescription,
    SecretPayload, SecretStore, TrustExchange,
};
use super::types::SecretValue;
use crate::domain::{DomainId, KeyRef, PolicyDocument, SecretPath, SecretVersion};
use crate::errors::{CrossvaultError, Result as CrossvaultResult};
use crate::replication::error::{ReplicationError, Result};

/// Vault backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBackendConfig {
    /// Vault server address (e.g., "https://vault.example.com:8200")
    pub address: String,

    /// KV v2 mount path (default: "secret")
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// AppRole auth mount (default: "approle")
    #[serde(default = "default_approle_mount")]
    pub approle_mount: String,

    /// KV prefix under which key policies are stored
    #[serde(default = "default_policy_prefix")]
    pub policy_prefix: String,

    /// Per-domain namespace and AppRole settings
    #[serde(default)]
    pub domains: BTreeMap<DomainId, VaultDomainConfig>,
}

/// How to reach and authenticate against one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultDomainConfig {
    /// Vault Enterprise namespace for the domain
    #[serde(default)]
    pub namespace: Option<String>,

    /// AppRole role id
    pub role_id: String,

    /// Environment variable holding the AppRole secret id
    pub secret_id_env: String,
}

fn default_mount_path() -> String {
    "secret".to_string()
}

fn default_approle_mount() -> String {
    "approle".to_string()
}

fn default_policy_prefix() -> String {
    "crossvault/key-policies".to_string()
}

impl Default for VaultBackendConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            mount_path: default_mount_path(),
            approle_mount: default_approle_mount(),
            policy_prefix: default_policy_prefix(),
            domains: BTreeMap::new(),
        }
    }
}

/// Vault-backed secret store, key service and trust exchange.
pub struct VaultCloud {
    config: VaultBackendConfig,
}

impl VaultCloud {
    /// Creates the backend and checks that Vault is reachable.
    ///
    /// # Errors
    ///
    /// - [`CrossvaultError::Config`] if the address is empty
    /// - [`CrossvaultError::Backend`] if the health check fails
    pub async fn new(config: VaultBackendConfig) -> CrossvaultResult<Self> {
        if config.address.is_empty() {
            return Err(CrossvaultError::config("Vault address cannot be empty"));
        }

        let backend = Self { config };
        let client = backend.client(None, None).map_err(|e| {
            CrossvaultError::backend(format!("Failed to create Vault client: {}", e))
        })?;

        match vaultrs::sys::health(&client).await {
            Ok(_) => {
                tracing::info!(
                    address = %backend.config.address,
                    "Successfully connected to Vault"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    address = %backend.config.address,
                    "Failed to connect to Vault"
                );
                return Err(CrossvaultError::backend(format!("Vault health check failed: {}", e)));
            }
        }

        Ok(backend)
    }

    fn domain_config(&self, domain: &DomainId) -> Option<&VaultDomainConfig> {
        self.config.domains.get(domain)
    }

    fn client(
        &self,
        domain: Option<&DomainId>,
        token: Option<&SecretValue>,
    ) -> Result<VaultClient> {
        let mut settings_builder = VaultClientSettingsBuilder::default();
        settings_builder.address(&self.config.address);

        if let Some(token) = token {
            settings_builder.token(String::from_utf8_lossy(token.expose_bytes()).into_owned());
        }

        let domain_config = domain.and_then(|d| self.domain_config(d));
        if let Some(namespace) = domain_config.and_then(|c| c.namespace.clone()) {
            settings_builder.namespace(Some(namespace));
        }

        let settings = settings_builder.build().map_err(|e| {
            ReplicationError::access_denied("vault", format!("invalid client settings: {}", e))
        })?;

        VaultClient::new(settings).map_err(|e| {
            ReplicationError::throttled(format!("failed to create Vault client: {}", e))
        })
    }

    fn credential_client(&self, credential: &ScopedCredential) -> Result<VaultClient> {
        self.client(Some(&credential.domain), Some(&credential.token))
    }

    fn policy_path(&self, key_ref: &KeyRef) -> String {
        format!("{}/{}", self.config.policy_prefix.trim_end_matches('/'), kv_path(key_ref.as_str()))
    }

    async fn read_current(
        &self,
        client: &VaultClient,
        domain: &DomainId,
        path: &SecretPath,
    ) -> Result<(u64, KvEntry)> {
        let resource = format!("{}:{}", domain, path);
        let key = kv_path(path.as_str());

        let metadata = kv2::read_metadata(client, &self.config.mount_path, key)
            .await
            .map_err(|e| map_client_error(e, &resource, false))?;

        // Pin the version so value and metadata describe the same write.
        let data: HashMap<String, String> =
            kv2::read_version(client, &self.config.mount_path, key, metadata.current_version)
                .await
                .map_err(|e| map_client_error(e, &resource, false))?;

        Ok((metadata.current_version, KvEntry::from_map(&resource, data)?))
    }

    async fn write_entry(
        &self,
        client: &VaultClient,
        domain: &DomainId,
        path: &SecretPath,
        entry: &KvEntry,
    ) -> Result<SecretVersion> {
        let resource = format!("{}:{}", domain, path);
        let data = entry.to_map(&resource)?;

        let written = kv2::set(client, &self.config.mount_path, kv_path(path.as_str()), &data)
            .await
            .map_err(|e| map_client_error(e, &resource, true))?;

        tracing::info!(
            domain = %domain,
            path = %path,
            version = written.version,
            "Stored secret version in Vault"
        );
        Ok(SecretVersion::new(written.version.to_string()))
    }
}

/// KV v2 paths are relative to the mount.
fn kv_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Decoded form of the KV data map for one secret version.
#[derive(Debug, Clone)]
struct KvEntry {
    value: SecretValue,
    key_ref: KeyRef,
    tags: BTreeMap<String, String>,
}

impl KvEntry {
    fn from_map(resource: &str, mut data: HashMap<String, String>) -> Result<Self> {
        let malformed = |what: &str| {
            ReplicationError::access_denied(
                resource,
                format!("stored secret is malformed: {}", what),
            )
        };

        let encoded = data.remove("value").ok_or_else(|| malformed("missing 'value'"))?;
        let value =
            SecretValue::from_base64(&encoded).map_err(|_| malformed("'value' is not base64"))?;
        let key_ref =
            data.remove("key_ref").map(KeyRef::from).ok_or_else(|| malformed("missing 'key_ref'"))?;
        let tags = match data.remove("tags") {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|_| malformed("'tags' is not a JSON object"))?
            }
            None => BTreeMap::new(),
        };

        Ok(Self { value, key_ref, tags })
    }

    fn to_map(&self, resource: &str) -> Result<HashMap<String, String>> {
        let tags = serde_json::to_string(&self.tags)
            .map_err(|e| ReplicationError::write_error(resource, e.to_string(), false))?;

        let mut data = HashMap::new();
        data.insert("value".to_string(), self.value.to_base64());
        data.insert("key_ref".to_string(), self.key_ref.to_string());
        data.insert("tags".to_string(), tags);
        Ok(data)
    }
}

/// Maps Vault client errors onto the replication taxonomy.
///
/// Transport failures and server errors on reads are reported as `Throttled`
/// so they follow the backoff path; on writes they become transient
/// `WriteError`s.
fn map_client_error(error: ClientError, resource: &str, write: bool) -> ReplicationError {
    match &error {
        ClientError::APIError { code: 404, .. } => ReplicationError::not_found(resource),
        ClientError::APIError { code: 401 | 403, .. } => {
            ReplicationError::access_denied(resource, error.to_string())
        }
        ClientError::APIError { code: 429, .. } => ReplicationError::throttled(error.to_string()),
        ClientError::APIError { code: 400 | 412, .. } if write => {
            ReplicationError::write_error(resource, error.to_string(), false)
        }
        _ if write => ReplicationError::write_error(resource, error.to_string(), true),
        _ => ReplicationError::throttled(format!("Vault request failed: {}", error)),
    }
}

fn map_login_error(error: ClientError, domain: &DomainId) -> ReplicationError {
    match &error {
        ClientError::APIError { code: 400 | 401 | 403, .. } => {
            ReplicationError::trust_denied(domain.as_str(), error.to_string(), true)
        }
        ClientError::APIError { code: 429, .. } => ReplicationError::throttled(error.to_string()),
        _ => ReplicationError::trust_denied(domain.as_str(), error.to_string(), false),
    }
}

#[async_trait]
impl TrustExchange for VaultCloud {
    async fn assume_identity(
        &self,
        domain: &DomainId,
        role: &str,
        session_tag: &str,
    ) -> Result<IssuedCredential> {
        let domain_config = self.domain_config(domain).ok_or_else(|| {
            ReplicationError::trust_denied(
                domain.as_str(),
                "no Vault AppRole configured for domain",
                true,
            )
        })?;

        let secret_id = std::env::var(&domain_config.secret_id_env).map_err(|_| {
            ReplicationError::trust_denied(
                domain.as_str(),
                format!("environment variable {} is not set", domain_config.secret_id_env),
                true,
            )
        })?;

        let client = self.client(Some(domain), None)?;
        let auth = vaultrs::auth::approle::login(
            &client,
            &self.config.approle_mount,
            &domain_config.role_id,
            &secret_id,
        )
        .await
        .map_err(|e| {
            tracing::warn!(domain = %domain, role = %role, error = %e, "AppRole login failed");
            map_login_error(e, domain)
        })?;

        tracing::debug!(
            domain = %domain,
            role = %role,
            session_tag = %session_tag,
            lease_seconds = auth.lease_duration,
            "Obtained Vault token"
        );

        Ok(IssuedCredential {
            token: SecretValue::from(auth.client_token),
            lease: Duration::from_secs(auth.lease_duration),
        })
    }
}

#[async_trait]
impl SecretStore for VaultCloud {
    async fn describe_secret(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretDescription> {
        let client = self.credential_client(credential)?;
        let (version, entry) = self.read_current(&client, &credential.domain, path).await?;

        Ok(SecretDescription {
            path: path.clone(),
            version: SecretVersion::new(version.to_string()),
            key_ref: entry.key_ref,
            tags: entry.tags,
        })
    }

    async fn get_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
    ) -> Result<SecretPayload> {
        let client = self.credential_client(credential)?;
        let (version, entry) = self.read_current(&client, &credential.domain, path).await?;

        Ok(SecretPayload { version: SecretVersion::new(version.to_string()), value: entry.value })
    }

    async fn create_secret(
        &self,
        credential: &ScopedCredential,
        secret: NewSecret,
    ) -> Result<SecretVersion> {
        let client = self.credential_client(credential)?;
        let entry = KvEntry { value: secret.value, key_ref: secret.key_ref, tags: secret.tags };
        self.write_entry(&client, &credential.domain, &secret.path, &entry).await
    }

    async fn put_secret_value(
        &self,
        credential: &ScopedCredential,
        path: &SecretPath,
        value: &SecretValue,
    ) -> Result<SecretVersion> {
        let client = self.credential_client(credential)?;
        let (_, mut entry) = self.read_current(&client, &credential.domain, path).await?;
        entry.value = value.clone();
        self.write_entry(&client, &credential.domain, path, &entry).await
    }
}

#[async_trait]
impl KeyManagement for VaultCloud {
    async fn get_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
    ) -> Result<PolicyDocument> {
        let client = self.credential_client(credential)?;
        let resource = format!("key {}:{}", credential.domain, key_ref);

        let data: HashMap<String, String> =
            kv2::read(&client, &self.config.mount_path, &self.policy_path(key_ref))
                .await
                .map_err(|e| map_client_error(e, &resource, false))?;

        let raw = data.get("document").ok_or_else(|| {
            ReplicationError::access_denied(&resource, "stored policy has no 'document' field")
        })?;

        serde_json::from_str(raw).map_err(|e| {
            ReplicationError::access_denied(
                &resource,
                format!("stored policy is not valid JSON: {}", e),
            )
        })
    }

    async fn put_key_policy(
        &self,
        credential: &ScopedCredential,
        key_ref: &KeyRef,
        document: &PolicyDocument,
    ) -> Result<()> {
        let client = self.credential_client(credential)?;
        let resource = format!("key {}:{}", credential.domain, key_ref);

        let json = document
            .to_canonical_json()
            .map_err(|e| ReplicationError::write_error(&resource, e.to_string(), false))?;
        let mut data = HashMap::new();
        data.insert("document".to_string(), String::from_utf8_lossy(&json).into_owned());

        kv2::set(&client, &self.config.mount_path, &self.policy_path(key_ref), &data)
            .await
            .map_err(|e| map_client_error(e, &resource, true))?;

        tracing::info!(domain = %credential.domain, key = %key_ref, "Stored key policy in Vault");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> ClientError {
        ClientError::APIError { code, errors: vec![] }
    }

    #[test]
    fn test_vault_config_defaults_from_yaml() {
        let yaml = r#"
address: https://vault.example.com:8200
domains:
  src:
    namespace: team-src
    role_id: "1234"
    secret_id_env: SRC_SECRET_ID
"#;
        let config: VaultBackendConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mount_path, "secret");
        assert_eq!(config.approle_mount, "approle");
        assert_eq!(config.policy_prefix, "crossvault/key-policies");
        assert_eq!(config.domains[&DomainId::new("src")].namespace.as_deref(), Some("team-src"));
    }

    #[test]
    fn test_kv_path_strips_leading_slash() {
        assert_eq!(kv_path("/vault/creds"), "vault/creds");
        assert_eq!(kv_path("plain"), "plain");
    }

    #[test]
    fn test_kv_entry_round_trip() {
        let mut tags = BTreeMap::new();
        tags.insert("team".to_string(), "payments".to_string());
        let entry = KvEntry {
            value: SecretValue::new(vec![1, 2, 3]),
            key_ref: KeyRef::new("alias/replica"),
            tags,
        };

        let map = entry.to_map("dest:/replica").unwrap();
        assert_ne!(map["value"], "\u{1}\u{2}\u{3}");

        let parsed = KvEntry::from_map("dest:/replica", map).unwrap();
        assert_eq!(parsed.value, entry.value);
        assert_eq!(parsed.key_ref, entry.key_ref);
        assert_eq!(parsed.tags, entry.tags);
    }

    #[test]
    fn test_kv_entry_rejects_missing_value() {
        let err = KvEntry::from_map("dest:/replica", HashMap::new()).unwrap_err();
        assert!(matches!(err, ReplicationError::AccessDenied { .. }));
    }

    #[test]
    fn test_client_error_mapping() {
        assert!(matches!(
            map_client_error(api_error(404), "r", false),
            ReplicationError::NotFound { .. }
        ));
        assert!(matches!(
            map_client_error(api_error(403), "r", true),
            ReplicationError::AccessDenied { .. }
        ));
        assert!(matches!(
            map_client_error(api_error(429), "r", false),
            ReplicationError::Throttled { .. }
        ));
        assert!(matches!(
            map_client_error(api_error(503), "r", true),
            ReplicationError::WriteError { transient: true, .. }
        ));
        assert!(matches!(
            map_client_error(api_error(503), "r", false),
            ReplicationError::Throttled { .. }
        ));
    }

    #[test]
    fn test_login_error_mapping() {
        let domain = DomainId::new("src");
        assert!(matches!(
            map_login_error(api_error(400), &domain),
            ReplicationError::TrustDenied { permanent: true, .. }
        ));
        assert!(matches!(
            map_login_error(api_error(500), &domain),
            ReplicationError::TrustDenied { permanent: false, .. }
        ));
    }
}
