use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::{
    abi::{encode, Token},
    signers::{LocalWallet, Signer},
    types::{Bytes, U256},
};
use invoice_common::crypto::{seal_for_don, secret_fingerprint, sha256};
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::OracleError;

/// On-chain pointer to secrets staged with the DON gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsReference {
    pub slot_id: u8,
    pub version: u64,
    pub expires_at: u64,
}

impl SecretsReference {
    /// ABI encoding carried in the request payload: (uint8 slotId, uint64 version)
    pub fn encode(&self) -> Bytes {
        encode(&[
            Token::Uint(U256::from(self.slot_id)),
            Token::Uint(U256::from(self.version)),
        ]).into()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn ensure_fresh(&self, now: u64) -> Result<(), OracleError> {
        if self.is_expired(now) {
            return Err(OracleError::SecretsExpired { expired_at: self.expires_at });
        }
        Ok(())
    }
}

/// Encrypted bundle as sent to a staging gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedUpload {
    pub slot_id: u8,
    pub version: u64,
    pub expires_at: u64,
    /// Hex-encoded sealed envelope
    pub payload: String,
}

#[async_trait]
pub trait SecretsGateway: Send + Sync {
    async fn upload(&self, upload: &EncryptedUpload) -> anyhow::Result<()>;
}

/// Result of staging: the reference plus fingerprints of the raw values.
/// The values themselves never leave the staging process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedSecrets {
    reference: SecretsReference,
    fingerprints: Vec<[u8; 32]>,
}

impl StagedSecrets {
    pub fn reference(&self) -> SecretsReference {
        self.reference
    }

    /// Whether `candidate` is exactly one of the staged secret values
    pub fn matches_secret(&self, candidate: &str) -> bool {
        let fp = secret_fingerprint(candidate);
        self.fingerprints.iter().any(|f| *f == fp)
    }
}

/// Encrypts credentials for the DON and stages them with a short lifetime
pub struct SecretsVault<G> {
    gateway: G,
    don_key: PublicKey,
    ttl_secs: u64,
    slot_id: u8,
}

impl<G: SecretsGateway> SecretsVault<G> {
    pub fn new(gateway: G, don_key: PublicKey, ttl_secs: u64, slot_id: u8) -> Self {
        Self { gateway, don_key, ttl_secs, slot_id }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub async fn stage(
        &self,
        secrets: &BTreeMap<String, String>,
        now: u64,
    ) -> Result<StagedSecrets, OracleError> {
        if secrets.is_empty() {
            return Err(OracleError::InvalidRequestConfig("no secrets to stage".to_string()));
        }
        if let Some((name, _)) = secrets.iter().find(|(_, v)| v.is_empty()) {
            return Err(OracleError::InvalidRequestConfig(format!("secret {} is empty", name)));
        }

        let plaintext = Zeroizing::new(serde_json::to_vec(secrets)?);
        let envelope = seal_for_don(&plaintext, &self.don_key)
            .map_err(|e| OracleError::Chain(anyhow!("sealing secrets: {}", e)))?;

        let reference = SecretsReference {
            slot_id: self.slot_id,
            version: now,
            expires_at: now.saturating_add(self.ttl_secs),
        };

        let upload = EncryptedUpload {
            slot_id: reference.slot_id,
            version: reference.version,
            expires_at: reference.expires_at,
            payload: hex::encode(&envelope),
        };
        self.gateway.upload(&upload).await?;

        info!(
            "Staged {} secrets in slot {} version {} (expires {})",
            secrets.len(), reference.slot_id, reference.version, reference.expires_at
        );

        Ok(StagedSecrets {
            reference,
            fingerprints: secrets.values().map(|v| secret_fingerprint(v)).collect(),
        })
    }
}

/// Posts signed uploads to every configured gateway
pub struct HttpGateway {
    client: reqwest::Client,
    urls: Vec<String>,
    wallet: LocalWallet,
}

#[derive(Serialize)]
struct SignedUpload<'a> {
    #[serde(flatten)]
    upload: &'a EncryptedUpload,
    signer: String,
    signature: String,
}

impl HttpGateway {
    pub fn new(urls: Vec<String>, wallet: LocalWallet) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
            wallet,
        }
    }
}

#[async_trait]
impl SecretsGateway for HttpGateway {
    async fn upload(&self, upload: &EncryptedUpload) -> anyhow::Result<()> {
        let digest = sha256(&serde_json::to_vec(upload)?);
        let signature = self.wallet
            .sign_message(digest.as_bytes())
            .await
            .context("signing secrets upload")?;

        let body = SignedUpload {
            upload,
            signer: format!("{:?}", self.wallet.address()),
            signature: format!("0x{}", signature),
        };

        let mut accepted = 0;
        for url in &self.urls {
            match self.client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => accepted += 1,
                Ok(resp) => warn!("Gateway {} refused secrets upload: {}", url, resp.status()),
                Err(e) => warn!("Gateway {} unreachable: {}", url, e),
            }
        }

        if accepted == 0 {
            return Err(anyhow!("no gateway accepted the secrets upload"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let reference = SecretsReference { slot_id: 0, version: 100, expires_at: 200 };

        assert!(reference.ensure_fresh(199).is_ok());
        assert!(matches!(
            reference.ensure_fresh(200),
            Err(OracleError::SecretsExpired { expired_at: 200 })
        ));
    }

    #[test]
    fn test_reference_encodes_two_words() {
        let reference = SecretsReference { slot_id: 1, version: 1_700_000_000, expires_at: 1_700_003_600 };
        assert_eq!(reference.encode().len(), 64);
    }
}
