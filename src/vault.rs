// =============================================================================
// CredentialVault — AES-256-GCM encrypted exchange credentials
// =============================================================================
//
// Secret fields (api_key, api_secret, passphrase) are serialised to JSON and
// sealed with the process-wide master key; storage format is
// base64(nonce[12] || ciphertext || tag[16]) in the exchange_credentials
// table. The testnet flag and updated_at are plaintext columns.
//
// Plaintext leaves this module on exactly one path: `get_plaintext`, called
// by the execution coordinator. Everything else sees the masked view (first
// 4 + "***" + last 4 of the api_key).
//
// Master-key rotation is a known operational boundary: old records stop
// decrypting. The masked path then reports configured=true with a null
// masked key; the plaintext path raises `auth`, never `fatal`.
// =============================================================================

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MASTER_KEY_LEN;
use crate::error::{EngineError, EngineResult};
use crate::store::Db;
use crate::types::Exchange;
use crate::venues::VenueCredentials;

const NONCE_LEN: usize = 12;
/// Keys shorter than this cannot be masked without leaking most of them.
const MIN_MASKABLE_KEY_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Operator-supplied credential payload.
#[derive(Clone, Deserialize)]
pub struct CredentialInput {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl std::fmt::Debug for CredentialInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialInput")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("testnet", &self.testnet)
            .finish()
    }
}

/// The sealed portion of a credential record.
#[derive(Serialize, Deserialize)]
struct SecretFields {
    api_key: String,
    api_secret: String,
    passphrase: Option<String>,
}

/// Masked credential status, safe for logs and API responses.
#[derive(Debug, Clone, Serialize)]
pub struct MaskedCredential {
    pub exchange: Exchange,
    pub configured: bool,
    /// None when unconfigured, undecryptable, or too short to mask safely.
    pub api_key_masked: Option<String>,
    pub testnet: Option<bool>,
    pub updated_at: Option<String>,
}

impl MaskedCredential {
    fn unconfigured(exchange: Exchange) -> Self {
        Self {
            exchange,
            configured: false,
            api_key_masked: None,
            testnet: None,
            updated_at: None,
        }
    }
}

/// First 4 + "***" + last 4; None when the key is too short to mask.
fn mask_api_key(api_key: &str) -> Option<String> {
    if api_key.len() < MIN_MASKABLE_KEY_LEN {
        return None;
    }
    let head: String = api_key.chars().take(4).collect();
    let tail: String = api_key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(format!("{head}***{tail}"))
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

fn encrypt_blob(key: &[u8; MASTER_KEY_LEN], plaintext: &[u8]) -> EngineResult<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EngineError::internal("credential encryption failed"))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

fn decrypt_blob(key: &[u8; MASTER_KEY_LEN], encoded: &str) -> EngineResult<Vec<u8>> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| EngineError::auth("stored credential blob is not valid base64"))?;
    if blob.len() < NONCE_LEN + 16 {
        return Err(EngineError::auth("stored credential blob is truncated"));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &blob[NONCE_LEN..])
        .map_err(|_| EngineError::auth("credential decryption failed (rotated master key?)"))
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct CredentialVault {
    db: Db,
    master_key: Option<[u8; MASTER_KEY_LEN]>,
}

impl CredentialVault {
    pub fn new(db: Db, master_key: Option<[u8; MASTER_KEY_LEN]>) -> Self {
        Self { db, master_key }
    }

    pub fn is_configured(&self) -> bool {
        self.master_key.is_some()
    }

    fn require_key(&self) -> EngineResult<&[u8; MASTER_KEY_LEN]> {
        self.master_key.as_ref().ok_or_else(|| {
            EngineError::auth("credential vault is not configured (FA_CREDENTIAL_ENCRYPTION_KEY)")
        })
    }

    /// Encrypt and persist a credential, returning the masked view.
    pub async fn put(
        &self,
        exchange: Exchange,
        input: CredentialInput,
    ) -> EngineResult<MaskedCredential> {
        let key = self.require_key()?;
        if input.api_key.trim().is_empty() || input.api_secret.trim().is_empty() {
            return Err(EngineError::validation("api_key and api_secret are required"));
        }

        let secrets = SecretFields {
            api_key: input.api_key.clone(),
            api_secret: input.api_secret,
            passphrase: input.passphrase,
        };
        let plaintext = serde_json::to_vec(&secrets)?;
        let ciphertext = encrypt_blob(key, &plaintext)?;
        let updated_at = Utc::now().to_rfc3339();

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO exchange_credentials (exchange, ciphertext, testnet, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(exchange) DO UPDATE SET
                 ciphertext = excluded.ciphertext,
                 testnet = excluded.testnet,
                 updated_at = excluded.updated_at",
            params![
                exchange.as_str(),
                ciphertext,
                input.testnet as i64,
                updated_at
            ],
        )?;
        debug!(%exchange, "credential stored");

        Ok(MaskedCredential {
            exchange,
            configured: true,
            api_key_masked: mask_api_key(&input.api_key),
            testnet: Some(input.testnet),
            updated_at: Some(updated_at),
        })
    }

    /// Masked view for one exchange; `configured=false` when absent.
    pub async fn get_masked(&self, exchange: Exchange) -> EngineResult<MaskedCredential> {
        let row = self.load_row(exchange).await?;
        let Some((ciphertext, testnet, updated_at)) = row else {
            return Ok(MaskedCredential::unconfigured(exchange));
        };

        let api_key_masked = self
            .master_key
            .as_ref()
            .and_then(|key| decrypt_blob(key, &ciphertext).ok())
            .and_then(|plain| serde_json::from_slice::<SecretFields>(&plain).ok())
            .and_then(|secrets| mask_api_key(&secrets.api_key));
        if api_key_masked.is_none() {
            warn!(%exchange, "stored credential is present but not decryptable");
        }

        Ok(MaskedCredential {
            exchange,
            configured: true,
            api_key_masked,
            testnet: Some(testnet),
            updated_at: Some(updated_at),
        })
    }

    /// Masked statuses for every venue, configured or not.
    pub async fn list_masked(&self) -> EngineResult<Vec<MaskedCredential>> {
        let mut out = Vec::with_capacity(Exchange::ALL.len());
        for exchange in Exchange::ALL {
            out.push(self.get_masked(exchange).await?);
        }
        Ok(out)
    }

    /// Plaintext pull path — the execution coordinator only.
    pub async fn get_plaintext(&self, exchange: Exchange) -> EngineResult<Option<VenueCredentials>> {
        let Some((ciphertext, testnet, _)) = self.load_row(exchange).await? else {
            return Ok(None);
        };
        let key = self.require_key()?;
        let plain = decrypt_blob(key, &ciphertext)?;
        let secrets: SecretFields = serde_json::from_slice(&plain)
            .map_err(|_| EngineError::auth("stored credential payload is malformed"))?;

        Ok(Some(VenueCredentials {
            api_key: secrets.api_key,
            api_secret: secrets.api_secret,
            passphrase: secrets.passphrase,
            testnet,
        }))
    }

    pub async fn delete(&self, exchange: Exchange) -> EngineResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM exchange_credentials WHERE exchange = ?1",
            params![exchange.as_str()],
        )?;
        if deleted > 0 {
            debug!(%exchange, "credential deleted");
        }
        Ok(deleted > 0)
    }

    async fn load_row(
        &self,
        exchange: Exchange,
    ) -> EngineResult<Option<(String, bool, String)>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT ciphertext, testnet, updated_at FROM exchange_credentials
                 WHERE exchange = ?1",
                params![exchange.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(EngineError::from(other)),
            })?;
        Ok(row)
    }

    /// Whether any credential rows exist (startup configuration check).
    pub async fn has_stored_credentials(db: &Db) -> EngineResult<bool> {
        let conn = db.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM exchange_credentials", [], |row| {
                row.get(0)
            })?;
        Ok(count > 0)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("master_key", &self.master_key.map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    const KEY: [u8; MASTER_KEY_LEN] = [42u8; MASTER_KEY_LEN];

    fn input() -> CredentialInput {
        CredentialInput {
            api_key: "AKID1234FUNDARB5678TAIL".to_string(),
            api_secret: "very-secret-value".to_string(),
            passphrase: Some("hunter2-passphrase".to_string()),
            testnet: true,
        }
    }

    #[tokio::test]
    async fn put_then_masked_and_plaintext_roundtrip() {
        let vault = CredentialVault::new(open_in_memory(), Some(KEY));

        let masked = vault.put(Exchange::Okx, input()).await.unwrap();
        assert!(masked.configured);
        assert_eq!(masked.api_key_masked.as_deref(), Some("AKID***TAIL"));
        assert_eq!(masked.testnet, Some(true));

        let fetched = vault.get_masked(Exchange::Okx).await.unwrap();
        assert_eq!(fetched.api_key_masked, masked.api_key_masked);

        let plain = vault.get_plaintext(Exchange::Okx).await.unwrap().unwrap();
        assert_eq!(plain.api_key, "AKID1234FUNDARB5678TAIL");
        assert_eq!(plain.api_secret, "very-secret-value");
        assert_eq!(plain.passphrase.as_deref(), Some("hunter2-passphrase"));
        assert!(plain.testnet);
    }

    #[tokio::test]
    async fn mask_exposes_only_head_and_tail() {
        let masked = mask_api_key("AKID1234FUNDARB5678TAIL").unwrap();
        assert_eq!(masked, "AKID***TAIL");
        // No interior substring of the key survives.
        assert!(!masked.contains("1234"));
        assert!(!masked.contains("FUNDARB"));
        assert_eq!(mask_api_key("short"), None);
    }

    #[tokio::test]
    async fn rotated_master_key_degrades_gracefully() {
        let db = open_in_memory();
        let vault = CredentialVault::new(db.clone(), Some(KEY));
        vault.put(Exchange::Binance, input()).await.unwrap();

        // Same database, different key: records stop decrypting.
        let rotated = CredentialVault::new(db, Some([9u8; MASTER_KEY_LEN]));
        let masked = rotated.get_masked(Exchange::Binance).await.unwrap();
        assert!(masked.configured);
        assert!(masked.api_key_masked.is_none());

        let err = rotated
            .get_plaintext(Exchange::Binance)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn vault_without_key_rejects_put_but_reports_status() {
        let db = open_in_memory();
        let sealed = CredentialVault::new(db.clone(), Some(KEY));
        sealed.put(Exchange::Gate, input()).await.unwrap();

        let keyless = CredentialVault::new(db, None);
        assert!(!keyless.is_configured());

        let err = keyless.put(Exchange::Okx, input()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Auth);

        // Status still shows the row exists, just unreadable.
        let masked = keyless.get_masked(Exchange::Gate).await.unwrap();
        assert!(masked.configured);
        assert!(masked.api_key_masked.is_none());
    }

    #[tokio::test]
    async fn delete_and_unconfigured_listing() {
        let db = open_in_memory();
        let vault = CredentialVault::new(db.clone(), Some(KEY));
        vault.put(Exchange::Bybit, input()).await.unwrap();

        assert!(CredentialVault::has_stored_credentials(&db).await.unwrap());
        assert!(vault.delete(Exchange::Bybit).await.unwrap());
        assert!(!vault.delete(Exchange::Bybit).await.unwrap());
        assert!(!CredentialVault::has_stored_credentials(&db).await.unwrap());

        let listed = vault.list_masked().await.unwrap();
        assert_eq!(listed.len(), Exchange::ALL.len());
        assert!(listed.iter().all(|m| !m.configured));
    }

    #[tokio::test]
    async fn ciphertext_blob_is_opaque() {
        let encoded = encrypt_blob(&KEY, b"payload").unwrap();
        assert!(!encoded.contains("payload"));
        let decoded = decrypt_blob(&KEY, &encoded).unwrap();
        assert_eq!(decoded, b"payload");
        assert!(decrypt_blob(&[1u8; MASTER_KEY_LEN], &encoded).is_err());
        assert!(decrypt_blob(&KEY, "not-base64!!!").is_err());
    }
}
