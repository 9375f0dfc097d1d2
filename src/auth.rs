//! Auth material: encrypted storage and the single startup refresh.
//!
//! The OAuth handshake itself is out of scope; token material enters the
//! system either from a previous run (via the Store) or from a one-time
//! config seed. Sensitive fields are encrypted at rest with AES-256-GCM;
//! plaintext is permitted only for the embedded store when the database file
//! is readable by the service user alone.

use crate::store::{AuthRecord, Store, StoreError};
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Refresh when the token expires within this margin.
const EXPIRY_MARGIN_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no auth material stored; seed tokens via chat.initial_access_token")]
    Missing,

    #[error("auth material expired and no refresh token is available")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("token encryption failed: {0}")]
    Crypto(String),

    #[error("invalid token encryption key: {0}")]
    BadKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum CipherMode {
    Aead(LessSafeKey),
    Plaintext,
}

/// Symmetric cipher for token fields. `plaintext` mode is the permission-
/// checked embedded-store escape hatch.
pub struct TokenCipher {
    mode: CipherMode,
    rng: SystemRandom,
}

impl TokenCipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_key_b64(key_b64: &str) -> Result<Self, AuthError> {
        let key_bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(key_b64.trim())
                .map_err(|e| AuthError::BadKey(e.to_string()))?,
        );
        if key_bytes.len() != 32 {
            return Err(AuthError::BadKey(format!(
                "expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| AuthError::BadKey("key rejected".into()))?;
        Ok(Self {
            mode: CipherMode::Aead(LessSafeKey::new(unbound)),
            rng: SystemRandom::new(),
        })
    }

    pub fn plaintext() -> Self {
        Self {
            mode: CipherMode::Plaintext,
            rng: SystemRandom::new(),
        }
    }

    /// Encrypt to base64(nonce || ciphertext || tag).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, AuthError> {
        let key = match &self.mode {
            CipherMode::Aead(key) => key,
            CipherMode::Plaintext => return Ok(plaintext.to_string()),
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AuthError::Crypto("nonce generation failed".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| AuthError::Crypto("seal failed".into()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&buffer);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, AuthError> {
        let key = match &self.mode {
            CipherMode::Aead(key) => key,
            CipherMode::Plaintext => return Ok(blob.to_string()),
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|e| AuthError::Crypto(format!("bad ciphertext encoding: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(AuthError::Crypto("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| AuthError::Crypto("bad nonce".into()))?;

        let mut buffer = ciphertext.to_vec();
        let opened = key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| AuthError::Crypto("decryption failed (wrong key?)".into()))?;
        String::from_utf8(opened.to_vec())
            .map_err(|_| AuthError::Crypto("decrypted token is not utf-8".into()))
    }
}

/// Whether a plaintext token store is acceptable for this database file:
/// the file must exist with permissions restricted to the owning user.
#[cfg(unix)]
pub fn plaintext_permitted(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o077 == 0,
        // Not created yet; it will be created with the process umask.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn plaintext_permitted(_path: &std::path::Path) -> bool {
    false
}

/// Decrypted auth material.
#[derive(Debug, Clone)]
pub struct AuthMaterial {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at_ms: Option<i64>,
    pub bot_username: Option<String>,
}

impl AuthMaterial {
    fn is_expired(&self, now_ms: i64) -> bool {
        match self.expires_at_ms {
            Some(expires) => expires - EXPIRY_MARGIN_MS <= now_ms,
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Loads, seeds, refreshes, and persists auth material.
pub struct AuthManager {
    store: Arc<dyn Store>,
    cipher: TokenCipher,
    client_id: String,
    client_secret: String,
    token_url: String,
    http: reqwest::Client,
}

impl AuthManager {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: TokenCipher,
        client_id: String,
        client_secret: String,
        token_url: String,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| AuthError::Refresh(format!("http client init failed: {e}")))?;
        Ok(Self {
            store,
            cipher,
            client_id,
            client_secret,
            token_url,
            http,
        })
    }

    /// First-run seeding from configuration. A stored record always wins.
    pub async fn seed_if_configured(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        bot_username: Option<&str>,
    ) -> Result<(), AuthError> {
        let access_token = match access_token {
            Some(token) if !token.trim().is_empty() => token.trim(),
            _ => return Ok(()),
        };
        if self.store.load_auth().await?.is_some() {
            return Ok(());
        }
        let material = AuthMaterial {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(|t| t.trim().to_string()),
            expires_at_ms: None,
            bot_username: bot_username.map(str::to_string),
        };
        self.save(&material).await?;
        info!("Auth material seeded from configuration");
        Ok(())
    }

    /// Load and decrypt the stored material.
    pub async fn load(&self) -> Result<AuthMaterial, AuthError> {
        let record = self.store.load_auth().await?.ok_or(AuthError::Missing)?;
        Ok(AuthMaterial {
            access_token: self.cipher.decrypt(&record.access_token)?,
            refresh_token: record
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.decrypt(t))
                .transpose()?,
            expires_at_ms: record.expires_at_ms,
            bot_username: record.bot_username,
        })
    }

    /// Startup contract: load the material; if expired, refresh exactly once
    /// and persist. Any failure here is startup-fatal for the caller.
    pub async fn ensure_valid(&self) -> Result<AuthMaterial, AuthError> {
        let material = self.load().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        if !material.is_expired(now_ms) {
            return Ok(material);
        }

        info!("Access token expired; attempting one refresh");
        let refresh_token = material
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NoRefreshToken)?;
        let refreshed = self.refresh(refresh_token).await?;

        let material = AuthMaterial {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .or_else(|| material.refresh_token.clone()),
            expires_at_ms: refreshed
                .expires_in
                .map(|s| chrono::Utc::now().timestamp_millis() + s * 1000),
            bot_username: material.bot_username.clone(),
        };
        self.save(&material).await?;
        info!("Access token refreshed");
        Ok(material)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token refresh rejected");
            return Err(AuthError::Refresh(format!("{status}: {body}")));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Refresh(format!("bad token response: {e}")))
    }

    async fn save(&self, material: &AuthMaterial) -> Result<(), AuthError> {
        let record = AuthRecord {
            access_token: self.cipher.encrypt(&material.access_token)?,
            refresh_token: material
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            expires_at_ms: material.expires_at_ms,
            bot_username: material.bot_username.clone(),
        };
        self.store.store_auth(&record).await?;
        Ok(())
    }
}
