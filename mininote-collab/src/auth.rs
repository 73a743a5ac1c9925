//! Credential verification and ownership checks.
//!
//! One [`AuthorizationGuard`] serves both the realtime protocol and
//! [`NoteService`](crate::notes::NoteService), so token parsing lives in
//! exactly one place.
//!
//! Tokens are HS256 JWTs carrying the principal in an `id` claim:
//! ```text
//! base64url(header) . base64url(claims) . base64url(hmac_sha256(secret, header.claims))
//! ```

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{ConfigError, SyncError};
use crate::model::{Document, PrincipalId};
use crate::store::DocumentStore;

type HmacSha256 = Hmac<Sha256>;

const BEARER_PREFIX: &str = "Bearer ";

/// Default tolerance for clock skew on `exp`.
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    id: String,
    #[serde(default)]
    exp: Option<i64>,
}

fn invalid(reason: impl Into<String>) -> SyncError {
    SyncError::InvalidCredential(reason.into())
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T, SyncError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| invalid(format!("{what} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| invalid(format!("{what} is not valid JSON: {e}")))
}

/// HS256 token verifier.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
    leeway_secs: u64,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl TokenVerifier {
    /// An empty secret is refused: anyone could sign tokens with it.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        Ok(Self {
            secret: secret.to_vec(),
            leeway_secs: DEFAULT_LEEWAY_SECS,
        })
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Verify `token` and return the principal it names.
    ///
    /// Accepts an optional `Bearer ` prefix. Every failure is
    /// [`SyncError::InvalidCredential`].
    pub fn verify(&self, token: &str) -> Result<PrincipalId, SyncError> {
        let token = token.trim();
        let token = token.strip_prefix(BEARER_PREFIX).unwrap_or(token);

        let mut segments = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid("token must have three segments"));
        };

        let header: Header = decode_segment(header_b64, "header")?;
        if header.alg != "HS256" {
            return Err(invalid(format!("unsupported algorithm {}", header.alg)));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| invalid("signature is not base64url"))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| invalid(format!("unusable secret: {e}")))?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("signature mismatch"))?;

        let claims: Claims = decode_segment(claims_b64, "claims")?;
        if let Some(exp) = claims.exp {
            let now = chrono::Utc::now().timestamp();
            if now > exp.saturating_add(self.leeway_secs as i64) {
                return Err(invalid("token expired"));
            }
        }

        Uuid::parse_str(&claims.id).map_err(|_| invalid("id claim is not a principal id"))
    }
}

/// What a caller wants to do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRight {
    Read,
    Write,
    Delete,
}

impl fmt::Display for AccessRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        })
    }
}

/// Authenticates credentials and enforces owner-only document access.
pub struct AuthorizationGuard {
    verifier: TokenVerifier,
    store: Arc<dyn DocumentStore>,
}

impl AuthorizationGuard {
    pub fn new(verifier: TokenVerifier, store: Arc<dyn DocumentStore>) -> Self {
        Self { verifier, store }
    }

    /// Resolve a credential token to a principal.
    pub fn authenticate(&self, token: &str) -> Result<PrincipalId, SyncError> {
        self.verifier.verify(token)
    }

    /// Check that `principal` may exercise `right` on `document_id`.
    ///
    /// Ownership is the only right model, so all three rights reduce to the
    /// same check. Returns the document so callers need not fetch it again.
    pub async fn authorize_document_access(
        &self,
        principal: PrincipalId,
        document_id: Uuid,
        right: AccessRight,
    ) -> Result<Document, SyncError> {
        let document = self
            .store
            .find_document(document_id)
            .await?
            .ok_or(SyncError::NotFound(document_id))?;

        if document.owner != principal {
            log::debug!("Denied {right} on {document_id} to {principal}");
            return Err(SyncError::Forbidden(document_id));
        }
        Ok(document)
    }
}
