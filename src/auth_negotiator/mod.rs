//! AuthNegotiator - HTTP Basic/Digest credentials for camera requests
//!
//! ## Responsibilities
//!
//! - Parse `WWW-Authenticate` challenges from 401 replies
//! - Build the `Authorization` value for every outgoing request
//! - Keep realm/nonce/opaque/qop and the nonce counter between requests so a
//!   new request can be signed without waiting for another 401
//!
//! Once Digest is in force a later Basic challenge is refused: a real camera
//! does not switch schemes mid-session.

mod challenge;

pub use challenge::{parse_auth_params, select_qop, split_scheme};

use base64::Engine;
use md5::{Digest, Md5};
use rand::Rng;
use serde::Serialize;

/// Nonce counter wraps back to 1 above this value
pub const NONCE_COUNT_MAX: u32 = 99_999;

/// Selected authentication scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Server-issued challenge state plus the client nonce counter
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthContext {
    pub scheme: Option<AuthScheme>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub nonce_count: u32,
    /// Set once the current nonce signed a request
    #[serde(skip)]
    nonce_spent: bool,
}

/// Authentication failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No recognisable challenge; no header may be built
    #[error("authentication unavailable: {0}")]
    Unavailable(String),

    /// Basic offered after Digest was established
    #[error("refusing Basic challenge after Digest was established")]
    Downgrade,

    /// Nonce reuse disabled and the current nonce is spent
    #[error("digest nonce spent, a fresh challenge is required")]
    ChallengeRequired,
}

/// A computed `Authorization` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub value: String,
    /// Caller should re-issue the request that produced the challenge
    pub resend: bool,
}

/// Per-camera credential negotiator
#[derive(Debug, Clone)]
pub struct AuthNegotiator {
    username: String,
    password: String,
    reuse_nonce: bool,
    context: AuthContext,
}

impl AuthNegotiator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            reuse_nonce: true,
            context: AuthContext::default(),
        }
    }

    /// Allow a digest nonce to sign more than one request (default: true)
    pub fn with_nonce_reuse(mut self, reuse: bool) -> Self {
        self.reuse_nonce = reuse;
        self
    }

    pub fn context(&self) -> &AuthContext {
        &self.context
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    /// Forget every challenge parameter (credential change, reconnect)
    pub fn reset(&mut self) {
        self.context = AuthContext::default();
    }

    /// Compute the credential for `uri`.
    ///
    /// `challenge` is the raw `WWW-Authenticate` text from a 401, or `None`
    /// to sign a new request with the parameters already held.
    pub fn process_auth(
        &mut self,
        challenge: Option<&str>,
        method: &str,
        uri: &str,
        resend: bool,
    ) -> Result<Authorization, AuthError> {
        if let Some(header) = challenge {
            self.absorb_challenge(header)?;
        }

        let value = match self.context.scheme {
            Some(AuthScheme::Basic) => self.basic_header(),
            Some(AuthScheme::Digest) => {
                if challenge.is_none() && !self.reuse_nonce && self.context.nonce_spent {
                    return Err(AuthError::ChallengeRequired);
                }
                let value = self.digest_header(method, uri);
                self.context.nonce_spent = true;
                value
            }
            None => {
                return Err(AuthError::Unavailable(
                    "no challenge received yet".to_string(),
                ))
            }
        };

        Ok(Authorization { value, resend })
    }

    /// Header for a fresh request, or `None` when a 401 must be awaited first
    pub fn authorization_for(&mut self, method: &str, uri: &str) -> Option<String> {
        self.process_auth(None, method, uri, false)
            .ok()
            .map(|auth| auth.value)
    }

    fn absorb_challenge(&mut self, header: &str) -> Result<(), AuthError> {
        let (scheme, params) = split_scheme(header);

        if scheme.eq_ignore_ascii_case("basic") {
            if self.context.scheme == Some(AuthScheme::Digest) {
                tracing::warn!(
                    challenge = %header,
                    "Basic challenge after Digest was established, refusing downgrade"
                );
                return Err(AuthError::Downgrade);
            }
            let params = parse_auth_params(params);
            self.context.scheme = Some(AuthScheme::Basic);
            self.context.realm = params.get("realm").cloned();
            return Ok(());
        }

        if scheme.eq_ignore_ascii_case("digest") {
            let mut params = parse_auth_params(params);
            let realm = params
                .remove("realm")
                .ok_or_else(|| AuthError::Unavailable("digest challenge has no realm".to_string()))?;
            let nonce = params
                .remove("nonce")
                .ok_or_else(|| AuthError::Unavailable("digest challenge has no nonce".to_string()))?;

            self.context.scheme = Some(AuthScheme::Digest);
            self.context.realm = Some(realm);
            self.context.nonce = Some(nonce);
            self.context.opaque = params.remove("opaque");
            self.context.qop = params.remove("qop");
            self.context.algorithm = params.remove("algorithm");
            self.context.nonce_spent = false;
            return Ok(());
        }

        Err(AuthError::Unavailable(format!(
            "unrecognised challenge scheme: {}",
            header
        )))
    }

    fn basic_header(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes())
        )
    }

    fn next_nonce_count(&mut self) -> u32 {
        self.context.nonce_count = if self.context.nonce_count >= NONCE_COUNT_MAX {
            1
        } else {
            self.context.nonce_count + 1
        };
        self.context.nonce_count
    }

    fn digest_header(&mut self, method: &str, uri: &str) -> String {
        let nc = format!("{:08x}", self.next_nonce_count());
        let cnonce = generate_cnonce();
        let realm = self.context.realm.clone().unwrap_or_default();
        let nonce = self.context.nonce.clone().unwrap_or_default();
        let qop = self.context.qop.as_deref().and_then(select_qop);

        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, realm, self.password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let response = digest_response(&ha1, &nonce, &nc, &cnonce, qop, &ha2);

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}""#,
            self.username, realm, nonce, uri
        );
        if let Some(qop) = qop {
            header.push_str(&format!(r#", cnonce="{}", nc={}, qop={}"#, cnonce, nc, qop));
        }
        header.push_str(&format!(r#", response="{}""#, response));
        if let Some(ref opaque) = self.context.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if let Some(ref algorithm) = self.context.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }

        header
    }
}

/// Lower-case hex MD5 of `input`
pub fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// RFC 2617 response value; without qop falls back to the RFC 2069 form
pub fn digest_response(
    ha1: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<&str>,
    ha2: &str,
) -> String {
    match qop {
        Some(qop) => md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}
