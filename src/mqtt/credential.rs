//! Short-lived signed broker credentials
//!
//! The broker authenticates a session only once, at CONNECT time, using a JWT
//! passed as the password. The token carries `iat`, `exp` and `aud` claims and is
//! signed with RS256. A session lives at most until the token expires, so a new
//! token is issued for every connect attempt and every time a session drops.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Validity window of every issued token.
pub const TOKEN_LIFETIME_SECS: i64 = 60 * 60;

/// Claims carried by a broker token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// A signed token together with its validity window
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub audience: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("audience", &self.audience)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Issues credentials for one identity from one RSA private key
#[derive(Clone)]
pub struct CredentialIssuer {
    audience: String,
    key: EncodingKey,
}

impl CredentialIssuer {
    /// Builds an issuer from a PEM encoded RSA private key.
    ///
    /// The key is parsed once here so that a malformed key surfaces as a
    /// configuration problem instead of on the first connect.
    pub fn from_rsa_pem(audience: impl Into<String>, private_key_pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)?;
        Ok(Self {
            audience: audience.into(),
            key,
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Signs a fresh token valid from `now` for [`TOKEN_LIFETIME_SECS`].
    pub fn issue(&self, now: DateTime<Utc>) -> Result<Credential> {
        let issued_at = now.timestamp();
        let claims = Claims {
            iat: issued_at,
            exp: issued_at + TOKEN_LIFETIME_SECS,
            aud: self.audience.clone(),
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)?;

        let issued_at = DateTime::from_timestamp(claims.iat, 0).unwrap_or(now);
        Ok(Credential {
            audience: claims.aud,
            token,
            issued_at,
            expires_at: issued_at + Duration::seconds(TOKEN_LIFETIME_SECS),
        })
    }
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("audience", &self.audience)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    pub(crate) const PRIVATE_KEY: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/rsa_private.pem"));
    const PUBLIC_KEY: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/rsa_public.pem"));

    fn decode_claims(token: &str, audience: &str) -> Claims {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_audience(&[audience]);
        decode::<Claims>(
            token,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY).unwrap(),
            &validation,
        )
        .unwrap()
        .claims
    }

    #[test]
    fn token_claims_cover_one_hour_for_the_identity() {
        for (audience, at) in [
            ("my-project", 1_700_000_000),
            ("other-project", 0),
            ("", 1_234_567_890),
        ] {
            let issuer = CredentialIssuer::from_rsa_pem(audience, PRIVATE_KEY).unwrap();
            let now = DateTime::from_timestamp(at, 0).unwrap();
            let credential = issuer.issue(now).unwrap();

            let claims = decode_claims(&credential.token, audience);
            assert_eq!(claims.exp - claims.iat, 3600);
            assert_eq!(claims.iat, at);
            assert_eq!(claims.aud, audience);
            assert_eq!(credential.audience, audience);
            assert_eq!(
                (credential.expires_at - credential.issued_at).num_seconds(),
                3600
            );
        }
    }

    #[test]
    fn every_issue_yields_a_new_credential() {
        let issuer = CredentialIssuer::from_rsa_pem("p", PRIVATE_KEY).unwrap();
        let first = issuer.issue(DateTime::from_timestamp(100, 0).unwrap()).unwrap();
        let second = issuer.issue(DateTime::from_timestamp(101, 0).unwrap()).unwrap();
        assert_ne!(first.token, second.token);
        assert!(second.expires_at > first.expires_at);
    }

    #[test]
    fn expiry_check() {
        let issuer = CredentialIssuer::from_rsa_pem("p", PRIVATE_KEY).unwrap();
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let credential = issuer.issue(now).unwrap();
        assert!(!credential.is_expired(now));
        assert!(credential.is_expired(now + Duration::seconds(3600)));
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(CredentialIssuer::from_rsa_pem("p", b"not a key").is_err());
    }

    #[test]
    fn debug_output_hides_token() {
        let issuer = CredentialIssuer::from_rsa_pem("p", PRIVATE_KEY).unwrap();
        let credential = issuer.issue(Utc::now()).unwrap();
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains(&credential.token));
    }
}
