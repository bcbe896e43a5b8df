use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies the HS256 bearer tokens that authenticate API calls.
///
/// Tokens carry `{sub, iat, exp}` and are valid until natural expiry; there
/// is no revocation list.
#[derive(Debug, Clone)]
pub struct AccessTokenIssuer {
    signing_secret: String,
    ttl_minutes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token is expired")]
    Expired,
    #[error("token is missing the subject claim")]
    MissingSubject,
    #[error("failed to sign token: {message}")]
    Signing { message: String },
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

impl AccessTokenIssuer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            signing_secret: config.jwt_secret.clone(),
            ttl_minutes: config.jwt_ttl_minutes,
        }
    }

    /// Produce a signed token for the given user id.
    pub fn issue(&self, user_id: &str) -> Result<String, TokenError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::minutes(self.ttl_minutes as i64);

        let header = serde_json::json!({
            "alg": "HS256",
            "typ": "JWT",
        });
        let claims = serde_json::json!({
            "sub": user_id,
            "iat": issued_at.timestamp(),
            "exp": expires_at.timestamp(),
        });

        let header_bytes = serde_json::to_vec(&header).map_err(|error| TokenError::Signing {
            message: format!("failed to encode token header: {error}"),
        })?;
        let claims_bytes = serde_json::to_vec(&claims).map_err(|error| TokenError::Signing {
            message: format!("failed to encode token claims: {error}"),
        })?;

        let header_segment = URL_SAFE_NO_PAD.encode(header_bytes);
        let claims_segment = URL_SAFE_NO_PAD.encode(claims_bytes);
        let signing_input = format!("{header_segment}.{claims_segment}");

        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes()).map_err(
            |error| TokenError::Signing {
                message: format!("failed to initialize token signer: {error}"),
            },
        )?;
        mac.update(signing_input.as_bytes());
        let signature_segment = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature_segment}"))
    }

    /// Verify a token and return the user id from its subject claim.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_segment), Some(claims_segment), Some(signature_segment), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes()).map_err(
            |error| TokenError::Signing {
                message: format!("failed to initialize token verifier: {error}"),
            },
        )?;
        mac.update(format!("{header_segment}.{claims_segment}").as_bytes());
        // verify_slice is a constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;

        match claims.exp {
            Some(exp) if exp > Utc::now().timestamp() => {}
            _ => return Err(TokenError::Expired),
        }

        claims
            .sub
            .filter(|subject| !subject.trim().is_empty())
            .ok_or(TokenError::MissingSubject)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn issuer() -> AccessTokenIssuer {
        AccessTokenIssuer::from_config(&Config::for_tests(PathBuf::from(".")))
    }

    #[test]
    fn issued_token_round_trips() {
        let issuer = issuer();
        let token = issuer.issue("user_abc123").expect("issue token");
        let subject = issuer.verify(&token).expect("verify token");
        assert_eq!(subject, "user_abc123");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let issuer = issuer();
        let token = issuer.issue("user_abc123").expect("issue token");
        let mut forged = token.clone();
        forged.pop();
        forged.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(matches!(
            issuer.verify(&forged),
            Err(TokenError::BadSignature | TokenError::Malformed)
        ));
    }

    #[test]
    fn garbage_token_is_malformed() {
        assert!(matches!(
            issuer().verify("not-a-token"),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let mut config = Config::for_tests(PathBuf::from("."));
        config.jwt_secret = "a-different-secret".to_string();
        let other = AccessTokenIssuer::from_config(&config);
        let token = other.issue("user_abc123").expect("issue token");
        assert!(matches!(
            issuer().verify(&token),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut config = Config::for_tests(PathBuf::from("."));
        config.jwt_ttl_minutes = 1;
        let issuer = AccessTokenIssuer::from_config(&config);

        // Forge an already-expired token with the right secret.
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let past = Utc::now().timestamp() - 120;
        let claims =
            URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user_x","iat":{past},"exp":{past}}}"#));
        let signing_input = format!("{header}.{claims}");
        let mut mac = HmacSha256::new_from_slice(config.jwt_secret.as_bytes()).expect("mac");
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{signing_input}.{signature}");

        assert!(matches!(issuer.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn token_without_subject_is_rejected() {
        let config = Config::for_tests(PathBuf::from("."));
        let issuer = AccessTokenIssuer::from_config(&config);

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let future = Utc::now().timestamp() + 600;
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{future}}}"#));
        let signing_input = format!("{header}.{claims}");
        let mut mac = HmacSha256::new_from_slice(config.jwt_secret.as_bytes()).expect("mac");
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{signing_input}.{signature}");

        assert!(matches!(
            issuer.verify(&token),
            Err(TokenError::MissingSubject)
        ));
    }
}
