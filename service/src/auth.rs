use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::access_token::{AccessTokenIssuer, TokenError};
use crate::store::{StoreError, TitulosStore, UserRecord};

const PBKDF2_SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const MIN_PASSWORD_CHARS: usize = 8;
const MAX_EMAIL_CHARS: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("A user with this email already exists")]
    EmailTaken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Registration and login over the credential store, with token issuance
/// delegated to the access-token issuer.
#[derive(Clone)]
pub struct AuthService {
    store: TitulosStore,
    tokens: AccessTokenIssuer,
}

impl AuthService {
    pub fn new(store: TitulosStore, tokens: AccessTokenIssuer) -> Self {
        Self { store, tokens }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, String), AuthError> {
        let email = validate_email(email)?;
        validate_password(password)?;

        if self.store.find_user_by_email(&email).await.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = hash_password(password);
        let user = match self.store.create_user(&email, &password_hash).await {
            Ok(user) => user,
            Err(StoreError::AlreadyExists { .. }) => return Err(AuthError::EmailTaken),
            Err(error) => return Err(AuthError::Store(error)),
        };

        let token = self.tokens.issue(&user.id)?;
        tracing::info!(
            target: "titulos.auth",
            user_id = %user.id,
            "user_registered",
        );
        Ok((user, token))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let user = self.store.find_user_by_email(email.trim()).await;
        let Some(user) = user.filter(|user| verify_password(password, &user.password_hash)) else {
            tracing::warn!(target: "titulos.auth", email = %email, "login_failed");
            return Err(AuthError::InvalidCredentials);
        };

        let token = self.tokens.issue(&user.id)?;
        tracing::info!(
            target: "titulos.auth",
            user_id = %user.id,
            "user_logged_in",
        );
        Ok(token)
    }

    /// Resolve a bearer token to the stored user. A valid token whose user
    /// has since disappeared is treated the same as an invalid one.
    pub async fn current_user(&self, token: &str) -> Result<UserRecord, AuthError> {
        let user_id = self.tokens.verify(token)?;
        self.store
            .find_user_by_id(&user_id)
            .await
            .ok_or(AuthError::InvalidCredentials)
    }
}

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let mut derived_key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        &salt,
        PBKDF2_ITERATIONS,
        &mut derived_key,
    );

    format!(
        "{PBKDF2_SCHEME}${PBKDF2_ITERATIONS}${}${}",
        BASE64.encode(salt),
        BASE64.encode(derived_key)
    )
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let mut parts = stored_hash.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PBKDF2_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };

    let mut derived_key = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived_key);
    derived_key.as_slice().ct_eq(expected.as_slice()).into()
}

fn validate_email(raw: &str) -> Result<String, AuthError> {
    let cleaned = raw.trim();
    let mut parts = cleaned.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    let shape_ok = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !cleaned.contains(char::is_whitespace)
        && cleaned.chars().count() <= MAX_EMAIL_CHARS;
    if shape_ok {
        Ok(cleaned.to_string())
    } else {
        Err(AuthError::Validation {
            field: "email",
            message: "value is not a valid email address".to_string(),
        })
    }
}

fn validate_password(raw: &str) -> Result<(), AuthError> {
    if raw.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AuthError::Validation {
            field: "password",
            message: format!("Password must be at least {MIN_PASSWORD_CHARS} characters"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse battery staple");
        assert!(hash.starts_with("pbkdf2-sha256$100000$"));
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn two_hashes_of_the_same_password_differ() {
        let first = hash_password("hunter2hunter2");
        let second = hash_password("hunter2hunter2");
        assert_ne!(first, second);
        assert!(verify_password("hunter2hunter2", &first));
        assert!(verify_password("hunter2hunter2", &second));
    }

    #[test]
    fn mangled_stored_hash_never_verifies() {
        for stored in ["", "plaintext", "bcrypt$12$abc$def", "pbkdf2-sha256$x$y$z"] {
            assert!(!verify_password("anything", stored));
        }
    }

    #[test]
    fn email_validation_accepts_plausible_addresses() {
        assert_eq!(
            validate_email(" lawyer@estudio.pe ").expect("valid"),
            "lawyer@estudio.pe"
        );
        for raw in ["", "no-at-sign", "@estudio.pe", "user@nodot", "user@.pe", "a b@c.pe"] {
            assert!(validate_email(raw).is_err(), "email '{raw}' should be rejected");
        }
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("seven77").is_err());
        assert!(validate_password("eight888").is_ok());
    }
}
