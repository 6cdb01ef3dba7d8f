use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: i64,
}

/// HS256 signer/verifier for session tokens. The secret is shared with
/// whatever issued the token; the server only ever checks that the token
/// is valid and names the user the connection claims to be.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue_token(&self, user_id: UserId) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id.0,
            exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify_token(&self, token: &str) -> Option<UserId> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).ok()?;
        Some(UserId(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips() {
        let keys = AuthKeys::from_secret("test-secret");
        let token = keys.issue_token(UserId(7)).expect("token");
        assert_eq!(keys.verify_token(&token), Some(UserId(7)));
    }

    #[test]
    fn token_from_another_secret_is_rejected() {
        let keys = AuthKeys::from_secret("test-secret");
        let other = AuthKeys::from_secret("other-secret");
        let token = other.issue_token(UserId(7)).expect("token");
        assert_eq!(keys.verify_token(&token), None);
    }

    #[test]
    fn garbage_token_is_rejected() {
        let keys = AuthKeys::from_secret("test-secret");
        assert_eq!(keys.verify_token("not.a.jwt"), None);
    }
}
