//! WebSocket bearer tokens.
//!
//! The HTTP layer mints a short-lived HS256 token after cookie auth; the
//! socket handshake presents it in the AUTH frame. The token's only claim
//! of interest is the account id.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use tether_core::ids::AccountId;

const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub struct TokenKeeper {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeeper {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a one-hour token for an account.
    pub fn mint(&self, account_id: &AccountId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: account_id.as_str().to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    /// Resolve a presented token to its account. `None` for anything
    /// invalid, tampered or expired.
    pub fn verify(&self, token: &str) -> Option<AccountId> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).ok()?;
        Some(AccountId::from_raw(data.claims.sub))
    }
}
