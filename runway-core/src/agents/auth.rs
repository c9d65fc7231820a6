use hmac::{Hmac, Mac};
use sha2::Sha256;

use runway_model::AgentPoolId;

use crate::error::{Result, RunwayError};

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length in bytes.
pub const MIN_SECRET_BYTES: usize = 32;

/// Verifies an agent's bearer token and yields the pool it is scoped to.
#[cfg_attr(test, mockall::automock)]
pub trait AgentAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<AgentPoolId>;
}

/// Pool-scoped tokens of the form `<pool id>.<hex HMAC-SHA-256(pool id)>`.
pub struct HmacAgentTokens {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacAgentTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAgentTokens")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl HmacAgentTokens {
    /// Builds from a hex-encoded secret of at least [`MIN_SECRET_BYTES`].
    pub fn from_hex(secret: &str) -> Result<Self> {
        let secret = hex::decode(secret.trim()).map_err(|err| {
            RunwayError::InvariantViolation(format!("agent token secret is not hex: {err}"))
        })?;
        if secret.len() < MIN_SECRET_BYTES {
            return Err(RunwayError::InvariantViolation(format!(
                "agent token secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self { secret })
    }

    fn mac(&self, pool: AgentPoolId) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| RunwayError::Internal(format!("hmac key: {err}")))?;
        mac.update(pool.as_uuid().as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, pool: AgentPoolId) -> Result<String> {
        let digest = self.mac(pool)?.finalize().into_bytes();
        Ok(format!("{pool}.{}", hex::encode(digest)))
    }
}

impl AgentAuthenticator for HmacAgentTokens {
    fn authenticate(&self, token: &str) -> Result<AgentPoolId> {
        let rejected = || RunwayError::Unauthorized("invalid agent token".into());
        let (pool, signature) = token.trim().split_once('.').ok_or_else(rejected)?;
        let pool: AgentPoolId = pool.parse().map_err(|_| rejected())?;
        let signature = hex::decode(signature).map_err(|_| rejected())?;
        self.mac(pool)?
            .verify_slice(&signature)
            .map_err(|_| rejected())?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn issued_tokens_authenticate_to_their_pool() {
        let tokens = HmacAgentTokens::from_hex(SECRET).unwrap();
        let pool = AgentPoolId::new();
        let token = tokens.issue(pool).unwrap();
        assert_eq!(tokens.authenticate(&token).unwrap(), pool);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let tokens = HmacAgentTokens::from_hex(SECRET).unwrap();
        let token = tokens.issue(AgentPoolId::new()).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = format!("{}.{signature}", AgentPoolId::new());
        assert!(matches!(
            tokens.authenticate(&forged),
            Err(RunwayError::Unauthorized(_))
        ));
        assert!(tokens.authenticate("garbage").is_err());

        let other = HmacAgentTokens::from_hex(&SECRET.replace('0', "1")).unwrap();
        assert!(other.authenticate(&token).is_err());
    }

    #[test]
    fn short_or_malformed_secrets_are_fatal() {
        assert!(HmacAgentTokens::from_hex("abcd").is_err());
        assert!(HmacAgentTokens::from_hex("not hex at all").is_err());
    }
}
