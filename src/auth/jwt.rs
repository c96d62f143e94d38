use std::time::Duration;

use anyhow::bail;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use crate::{
    auth::claims::{Claims, Identity},
    config::JwtConfig,
};

/// HS256 signing and verification keys with issuer/audience settings.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl JwtKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::from_secs((cfg.ttl_minutes.max(1) as u64).saturating_mul(60)),
        }
    }

    pub fn sign(&self, who: &Identity) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let ttl = TimeDuration::seconds(i64::try_from(self.ttl.as_secs())?);
        let exp = now
            .checked_add(ttl)
            .ok_or_else(|| anyhow::anyhow!("token lifetime out of range"))?;
        let claims = Claims {
            user_id: who.id,
            email: who.email.clone(),
            name: who.name.clone(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: Some(self.issuer.clone()),
            aud: Some(self.audience.clone()),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %who.id, "jwt signed");
        Ok(token)
    }

    /// Signature and expiry are always checked. Issuer and audience are
    /// checked when the token carries them; older tokens carry neither.
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.validate_aud = false;
        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if claims.iss.as_deref().is_some_and(|iss| iss != self.issuer) {
            bail!("token issuer mismatch");
        }
        if claims.aud.as_deref().is_some_and(|aud| aud != self.audience) {
            bail!("token audience mismatch");
        }
        debug!(
            user_id = %claims.user_id,
            legacy = claims.iss.is_none() && claims.aud.is_none(),
            "jwt verified"
        );
        Ok(claims)
    }
}
