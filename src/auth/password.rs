use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub time_cost: u32,
    pub memory_kib: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            time_cost: Params::DEFAULT_T_COST,
            memory_kib: Params::DEFAULT_M_COST,
        }
    }
}

pub fn hash_password(plain: &str, cost: HashCost) -> anyhow::Result<String> {
    let params = Params::new(cost.memory_kib, cost.time_cost, Params::DEFAULT_P_COST, None)
        .map_err(|e| anyhow::anyhow!("invalid argon2 cost: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

fn is_bcrypt(hash: &str) -> bool {
    ["$2a$", "$2b$", "$2y$"].iter().any(|p| hash.starts_with(p))
}

/// Checks `plain` against an Argon2 PHC string or a legacy bcrypt hash.
pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    if is_bcrypt(hash) {
        return bcrypt::verify(plain, hash).map_err(|e| {
            error!(error = %e, "bcrypt verify error");
            anyhow::anyhow!(e.to_string())
        });
    }
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    // params come from the PHC string, not from the current cost settings
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}
