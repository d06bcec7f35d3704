use anyhow::Context;
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;

use crate::config::HashConfig;

fn hasher(cfg: &HashConfig) -> anyhow::Result<Argon2<'static>> {
    let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
        .map_err(|e| anyhow::anyhow!("invalid argon2 params: {e}"))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hashes with a fresh random salt; the result is a self-describing PHC string.
pub fn hash_password(plain: &str, cfg: &HashConfig) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let phc = hasher(cfg)?
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))?;
    Ok(phc.to_string())
}

/// A hash of a random throwaway password with the configured cost, verified
/// against when a login names an unknown email.
pub fn decoy_hash(cfg: &HashConfig) -> anyhow::Result<String> {
    let throwaway = SaltString::generate(&mut OsRng);
    hash_password(throwaway.as_str(), cfg).context("build decoy hash")
}

/// `Ok(false)` means the password does not match. A hash that cannot be parsed
/// or evaluated is an error, not a mismatch.
pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("stored hash is not a PHC string: {e}"))?;
    // Cost parameters come from the PHC string, not from the default instance.
    match Argon2::default().verify_password(plain.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("argon2 verification failed: {e}")),
    }
}

#[cfg(test)]
pub(crate) fn cheap_params() -> HashConfig {
    HashConfig {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
pub(crate) fn params_of(hash: &str) -> Params {
    let parsed = PasswordHash::new(hash).expect("phc string");
    Params::try_from(&parsed).expect("argon2 params")
}
