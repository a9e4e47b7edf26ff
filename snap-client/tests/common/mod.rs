//! Shared fixtures for integration tests

#![allow(dead_code)]

use rsa::RsaPrivateKey;
use snap_client::canonical::EmptyBodyDigest;
use snap_client::config::{BankConfig, TokenConfig};
use snap_client::{KeyMaterial, SignatureEngine, SnapClient, SnapSession};
use std::sync::{Arc, OnceLock};

pub const CLIENT_KEY: &str = "client-123";
pub const CLIENT_SECRET: &str = "client-secret";

/// One RSA key per test binary
pub fn key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate RSA key"))
        .clone()
}

/// Engine that also verifies its own signatures
pub fn engine() -> Arc<SignatureEngine> {
    let private_key = key();
    let public_key = private_key.to_public_key();
    Arc::new(SignatureEngine::new(
        CLIENT_KEY,
        KeyMaterial::from_keys(private_key, public_key),
        EmptyBodyDigest::HashOfEmpty,
    ))
}

pub fn bank_config(base_url: &str) -> BankConfig {
    BankConfig {
        base_url: base_url.to_string(),
        client_key: CLIENT_KEY.to_string(),
        client_secret: CLIENT_SECRET.to_string(),
        partner_id: "12345".to_string(),
        origin: "www.merchant.example".to_string(),
        ..BankConfig::default()
    }
}

pub fn client(config: &BankConfig) -> Arc<SnapClient> {
    Arc::new(SnapClient::new(config, engine()).expect("build client"))
}

pub fn session(base_url: &str) -> SnapSession {
    SnapSession::new(client(&bank_config(base_url)), &TokenConfig::default())
}
