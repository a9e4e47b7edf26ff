//! Signature engine
//!
//! Two schemes are in play:
//! - asymmetric, RSA PKCS#1 v1.5 over SHA-256 of `clientId|timestamp`, used
//!   only for access-token issuance;
//! - symmetric, HMAC-SHA512 with the client secret over the canonical
//!   string-to-sign, used for every other call.
//!
//! Both produce standard base64. Verification returns `Ok(false)` for a
//! signature that does not match; `Err` is reserved for a verifier that
//! cannot run (undecodable base64).

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::canonical::{CanonicalRequest, EmptyBodyDigest};
use crate::config::{BankConfig, SigningConfig};
use crate::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// Our private key and the bank's public key
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    counterparty_public_key: RsaPublicKey,
}

impl KeyMaterial {
    /// Load both keys from PEM files.
    ///
    /// The private key may be PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8
    /// (`PRIVATE KEY`); the public key must be PKIX (`PUBLIC KEY`).
    pub fn load(
        private_key_path: impl AsRef<Path>,
        public_key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let private_key_path = private_key_path.as_ref();
        let public_key_path = public_key_path.as_ref();

        let private_pem = read_pem(private_key_path)?;
        let public_pem = read_pem(public_key_path)?;

        let keys = Self {
            private_key: parse_private_key(&private_pem, &private_key_path.display().to_string())?,
            counterparty_public_key: parse_public_key(
                &public_pem,
                &public_key_path.display().to_string(),
            )?,
        };
        info!(
            "Loaded signing keys from {} and {}",
            private_key_path.display(),
            public_key_path.display()
        );
        Ok(keys)
    }

    /// Build from already-parsed keys
    pub fn from_keys(private_key: RsaPrivateKey, counterparty_public_key: RsaPublicKey) -> Self {
        Self {
            private_key,
            counterparty_public_key,
        }
    }

    /// Build from PEM text
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self> {
        Ok(Self {
            private_key: parse_private_key(private_pem, "<inline>")?,
            counterparty_public_key: parse_public_key(public_pem, "<inline>")?,
        })
    }
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::KeyLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn pem_label(pem: &str) -> Option<&str> {
    let start = pem.find("-----BEGIN ")? + "-----BEGIN ".len();
    let len = pem[start..].find("-----")?;
    Some(&pem[start..start + len])
}

fn parse_private_key(pem: &str, path: &str) -> Result<RsaPrivateKey> {
    let key_error = |reason: String| Error::KeyLoad {
        path: path.to_string(),
        reason,
    };
    match pem_label(pem) {
        Some("RSA PRIVATE KEY") => {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| key_error(e.to_string()))
        }
        Some("PRIVATE KEY") => {
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| key_error(e.to_string()))
        }
        Some(other) => Err(key_error(format!("unexpected PEM block '{}'", other))),
        None => Err(key_error("no PEM block found".to_string())),
    }
}

fn parse_public_key(pem: &str, path: &str) -> Result<RsaPublicKey> {
    let key_error = |reason: String| Error::KeyLoad {
        path: path.to_string(),
        reason,
    };
    match pem_label(pem) {
        Some("PUBLIC KEY") => {
            RsaPublicKey::from_public_key_pem(pem).map_err(|e| key_error(e.to_string()))
        }
        Some(other) => Err(key_error(format!("unexpected PEM block '{}'", other))),
        None => Err(key_error("no PEM block found".to_string())),
    }
}

/// Inputs of a symmetric signature
#[derive(Debug, Clone, Copy)]
pub struct SymmetricRequest<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Relative URL, raw or already canonical
    pub url: &'a str,
    /// Bearer token, may be empty
    pub token: &'a str,
    /// Raw request body
    pub body: &'a [u8],
    /// `X-TIMESTAMP` value
    pub timestamp: &'a str,
}

/// Fully loaded signer/verifier
pub struct SignatureEngine {
    client_id: String,
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    empty_body: EmptyBodyDigest,
}

impl SignatureEngine {
    /// Create an engine for `client_id` from loaded keys
    pub fn new(client_id: impl Into<String>, keys: KeyMaterial, empty_body: EmptyBodyDigest) -> Self {
        Self {
            client_id: client_id.into(),
            signing_key: SigningKey::<Sha256>::new(keys.private_key),
            verifying_key: VerifyingKey::<Sha256>::new(keys.counterparty_public_key),
            empty_body,
        }
    }

    /// Load keys from the configured paths
    pub fn from_config(bank: &BankConfig, signing: &SigningConfig) -> Result<Self> {
        if bank.client_key.is_empty() {
            return Err(Error::Config("bank.client_key is not set".to_string()));
        }
        let keys = KeyMaterial::load(&bank.private_key_path, &bank.public_key_path)?;
        Ok(Self::new(bank.client_key.clone(), keys, signing.empty_body_digest))
    }

    /// Our client id (`X-CLIENT-KEY`)
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Empty-body policy used when canonicalizing
    pub fn empty_body_digest(&self) -> EmptyBodyDigest {
        self.empty_body
    }

    /// Sign `clientId|timestamp` with our private key
    pub fn create_asymmetric_signature(&self, timestamp: &str) -> Result<String> {
        let message = format!("{}|{}", self.client_id, timestamp);
        let signature = self
            .signing_key
            .try_sign(message.as_bytes())?;
        Ok(STANDARD.encode(signature.to_vec()))
    }

    /// Verify `clientKey|timestamp` against the bank's public key
    pub fn verify_asymmetric_signature(
        &self,
        timestamp: &str,
        client_key: &str,
        signature: &str,
    ) -> Result<bool> {
        let raw = STANDARD.decode(signature.trim())?;
        let signature = match Signature::try_from(raw.as_slice()) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        let message = format!("{}|{}", client_key, timestamp);
        let valid = self
            .verifying_key
            .verify(message.as_bytes(), &signature)
            .is_ok();
        if !valid {
            debug!("Asymmetric signature mismatch for client {}", client_key);
        }
        Ok(valid)
    }

    /// Canonical form of a symmetric request under this engine's policy
    pub fn canonical_request(&self, request: &SymmetricRequest<'_>) -> Result<CanonicalRequest> {
        CanonicalRequest::new(
            request.method,
            request.url,
            request.token,
            request.body,
            request.timestamp,
            self.empty_body,
        )
    }

    /// HMAC-SHA512 over the string-to-sign
    pub fn create_symmetric_signature(
        &self,
        request: &SymmetricRequest<'_>,
        secret: &[u8],
    ) -> Result<String> {
        let mac = self.symmetric_mac(request, secret)?;
        Ok(STANDARD.encode(mac))
    }

    /// Recompute and compare in constant time
    pub fn verify_symmetric_signature(
        &self,
        request: &SymmetricRequest<'_>,
        secret: &[u8],
        signature: &str,
    ) -> Result<bool> {
        let provided = STANDARD.decode(signature.trim())?;
        let expected = self.symmetric_mac(request, secret)?;
        Ok(expected.ct_eq(&provided).into())
    }

    fn symmetric_mac(&self, request: &SymmetricRequest<'_>, secret: &[u8]) -> Result<Vec<u8>> {
        let string_to_sign = self.canonical_request(request)?.string_to_sign();
        let mut mac = HmacSha512::new_from_slice(secret)
            .map_err(|e| Error::Config(format!("invalid HMAC secret: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureEngine")
            .field("client_id", &self.client_id)
            .field("empty_body", &self.empty_body)
            .finish_non_exhaustive()
    }
}
