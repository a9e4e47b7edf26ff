//! Canonical request form
//!
//! The bank hashes and signs an exact byte form of each request. Any drift
//! here (an extra space in the body, a differently ordered query) makes
//! every signature fail silently on the bank side.
//!
//! - Path: every byte outside `A-Z a-z 0-9 - _ . ~ /` is percent-encoded
//!   with uppercase hex.
//! - Query: pairs are decoded, sorted by name then value (byte-wise) and
//!   re-encoded with the same set plus `? = &`.
//! - Body: JSON with insignificant whitespace removed, SHA-256, lowercase hex.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// How an empty body is represented in the string-to-sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBodyDigest {
    /// SHA-256 hex of the zero-length input
    #[default]
    HashOfEmpty,
    /// Empty string in place of the digest
    Blank,
}

fn is_path_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'/')
}

fn is_query_safe(b: u8) -> bool {
    is_path_safe(b) || matches!(b, b'?' | b'=' | b'&')
}

fn percent_encode(input: &[u8], safe: fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if safe(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX_UPPER[(b >> 4) as usize] as char);
            out.push(HEX_UPPER[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode; invalid escapes are kept literally. `plus_as_space`
/// applies form decoding to query components.
fn percent_decode(input: &str, plus_as_space: bool) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Canonical relative URL: encoded path plus sorted, re-encoded query.
///
/// Accepts absolute URLs too; scheme and authority are dropped. Fragments are
/// never part of the signed form.
pub fn canonicalize_relative_url(raw_url: &str) -> String {
    let without_fragment = raw_url.split('#').next().unwrap_or_default();
    let relative = strip_origin(without_fragment);

    let (raw_path, raw_query) = match relative.split_once('?') {
        Some((path, query)) => (path, query),
        None => (relative, ""),
    };

    let path = percent_encode(&percent_decode(raw_path, false), is_path_safe);

    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = raw_query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
            (percent_decode(name, true), percent_decode(value, true))
        })
        .collect();
    pairs.sort();

    let query = pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                percent_encode(name, is_query_safe),
                percent_encode(value, is_query_safe)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query)
    }
}

fn strip_origin(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let after_scheme = &url[scheme_end + 3..];
            match after_scheme.find(|c| c == '/' || c == '?') {
                Some(idx) => &after_scheme[idx..],
                None => "",
            }
        }
        None => url,
    }
}

/// Remove insignificant whitespace from a JSON document, keeping key order,
/// number spelling and string contents untouched.
pub fn minify_json(body: &[u8]) -> Result<Vec<u8>> {
    serde_json::from_slice::<serde::de::IgnoredAny>(body)
        .map_err(Error::Canonicalization)?;

    let mut out = Vec::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    for &b in body {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => {}
            b'"' => {
                in_string = true;
                out.push(b);
            }
            _ => out.push(b),
        }
    }
    Ok(out)
}

/// Lowercase hex SHA-256 of the minified body
pub fn canonical_body_digest(body: &[u8], empty: EmptyBodyDigest) -> Result<String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(match empty {
            EmptyBodyDigest::HashOfEmpty => hex::encode(Sha256::digest(b"")),
            EmptyBodyDigest::Blank => String::new(),
        });
    }
    let minified = minify_json(body)?;
    Ok(hex::encode(Sha256::digest(&minified)))
}

/// The canonical components of a symmetric-signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    /// Uppercase HTTP method
    pub method: String,
    /// Canonical relative URL
    pub url: String,
    /// Bearer token, may be empty
    pub token: String,
    /// Body digest
    pub body_digest: String,
    /// RFC3339 timestamp, as sent in `X-TIMESTAMP`
    pub timestamp: String,
}

impl CanonicalRequest {
    /// Derive the canonical form of a request
    pub fn new(
        method: &str,
        url: &str,
        token: &str,
        body: &[u8],
        timestamp: &str,
        empty: EmptyBodyDigest,
    ) -> Result<Self> {
        Ok(Self {
            method: method.to_ascii_uppercase(),
            url: canonicalize_relative_url(url),
            token: token.to_string(),
            body_digest: canonical_body_digest(body, empty)?,
            timestamp: timestamp.to_string(),
        })
    }

    /// `METHOD:URL:TOKEN:BODYDIGEST:TIMESTAMP`
    pub fn string_to_sign(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.method, self.url, self.token, self.body_digest, self.timestamp
        )
    }
}
