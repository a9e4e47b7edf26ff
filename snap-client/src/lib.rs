//! # SNAP Client
//!
//! Client side of the SNAP (Standar Nasional Open API Pembayaran) bank
//! integration protocol:
//! - asymmetric (RSA/SHA-256) signatures for token requests
//! - symmetric (HMAC-SHA512) signatures over a canonical request for
//!   service calls
//! - bearer token acquisition with single-flight renewal
//! - verification of inbound bank callbacks
//! - virtual account expiry with exactly-once commit
//!
//! ## Architecture
//!
//! ```text
//!  outbound                                inbound
//! ┌──────────────┐  token  ┌────────────┐  ┌────────────────┐
//! │  SnapSession ├────────►│ AccessToken│  │ InboundVerifier│
//! │ (SnapClient) │◄────────┤  Manager   │  └───────┬────────┘
//! └──────┬───────┘         └────────────┘          │
//!        │        ┌──────────────────┐             │
//!        └───────►│ SignatureEngine  │◄────────────┘
//!                 │  + canonical     │
//!                 └──────────────────┘
//!
//! VirtualAccountService ──► ReservationStore ◄── ExpiryWatcher
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod cache;
pub mod canonical;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod inbound;
pub mod metrics;
pub mod response_codes;
pub mod server;
pub mod signature;
pub mod store;
pub mod token;
pub mod virtual_account;
pub mod watcher;

pub use client::{SnapClient, SnapSession};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use inbound::{InboundDecision, InboundVerifier, RejectReason};
pub use signature::{KeyMaterial, SignatureEngine};
pub use token::{AccessTokenManager, TokenState};
pub use watcher::ExpiryWatcher;

/// SNAP header names
pub mod headers {
    /// Request timestamp, ISO-8601 with offset
    pub const X_TIMESTAMP: &str = "X-TIMESTAMP";
    /// Client key on token requests
    pub const X_CLIENT_KEY: &str = "X-CLIENT-KEY";
    /// Base64 signature
    pub const X_SIGNATURE: &str = "X-SIGNATURE";
    /// Partner identifier on service requests
    pub const X_PARTNER_ID: &str = "X-PARTNER-ID";
    /// Numeric per-request id, unique per day
    pub const X_EXTERNAL_ID: &str = "X-EXTERNAL-ID";
    /// Channel identifier
    pub const CHANNEL_ID: &str = "CHANNEL-ID";
    /// Caller origin
    pub const ORIGIN: &str = "ORIGIN";
    /// `Bearer <token>`
    pub const AUTHORIZATION: &str = "Authorization";
    /// Body media type
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// Default request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default attempts to commit an expiry before dead-lettering it
pub const DEFAULT_EXPIRY_COMMIT_ATTEMPTS: u32 = 20;
