//! HTTP surface for bank callbacks
//!
//! Routes:
//! - `POST /snap/v1.0/access-token/b2b` issues a token to a verified bank client
//! - `POST /snap/v1.0/transfer-va/payment` settles a virtual account payment
//! - `GET /health`
//! - `GET /metrics`

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use crate::inbound::{InboundDecision, InboundRequest, InboundVerifier, RejectReason};
use crate::response_codes::BankResponseCode;
use crate::virtual_account::{Amount, SettlementOutcome, VirtualAccountService};
use crate::{Error, ErrorKind};

/// Token issuance route
pub const ACCESS_TOKEN_PATH: &str = "/snap/v1.0/access-token/b2b";
/// Payment notification route
pub const PAYMENT_PATH: &str = "/snap/v1.0/transfer-va/payment";

const ACCESS_TOKEN_SERVICE: u8 = 73;
const PAYMENT_SERVICE: u8 = 25;

/// Shared handler state
pub struct AppState {
    /// Inbound signature and token checks
    pub verifier: Arc<InboundVerifier>,
    /// Reservation settlement
    pub accounts: Arc<VirtualAccountService>,
}

/// SNAP response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// 7-character SNAP code
    pub response_code: String,
    /// Message for the code
    pub response_message: String,
    /// Service-specific fields
    #[serde(flatten)]
    pub data: T,
}

/// Payment notification sent by the bank
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    /// Partner prefix
    #[serde(default)]
    pub partner_service_id: String,
    /// Customer number
    #[serde(default)]
    pub customer_no: String,
    /// Virtual account paid into
    pub virtual_account_no: String,
    /// Our transaction id
    pub trx_id: String,
    /// Bank payment reference
    pub payment_request_id: String,
    /// Amount paid
    pub paid_amount: Amount,
    /// When the payment happened
    #[serde(default)]
    pub trx_date_time: Option<String>,
}

/// Echo returned for a settled payment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualAccountData {
    /// Our transaction id
    pub trx_id: String,
    /// Virtual account paid into
    pub virtual_account_no: String,
    /// Bank payment reference
    pub payment_request_id: String,
    /// Amount paid
    pub paid_amount: Amount,
    /// `00` success
    pub payment_flag_status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentData {
    virtual_account_data: VirtualAccountData,
}

#[derive(Debug, Serialize)]
struct NoData {}

/// Handler error rendered as a SNAP envelope
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        error!("Request failed: {}", self.0);
        let case = match self.0.kind() {
            ErrorKind::PersistenceTransient | ErrorKind::Transport => 1,
            _ => 0,
        };
        envelope(BankResponseCode::new(500, 0, case), None, NoData {})
    }
}

fn envelope<T: Serialize>(code: BankResponseCode, message: Option<String>, data: T) -> HttpResponse {
    let status = StatusCode::from_u16(code.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let response_message = message
        .or_else(|| code.message().map(str::to_string))
        .unwrap_or_default();
    HttpResponse::build(status).json(Envelope {
        response_code: code.to_string(),
        response_message,
        data,
    })
}

fn rejection(reason: &RejectReason, service_code: u8) -> HttpResponse {
    let code = match reason.response_code(service_code).parse::<BankResponseCode>() {
        Ok(code) => code,
        Err(_) => BankResponseCode::new(401, service_code, 0),
    };
    envelope(code, Some(reason.to_string()), NoData {})
}

fn inbound_request(req: &HttpRequest, body: &[u8]) -> InboundRequest {
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.path());
    req.headers().iter().fold(
        InboundRequest::new(req.method().as_str(), url, body.to_vec()),
        |request, (name, value)| match value.to_str() {
            Ok(value) => request.with_header(name.as_str(), value),
            Err(_) => request,
        },
    )
}

/// `POST /snap/v1.0/access-token/b2b`
pub async fn access_token(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let inbound = inbound_request(&req, &body);
    let client_key = match state.verifier.verify_token_request(&inbound).await? {
        InboundDecision::Accepted(client_key) => client_key,
        InboundDecision::Rejected(reason) => return Ok(rejection(&reason, ACCESS_TOKEN_SERVICE)),
    };

    let issued = state.verifier.issue_access_token(&client_key).await?;
    Ok(envelope(
        BankResponseCode::new(200, ACCESS_TOKEN_SERVICE, 0),
        None,
        issued,
    ))
}

/// `POST /snap/v1.0/transfer-va/payment`
pub async fn payment(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let inbound = inbound_request(&req, &body);
    if let InboundDecision::Rejected(reason) = state.verifier.verify_service_request(&inbound).await? {
        return Ok(rejection(&reason, PAYMENT_SERVICE));
    }

    let notification: PaymentNotification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(e) => {
            return Ok(envelope(
                BankResponseCode::new(400, PAYMENT_SERVICE, 1),
                Some(format!("Invalid Field Format {}", e)),
                NoData {},
            ))
        }
    };

    let paid_at = notification
        .trx_date_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let outcome = state
        .accounts
        .settle_payment(&notification.trx_id, paid_at)
        .await?;
    info!("Payment {} for {}: {:?}", notification.payment_request_id, notification.trx_id, outcome);

    let code = match outcome {
        SettlementOutcome::Paid => BankResponseCode::new(200, PAYMENT_SERVICE, 0),
        SettlementOutcome::AlreadyPaid => BankResponseCode::new(404, PAYMENT_SERVICE, 14),
        SettlementOutcome::Expired => BankResponseCode::new(404, PAYMENT_SERVICE, 19),
        SettlementOutcome::NotFound => BankResponseCode::new(404, PAYMENT_SERVICE, 12),
    };
    if outcome != SettlementOutcome::Paid {
        return Ok(envelope(code, None, NoData {}));
    }

    Ok(envelope(
        code,
        None,
        PaymentData {
            virtual_account_data: VirtualAccountData {
                trx_id: notification.trx_id,
                virtual_account_no: notification.virtual_account_no,
                payment_request_id: notification.payment_request_id,
                paid_amount: notification.paid_amount,
                payment_flag_status: "00".to_string(),
            },
        },
    ))
}

/// `GET /health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "watchedTransactions": state.accounts.watcher().len(),
    }))
}

/// `GET /metrics`
pub async fn metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(crate::metrics::gather_text())
}

/// Register all routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics))
        .route(ACCESS_TOKEN_PATH, web::post().to(access_token))
        .route(PAYMENT_PATH, web::post().to(payment));
}
