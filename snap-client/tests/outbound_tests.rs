//! Outbound pipeline against a mock bank

mod common;

use common::{bank_config, client, engine, session, CLIENT_KEY, CLIENT_SECRET};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use snap_client::config::{TokenConfig, WatcherConfig};
use snap_client::signature::SymmetricRequest;
use snap_client::store::{MemoryReservationStore, ReservationStatus, ReservationStore};
use snap_client::virtual_account::{NewVirtualAccount, VirtualAccountService, CREATE_VA_PATH};
use snap_client::{Error, ErrorKind, ExpiryWatcher, SnapSession};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TOKEN_PATH: &str = "/snap/v1.0/access-token/b2b";
const INQUIRY_PATH: &str = "/snap/v1.0/transfer-va/inquiry";

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(header("X-CLIENT-KEY", CLIENT_KEY))
        .and(header_exists("X-TIMESTAMP"))
        .and(header_exists("X-SIGNATURE"))
        .and(body_json(json!({ "grantType": "client_credentials" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": "2007300",
            "responseMessage": "Successful",
            "accessToken": "bank-token",
            "tokenType": "Bearer",
            "expiresIn": "900"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn header_value<'a>(request: &'a Request, name: &str) -> &'a str {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

#[tokio::test]
async fn token_request_carries_verifiable_asymmetric_signature() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    let client = client(&bank_config(&server.uri()));
    let response = client.request_access_token().await.unwrap();
    assert_eq!(response.access_token, "bank-token");

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let timestamp = header_value(request, "X-TIMESTAMP");
    let signature = header_value(request, "X-SIGNATURE");
    assert!(engine()
        .verify_asymmetric_signature(timestamp, CLIENT_KEY, signature)
        .unwrap());
}

#[tokio::test]
async fn service_request_is_symmetric_signed_with_bearer_token() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(INQUIRY_PATH))
        .and(header("Authorization", "Bearer bank-token"))
        .and(header("X-PARTNER-ID", "12345"))
        .and(header("CHANNEL-ID", "95221"))
        .and(header("Content-Type", "application/json"))
        .and(header_exists("X-EXTERNAL-ID"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": "2002400",
            "responseMessage": "Successful"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = session(&server.uri());
    let body = json!({ "partnerServiceId": "   12345", "customerNo": "0001" });
    let response: Value = session.post(INQUIRY_PATH, &body).await.unwrap();
    assert_eq!(response["responseCode"], "2002400");

    let requests = server.received_requests().await.unwrap();
    let request = requests
        .iter()
        .find(|r| r.url.path() == INQUIRY_PATH)
        .unwrap();
    let external_id = header_value(request, "X-EXTERNAL-ID");
    assert!(external_id.bytes().all(|b| b.is_ascii_digit()));

    let verified = engine()
        .verify_symmetric_signature(
            &SymmetricRequest {
                method: "POST",
                url: INQUIRY_PATH,
                token: "bank-token",
                body: &request.body,
                timestamp: header_value(request, "X-TIMESTAMP"),
            },
            CLIENT_SECRET.as_bytes(),
            header_value(request, "X-SIGNATURE"),
        )
        .unwrap();
    assert!(verified);
}

#[tokio::test]
async fn non_200_envelope_is_preserved_verbatim() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(INQUIRY_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "responseCode": "4042412",
            "responseMessage": "Bill not found"
        })))
        .mount(&server)
        .await;

    let session = session(&server.uri());
    let err = session
        .post::<_, Value>(INQUIRY_PATH, &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolRejection);
    assert!(!err.is_retryable());
    assert_eq!(err.bank_message(), Some("Invalid Bill/Virtual Account"));
    match err {
        Error::BankRejection {
            status_code,
            response_code,
            response_message,
        } => {
            assert_eq!(status_code, 404);
            assert_eq!(response_code, "4042412");
            assert_eq!(response_message, "Bill not found");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn non_200_without_envelope_keeps_raw_body() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(INQUIRY_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = session(&server.uri())
        .get::<Value>(INQUIRY_PATH)
        .await
        .unwrap_err();
    match err {
        Error::BankRejection {
            status_code,
            response_code,
            response_message,
        } => {
            assert_eq!(status_code, 502);
            assert!(response_code.is_empty());
            assert_eq!(response_message, "upstream down");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn malformed_200_is_a_transport_error() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(INQUIRY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = session(&server.uri())
        .get::<Value>(INQUIRY_PATH)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { status_code: 200, .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn rejected_token_request_surfaces_to_caller() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "responseCode": "4017300",
            "responseMessage": "Unauthorized. Signature"
        })))
        .mount(&server)
        .await;

    let session = session(&server.uri());
    let err = session
        .post::<_, Value>(INQUIRY_PATH, &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolRejection);
}

#[tokio::test]
async fn slow_bank_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut config = bank_config(&server.uri());
    config.request_timeout_secs = 1;
    let err = client(&config).request_access_token().await.unwrap_err();
    assert!(matches!(err, Error::Http(_)));
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn concurrent_calls_share_one_token_request() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(INQUIRY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "responseCode": "2002400" })))
        .expect(16)
        .mount(&server)
        .await;

    let session = Arc::new(SnapSession::new(
        client(&bank_config(&server.uri())),
        &TokenConfig::default(),
    ));
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let session = session.clone();
        tasks.spawn(async move { session.get::<Value>(INQUIRY_PATH).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().is_ok());
    }
}

#[tokio::test]
async fn create_virtual_account_registers_expiry() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(CREATE_VA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": "2002700",
            "responseMessage": "Successful",
            "virtualAccountData": { "virtualAccountNo": "   123450001" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryReservationStore::new());
    let config = WatcherConfig::default();
    let watcher = ExpiryWatcher::new(store.clone(), &config);
    let service = VirtualAccountService::new(
        Arc::new(session(&server.uri())),
        store.clone(),
        watcher.clone(),
        "12345",
        &config,
    );

    let reservation = service
        .create(NewVirtualAccount {
            transaction_id: "trx-va-1".to_string(),
            customer_no: "0001".to_string(),
            customer_name: "Budi Santoso".to_string(),
            amount: Decimal::new(150_000, 0),
            currency: "IDR".to_string(),
            validity: Some(Duration::from_secs(3600)),
        })
        .await
        .unwrap();

    assert_eq!(reservation.virtual_account_no, "123450001");
    assert_eq!(reservation.status, ReservationStatus::Pending);
    assert!(watcher.is_watched("trx-va-1"));
    let stored = store.find_by_transaction_id("trx-va-1").await.unwrap();
    assert!(stored.is_some());

    let requests = server.received_requests().await.unwrap();
    let create = requests
        .iter()
        .find(|r| r.url.path() == CREATE_VA_PATH)
        .unwrap();
    let body: Value = serde_json::from_slice(&create.body).unwrap();
    assert_eq!(body["trxId"], "trx-va-1");
    assert_eq!(body["totalAmount"]["value"], "150000.00");
    assert!(body["expiredDate"].as_str().unwrap().ends_with("+07:00"));
}

#[tokio::test]
async fn failed_create_persists_nothing() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(CREATE_VA_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "responseCode": "4092701",
            "responseMessage": "Duplicate partnerReferenceNo"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryReservationStore::new());
    let config = WatcherConfig::default();
    let watcher = ExpiryWatcher::new(store.clone(), &config);
    let service = VirtualAccountService::new(
        Arc::new(session(&server.uri())),
        store.clone(),
        watcher.clone(),
        "12345",
        &config,
    );

    let err = service
        .create(NewVirtualAccount {
            transaction_id: "trx-va-2".to_string(),
            customer_no: "0002".to_string(),
            customer_name: "Siti".to_string(),
            amount: Decimal::new(50_000, 0),
            currency: "IDR".to_string(),
            validity: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolRejection);
    assert!(store.find_by_transaction_id("trx-va-2").await.unwrap().is_none());
    assert!(watcher.is_empty());
}

/// Log sink shared between a test and its subscriber
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn create_after_watcher_shutdown_warns_about_missing_countdown() {
    let logs = CapturedLogs::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || sink.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path(CREATE_VA_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "responseCode": "2002700",
            "responseMessage": "Successful"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryReservationStore::new());
    let config = WatcherConfig::default();
    let watcher = ExpiryWatcher::new(store.clone(), &config);
    let service = VirtualAccountService::new(
        Arc::new(session(&server.uri())),
        store.clone(),
        watcher.clone(),
        "12345",
        &config,
    );
    watcher.shutdown();

    let reservation = service
        .create(NewVirtualAccount {
            transaction_id: "trx-va-3".to_string(),
            customer_no: "0003".to_string(),
            customer_name: "Andi".to_string(),
            amount: Decimal::new(75_000, 0),
            currency: "IDR".to_string(),
            validity: None,
        })
        .await
        .unwrap();

    assert_eq!(reservation.status, ReservationStatus::Pending);
    assert!(!watcher.is_watched("trx-va-3"));
    assert!(store.find_by_transaction_id("trx-va-3").await.unwrap().is_some());
    assert!(logs
        .text()
        .contains("trx-va-3 is PENDING without an expiry countdown"));
}
