//! REST gateway tests against a mock Noren server

use order_executor::api::{search_instruments, OrderIntent, OrderRequest};
use order_executor::trading::classify_rejection;
use order_executor::*;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credentials() -> Credentials {
    Credentials {
        user_id: "FA1234".to_string(),
        account_id: "FA1234".to_string(),
        session_token: "session-token".to_string(),
    }
}

async fn client() -> (MockServer, NorenRestClient) {
    let server = MockServer::start().await;
    let client = NorenRestClient::new(&server.uri(), credentials(), "I").unwrap();
    (server, client)
}

fn buy_reliance() -> OrderRequest {
    OrderRequest {
        instrument: Instrument::new("NSE", "2885", "RELIANCE-EQ"),
        side: Side::Long,
        quantity: 10,
        order_type: OrderType::Market,
        intent: OrderIntent::Entry,
        remarks: "OE-Entry".to_string(),
    }
}

#[tokio::test]
async fn test_place_order_returns_order_ref() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/PlaceOrder"))
        .and(body_string_contains("jKey=session-token"))
        .and(body_string_contains("\"trantype\":\"B\""))
        .and(body_string_contains("\"tsym\":\"RELIANCE-EQ\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "request_time": "10:15:00 12-01-2024",
            "stat": "Ok",
            "norenordno": "24011200000007"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let order_ref = client.place_order(&buy_reliance()).await.unwrap();
    assert_eq!(order_ref, "24011200000007");
}

#[tokio::test]
async fn test_place_order_refusal_is_rejection() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/PlaceOrder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Not_Ok",
            "emsg": "RMS:Margin Exceeds,Required:25000.00, Available:1000.00"
        })))
        .mount(&server)
        .await;

    let err = client.place_order(&buy_reliance()).await.unwrap_err();
    assert_eq!(err.category(), "ORDER_REJECTED");
    assert!(!err.is_retryable());
    assert!(classify_rejection(&err.to_string()).is_some());
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/PlaceOrder"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = client.place_order(&buy_reliance()).await.unwrap_err();
    assert!(err.is_retryable());
    // The gateway may have forwarded the order
    assert!(!err.is_safe_to_resend());
}

#[tokio::test]
async fn test_missing_order_number_is_not_safe_to_resend() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/PlaceOrder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "stat": "Ok" })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client.place_order(&buy_reliance()).await.unwrap_err();
    assert!(!err.is_safe_to_resend());
}

#[tokio::test]
async fn test_connection_refused_is_safe_to_resend() {
    // Free a port so nothing is listening on it
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = NorenRestClient::new(&format!("http://127.0.0.1:{}", port), credentials(), "I").unwrap();
    let err = client.place_order(&buy_reliance()).await.unwrap_err();

    assert_eq!(err.category(), "UNREACHABLE");
    assert!(err.is_safe_to_resend());
}

#[tokio::test]
async fn test_order_history_reports_fill() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/SingleOrdHist"))
        .and(body_string_contains("\"norenordno\":\"24011200000007\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "stat": "Ok", "status": "COMPLETE", "avgprc": "98.40", "flprc": "98.40" },
            { "stat": "Ok", "status": "OPEN" }
        ])))
        .mount(&server)
        .await;

    let report = client.get_order_status("24011200000007").await.unwrap();
    assert_eq!(report.status, OrderStatus::Filled);
    assert_eq!(report.fill_price, Some(98.4));
}

#[tokio::test]
async fn test_order_history_rejection_reason() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/SingleOrdHist"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "stat": "Ok", "status": "REJECTED", "rejreason": "Market is closed" }
        ])))
        .mount(&server)
        .await;

    let report = client.get_order_status("9").await.unwrap();
    assert_eq!(report.status, OrderStatus::Rejected);
    assert_eq!(report.fill_price, None);
    assert_eq!(report.reason.as_deref(), Some("Market is closed"));
}

#[tokio::test]
async fn test_unknown_order_not_found() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/SingleOrdHist"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Not_Ok",
            "emsg": "Error Occurred : 5 \"no data\""
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/CancelOrder"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Not_Ok",
            "emsg": "Order not found"
        })))
        .mount(&server)
        .await;

    let err = client.get_order_status("404").await.unwrap_err();
    assert_eq!(err.category(), "ORDER_NOT_FOUND");
    let err = client.cancel_order("404").await.unwrap_err();
    assert_eq!(err.category(), "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_quote_reads_last_price() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/GetQuotes"))
        .and(body_string_contains("\"token\":\"2885\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Ok",
            "exch": "NSE",
            "tsym": "RELIANCE-EQ",
            "lp": "2501.35"
        })))
        .mount(&server)
        .await;

    let price = client.get_quote(&Instrument::new("NSE", "2885", "RELIANCE-EQ")).await.unwrap();
    assert_eq!(price, 2501.35);

    let missing = client.get_quote(&Instrument::new("NSE", "1", "UNKNOWN")).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_search_scrip_lists_instruments() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/SearchScrip"))
        .and(body_string_contains("\"stext\":\"RELIANCE\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Ok",
            "values": [
                { "exch": "NSE", "token": "2885", "tsym": "RELIANCE-EQ", "instname": "EQ" },
                { "exch": "NSE", "token": "15068", "tsym": "RELIANCE-BL", "instname": "EQ" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/SearchScrip"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "stat": "Not_Ok",
            "emsg": "Error Occurred : 5 \"no data\""
        })))
        .mount(&server)
        .await;

    let found = client.search_symbol("NSE", "RELIANCE").await.unwrap();
    assert_eq!(
        found,
        vec![
            Instrument::new("NSE", "2885", "RELIANCE-EQ"),
            Instrument::new("NSE", "15068", "RELIANCE-BL"),
        ]
    );

    // Lower-case text misses, the upper-case retry hits
    let found = search_instruments(&client, "reliance").await.unwrap();
    assert_eq!(found[0].symbol, "RELIANCE-EQ");

    assert!(client.search_symbol("BSE", "NOPE").await.unwrap().is_empty());
}
