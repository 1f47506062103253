//! Noren REST client
//! Order placement, cancellation, order history and quotes over the jData/jKey form API

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{number_field, ApiError, BrokerGateway, Instrument, OrderRequest, OrderStatus, OrderStatusReport};
use crate::trading::TradingError;
use crate::utils::RateLimiter;

/// Account session used for every request
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub account_id: String,
    pub session_token: String,
}

/// Live broker gateway
pub struct NorenRestClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    /// `I` intraday, `C` delivery, `M` margin
    product_type: String,
    rate_limiter: RateLimiter,
}

impl NorenRestClient {
    /// Create new REST client with timeout
    pub fn new(base_url: &str, credentials: Credentials, product_type: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            product_type: product_type.to_string(),
            rate_limiter: RateLimiter::new_default(),
        })
    }

    /// POST `jData=<json>&jKey=<token>` and return the decoded body
    async fn post(&self, endpoint: &str, data: Value) -> Result<Value, ApiError> {
        self.rate_limiter.wait().await;

        let url = format!("{}/{}", self.base_url, endpoint);
        let body = format!("jData={}&jKey={}", data, self.credentials.session_token);
        debug!("POST {}", url);

        let response = self.client.post(&url).body(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(crate::api::sanitize_api_error(status.as_u16(), error_text));
        }

        Ok(response.json().await?)
    }
}

/// `stat` is "Ok" on success, anything else carries `emsg`
fn refusal(body: &Value) -> Option<String> {
    let object = match body {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match object.get("stat").and_then(Value::as_str) {
        Some("Ok") => None,
        _ => Some(
            object
                .get("emsg")
                .and_then(Value::as_str)
                .unwrap_or("request refused")
                .to_string(),
        ),
    }
}

#[async_trait]
impl BrokerGateway for NorenRestClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<String, TradingError> {
        let data = json!({
            "uid": self.credentials.user_id,
            "actid": self.credentials.account_id,
            "exch": order.instrument.exchange,
            "tsym": order.instrument.symbol,
            "qty": order.quantity.to_string(),
            "prc": format!("{}", order.order_type.price()),
            "prd": self.product_type,
            "trantype": order.transaction_code(),
            "prctyp": order.order_type.code(),
            "ret": "DAY",
            "remarks": order.remarks,
        });

        let body = self.post("PlaceOrder", data).await?;
        if let Some(reason) = refusal(&body) {
            warn!("❌ PlaceOrder refused: {}", reason);
            return Err(TradingError::OrderRejected { reason });
        }

        let order_ref = body
            .get("norenordno")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| TradingError::ApiError {
                status: 200,
                message: "PlaceOrder response without norenordno".to_string(),
            })?;

        info!(
            "📨 Order {} placed: {} {} x{} {}",
            order_ref,
            order.transaction_code(),
            order.instrument.symbol,
            order.quantity,
            order.order_type.code()
        );
        Ok(order_ref.to_string())
    }

    async fn cancel_order(&self, order_ref: &str) -> Result<(), TradingError> {
        let data = json!({
            "uid": self.credentials.user_id,
            "norenordno": order_ref,
        });

        let body = self.post("CancelOrder", data).await?;
        if let Some(reason) = refusal(&body) {
            debug!("CancelOrder {} refused: {}", order_ref, reason);
            return Err(TradingError::OrderNotFound {
                order_ref: order_ref.to_string(),
            });
        }
        Ok(())
    }

    async fn get_order_status(&self, order_ref: &str) -> Result<OrderStatusReport, TradingError> {
        let data = json!({
            "uid": self.credentials.user_id,
            "norenordno": order_ref,
        });

        let body = self.post("SingleOrdHist", data).await?;
        if let Some(reason) = refusal(&body) {
            debug!("SingleOrdHist {} refused: {}", order_ref, reason);
            return Err(TradingError::OrderNotFound {
                order_ref: order_ref.to_string(),
            });
        }

        // Newest entry first
        let latest = match &body {
            Value::Array(items) => items.first(),
            other => Some(other),
        }
        .ok_or_else(|| TradingError::OrderNotFound {
            order_ref: order_ref.to_string(),
        })?;

        let raw_status = latest.get("status").and_then(Value::as_str).unwrap_or_default();
        let status = OrderStatus::from_noren(raw_status).ok_or_else(|| TradingError::ApiError {
            status: 200,
            message: format!("unrecognised order status {:?} for {}", raw_status, order_ref),
        })?;

        let fill_price = if status == OrderStatus::Filled {
            number_field(latest, "avgprc")
                .or_else(|| number_field(latest, "flprc"))
                .filter(|p| *p > 0.0)
        } else {
            None
        };

        Ok(OrderStatusReport {
            status,
            fill_price,
            reason: latest
                .get("rejreason")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    async fn get_quote(&self, instrument: &Instrument) -> Result<f64, TradingError> {
        let data = json!({
            "uid": self.credentials.user_id,
            "exch": instrument.exchange,
            "token": instrument.token,
        });

        let body = self.post("GetQuotes", data).await?;
        if refusal(&body).is_some() {
            return Err(TradingError::QuoteUnavailable {
                instrument: instrument.to_string(),
            });
        }

        number_field(&body, "lp")
            .filter(|p| *p > 0.0)
            .ok_or_else(|| TradingError::QuoteUnavailable {
                instrument: instrument.to_string(),
            })
    }

    async fn search_symbol(&self, exchange: &str, text: &str) -> Result<Vec<Instrument>, TradingError> {
        let data = json!({
            "uid": self.credentials.user_id,
            "exch": exchange,
            "stext": text,
        });

        let body = self.post("SearchScrip", data).await?;
        // "no data" comes back as Not_Ok
        if let Some(reason) = refusal(&body) {
            debug!("SearchScrip {} {:?}: {}", exchange, text, reason);
            return Ok(Vec::new());
        }

        let values = body.get("values").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(values.iter().filter_map(scrip).collect())
    }
}

/// One `SearchScrip` row; rows missing a field are skipped
fn scrip(row: &Value) -> Option<Instrument> {
    let field = |key: &str| row.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
    Some(Instrument::new(field("exch")?, field("token")?, field("tsym")?))
}
