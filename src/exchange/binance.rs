// =============================================================================
// Binance USDⓈ-M Futures Adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the fleet and Binance servers.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, warn};

use super::{
    AccountState, Exchange, ExchangeError, OrderRequest, OrderResult, Position, PositionSide,
};
use crate::types::{MarginMode, OrderSide};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";

/// Binance code meaning the margin type is already what we asked for.
const NO_NEED_TO_CHANGE_MARGIN_TYPE: i64 = -4046;

/// Binance futures REST adapter with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFutures {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_BASE } else { MAINNET_BASE };
        debug!(base_url, "BinanceFutures adapter initialised");

        Self {
            api_key,
            secret,
            base_url: base_url.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing + error classification
    // -------------------------------------------------------------------------

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Transient(format!("{path} timed out"))
                } else {
                    ExchangeError::Transient(format!("{path} request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("{path} body unreadable: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        Err(Self::classify_error(path, status, &body))
    }

    fn classify_error(path: &str, status: StatusCode, body: &serde_json::Value) -> ExchangeError {
        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();
        let detail = format!("{path} returned {status} (code {code}): {msg}");

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return ExchangeError::RateLimited(detail);
        }
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || code == -2014
            || code == -2015
        {
            return ExchangeError::Auth(detail);
        }
        if status.is_server_error() {
            return ExchangeError::Transient(detail);
        }
        if code != 0 {
            return ExchangeError::MarketRule { code, message: msg };
        }
        ExchangeError::Permanent(detail)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    /// GET /fapi/v2/account (signed).
    async fn get_account(&self) -> Result<AccountState, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", "")
            .await?;

        let total_equity = Self::parse_str_f64(&body["totalMarginBalance"]);
        let available_balance = Self::parse_str_f64(&body["availableBalance"]);
        let unrealized_pnl = Self::parse_str_f64(&body["totalUnrealizedProfit"]);
        let margin_used = Self::parse_str_f64(&body["totalInitialMargin"]);

        let position_count = body["positions"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|p| Self::parse_str_f64(&p["positionAmt"]).abs() > 0.0)
                    .count()
            })
            .unwrap_or(0);

        let margin_used_pct = if total_equity > 0.0 {
            (margin_used / total_equity) * 100.0
        } else {
            0.0
        };

        debug!(total_equity, available_balance, position_count, "account fetched");

        Ok(AccountState {
            total_equity,
            available_balance,
            margin_used_pct,
            position_count,
            // Binance does not report session realized PnL on this endpoint.
            realized_pnl: 0.0,
            unrealized_pnl,
        })
    }

    /// GET /fapi/v1/premiumIndex (public — no signature required).
    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={symbol}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("premiumIndex request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("premiumIndex body unreadable: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_error("/fapi/v1/premiumIndex", status, &body));
        }

        let mark = Self::parse_str_f64(&body["markPrice"]);
        if mark <= 0.0 {
            return Err(ExchangeError::Permanent(format!(
                "no mark price reported for {symbol}"
            )));
        }
        Ok(mark)
    }

    /// GET /fapi/v2/positionRisk (signed).
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Permanent("positionRisk is not an array".into()))?;

        let mut positions = Vec::new();
        for entry in raw {
            let amt = Self::parse_str_f64(&entry["positionAmt"]);
            if amt.abs() == 0.0 {
                continue;
            }
            let side = if amt > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            positions.push(Position {
                symbol: entry["symbol"].as_str().unwrap_or("").to_string(),
                side,
                quantity: amt.abs(),
                entry_price: Self::parse_str_f64(&entry["entryPrice"]),
                mark_price: Self::parse_str_f64(&entry["markPrice"]),
                unrealized_pnl: Self::parse_str_f64(&entry["unRealizedProfit"]),
                leverage: Self::parse_str_f64(&entry["leverage"]) as u32,
            });
        }

        debug!(count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    /// POST /fapi/v1/order (signed).
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&quantity={}",
            req.symbol, req.side, req.quantity
        );
        match req.price {
            Some(p) => params.push_str(&format!("&type=LIMIT&price={p}&timeInForce=GTC")),
            None => params.push_str("&type=MARKET"),
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(
            symbol = %req.symbol,
            side = %req.side,
            quantity = req.quantity,
            reduce_only = req.reduce_only,
            "placing order"
        );

        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        Ok(OrderResult {
            order_id: body["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            price: Self::parse_str_f64(&body["avgPrice"]),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    /// Reduce-only market order on the opposite side of the position.
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        let quantity = match quantity {
            Some(q) => q,
            None => {
                let positions = self.get_positions().await?;
                positions
                    .iter()
                    .find(|p| p.symbol == symbol && p.side == side)
                    .map(|p| p.quantity)
                    .unwrap_or(0.0)
            }
        };
        if quantity == 0.0 {
            return Err(ExchangeError::Permanent(format!(
                "no open {side} position on {symbol}"
            )));
        }

        let close_side = match side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };

        let params = format!(
            "symbol={symbol}&side={close_side}&type=MARKET&quantity={quantity}&reduceOnly=true"
        );
        let body = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        debug!(symbol, %side, quantity, "close order submitted");

        Ok(OrderResult {
            order_id: body["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            symbol: symbol.to_string(),
            side: close_side,
            quantity,
            price: Self::parse_str_f64(&body["avgPrice"]),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    /// POST /fapi/v1/leverage (signed).
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// POST /fapi/v1/marginType (signed). Already-set is not an error.
    async fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        let margin_type = match mode {
            MarginMode::Cross => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        };
        let params = format!("symbol={symbol}&marginType={margin_type}");
        match self
            .signed_request(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::MarketRule { code, .. })
                if code == NO_NEED_TO_CHANGE_MARGIN_TYPE =>
            {
                Ok(())
            }
            Err(e) => {
                warn!(symbol, %mode, error = %e, "failed to set margin mode");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let ex = BinanceFutures::new("key", "secret", false);
        let sig = ex.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig, ex.sign("symbol=BTCUSDT&side=BUY"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_carries_timestamp_and_signature() {
        let ex = BinanceFutures::new("key", "secret", false);
        let qs = ex.signed_query("symbol=ETHUSDT");
        assert!(qs.starts_with("symbol=ETHUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn testnet_flag_switches_base_url() {
        let mainnet = BinanceFutures::new("k", "s", false);
        let testnet = BinanceFutures::new("k", "s", true);
        assert_eq!(mainnet.base_url, MAINNET_BASE);
        assert_eq!(testnet.base_url, TESTNET_BASE);
    }

    #[test]
    fn error_classification_maps_codes() {
        let body = serde_json::json!({"code": -4061, "msg": "position side mismatch"});
        let err =
            BinanceFutures::classify_error("/fapi/v1/order", StatusCode::BAD_REQUEST, &body);
        assert!(err.is_position_side_mismatch());

        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient"});
        let err =
            BinanceFutures::classify_error("/fapi/v1/order", StatusCode::BAD_REQUEST, &body);
        assert!(err.is_insufficient_margin());

        let body = serde_json::json!({"code": -2015, "msg": "Invalid API-key"});
        let err = BinanceFutures::classify_error("/fapi/v2/account", StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, ExchangeError::Auth(_)));

        let body = serde_json::json!({});
        let err = BinanceFutures::classify_error(
            "/fapi/v2/account",
            StatusCode::INTERNAL_SERVER_ERROR,
            &body,
        );
        assert!(matches!(err, ExchangeError::Transient(_)));

        let err = BinanceFutures::classify_error(
            "/fapi/v2/account",
            StatusCode::TOO_MANY_REQUESTS,
            &body,
        );
        assert!(matches!(err, ExchangeError::RateLimited(_)));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let ex = BinanceFutures::new("my-api-key", "my-secret", false);
        let dbg = format!("{ex:?}");
        assert!(!dbg.contains("my-api-key"));
        assert!(!dbg.contains("my-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
