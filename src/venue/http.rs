//! HTTP venue adapter
//!
//! Wire (consumed, JSON):
//! - `GET /quote?fromToken&toToken&amount` -> `{outputAmount, route, priceImpact?}`
//! - `POST /swap {fromToken, toToken, amount, minOutput}` -> `{txHash, outputAmount}`
//! - `GET /token/{address}` -> `{name, symbol, decimals, total_supply?}`
//!
//! Every public call runs under one 30 s total deadline. Transport errors,
//! 5xx and 429 retry up to 3 attempts with linear 1 s x attempt back-off.

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::{TokenInfo, VenueClient, VenueError, VenueQuote, VenueSwap};

const TOTAL_DEADLINE: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

pub struct HttpVenueClient {
    name: String,
    network: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(rename = "outputAmount")]
    output_amount: String,
    #[serde(default)]
    route: Vec<Value>,
    #[serde(rename = "priceImpact")]
    price_impact: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    #[serde(rename = "txHash")]
    tx_hash: String,
    #[serde(rename = "outputAmount")]
    output_amount: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    name: String,
    symbol: String,
    decimals: u32,
    total_supply: Option<String>,
}

impl HttpVenueClient {
    pub fn new(name: &str, network: &str, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TOTAL_DEADLINE)
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            network: network.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Run `op` under the retry policy and the total deadline.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let attempt_loop = async {
            let mut last = VenueError::Timeout;
            for attempt in 1..=MAX_ATTEMPTS {
                match op().await {
                    Ok(v) => return Ok(v),
                    Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                        warn!(venue = %self.name, attempt, "{} failed, retrying: {}", what, e);
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                        last = e;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last)
        };
        tokio::time::timeout(TOTAL_DEADLINE, attempt_loop)
            .await
            .unwrap_or(Err(VenueError::Timeout))
    }

    fn map_transport(e: reqwest::Error) -> VenueError {
        if e.is_timeout() {
            VenueError::Timeout
        } else {
            VenueError::Transient(e.to_string())
        }
    }

    /// Shared status-code policy for all endpoints.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, VenueError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(VenueError::PairNotFound),
            StatusCode::UNAUTHORIZED => Err(VenueError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(VenueError::Transient(format!("429: {}", body)))
            }
            s if s.is_server_error() => Err(VenueError::Transient(format!("{}: {}", s, body))),
            s => {
                let detail = serde_json::from_str::<ErrorBody>(&body)
                    .map(|b| b.error)
                    .unwrap_or(body);
                Err(VenueError::Rejected(format!("{}: {}", s, detail)))
            }
        }
    }

    fn parse_decimal(raw: &str) -> Result<Decimal, VenueError> {
        raw.parse()
            .map_err(|_| VenueError::InvalidResponse(format!("bad amount: {}", raw)))
    }
}

#[async_trait]
impl VenueClient for HttpVenueClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<VenueQuote, VenueError> {
        let url = format!("{}/quote", self.base_url);
        self.with_retry("quote", || {
            let url = url.clone();
            async move {
                let resp = self
                    .client
                    .get(&url)
                    .query(&[
                        ("fromToken", from),
                        ("toToken", to),
                        ("amount", &amount.to_string()),
                    ])
                    .send()
                    .await
                    .map_err(Self::map_transport)?;
                let resp = Self::check_status(resp).await?;
                let body: QuoteResponse = resp
                    .json()
                    .await
                    .map_err(|e| VenueError::InvalidResponse(e.to_string()))?;
                Ok(VenueQuote {
                    output_amount: Self::parse_decimal(&body.output_amount)?,
                    route: body.route,
                    price_impact: body.price_impact,
                })
            }
        })
        .await
    }

    async fn swap(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        min_output: Decimal,
    ) -> Result<VenueSwap, VenueError> {
        let url = format!("{}/swap", self.base_url);
        let payload = serde_json::json!({
            "fromToken": from,
            "toToken": to,
            "amount": amount.to_string(),
            "minOutput": min_output.to_string(),
        });
        self.with_retry("swap", || {
            let url = url.clone();
            let payload = payload.clone();
            async move {
                let resp = self
                    .client
                    .post(&url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(Self::map_transport)?;
                let resp = Self::check_status(resp).await?;
                let body: SwapResponse = resp
                    .json()
                    .await
                    .map_err(|e| VenueError::InvalidResponse(e.to_string()))?;
                Ok(VenueSwap {
                    tx_hash: body.tx_hash,
                    output_amount: Self::parse_decimal(&body.output_amount)?,
                })
            }
        })
        .await
    }

    async fn token_info(&self, address: &str) -> Result<TokenInfo, VenueError> {
        let url = format!("{}/token/{}", self.base_url, address);
        let info = self
            .with_retry("token_info", || {
                let url = url.clone();
                async move {
                    let resp = self
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(Self::map_transport)?;
                    let resp = Self::check_status(resp).await?;
                    resp.json::<TokenResponse>()
                        .await
                        .map_err(|e| VenueError::InvalidResponse(e.to_string()))
                }
            })
            .await
            .map_err(|e| match e {
                // a 404 here is about the token, not a pair
                VenueError::PairNotFound => VenueError::TokenNotFound(address.to_string()),
                other => other,
            })?;
        Ok(TokenInfo {
            address: address.to_string(),
            name: info.name,
            symbol: info.symbol,
            decimals: info.decimals,
            total_supply: info.total_supply,
            network: self.network.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VenueError::Timeout.is_retryable());
        assert!(VenueError::Transient("503".into()).is_retryable());
        assert!(!VenueError::PairNotFound.is_retryable());
        assert!(!VenueError::Rejected("400".into()).is_retryable());
        assert!(!VenueError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_quote_response_shape() {
        let body: QuoteResponse = serde_json::from_str(
            r#"{"outputAmount": "103.5", "route": [{"pool": "a/b"}], "priceImpact": 0.2}"#,
        )
        .unwrap();
        assert_eq!(body.output_amount, "103.5");
        assert_eq!(body.route.len(), 1);

        // route and priceImpact are optional on the wire
        let sparse: QuoteResponse = serde_json::from_str(r#"{"outputAmount": "1"}"#).unwrap();
        assert!(sparse.route.is_empty());
        assert!(sparse.price_impact.is_none());
    }
}
