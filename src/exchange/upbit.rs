//! Upbit REST Adapter
//!
//! Implements [`ExchangeApi`] against the Upbit spot API. Authenticated
//! requests carry a JWT whose payload includes the access key, a random
//! nonce, and a SHA-512 hash of the exact query string sent with the
//! request.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::sync::watch;
use uuid::Uuid;

use super::{ExchangeApi, ExchangeError, OrderInfo, OrderSide};
use crate::exchange::ws;

const REST_BASE: &str = "https://api.upbit.com/v1";

#[derive(Serialize)]
struct AuthClaims<'a> {
    access_key: &'a str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(with = "rust_decimal::serde::float")]
    trade_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct Account {
    currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    name: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    market: &'a str,
    side: &'a str,
    volume: String,
    price: String,
    ord_type: &'a str,
}

pub struct UpbitClient {
    http: reqwest::Client,
    access_key: String,
    secret_key: String,
    base_url: String,
}

impl UpbitClient {
    pub fn new(access_key: &str, secret_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            base_url: REST_BASE.to_string(),
        }
    }

    /// Signed JWT for the Authorization header. `query` must be the exact
    /// query string (or urlencoded body parameters) sent with the request.
    fn auth_token(&self, query: Option<&str>) -> Result<String, ExchangeError> {
        let query_hash = query.map(|q| {
            let mut hasher = Sha512::new();
            hasher.update(q.as_bytes());
            hex::encode(hasher.finalize())
        });

        let claims = AuthClaims {
            access_key: &self.access_key,
            nonce: Uuid::new_v4().to_string(),
            query_hash_alg: query_hash.as_ref().map(|_| "SHA512"),
            query_hash,
        };

        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(e.to_string()))
    }

    async fn read_error(response: reqwest::Response) -> ExchangeError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| format!("{}: {}", b.error.name, b.error.message))
            .unwrap_or(body);
        ExchangeError::Api { status, message }
    }

    async fn get_authed<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let token = self.auth_token(Some(query))?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self.http.get(url).bearer_auth(token).send().await?;
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::read_error(response).await)
        }
    }

    async fn place_order(
        &self,
        market: &str,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String, ExchangeError> {
        let side_str = match side {
            OrderSide::Bid => "bid",
            OrderSide::Ask => "ask",
        };
        let price_str = price.to_string();
        let volume_str = volume.to_string();

        // The hash covers the urlencoded parameters; the request itself
        // carries the same values as a JSON body.
        let query = format!(
            "market={market}&ord_type=limit&price={price_str}&side={side_str}&volume={volume_str}"
        );
        let token = self.auth_token(Some(&query))?;

        let body = PlaceOrderBody {
            market,
            side: side_str,
            volume: volume_str,
            price: price_str,
            ord_type: "limit",
        };

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            let created: OrderCreated = response.json().await?;
            Ok(created.uuid)
        } else {
            match Self::read_error(response).await {
                ExchangeError::Api { message, .. } => Err(ExchangeError::Rejected(message)),
                other => Err(other),
            }
        }
    }
}

#[async_trait]
impl ExchangeApi for UpbitClient {
    async fn current_price(&self, market: &str) -> Result<Option<Decimal>, ExchangeError> {
        let url = format!("{}/ticker?markets={}", self.base_url, market);
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let ticks: Vec<TickerData> = response.json().await?;
        Ok(ticks.first().map(|t| t.trade_price))
    }

    async fn place_buy(
        &self,
        market: &str,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String, ExchangeError> {
        self.place_order(market, OrderSide::Bid, price, volume).await
    }

    async fn place_sell(
        &self,
        market: &str,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String, ExchangeError> {
        self.place_order(market, OrderSide::Ask, price, volume).await
    }

    async fn cancel(&self, order_id: &str) -> Result<bool, ExchangeError> {
        let query = format!("uuid={order_id}");
        let token = self.auth_token(Some(&query))?;
        let url = format!("{}/order?{}", self.base_url, query);
        let response = self.http.delete(url).bearer_auth(token).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::read_error(response).await),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<Option<OrderInfo>, ExchangeError> {
        let query = format!("uuid={order_id}");
        let token = self.auth_token(Some(&query))?;
        let url = format!("{}/order?{}", self.base_url, query);
        let response = self.http.get(url).bearer_auth(token).send().await?;
        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            // Not-yet-visible ids are a normal race, not an error.
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::read_error(response).await),
        }
    }

    async fn open_orders(&self, market: &str) -> Result<Vec<OrderInfo>, ExchangeError> {
        let query = format!("limit=100&market={market}&page=1&state=wait");
        self.get_authed("/orders", &query).await
    }

    async fn completed_orders(
        &self,
        market: &str,
        limit: u32,
    ) -> Result<Vec<OrderInfo>, ExchangeError> {
        let query = format!("limit={limit}&market={market}&order_by=desc&page=1&state=done");
        self.get_authed("/orders", &query).await
    }

    async fn free_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let accounts: Vec<Account> = {
            let token = self.auth_token(None)?;
            let url = format!("{}/accounts", self.base_url);
            let response = self.http.get(url).bearer_auth(token).send().await?;
            if response.status().is_success() {
                response.json().await?
            } else {
                return Err(Self::read_error(response).await);
            }
        };
        Ok(accounts
            .iter()
            .find(|a| a.currency == currency)
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn total_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let token = self.auth_token(None)?;
        let url = format!("{}/accounts", self.base_url);
        let response = self.http.get(url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let accounts: Vec<Account> = response.json().await?;
        Ok(accounts
            .iter()
            .find(|a| a.currency == currency)
            .map(|a| a.balance + a.locked)
            .unwrap_or(Decimal::ZERO))
    }

    fn subscribe_price(&self, market: &str) -> watch::Receiver<Option<Decimal>> {
        ws::spawn_price_stream(market.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn client() -> UpbitClient {
        UpbitClient::new("test-access", "test-secret")
    }

    fn decode_claims(token: &str) -> serde_json::Value {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        decode::<serde_json::Value>(
            token,
            &DecodingKey::from_secret(b"test-secret"),
            &validation,
        )
        .unwrap()
        .claims
    }

    #[test]
    fn test_auth_token_without_query() {
        let token = client().auth_token(None).unwrap();
        let claims = decode_claims(&token);
        assert_eq!(claims["access_key"], "test-access");
        assert!(claims["nonce"].is_string());
        assert!(claims.get("query_hash").is_none());
    }

    #[test]
    fn test_auth_token_hashes_query() {
        let query = "uuid=abc-123";
        let token = client().auth_token(Some(query)).unwrap();
        let claims = decode_claims(&token);

        let mut hasher = Sha512::new();
        hasher.update(query.as_bytes());
        let expected = hex::encode(hasher.finalize());

        assert_eq!(claims["query_hash"], expected.as_str());
        assert_eq!(claims["query_hash_alg"], "SHA512");
    }

    #[test]
    fn test_ticker_parse() {
        let raw = r#"[{"market":"KRW-USDT","trade_price":1450.0,"trade_volume":12.3}]"#;
        let ticks: Vec<TickerData> = serde_json::from_str(raw).unwrap();
        assert_eq!(ticks[0].trade_price.to_string(), "1450");
    }

    #[test]
    fn test_account_parse() {
        let raw = r#"[{"currency":"KRW","balance":"1000000.0","locked":"5000.0","avg_buy_price":"0"}]"#;
        let accounts: Vec<Account> = serde_json::from_str(raw).unwrap();
        assert_eq!(accounts[0].currency, "KRW");
        assert_eq!(
            accounts[0].balance + accounts[0].locked,
            "1005000.0".parse().unwrap()
        );
    }

    #[test]
    fn test_error_body_parse() {
        let raw = r#"{"error":{"name":"insufficient_funds_bid","message":"not enough funds"}}"#;
        let body: ApiErrorBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.error.name, "insufficient_funds_bid");
        assert_eq!(body.error.message, "not enough funds");
    }
}
