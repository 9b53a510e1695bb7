//! HTTP implementation of [`HermesApi`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tollgate_types::{ChainId, Identity, Promise, TokenAmount};
use tollgate_utils::{Attempt, RetryError, RetryPolicy};

use crate::api::{ConsumerData, HermesApi, ProviderData, RefreshPromiseRequest, RequestPromise};
use crate::error::{ErrorBody, HermesCause, HermesError};

/// Retries applied to calls hermes may rate limit.
pub fn rate_limit_retry() -> RetryPolicy {
    RetryPolicy::constant(Duration::from_millis(500), 3)
}

#[derive(Serialize)]
struct RevealRequest<'a> {
    r: &'a str,
    provider: &'a Identity,
    agreement_id: u128,
}

#[derive(Serialize)]
struct SyncPromiseRequest<'a> {
    promise: &'a Promise,
    provider: &'a Identity,
    #[serde(with = "tollgate_types::hex_bytes")]
    signature: Vec<u8>,
}

#[derive(Serialize)]
struct ChangeFeeRequest<'a> {
    promise: &'a Promise,
    new_fee: TokenAmount,
}

/// HTTP client for one hermes instance.
///
/// Wraps `reqwest::Client` with the hermes base URL. Promise requests and
/// reveals are retried while hermes reports too many simultaneous requests.
#[derive(Clone)]
pub struct HermesCaller {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HermesCaller {
    /// Create a caller targeting the given base URL (e.g. `https://hermes.example/api/v2`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HermesError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HermesError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            retry: rate_limit_retry(),
        })
    }

    /// Replace the rate-limit retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Turn a non-success response into a classified error.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, HermesError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) if !parsed.cause.is_empty() => Err(parsed.into_error()),
            _ if status == reqwest::StatusCode::NOT_FOUND => {
                Err(HermesError::remote(HermesCause::NotFound, body))
            }
            _ => Err(HermesError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, HermesError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| HermesError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HermesError> {
        response
            .json()
            .await
            .map_err(|e| HermesError::Decode(e.to_string()))
    }

    /// GET a per-chain ledger map and pick the entry for `chain_id`.
    async fn ledger_entry(
        &self,
        kind: &str,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ConsumerData, HermesError> {
        let response = self
            .http
            .get(self.url(&format!("data/{kind}/{identity}")))
            .send()
            .await
            .map_err(|e| HermesError::Transport(e.to_string()))?;
        let response = Self::check(response).await?;

        let mut by_chain: HashMap<ChainId, ConsumerData> = Self::decode(response).await?;
        by_chain.remove(&chain_id).ok_or_else(|| {
            HermesError::remote(
                HermesCause::NotFound,
                format!("no {kind} data for {identity} on chain {chain_id}"),
            )
        })
    }

    /// POST with the rate-limit retry policy.
    async fn post_retrying<B, T>(&self, path: &str, body: &B) -> Result<T, HermesError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Send,
    {
        self.retry
            .run(move || async move {
                let response = self.post(path, body).await.map_err(classify)?;
                Self::decode(response).await.map_err(Attempt::Abort)
            })
            .await
            .map_err(unwrap_retry)
    }
}

fn classify(err: HermesError) -> Attempt<HermesError> {
    if err.is(HermesCause::TooManyRequests) {
        Attempt::Retry(err)
    } else {
        Attempt::Abort(err)
    }
}

fn unwrap_retry(err: RetryError<HermesError>) -> HermesError {
    err.into_inner()
        .unwrap_or_else(|| HermesError::Transport("request canceled".into()))
}

#[async_trait]
impl HermesApi for HermesCaller {
    async fn request_promise(&self, request: &RequestPromise) -> Result<Promise, HermesError> {
        self.post_retrying("request_promise", request).await
    }

    async fn pay_and_settle(&self, request: &RequestPromise) -> Result<Promise, HermesError> {
        self.post_retrying("pay_and_settle", request).await
    }

    async fn reveal_r(
        &self,
        r: &str,
        provider: &Identity,
        agreement_id: u128,
    ) -> Result<(), HermesError> {
        let body = RevealRequest {
            r,
            provider,
            agreement_id,
        };
        let body = &body;
        self.retry
            .run(move || async move {
                self.post("reveal_r", body).await.map_err(classify)?;
                Ok(())
            })
            .await
            .map_err(unwrap_retry)
    }

    async fn update_promise_fee(
        &self,
        promise: &Promise,
        new_fee: TokenAmount,
    ) -> Result<Promise, HermesError> {
        let body = ChangeFeeRequest { promise, new_fee };
        let response = self.post("change_promise_fee", &body).await?;
        Self::decode(response).await
    }

    async fn get_consumer_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ConsumerData, HermesError> {
        self.ledger_entry("consumer", chain_id, identity).await
    }

    async fn get_provider_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ProviderData, HermesError> {
        self.ledger_entry("provider", chain_id, identity).await
    }

    async fn sync_promise(
        &self,
        promise: &Promise,
        provider: &Identity,
        signature: &[u8],
    ) -> Result<(), HermesError> {
        let body = SyncPromiseRequest {
            promise,
            provider,
            signature: signature.to_vec(),
        };
        self.post("sync_promise", &body).await?;
        Ok(())
    }

    async fn refresh_promise(
        &self,
        request: &RefreshPromiseRequest,
    ) -> Result<Promise, HermesError> {
        self.post_retrying("refresh_promise", request).await
    }
}
