//! Authenticated JSON/bytes client shared by the HTTP providers.

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;

use ferry_core::error::{FerryError, FerryResult};
use ferry_core::RequestPolicy;

/// How requests are authenticated.
pub enum HttpAuth {
    None,
    Bearer(SecretString),
    Basic {
        username: SecretString,
        password: SecretString,
    },
}

/// reqwest client bound to one provider account.
///
/// Every call goes through the account's [`RequestPolicy`], so it is paced by
/// the rate limiter and retried on transient failures.
pub struct ProviderClient {
    client: Client,
    auth: HttpAuth,
    policy: RequestPolicy,
    context: &'static str,
}

impl ProviderClient {
    /// `context` names the provider in errors and logs.
    pub fn new(
        context: &'static str,
        auth: HttpAuth,
        policy: RequestPolicy,
        timeout: Duration,
    ) -> FerryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                FerryError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            auth,
            policy,
            context,
        })
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T>(&self, url: &str, query: &[(&str, String)]) -> FerryResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.policy
            .execute(self.context, || async move {
                let response = self.send(self.client.get(url).query(query)).await?;
                self.decode(response).await
            })
            .await
    }

    /// GET `url` and return the raw body.
    pub async fn get_bytes(&self, url: &str) -> FerryResult<Vec<u8>> {
        self.policy
            .execute(self.context, || async move {
                let response = self.send(self.client.get(url)).await?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(self.context, e))?;
                Ok(bytes.to_vec())
            })
            .await
    }

    /// POST a form and decode the JSON body.
    pub async fn post_form<T>(&self, url: &str, form: &[(&str, &str)]) -> FerryResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.policy
            .execute(self.context, || async move {
                let response = self.send(self.client.post(url).form(form)).await?;
                self.decode(response).await
            })
            .await
    }

    async fn send(&self, request: RequestBuilder) -> FerryResult<Response> {
        let request = match &self.auth {
            HttpAuth::None => request,
            HttpAuth::Bearer(token) => request.bearer_auth(token.expose_secret()),
            HttpAuth::Basic { username, password } => {
                request.basic_auth(username.expose_secret(), Some(password.expose_secret()))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(self.context, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        tracing::debug!(provider = self.context, status = status.as_u16(), "request rejected");
        Err(FerryError::from_http_status(
            status.as_u16(),
            self.context,
            retry_after,
        ))
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> FerryResult<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(self.context, e))?;
        serde_json::from_slice(&body).map_err(|e| {
            FerryError::parse(format!("{} returned an unexpected payload: {}", self.context, e))
        })
    }
}

/// Map a transport failure without leaking the URL, which may carry ids.
fn transport_error(context: &str, err: reqwest::Error) -> FerryError {
    let err = err.without_url();
    if err.is_timeout() {
        FerryError::Timeout(format!("{} request timed out", context))
    } else {
        FerryError::network_with_source(format!("{} request failed", context), err)
    }
}
