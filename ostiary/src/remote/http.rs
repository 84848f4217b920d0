//! Identity server calls over HTTP

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CredentialExchange, Credentials, RemoteError, TokenRenewer};
use crate::{AccessToken, CsrfTokenRef, SessionIdRef};

const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Deserialize)]
struct TokenResponse {
    token: AccessToken,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewRequest<'a> {
    session_id: &'a SessionIdRef,
}

/// Renews tokens by posting the session identifier to a renewal endpoint
#[derive(Clone, Debug)]
pub struct HttpTokenRenewer {
    client: reqwest::Client,
    renew_url: reqwest::Url,
}

impl HttpTokenRenewer {
    /// Constructs a renewer posting to `renew_url`
    ///
    /// Timeouts configured on `client` are the only timeouts applied.
    pub fn new(client: reqwest::Client, renew_url: reqwest::Url) -> Self {
        Self { client, renew_url }
    }
}

#[async_trait]
impl TokenRenewer for HttpTokenRenewer {
    #[tracing::instrument(err, skip(self, session_id), fields(renew_url = %self.renew_url))]
    async fn renew(&self, session_id: &SessionIdRef) -> Result<AccessToken, RemoteError> {
        tracing::trace!("requesting token renewal");

        let req = self
            .client
            .post(self.renew_url.clone())
            .json(&RenewRequest { session_id });

        request_token(req).await
    }
}

/// Exchanges credentials by posting them to a login endpoint
#[derive(Clone, Debug)]
pub struct HttpCredentialExchange {
    client: reqwest::Client,
    login_url: reqwest::Url,
}

impl HttpCredentialExchange {
    /// Constructs an exchange posting to `login_url`
    pub fn new(client: reqwest::Client, login_url: reqwest::Url) -> Self {
        Self { client, login_url }
    }
}

#[async_trait]
impl CredentialExchange for HttpCredentialExchange {
    #[tracing::instrument(err, skip(self, credentials, csrf_token), fields(login_url = %self.login_url))]
    async fn exchange(
        &self,
        credentials: &Credentials,
        csrf_token: &CsrfTokenRef,
    ) -> Result<AccessToken, RemoteError> {
        tracing::trace!("exchanging credentials");

        let req = self
            .client
            .post(self.login_url.clone())
            .header(CSRF_HEADER, csrf_token.as_str())
            .json(credentials);

        request_token(req).await
    }
}

async fn request_token(req: reqwest::RequestBuilder) -> Result<AccessToken, RemoteError> {
    let resp = req
        .send()
        .await
        .map_err(|e| RemoteError::transport(e.to_string()))?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received response from identity server"
    );

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteError::with_status(status.as_u16(), body));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| RemoteError::transport(e.to_string()))?;
    let resp: TokenResponse = serde_json::from_slice(&body)
        .map_err(|e| RemoteError::with_status(status.as_u16(), e.to_string()))?;

    Ok(resp.token)
}
