//! The HTTP transport used to reach identity providers

use std::{error, sync::Arc};

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A PEM-encoded client certificate and private key
#[derive(Clone)]
pub struct ClientCertificate {
    pem: Arc<[u8]>,
}

impl ClientCertificate {
    /// Wraps a PEM bundle holding a certificate chain and its private key
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        let pem: Vec<u8> = pem.into();
        Self { pem: pem.into() }
    }

    /// The PEM bundle
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }
}

impl std::fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientCertificate(***)")
    }
}

/// An outgoing HTTP request
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// The method
    pub method: Method,
    /// The target
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// The body, if any
    pub body: Option<Vec<u8>>,
    /// A client certificate to present, if any
    pub certificate: Option<ClientCertificate>,
}

impl HttpRequest {
    /// A `POST` of a form-encoded body
    pub fn post_form(url: Url, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        Self {
            method: Method::POST,
            url,
            headers,
            body: Some(body.into_bytes()),
            certificate: None,
        }
    }
}

/// A received HTTP response
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// The status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// The body
    pub body: Vec<u8>,
}

/// A transport failure
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The caller cancelled the request
    #[error("request was cancelled")]
    Cancelled,
    /// The request could not be built
    #[error("invalid request")]
    InvalidRequest(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The request could not be delivered or its response not read
    #[error("transport failure")]
    Transport(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// Sends HTTP requests
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Sends `request`, giving up if `cancel` fires first
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, NetworkError>;
}

#[cfg(feature = "reqwest")]
mod reqwest_client {
    use super::*;

    /// A network client backed by [`reqwest`]
    #[derive(Clone, Debug, Default)]
    pub struct ReqwestNetworkClient {
        client: reqwest::Client,
    }

    impl ReqwestNetworkClient {
        /// Constructs a network client over an existing `reqwest` client
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }

        fn client_for(&self, request: &HttpRequest) -> Result<reqwest::Client, NetworkError> {
            match &request.certificate {
                None => Ok(self.client.clone()),
                Some(certificate) => {
                    let identity = reqwest::Identity::from_pem(certificate.pem())
                        .map_err(|e| NetworkError::InvalidRequest(e.into()))?;
                    reqwest::Client::builder()
                        .identity(identity)
                        .build()
                        .map_err(|e| NetworkError::InvalidRequest(e.into()))
                }
            }
        }
    }

    #[async_trait]
    impl NetworkClient for ReqwestNetworkClient {
        #[tracing::instrument(
            skip(self, request, cancel),
            fields(method = %request.method, url = %request.url),
        )]
        async fn send(
            &self,
            request: HttpRequest,
            cancel: &CancellationToken,
        ) -> Result<HttpResponse, NetworkError> {
            let client = self.client_for(&request)?;
            let mut builder = client
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let exchange = async {
                let resp = builder
                    .send()
                    .await
                    .map_err(|e| NetworkError::Transport(e.into()))?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| NetworkError::Transport(e.into()))?;
                tracing::debug!(response.status = status.as_u16(), "received response");
                Ok(HttpResponse {
                    status,
                    headers,
                    body: body.to_vec(),
                })
            };

            tokio::select! {
                _ = cancel.cancelled() => Err(NetworkError::Cancelled),
                result = exchange => result,
            }
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestNetworkClient;
