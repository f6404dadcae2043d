use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use http::{Request, Response};
use serde_json::Value as Json;
use url::Url;

use crate::error::{self, ErrorKind};

/// Generic HTTP client.
///
/// A trait is used here so to facilitate native HTTP/TLS when compiled for mobile applications.
#[async_trait]
pub trait AsyncHttpClient: Send + Sync {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

pub(crate) fn base_request() -> http::request::Builder {
    Request::builder().header("Accept", "application/json")
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}

async fn get(http_client: &dyn AsyncHttpClient, url: &Url) -> Result<Vec<u8>> {
    let request = base_request()
        .method("GET")
        .uri(url.as_str())
        .body(vec![])
        .context("failed to build request")?;

    let response = http_client
        .execute(request)
        .await
        .context(format!("failed to make request to '{url}'"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("'{url}' responded with {status}")
    }

    Ok(response.into_body())
}

/// Fetch a JSON document.
pub async fn get_json(http_client: &dyn AsyncHttpClient, url: &Url) -> error::Result<Json> {
    let body = get(http_client, url).await.fetch()?;
    serde_json::from_slice(&body)
        .context(format!("'{url}' did not return JSON"))
        .fetch()
}

/// Fetch a document as raw text, e.g. a compact JWT.
pub async fn get_text(http_client: &dyn AsyncHttpClient, url: &Url) -> error::Result<String> {
    let body = get(http_client, url).await.fetch()?;
    String::from_utf8(body)
        .context(format!("'{url}' did not return UTF-8 text"))
        .fetch()
}

/// Resolve a value that is either passed inline or by a URL pointing at it.
///
/// The reference takes precedence when both are present. Returns `None` if neither is.
pub async fn fetch_by_reference_or_use_by_value(
    http_client: &dyn AsyncHttpClient,
    reference: Option<&str>,
    value: Option<&Json>,
) -> error::Result<Option<Json>> {
    match (reference, value) {
        (Some(reference), _) => {
            let url = Url::parse(reference)
                .context(format!("invalid reference '{reference}'"))
                .fetch()?;
            get_json(http_client, &url).await.map(Some)
        }
        (None, Some(value)) => Ok(Some(value.clone())),
        (None, None) => Ok(None),
    }
}

/// POST a JSON body using a bearer token, accepting only `200` and `201`.
pub async fn post_with_bearer_token(
    http_client: &dyn AsyncHttpClient,
    url: &Url,
    body: &Json,
    bearer_token: &str,
) -> error::Result<Json> {
    let request = base_request()
        .method("POST")
        .uri(url.as_str())
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {bearer_token}"))
        .body(serde_json::to_vec(body).context("failed to serialize body").fetch()?)
        .context("failed to build request")
        .fetch()?;

    let response = http_client
        .execute(request)
        .await
        .context(format!("failed to make request to '{url}'"))
        .fetch()?;

    let status = response.status().as_u16();
    if status != 200 && status != 201 {
        return Err(error::Error::ExternalFetchFailure(format!(
            "'{url}' responded with {status}"
        )));
    }

    serde_json::from_slice(response.body())
        .context(format!("'{url}' did not return JSON"))
        .fetch()
}

/// POST a form encoded body, accepting any 2xx or 3xx status.
pub async fn post_form(
    http_client: &dyn AsyncHttpClient,
    url: &Url,
    form: &[(String, String)],
) -> error::Result<Response<Vec<u8>>> {
    let body = serde_urlencoded::to_string(form)
        .context("failed to encode form")
        .fetch()?;

    let request = base_request()
        .method("POST")
        .uri(url.as_str())
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body.into_bytes())
        .context("failed to build request")
        .fetch()?;

    let response = http_client
        .execute(request)
        .await
        .context(format!("failed to make request to '{url}'"))
        .fetch()?;

    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        return Err(error::Error::ExternalFetchFailure(format!(
            "'{url}' responded with {status}"
        )));
    }

    Ok(response)
}

/// An in-memory [`AsyncHttpClient`] for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use super::*;

    /// Serves canned bodies by URL and records every request it receives.
    #[derive(Default)]
    pub struct MockHttpClient {
        routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
        pub requests: Mutex<Vec<Request<Vec<u8>>>>,
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl MockHttpClient {
        pub fn with_json(self, url: &str, body: Json) -> Self {
            self.serve_json(url, body);
            self
        }

        pub fn with_status(self, url: &str, status: u16, body: &str) -> Self {
            self.serve(url, status, body);
            self
        }

        pub fn serve(&self, url: &str, status: u16, body: &str) {
            lock(&self.routes).insert(url.into(), (status, body.as_bytes().to_vec()));
        }

        pub fn serve_json(&self, url: &str, body: Json) {
            self.serve(url, 200, &body.to_string())
        }

        pub fn request_count(&self) -> usize {
            lock(&self.requests).len()
        }

        /// Bodies of the requests made to `url`, in order.
        pub fn bodies(&self, url: &str) -> Vec<String> {
            lock(&self.requests)
                .iter()
                .filter(|r| r.uri().to_string() == url)
                .map(|r| String::from_utf8_lossy(r.body()).into_owned())
                .collect()
        }

        /// Headers named `name` sent with each request, in order.
        pub fn header_values(&self, name: &str) -> Vec<String> {
            lock(&self.requests)
                .iter()
                .filter_map(|r| r.headers().get(name)?.to_str().ok().map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl AsyncHttpClient for MockHttpClient {
        async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
            let uri = request.uri().to_string();
            lock(&self.requests).push(request);
            let Some((status, body)) = lock(&self.routes).get(&uri).cloned() else {
                bail!("connection refused: {uri}")
            };
            Ok(Response::builder().status(status).body(body)?)
        }
    }
}
