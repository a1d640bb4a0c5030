use reqwest::header::{HeaderValue, ETAG, IF_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{CiError, Result};

/// Request header asking the store to return the document's version tag.
const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";

/// A document read together with the version tag it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// `None` when nothing is stored at the path
    pub value: Option<T>,
    pub etag: String,
}

/// HTTP client for a Firebase-style JSON document store.
///
/// Every path maps to `<base_url>/<path>.json`. The only mutual-exclusion
/// primitive is [`StoreClient::conditional_write`]; every other write is
/// unconditional.
#[derive(Debug, Clone)]
pub struct StoreClient {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl StoreClient {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }

    fn check(response: &Response, method: &'static str, path: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CiError::Store {
                status: status.as_u16(),
                method,
                path: path.to_string(),
            })
        }
    }

    /// Read a document. Returns `None` if nothing is stored at `path`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.request(Method::GET, path).send().await?;
        Self::check(&response, "GET", path)?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice::<Option<T>>(&body)?)
    }

    /// Read a document along with its current version tag.
    pub async fn get_versioned<T: DeserializeOwned>(&self, path: &str) -> Result<Versioned<T>> {
        let response = self
            .request(Method::GET, path)
            .header(ETAG_REQUEST_HEADER, "true")
            .send()
            .await?;
        Self::check(&response, "GET", path)?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CiError::MissingVersion(path.to_string()))?;
        let body = response.bytes().await?;
        let value = serde_json::from_slice::<Option<T>>(&body)?;

        Ok(Versioned { value, etag })
    }

    /// Unconditionally replace the document at `path`.
    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<()> {
        let response = self.request(Method::PUT, path).json(value).send().await?;
        Self::check(&response, "PUT", path)
    }

    /// Replace the document at `path` only if it is still at version `etag`.
    ///
    /// Returns `Ok(false)` when the precondition failed, i.e. somebody else
    /// wrote the document since it was read. That is a lost race, not an error.
    pub async fn conditional_write<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
        etag: &str,
    ) -> Result<bool> {
        let etag = HeaderValue::from_str(etag)
            .map_err(|_| CiError::MissingVersion(path.to_string()))?;
        let response = self
            .request(Method::PUT, path)
            .header(IF_MATCH, etag)
            .json(value)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        Self::check(&response, "PUT", path)?;
        Ok(true)
    }

    /// Merge the top-level keys of `patch` into the document at `path`.
    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, patch: &T) -> Result<()> {
        let response = self.request(Method::PATCH, path).json(patch).send().await?;
        Self::check(&response, "PATCH", path)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.request(Method::DELETE, path).send().await?;
        Self::check(&response, "DELETE", path)
    }
}
