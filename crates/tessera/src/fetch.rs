//! The fetcher contract and its HTTP implementation.
//!
//! The scheduler hands a [`FetchRequest`] to a [`Fetcher`] and spawns the
//! returned future; the future's output is sent back over a channel and only
//! observed on the next data tick.

use std::future::Future;
use std::pin::Pin;
#[cfg(not(target_family = "wasm"))]
use std::sync::Arc;

#[cfg(not(target_family = "wasm"))]
use crate::cache::{ByteCache, NoCache};
#[cfg(not(target_family = "wasm"))]
use crate::error::Error;
use crate::error::Result;

/// A request for the bytes of a named resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Resource name; for network resources this is the URL.
    pub name: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The bytes delivered for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReply {
    pub data: Vec<u8>,
    /// The bytes came from a local cache rather than the network.
    pub from_cache: bool,
}

/// Future type returned by [`Fetcher::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchReply>> + Send + 'static>>;

/// Delivers resource bytes asynchronously.
///
/// The returned future must not borrow the fetcher; it is spawned onto a
/// [`TaskSpawner`](crate::TaskSpawner) and may outlive the call.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

/// User agent sent with every HTTP request.
#[cfg(not(target_family = "wasm"))]
const USER_AGENT: &str = concat!("tessera/", env!("CARGO_PKG_VERSION"));

/// Fetches resources over HTTP, consulting a byte cache first.
#[cfg(not(target_family = "wasm"))]
#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
    cache: Arc<dyn ByteCache>,
}

#[cfg(not(target_family = "wasm"))]
impl HttpFetcher {
    /// Create a fetcher with no caching.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(NoCache)
    }

    /// Create a fetcher with a custom byte cache.
    #[must_use]
    pub fn with_cache(cache: impl ByteCache + 'static) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: Arc::new(cache),
        }
    }

    /// Create a fetcher with a custom HTTP client and byte cache.
    #[must_use]
    pub fn with_http_and_cache(http: reqwest::Client, cache: Arc<dyn ByteCache>) -> Self {
        Self { http, cache }
    }

    /// Create a fetcher identifying itself with the given client id.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_client_id(client_id: &str, cache: Arc<dyn ByteCache>) -> Result<Self> {
        let user_agent = if client_id.is_empty() {
            USER_AGENT.to_string()
        } else {
            format!("{USER_AGENT} ({client_id})")
        };
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Http {
                url: String::new(),
                message: format!("failed to create client: {e}"),
            })?;
        Ok(Self { http, cache })
    }
}

#[cfg(not(target_family = "wasm"))]
impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_family = "wasm"))]
impl Fetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let http = self.http.clone();
        let cache = Arc::clone(&self.cache);
        Box::pin(async move { fetch_bytes(&http, cache.as_ref(), &request).await })
    }
}

/// Fetch raw bytes for a request, using the cache if available.
#[cfg(not(target_family = "wasm"))]
async fn fetch_bytes(
    http: &reqwest::Client,
    cache: &dyn ByteCache,
    request: &FetchRequest,
) -> Result<FetchReply> {
    let url = request.name.as_str();

    if let Some(data) = cache.get(url) {
        tracing::debug!(url, "cache hit");
        return Ok(FetchReply {
            data,
            from_cache: true,
        });
    }

    tracing::debug!(url, "fetching");

    let mut builder = http.get(url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await.map_err(|e| Error::Http {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let data = response.bytes().await.map_err(|e| Error::Http {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let data = data.to_vec();

    cache.put(url, data.clone());

    Ok(FetchReply {
        data,
        from_cache: false,
    })
}
