use std::sync::Arc;

use vox_transport::AudioRef;

use crate::ObjectUrls;

pub use futures_util::future::BoxFuture;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("reference {0} is no longer valid")]
    Stale(String),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("network error: {0}")]
    Network(String),
}

/// Reads the encoded bytes behind an [`AudioRef`].
pub trait ByteFetcher: Send + Sync {
    fn fetch<'a>(&'a self, source: &'a AudioRef) -> BoxFuture<'a, Result<Arc<[u8]>, FetchError>>;
}

/// Resolves object references through the in-process registry and remote
/// references over HTTP, relative paths being joined to `api_base`.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    objects: ObjectUrls,
    client: reqwest::Client,
    api_base: String,
}

impl SourceFetcher {
    pub fn new(objects: ObjectUrls, api_base: impl Into<String>) -> Self {
        Self {
            objects,
            client: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }

    pub fn absolute_url(&self, path: &str) -> String {
        absolute_url(&self.api_base, path)
    }
}

pub(crate) fn absolute_url(api_base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = api_base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

impl ByteFetcher for SourceFetcher {
    fn fetch<'a>(&'a self, source: &'a AudioRef) -> BoxFuture<'a, Result<Arc<[u8]>, FetchError>> {
        Box::pin(async move {
            match source {
                AudioRef::Object(key) => self
                    .objects
                    .resolve(source)
                    .map(|entry| entry.bytes)
                    .ok_or_else(|| FetchError::Stale(key.clone())),
                AudioRef::Remote(path) => {
                    let url = self.absolute_url(path);
                    let response = self
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(FetchError::Status {
                            url,
                            status: status.as_u16(),
                        });
                    }
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    Ok(Arc::from(bytes.as_ref()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url("http://127.0.0.1:8000/", "/api/download/mixed-track?id=1"),
            "http://127.0.0.1:8000/api/download/mixed-track?id=1"
        );
        assert_eq!(absolute_url("http://h", "file.wav"), "http://h/file.wav");
        assert_eq!(absolute_url("http://h", "https://cdn/x.wav"), "https://cdn/x.wav");
    }

    #[tokio::test]
    async fn test_object_references_resolve_in_memory() {
        let objects = ObjectUrls::new();
        let reference = objects.create(Arc::from(&b"bytes"[..]), "a.wav");
        let fetcher = SourceFetcher::new(objects.clone(), "http://127.0.0.1:1");

        let bytes = fetcher.fetch(&reference).await.expect("fetch");
        assert_eq!(&bytes[..], b"bytes");

        objects.revoke(&reference);
        let err = fetcher.fetch(&reference).await.unwrap_err();
        assert!(matches!(err, FetchError::Stale(_)));
    }
}
