use anyhow::Error;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

/// Durable byte store addressed by path, reachable through a public URL.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error>;

    fn public_url(&self, path: &str) -> String;
}

/// Client for a Supabase-style storage REST API: objects are uploaded to
/// `{base}/object/{bucket}{path}` and publicly readable under
/// `{base}/object/public/{bucket}{path}`.
pub struct BucketClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    bucket: String,
}

impl BucketClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        BucketClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for BucketClient {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), Error> {
        let url = format!("{}/object/{}{}", self.base_url, self.bucket, path);
        debug!("Uploading {} bytes to {}", bytes.len(), url);

        self.http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/object/public/{}{}", self.base_url, self.bucket, path)
    }
}
