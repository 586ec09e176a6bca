//! Shared HTTP fetcher used by upstream clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Single-attempt fetcher; retry policy belongs to whoever triggers runs.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_fetch", %run_id, source_id, url);

        async {
            let resp = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched upstream payload");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
