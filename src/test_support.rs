//! Shared doubles for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::{FeedpostError, Result};
use crate::digest::{ContentMode, Digest};
use crate::domain::{CacheValidators, Source, Subscription};
use crate::fetcher::{FetchError, FetchResponse, Fetcher};
use crate::notify::{Outgoing, RenderedDigest, Renderer, Transport};

enum Scripted {
    Serve {
        body: Vec<u8>,
        validators: Option<CacheValidators>,
    },
    Fail(FetchError),
}

/// In-memory [`Fetcher`] keyed by URL that records peak concurrency.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, Duration>>,
    jitter: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Serve `body`. When `validators` is set, a request carrying the same
    /// entity tag gets a not-modified response.
    pub fn serve(&self, url: &str, body: Vec<u8>, validators: Option<CacheValidators>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Serve { body, validators });
    }

    pub fn fail(&self, url: &str, error: FetchError) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Fail(error));
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> std::result::Result<FetchResponse, FetchError> {
        let responses = self.responses.lock().unwrap();
        match responses.get(url) {
            None => Err(FetchError::Network(format!("no route to {}", url))),
            Some(Scripted::Fail(e)) => Err(e.clone()),
            Some(Scripted::Serve {
                body,
                validators: current,
            }) => {
                if let Some(current) = current {
                    if current.etag.is_some() && current.etag == validators.etag {
                        return Ok(FetchResponse::NotModified);
                    }
                }
                Ok(FetchResponse::Content {
                    body: body.clone(),
                    validators: current.clone().unwrap_or_default(),
                })
            }
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> std::result::Result<FetchResponse, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(url).copied();
        let delay = match delay {
            Some(d) => Some(d),
            None if self.jitter => Some(Duration::from_millis(5 + (call % 7) as u64 * 3)),
            None => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.respond(url, validators);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Build an RSS 2.0 document from `(guid, published)` pairs.
pub fn rss(items: &[(&str, Option<DateTime<Utc>>)]) -> Vec<u8> {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><rss version=\"2.0\"><channel><title>Fixture</title>",
    );
    for (guid, published) in items {
        out.push_str(&format!(
            "<item><title>Title {guid}</title><link>https://example.com/{guid}</link><guid>{guid}</guid>"
        ));
        if let Some(published) = published {
            out.push_str(&format!("<pubDate>{}</pubDate>", published.to_rfc2822()));
        }
        out.push_str(&format!("<description>Body of {guid}</description></item>"));
    }
    out.push_str("</channel></rss>");
    out.into_bytes()
}

pub fn source(id: i64, url: &str) -> Source {
    Source {
        id,
        subscription_id: 1,
        url: url.to_string(),
        name: None,
        last_fetched_at: None,
        etag: None,
        last_modified: None,
    }
}

/// [`Transport`] that records every message and can be told to fail.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Outgoing>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &Outgoing) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedpostError::Transport("connection refused".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub struct FailingRenderer;

impl Renderer for FailingRenderer {
    fn render(
        &self,
        _subscription: &Subscription,
        _digest: &Digest,
        _mode: ContentMode,
    ) -> Result<RenderedDigest> {
        Err(FeedpostError::Render("template exploded".into()))
    }
}
