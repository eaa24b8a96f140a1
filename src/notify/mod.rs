pub mod render;
pub mod smtp;

use async_trait::async_trait;
use url::Url;

use crate::app::{FeedpostError, Result};
use crate::digest::{ContentMode, Digest};
use crate::domain::Subscription;

pub use render::DigestRenderer;
pub use smtp::{SmtpTransport, TransportMode};

/// Subject and body parts of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDigest {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A rendered digest plus the per-recipient tokens and links the transport
/// embeds in the message.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub recipient: String,
    pub digest: RenderedDigest,
    pub unsubscribe_token: Option<String>,
    pub dashboard_url: Option<String>,
    pub tracking_token: Option<String>,
}

pub trait Renderer {
    fn render(
        &self,
        subscription: &Subscription,
        digest: &Digest,
        mode: ContentMode,
    ) -> Result<RenderedDigest>;
}

#[async_trait]
pub trait Transport {
    async fn send(&self, message: &Outgoing) -> Result<()>;
}

/// Public URLs under the configured origin.
#[derive(Debug, Clone)]
pub struct Links {
    origin: String,
}

impl Links {
    pub fn new(origin: &str) -> Result<Self> {
        let url = Url::parse(origin)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FeedpostError::Config(format!(
                "origin must be an http(s) URL, got {}",
                origin
            )));
        }
        Ok(Self {
            origin: origin.trim_end_matches('/').to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn dashboard(&self, subscriber: &str) -> String {
        format!("{}/{}", self.origin, subscriber)
    }

    pub fn unsubscribe(&self, token: &str) -> String {
        format!("{}/unsubscribe/{}", self.origin, token)
    }

    pub fn keep_alive(&self, token: &str) -> String {
        format!("{}/keep-alive/{}", self.origin, token)
    }

    pub fn tracking_pixel(&self, token: &str) -> String {
        format!("{}/t/{}.gif", self.origin, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_strip_trailing_slash() {
        let links = Links::new("https://feeds.example.com/").unwrap();
        assert_eq!(links.dashboard("alice"), "https://feeds.example.com/alice");
        assert_eq!(
            links.unsubscribe("tok"),
            "https://feeds.example.com/unsubscribe/tok"
        );
        assert_eq!(
            links.keep_alive("tok"),
            "https://feeds.example.com/keep-alive/tok"
        );
        assert_eq!(
            links.tracking_pixel("tok"),
            "https://feeds.example.com/t/tok.gif"
        );
    }

    #[test]
    fn test_links_reject_non_http_origin() {
        assert!(Links::new("ftp://example.com").is_err());
        assert!(Links::new("not a url").is_err());
    }
}
