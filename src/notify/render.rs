use std::fmt::Write as _;

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::app::{FeedpostError, Result};
use crate::digest::{ContentMode, Digest};
use crate::domain::{FetchedItem, Subscription};
use crate::notify::{RenderedDigest, Renderer};

/// Plain-text and HTML digest. Feed markup is reduced to text before it is
/// placed in either part.
#[derive(Debug, Clone, Default)]
pub struct DigestRenderer;

impl DigestRenderer {
    pub fn new() -> Self {
        Self
    }

    fn subject(subscription: &Subscription, count: usize) -> String {
        let noun = if count == 1 { "item" } else { "items" };
        format!("{}: {} new {}", subscription.display_name(), count, noun)
    }

    fn text(subscription: &Subscription, digest: &Digest, mode: ContentMode) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", Self::subject(subscription, digest.new_item_count()));

        for group in &digest.groups {
            let _ = writeln!(out, "\n== {} ==", group.source_name);
            for item in &group.items {
                let _ = writeln!(out, "- {}{}", item.display_title(), published(item));
                if let Some(link) = &item.link {
                    let _ = writeln!(out, "  {}", link);
                }
                if mode == ContentMode::Inline {
                    if let Some(content) = item.content.as_deref().map(strip_html) {
                        if !content.is_empty() {
                            let _ = writeln!(out, "\n  {}\n", content);
                        }
                    }
                }
            }
        }

        out
    }

    fn html(subscription: &Subscription, digest: &Digest, mode: ContentMode) -> String {
        let mut out = String::from("<!DOCTYPE html><html><body>");
        let _ = write!(
            out,
            "<h1>{}</h1>",
            encode_text(&Self::subject(subscription, digest.new_item_count()))
        );

        for group in &digest.groups {
            let _ = write!(
                out,
                "<h2><a href=\"{}\">{}</a></h2><ul>",
                encode_double_quoted_attribute(&group.source_url),
                encode_text(&group.source_name)
            );
            for item in &group.items {
                out.push_str("<li>");
                match &item.link {
                    Some(link) => {
                        let _ = write!(
                            out,
                            "<a href=\"{}\">{}</a>",
                            encode_double_quoted_attribute(link),
                            encode_text(item.display_title())
                        );
                    }
                    None => out.push_str(&encode_text(item.display_title())),
                }
                let date = published(item);
                if !date.is_empty() {
                    let _ = write!(out, "<small>{}</small>", encode_text(&date));
                }
                if mode == ContentMode::Inline {
                    if let Some(content) = item.content.as_deref().map(strip_html) {
                        if !content.is_empty() {
                            let _ = write!(out, "<p>{}</p>", encode_text(&content));
                        }
                    }
                }
                out.push_str("</li>");
            }
            out.push_str("</ul>");
        }

        out.push_str("</body></html>");
        out
    }
}

impl Renderer for DigestRenderer {
    fn render(
        &self,
        subscription: &Subscription,
        digest: &Digest,
        mode: ContentMode,
    ) -> Result<RenderedDigest> {
        if digest.is_empty() {
            return Err(FeedpostError::Render("digest has no items".into()));
        }

        Ok(RenderedDigest {
            subject: Self::subject(subscription, digest.new_item_count()),
            html: Self::html(subscription, digest, mode),
            text: Self::text(subscription, digest, mode),
        })
    }
}

fn published(item: &FetchedItem) -> String {
    item.published_at
        .map(|at| format!(" ({})", at.format("%Y-%m-%d")))
        .unwrap_or_default()
}

fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    let mut last_was_space = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => {
                if c.is_whitespace() {
                    if !last_was_space {
                        result.push(' ');
                        last_was_space = true;
                    }
                } else {
                    result.push(c);
                    last_was_space = false;
                }
            }
            _ => {}
        }
    }

    result.trim().to_string()
}
