use chrono::Utc;
use feed_rs::model::{Link, Text};
use feed_rs::parser;
use html_escape::decode_html_entities;

use crate::domain::FetchedItem;
use crate::fetcher::FetchError;

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub items: Vec<FetchedItem>,
}

#[derive(Clone)]
pub struct Normalizer;

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Entries without a native id are identified by their first link.
fn link_as_id(links: &[Link], _title: &Option<Text>, _base: Option<&str>) -> String {
    links.first().map(|l| l.href.clone()).unwrap_or_default()
}

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, body: &[u8]) -> Result<ParsedFeed, FetchError> {
        let feed = parser::Builder::new()
            .id_generator(link_as_id)
            .build()
            .parse(body)
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let title = feed
            .title
            .map(|t| decode_html_entities(&t.content).to_string());

        let items = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let link = entry.links.first().map(|l| l.href.clone());
                let guid = if entry.id.is_empty() {
                    link.clone()?
                } else {
                    entry.id
                };

                let content = entry
                    .content
                    .and_then(|c| c.body)
                    .filter(|b| !b.is_empty())
                    .or_else(|| entry.summary.map(|s| s.content))
                    .map(|b| decode_html_entities(&b).to_string());

                Some(FetchedItem {
                    guid,
                    title: entry
                        .title
                        .map(|t| decode_html_entities(&t.content).to_string()),
                    link,
                    content,
                    published_at: entry
                        .published
                        .or(entry.updated)
                        .map(|dt| dt.with_timezone(&Utc)),
                })
            })
            .collect();

        Ok(ParsedFeed { title, items })
    }
}
