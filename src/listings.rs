//! Turns a marketplace search page into raw listings.

use crate::error::ScrapeError;
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::{collections::HashSet, time::Duration};
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:130.0) Gecko/20100101 Firefox/130.0";

/// A listing as found on a search page. Never stored as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawListing {
    pub ad_id: String,
    pub title: String,
    pub price: String,
    pub listing_url: String,
}

/// Anything that can produce the listings behind a search URL.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listings(&self, url: &str) -> Result<Vec<RawListing>, ScrapeError>;
}

/// Fetches search pages over HTTP and scrapes the listing cards out of them.
pub struct MarketplaceScraper {
    client: reqwest::Client,
}

impl MarketplaceScraper {
    pub fn new(timeout: Duration) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ScrapeError::Fatal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ListingSource for MarketplaceScraper {
    async fn fetch_listings(&self, url: &str) -> Result<Vec<RawListing>, ScrapeError> {
        tracing::info!("Requesting {url}");

        let base = Url::parse(url).map_err(|e| ScrapeError::Fatal(format!("Bad URL {url}: {e}")))?;
        let response = self.client.get(base.clone()).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ScrapeError::Transient(format!("{url} answered {status}")));
        }
        if !status.is_success() {
            return Err(ScrapeError::Fatal(format!("{url} answered {status}")));
        }

        let content = response.text().await?;
        let listings = extract_listings(&content, &base);
        tracing::debug!("Extracted {} listings from {url}", listings.len());

        Ok(listings)
    }
}

/// Whether a scraped price looks like a real price in `currency`.
///
/// Cards without a currency-prefixed price are usually promoted content.
pub fn priced_in(price: &str, currency: &str) -> bool {
    price.starts_with(currency) || price.to_lowercase().contains("free")
}

/// The stable identifier of a listing, derived from its canonical URL.
pub fn listing_id(listing_url: &str) -> String {
    hex::encode(Sha256::digest(listing_url.as_bytes()))
}

/// Scrapes listing cards from a search results page.
///
/// A card is a link holding a line-clamped title span and a `dir="auto"`
/// price span. Links are resolved against `base` with their query dropped.
pub fn extract_listings(html: &str, base: &Url) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a[href]").unwrap();
    let title_selector = Selector::parse("span[style*=\"-webkit-line-clamp\"]").unwrap();
    let price_selector = Selector::parse("span[dir=\"auto\"]").unwrap();

    let mut seen = HashSet::new();
    let mut listings = Vec::new();

    for anchor in document.select(&anchor_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(mut listing_url) = base.join(href) else {
            continue;
        };
        listing_url.set_query(None);
        listing_url.set_fragment(None);

        let title = anchor.select(&title_selector).next().map(element_text);
        let price = anchor.select(&price_selector).next().map(element_text);
        let (Some(title), Some(price)) = (title, price) else {
            continue;
        };
        if title.is_empty() || price.is_empty() {
            continue;
        }

        let listing_url = listing_url.to_string();
        let ad_id = listing_id(&listing_url);
        if !seen.insert(ad_id.clone()) {
            continue;
        }

        listings.push(RawListing {
            ad_id,
            title,
            price,
            listing_url,
        });
    }

    listings
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}
