//! Renders the stored ad window as an RSS channel.

use crate::{
    config::Config,
    error::FeedError,
    storage::{Ad, AdStore},
};
use chrono::TimeDelta;
use rss::{Channel, ChannelBuilder, GuidBuilder, Item, ItemBuilder};

const FEED_TITLE: &str = "Facebook Marketplace Ad Feed";
const FEED_DESCRIPTION: &str = "An RSS feed to monitor new ads on Facebook Marketplace";

/// Builds a channel from every ad in the retention window.
pub async fn build_feed(store: &AdStore, config: &Config, window: TimeDelta) -> Channel {
    let ads = store.query_window(window).await;
    tracing::debug!("Building feed with {} ads", ads.len());

    let items: Vec<Item> = ads
        .iter()
        .map(|ad| ad_to_item(ad, &config.currency))
        .collect();

    let mut channel = empty_feed(config);
    channel.set_items(items);
    channel
}

/// A channel with no items, also served when rendering fails.
pub fn empty_feed(config: &Config) -> Channel {
    ChannelBuilder::default()
        .title(FEED_TITLE)
        .link(format!("http://{}:{}/rss", config.server_ip, config.server_port))
        .description(FEED_DESCRIPTION)
        .last_build_date(Some(chrono::Utc::now().to_rfc2822()))
        .build()
}

/// Serializes a channel to RSS XML.
pub fn render(channel: &Channel) -> Result<String, FeedError> {
    let buffer = channel.write_to(Vec::new())?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn ad_to_item(ad: &Ad, currency: &str) -> Item {
    let price = format_price(&ad.price, currency);
    let guid = GuidBuilder::default()
        .value(ad.ad_id.clone())
        .permalink(false)
        .build();

    ItemBuilder::default()
        .title(Some(format!("{} - {}", ad.title, price)))
        .link(Some(ad.listing_url.clone()))
        .description(Some(format!("Price: {} - {}", price, ad.title)))
        .guid(Some(guid))
        .pub_date(Some(ad.first_seen.to_rfc2822()))
        .build()
}

/// Puts the currency on a raw price, unless it's already there.
///
/// Symbols go in front (`$450`), alphabetic codes after (`450 EUR`).
pub fn format_price(price: &str, currency: &str) -> String {
    let price = price.trim();
    if currency.is_empty() || price.contains(currency) || price.to_lowercase().contains("free") {
        return price.to_string();
    }

    if currency.chars().all(char::is_alphabetic) {
        format!("{price} {currency}")
    } else {
        format!("{currency}{price}")
    }
}
