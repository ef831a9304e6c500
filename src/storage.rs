//! Deduplicated, time-windowed ad storage.
//!
//! The store keeps every matched ad in memory, keyed by (source URL, ad id),
//! and persists snapshots through an [`AdBackend`]. Mutations only touch
//! memory; [`AdStore::commit`] makes them durable.

use crate::error::StoreError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, RwLock};

/// How long an ad stays in the feed after it was last seen.
pub fn default_retention() -> TimeDelta {
    TimeDelta::days(7)
}

/// A matched listing as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ad {
    pub ad_id: String,
    pub title: String,
    pub price: String,
    pub listing_url: String,
    pub source_url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Ad {
    fn key(&self) -> AdKey {
        (self.source_url.clone(), self.ad_id.clone())
    }
}

/// A listing that passed its URL's filter and is about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdCandidate {
    pub ad_id: String,
    pub title: String,
    pub price: String,
    pub listing_url: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// What happens to title, price and link when a known ad is seen again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetailsPolicy {
    /// Keep what was recorded at first sighting.
    #[default]
    KeepFirst,
    /// Overwrite with the latest observation.
    RefreshOnSighting,
}

impl DetailsPolicy {
    pub fn from_flag(refresh: bool) -> Self {
        if refresh {
            Self::RefreshOnSighting
        } else {
            Self::KeepFirst
        }
    }
}

/// (source URL, ad id)
type AdKey = (String, String);

/// Durable persistence for the ad index.
pub trait AdBackend: Send + Sync {
    fn load(&self) -> Result<Vec<Ad>, StoreError>;
    fn save(&self, ads: &[Ad]) -> Result<(), StoreError>;
}

/// Stores the ad index as a JSON array in a single file.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `ads.json` -> `ads.json.<suffix>`
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }
}

impl AdBackend for JsonFileBackend {
    fn load(&self) -> Result<Vec<Ad>, StoreError> {
        use std::io::ErrorKind;

        let json = match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                if content.trim().is_empty() {
                    return Ok(Vec::new());
                }
                content
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&json) {
            Ok(ads) => Ok(ads),
            Err(e) => {
                // Keep the damaged file for inspection and start over.
                let aside = self.sibling("corrupt");
                tracing::error!(
                    "Ad store {} is corrupt ({e}), moving it to {} and starting empty",
                    self.path.display(),
                    aside.display()
                );
                std::fs::rename(&self.path, &aside)?;
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, ads: &[Ad]) -> Result<(), StoreError> {
        let json = serde_json::to_string(ads)?;

        // Write next to the target and rename, so readers never see half a file.
        let staging = self.sibling("tmp");

        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl<B: AdBackend + ?Sized> AdBackend for Arc<B> {
    fn load(&self) -> Result<Vec<Ad>, StoreError> {
        (**self).load()
    }

    fn save(&self, ads: &[Ad]) -> Result<(), StoreError> {
        (**self).save(ads)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryBackend {
    pub ads: std::sync::Mutex<Vec<Ad>>,
    pub fail: AtomicBool,
}

#[cfg(test)]
impl AdBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<Ad>, StoreError> {
        Ok(self.ads.lock().unwrap().clone())
    }

    fn save(&self, ads: &[Ad]) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk on fire").into());
        }
        *self.ads.lock().unwrap() = ads.to_vec();
        Ok(())
    }
}

/// Shared handle to the ad index. Cheap to clone.
#[derive(Clone)]
pub struct AdStore {
    inner: Arc<Inner>,
}

struct Inner {
    ads: RwLock<HashMap<AdKey, Ad>>,
    backend: Box<dyn AdBackend>,
    commit_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl AdStore {
    /// Opens the store, loading whatever the backend has persisted.
    pub fn open(backend: impl AdBackend + 'static) -> Result<Self, StoreError> {
        let mut ads: HashMap<AdKey, Ad> = HashMap::new();
        for ad in backend.load()? {
            // Should a snapshot ever carry duplicates, the freshest sighting wins.
            let key = ad.key();
            if ads
                .get(&key)
                .is_none_or(|existing| existing.last_seen < ad.last_seen)
            {
                ads.insert(key, ad);
            }
        }
        tracing::info!("Loaded {} stored ads", ads.len());

        Ok(Self {
            inner: Arc::new(Inner {
                ads: RwLock::new(ads),
                backend: Box::new(backend),
                commit_lock: Mutex::new(()),
                dirty: AtomicBool::new(false),
            }),
        })
    }

    pub async fn upsert(&self, candidate: AdCandidate, policy: DetailsPolicy) -> UpsertOutcome {
        self.upsert_at(candidate, policy, Utc::now()).await
    }

    /// Records a sighting at `now`. `first_seen` is set once; `last_seen` never goes back.
    pub async fn upsert_at(
        &self,
        candidate: AdCandidate,
        policy: DetailsPolicy,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        use std::collections::hash_map::Entry;

        let key = (candidate.source_url.clone(), candidate.ad_id.clone());
        let mut ads = self.inner.ads.write().await;
        self.inner.dirty.store(true, Ordering::SeqCst);

        match ads.entry(key) {
            Entry::Occupied(mut entry) => {
                let ad = entry.get_mut();
                ad.last_seen = ad.last_seen.max(now);
                if policy == DetailsPolicy::RefreshOnSighting {
                    ad.title = candidate.title;
                    ad.price = candidate.price;
                    ad.listing_url = candidate.listing_url;
                }
                UpsertOutcome::Updated
            }
            Entry::Vacant(entry) => {
                tracing::info!(ad_id = %candidate.ad_id, "New ad detected: {}", candidate.title);
                entry.insert(Ad {
                    ad_id: candidate.ad_id,
                    title: candidate.title,
                    price: candidate.price,
                    listing_url: candidate.listing_url,
                    source_url: candidate.source_url,
                    first_seen: now,
                    last_seen: now,
                });
                UpsertOutcome::Inserted
            }
        }
    }

    pub async fn query_window(&self, window: TimeDelta) -> Vec<Ad> {
        self.query_window_at(window, Utc::now()).await
    }

    /// Ads last seen within `window` of `now`, newest-discovered first.
    pub async fn query_window_at(&self, window: TimeDelta, now: DateTime<Utc>) -> Vec<Ad> {
        let cutoff = cutoff(now, window);
        let ads = self.inner.ads.read().await;

        let mut recent: Vec<Ad> = ads
            .values()
            .filter(|ad| ad.last_seen >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| {
            b.first_seen
                .cmp(&a.first_seen)
                .then_with(|| a.source_url.cmp(&b.source_url))
                .then_with(|| a.ad_id.cmp(&b.ad_id))
        });
        recent
    }

    pub async fn prune(&self, window: TimeDelta) -> usize {
        self.prune_at(window, Utc::now()).await
    }

    /// Drops ads last seen before `now - window`. Returns how many were removed.
    pub async fn prune_at(&self, window: TimeDelta, now: DateTime<Utc>) -> usize {
        let cutoff = cutoff(now, window);
        let mut ads = self.inner.ads.write().await;

        let before = ads.len();
        ads.retain(|_, ad| ad.last_seen >= cutoff);
        let removed = before - ads.len();

        if removed > 0 {
            self.inner.dirty.store(true, Ordering::SeqCst);
            tracing::debug!("Pruned {removed} ads last seen before {cutoff}");
        }
        removed
    }

    /// Persists the index if it changed since the last successful commit.
    ///
    /// On failure the in-memory index is kept and the next commit retries.
    pub async fn commit(&self) -> Result<(), StoreError> {
        let _guard = self.inner.commit_lock.lock().await;
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut snapshot: Vec<Ad> = self.inner.ads.read().await.values().cloned().collect();
        snapshot.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));

        if let Err(error) = self.inner.backend.save(&snapshot) {
            self.inner.dirty.store(true, Ordering::SeqCst);
            return Err(error);
        }
        tracing::debug!("Committed {} ads to storage", snapshot.len());
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.ads.read().await.len()
    }
}

fn cutoff(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
