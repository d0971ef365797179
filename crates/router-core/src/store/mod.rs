//! Durable position-mapping storage with a write-through cache.
//!
//! Key namespace:
//! - `map/{sourceAccountId}/{sourcePositionId}/{destAccountId}` -> mapping JSON
//! - `map_idx/{sourceAccountId}` -> set of `{sourcePositionId}/{destAccountId}`
//! - `closed/{sourceAccountId}/{sourcePositionId}` -> recent-close JSON, with expiry

pub mod kv;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{PositionMapping, RecentClose};

pub use kv::{Kv, MemoryKv, RedisKv};

/// Durable map {source position} -> destination details, plus the
/// recently-closed records that suppress re-opens after a close.
///
/// All writes for a given source position are serialized by the copy
/// trader's single-writer loop; the store itself only needs per-key
/// consistency.
pub struct MappingStore {
    kv: Arc<dyn Kv>,
    cache: DashMap<String, PositionMapping>,
    recent_closes: DashMap<String, (RecentClose, Instant)>,
    recent_close_ttl: Duration,
}

impl MappingStore {
    pub fn new(kv: Arc<dyn Kv>, recent_close_ttl: Duration) -> Self {
        Self {
            kv,
            cache: DashMap::new(),
            recent_closes: DashMap::new(),
            recent_close_ttl,
        }
    }

    fn mapping_key(source_account_id: &str, source_position_id: &str, dest_account_id: &str) -> String {
        format!("map/{source_account_id}/{source_position_id}/{dest_account_id}")
    }

    fn index_key(source_account_id: &str) -> String {
        format!("map_idx/{source_account_id}")
    }

    fn index_member(source_position_id: &str, dest_account_id: &str) -> String {
        format!("{source_position_id}/{dest_account_id}")
    }

    fn closed_key(source_account_id: &str, source_position_id: &str) -> String {
        format!("closed/{source_account_id}/{source_position_id}")
    }

    /// Create a mapping, idempotently. An existing record is never
    /// overwritten; doing so would orphan the destination position a prior
    /// execution already opened. Returns false when the mapping already
    /// existed.
    pub async fn create_mapping(&self, mapping: &PositionMapping) -> Result<bool, StoreError> {
        let key = Self::mapping_key(
            &mapping.source_account_id,
            &mapping.source_position_id,
            &mapping.dest_account_id,
        );

        if self.cache.contains_key(&key) || self.kv.get(&key).await?.is_some() {
            debug!(key = %key, "mapping already exists, keeping original");
            return Ok(false);
        }

        let json = serde_json::to_string(mapping)?;
        self.kv.set(&key, &json).await?;
        self.kv
            .sadd(
                &Self::index_key(&mapping.source_account_id),
                &Self::index_member(&mapping.source_position_id, &mapping.dest_account_id),
            )
            .await?;
        self.cache.insert(key, mapping.clone());
        Ok(true)
    }

    /// Cache-first lookup of one route's mapping for a source position.
    pub async fn get_mapping(
        &self,
        source_account_id: &str,
        source_position_id: &str,
        dest_account_id: &str,
    ) -> Result<Option<PositionMapping>, StoreError> {
        let key = Self::mapping_key(source_account_id, source_position_id, dest_account_id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached.clone()));
        }

        match self.kv.get(&key).await? {
            Some(json) => {
                let mapping: PositionMapping = serde_json::from_str(&json)?;
                self.cache.insert(key, mapping.clone());
                Ok(Some(mapping))
            }
            None => Ok(None),
        }
    }

    /// All mappings for one source position (one per destination route).
    pub async fn get_position_mappings(
        &self,
        source_account_id: &str,
        source_position_id: &str,
    ) -> Result<Vec<PositionMapping>, StoreError> {
        let prefix = format!("{source_position_id}/");
        let mut mappings = Vec::new();
        for member in self.kv.smembers(&Self::index_key(source_account_id)).await? {
            if let Some(dest_account_id) = member.strip_prefix(&prefix) {
                if let Some(mapping) = self
                    .get_mapping(source_account_id, source_position_id, dest_account_id)
                    .await?
                {
                    mappings.push(mapping);
                }
            }
        }
        Ok(mappings)
    }

    /// Full mapping set for a source account; used by the reconciler and
    /// for cache rehydration at startup.
    pub async fn get_account_mappings(
        &self,
        source_account_id: &str,
    ) -> Result<Vec<PositionMapping>, StoreError> {
        let mut mappings = Vec::new();
        for member in self.kv.smembers(&Self::index_key(source_account_id)).await? {
            let Some((source_position_id, dest_account_id)) = member.split_once('/') else {
                warn!(member = %member, "malformed index member, skipping");
                continue;
            };
            match self
                .get_mapping(source_account_id, source_position_id, dest_account_id)
                .await?
            {
                Some(mapping) => mappings.push(mapping),
                None => {
                    // Dangling index entry from a partial delete.
                    self.kv
                        .srem(&Self::index_key(source_account_id), &member)
                        .await
                        .ok();
                }
            }
        }
        Ok(mappings)
    }

    /// Find the mapping owning a destination position, scanning the hinted
    /// source accounts first and falling back to the local cache.
    pub async fn find_by_dest_position(
        &self,
        dest_account_id: &str,
        dest_position_id: &str,
        hint_source_account_ids: &[String],
    ) -> Result<Option<PositionMapping>, StoreError> {
        for source_account_id in hint_source_account_ids {
            for mapping in self.get_account_mappings(source_account_id).await? {
                if mapping.dest_account_id == dest_account_id
                    && mapping.dest_position_id == dest_position_id
                {
                    return Ok(Some(mapping));
                }
            }
        }

        Ok(self
            .cache
            .iter()
            .find(|entry| {
                entry.dest_account_id == dest_account_id
                    && entry.dest_position_id == dest_position_id
            })
            .map(|entry| entry.value().clone()))
    }

    /// Delete a mapping from store and cache. Mapping record first, then
    /// index membership; a crash in between leaves only a dangling index
    /// entry that `get_account_mappings` cleans up.
    pub async fn delete_mapping(
        &self,
        source_account_id: &str,
        source_position_id: &str,
        dest_account_id: &str,
    ) -> Result<(), StoreError> {
        let key = Self::mapping_key(source_account_id, source_position_id, dest_account_id);
        self.kv.del(&key).await?;
        self.kv
            .srem(
                &Self::index_key(source_account_id),
                &Self::index_member(source_position_id, dest_account_id),
            )
            .await?;
        self.cache.remove(&key);
        Ok(())
    }

    /// Record a close so a late snapshot cannot re-open the position.
    pub async fn record_close(&self, close: &RecentClose) -> Result<(), StoreError> {
        let key = Self::closed_key(&close.source_account_id, &close.source_position_id);
        let json = serde_json::to_string(close)?;
        self.kv.set_ex(&key, &json, self.recent_close_ttl).await?;
        self.recent_closes.insert(
            key,
            (close.clone(), Instant::now() + self.recent_close_ttl),
        );
        Ok(())
    }

    /// TTL-bounded check for a recent close of this source position.
    pub async fn was_recently_closed(
        &self,
        source_account_id: &str,
        source_position_id: &str,
    ) -> Result<bool, StoreError> {
        let key = Self::closed_key(source_account_id, source_position_id);
        if let Some(entry) = self.recent_closes.get(&key) {
            if Instant::now() < entry.value().1 {
                return Ok(true);
            }
            drop(entry);
            self.recent_closes.remove(&key);
        }
        Ok(self.kv.get(&key).await?.is_some())
    }

    /// Warm the cache from the store at startup. Returns how many mappings
    /// were loaded.
    pub async fn rehydrate(&self, source_account_ids: &[String]) -> Result<usize, StoreError> {
        let mut count = 0;
        for source_account_id in source_account_ids {
            count += self.get_account_mappings(source_account_id).await?.len();
        }
        Ok(count)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
