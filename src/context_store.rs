/*
 * Conversation Assistant - Context Store
 * Copyright (c) 2024 Conversation Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::event_bus::EventBus;
use crate::types::{Event, EventType};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Context entry not found: {0}")]
    NotFound(String),

    #[error("Context validation failed: {0}")]
    Validation(String),

    #[error("Context update conflict: {0}")]
    UpdateConflict(String),

    #[error("No entries to merge")]
    EmptyMerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Conversation,
    Document,
    Analysis,
    UserInput,
    System,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Critical,
    Important,
    Relevant,
    Background,
}

impl ContextLevel {
    /// Importance rank; higher means more important.
    pub fn rank(&self) -> u8 {
        match self {
            ContextLevel::Critical => 3,
            ContextLevel::Important => 2,
            ContextLevel::Relevant => 1,
            ContextLevel::Background => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Archived,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub source: ContextSource,
    pub level: ContextLevel,
    pub state: ContextState,
    pub timestamp: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub tags: HashSet<String>,
    pub references: HashSet<String>,
    pub custom_data: serde_json::Map<String, Value>,
}

impl ContextMetadata {
    pub fn new(source: ContextSource, level: ContextLevel) -> Self {
        Self {
            source,
            level,
            state: ContextState::Active,
            timestamp: Utc::now(),
            expiry: None,
            tags: HashSet::new(),
            references: HashSet::new(),
            custom_data: serde_json::Map::new(),
        }
    }

    pub fn with_tags<I: IntoIterator<Item = String>>(mut self, tags: I) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_references<I: IntoIterator<Item = String>>(mut self, references: I) -> Self {
        self.references.extend(references);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub content: Value,
    pub metadata: ContextMetadata,
}

/// Query over the store's secondary indexes.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    pub sources: Option<HashSet<ContextSource>>,
    pub levels: Option<HashSet<ContextLevel>>,
    pub states: Option<HashSet<ContextState>>,
    pub tags: Option<HashSet<String>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Typed update applied to one entry.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub content: Option<Value>,
    pub level: Option<ContextLevel>,
    pub state: Option<ContextState>,
    pub add_tags: HashSet<String>,
    pub add_references: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    LatestWins,
    CombineAll,
    PriorityBased,
}

/// Relationship analysis over a set of entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextRelationships {
    pub shared_references: Vec<SharedLink>,
    pub shared_tags: Vec<SharedLink>,
    pub temporal: Vec<TemporalLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedLink {
    pub key: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemporalLink {
    pub entries: [String; 2],
    pub time_difference_secs: f64,
}

/// One content search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub entry_id: String,
    pub match_count: usize,
    pub source: ContextSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct ContextInner {
    entries: HashMap<String, ContextEntry>,
    by_source: HashMap<ContextSource, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
    by_reference: HashMap<String, HashSet<String>>,
}

impl ContextInner {
    fn index_entry(&mut self, entry: &ContextEntry) {
        self.by_source
            .entry(entry.metadata.source)
            .or_default()
            .insert(entry.id.clone());
        for tag in &entry.metadata.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        for reference in &entry.metadata.references {
            self.by_reference
                .entry(reference.clone())
                .or_default()
                .insert(entry.id.clone());
        }
    }

    fn deindex_entry(&mut self, entry: &ContextEntry) {
        if let Some(ids) = self.by_source.get_mut(&entry.metadata.source) {
            ids.remove(&entry.id);
            if ids.is_empty() {
                self.by_source.remove(&entry.metadata.source);
            }
        }
        for tag in &entry.metadata.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&entry.id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        for reference in &entry.metadata.references {
            if let Some(ids) = self.by_reference.get_mut(reference) {
                ids.remove(&entry.id);
                if ids.is_empty() {
                    self.by_reference.remove(reference);
                }
            }
        }
    }

    /// Entries currently present in the active indexes.
    fn active_count(&self) -> usize {
        self.by_source.values().map(HashSet::len).sum()
    }
}

/// Source-, tag- and reference-indexed context storage with merge
/// strategies and background archival.
pub struct ContextStore {
    event_bus: Arc<EventBus>,
    config: ContextConfig,
    inner: RwLock<ContextInner>,
    cancel: CancellationToken,
}

impl ContextStore {
    pub fn new(event_bus: Arc<EventBus>, config: ContextConfig) -> Arc<Self> {
        Arc::new(Self {
            event_bus,
            config,
            inner: RwLock::new(ContextInner::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the background retention/expiry sweep.
    pub fn start(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(store.config.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is not a sweep
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep_expired().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Add a new entry, archiving the oldest active entries when over the
    /// configured limit.
    pub async fn add_entry(
        &self,
        content: Value,
        metadata: ContextMetadata,
    ) -> Result<ContextEntry, ContextError> {
        let entry = ContextEntry {
            id: Uuid::new_v4().to_string(),
            content,
            metadata,
        };

        {
            let mut inner = self.inner.write().await;
            if self.config.auto_archive && inner.active_count() >= self.config.max_entries {
                archive_oldest(&mut inner, self.config.max_entries);
            }
            inner.entries.insert(entry.id.clone(), entry.clone());
            inner.index_entry(&entry);
        }

        self.event_bus
            .publish(Event::new(
                EventType::ContextUpdate,
                json!({
                    "action": "add",
                    "entry_id": entry.id.as_str(),
                    "source": entry.metadata.source,
                }),
            ))
            .await;

        Ok(entry)
    }

    /// Re-insert an existing entry verbatim (used when moving entries
    /// between stores or restoring a removed one).
    pub async fn insert_entry(&self, entry: ContextEntry) -> Result<(), ContextError> {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&entry.id) {
            return Err(ContextError::UpdateConflict(entry.id));
        }
        inner.entries.insert(entry.id.clone(), entry.clone());
        inner.index_entry(&entry);
        Ok(())
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<ContextEntry, ContextError> {
        self.inner
            .read()
            .await
            .entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(entry_id.to_string()))
    }

    /// Query entries; results sorted newest-first.
    pub async fn query(&self, query: &ContextQuery) -> Vec<ContextEntry> {
        let inner = self.inner.read().await;

        let mut candidates: HashSet<String> = inner.entries.keys().cloned().collect();

        if let Some(sources) = &query.sources {
            let mut by_source = HashSet::new();
            for source in sources {
                if let Some(ids) = inner.by_source.get(source) {
                    by_source.extend(ids.iter().cloned());
                }
            }
            candidates.retain(|id| by_source.contains(id));
        }

        if let Some(tags) = &query.tags {
            let mut by_tag = HashSet::new();
            for tag in tags {
                if let Some(ids) = inner.by_tag.get(tag) {
                    by_tag.extend(ids.iter().cloned());
                }
            }
            candidates.retain(|id| by_tag.contains(id));
        }

        let mut results: Vec<ContextEntry> = candidates
            .into_iter()
            .filter_map(|id| inner.entries.get(&id))
            .filter(|entry| {
                if let Some(levels) = &query.levels {
                    if !levels.contains(&entry.metadata.level) {
                        return false;
                    }
                }
                if let Some(states) = &query.states {
                    if !states.contains(&entry.metadata.state) {
                        return false;
                    }
                }
                if let Some(start) = query.start_time {
                    if entry.metadata.timestamp < start {
                        return false;
                    }
                }
                if let Some(end) = query.end_time {
                    if entry.metadata.timestamp > end {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    /// Apply a typed update, keeping every index in sync.
    pub async fn update_entry(
        &self,
        entry_id: &str,
        update: ContextUpdate,
    ) -> Result<ContextEntry, ContextError> {
        let updated = {
            let mut inner = self.inner.write().await;
            let mut entry = inner
                .entries
                .get(entry_id)
                .cloned()
                .ok_or_else(|| ContextError::NotFound(entry_id.to_string()))?;

            inner.deindex_entry(&entry);

            if let Some(content) = update.content {
                entry.content = content;
            }
            if let Some(level) = update.level {
                entry.metadata.level = level;
            }
            if let Some(state) = update.state {
                entry.metadata.state = state;
            }
            entry.metadata.tags.extend(update.add_tags);
            entry.metadata.references.extend(update.add_references);
            entry.metadata.timestamp = Utc::now();

            inner.index_entry(&entry);
            inner.entries.insert(entry_id.to_string(), entry.clone());
            entry
        };

        self.event_bus
            .publish(Event::new(
                EventType::ContextUpdate,
                json!({"action": "update", "entry_id": entry_id}),
            ))
            .await;

        Ok(updated)
    }

    /// Remove an entry and every index reference to it.
    pub async fn remove_entry(&self, entry_id: &str) -> Result<ContextEntry, ContextError> {
        let removed = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .entries
                .remove(entry_id)
                .ok_or_else(|| ContextError::NotFound(entry_id.to_string()))?;
            inner.deindex_entry(&entry);
            entry
        };

        self.event_bus
            .publish(Event::new(
                EventType::ContextUpdate,
                json!({"action": "remove", "entry_id": entry_id}),
            ))
            .await;

        Ok(removed)
    }

    /// Merge entries under the given strategy.
    pub fn merge_entries(
        entries: Vec<ContextEntry>,
        strategy: MergeStrategy,
    ) -> Result<ContextEntry, ContextError> {
        if entries.is_empty() {
            return Err(ContextError::EmptyMerge);
        }
        if entries.len() == 1 {
            return Ok(entries.into_iter().next().unwrap());
        }

        match strategy {
            MergeStrategy::LatestWins => Ok(merge_latest_wins(entries)),
            MergeStrategy::CombineAll => Ok(merge_combine_all(entries)),
            MergeStrategy::PriorityBased => Ok(merge_priority_based(entries)),
        }
    }

    /// Case-insensitive regex search over stringified content, sorted by
    /// match count.
    pub async fn search_content(&self, pattern: &str) -> Result<Vec<SearchMatch>, ContextError> {
        let regex = regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ContextError::Validation(format!("invalid pattern: {e}")))?;

        let inner = self.inner.read().await;
        let mut matches: Vec<SearchMatch> = inner
            .entries
            .values()
            .filter_map(|entry| {
                let content = entry.content.to_string();
                let count = regex.find_iter(&content).count();
                (count > 0).then(|| SearchMatch {
                    entry_id: entry.id.clone(),
                    match_count: count,
                    source: entry.metadata.source,
                    timestamp: entry.metadata.timestamp,
                })
            })
            .collect();

        matches.sort_by(|a, b| b.match_count.cmp(&a.match_count));
        Ok(matches)
    }

    /// Shared-reference, shared-tag and temporal-proximity relationships
    /// between the given entries (or all entries when none are named).
    pub async fn analyze_relationships(&self, entry_ids: Option<&[String]>) -> ContextRelationships {
        let inner = self.inner.read().await;
        let entries: Vec<&ContextEntry> = match entry_ids {
            Some(ids) => ids.iter().filter_map(|id| inner.entries.get(id)).collect(),
            None => inner.entries.values().collect(),
        };

        let mut relationships = ContextRelationships::default();

        let mut by_reference: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut by_tag: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in &entries {
            for reference in &entry.metadata.references {
                by_reference
                    .entry(reference.as_str())
                    .or_default()
                    .push(entry.id.as_str());
            }
            for tag in &entry.metadata.tags {
                by_tag.entry(tag.as_str()).or_default().push(entry.id.as_str());
            }
        }
        for (reference, ids) in by_reference {
            if ids.len() > 1 {
                relationships.shared_references.push(SharedLink {
                    key: reference.to_string(),
                    entries: ids.into_iter().map(str::to_string).collect(),
                });
            }
        }
        for (tag, ids) in by_tag {
            if ids.len() > 1 {
                relationships.shared_tags.push(SharedLink {
                    key: tag.to_string(),
                    entries: ids.into_iter().map(str::to_string).collect(),
                });
            }
        }

        let mut ordered: Vec<&ContextEntry> = entries;
        ordered.sort_by_key(|e| e.metadata.timestamp);
        for pair in ordered.windows(2) {
            let diff = (pair[1].metadata.timestamp - pair[0].metadata.timestamp)
                .num_milliseconds() as f64
                / 1000.0;
            if diff < 60.0 {
                relationships.temporal.push(TemporalLink {
                    entries: [pair[0].id.clone(), pair[1].id.clone()],
                    time_difference_secs: diff,
                });
            }
        }

        relationships
    }

    /// Remove entries past the retention period or their individual expiry.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .entries
                .values()
                .filter(|entry| {
                    let past_retention = self.config.retention_period_secs.is_some_and(|secs| {
                        (now - entry.metadata.timestamp).num_seconds() as u64 > secs
                    });
                    let past_expiry = entry.metadata.expiry.is_some_and(|expiry| now > expiry);
                    past_retention || past_expiry
                })
                .map(|entry| entry.id.clone())
                .collect()
        };

        for entry_id in expired {
            if let Err(e) = self.remove_entry(&entry_id).await {
                tracing::warn!("cleanup failed for {entry_id}: {e}");
            }
        }
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active_count()
    }
}

/// Transition the oldest active entries to ARCHIVED and drop them from the
/// active indexes until the store is back under the limit.
fn archive_oldest(inner: &mut ContextInner, max_entries: usize) {
    let mut active: Vec<(String, DateTime<Utc>)> = inner
        .entries
        .values()
        .filter(|entry| entry.metadata.state == ContextState::Active)
        .map(|entry| (entry.id.clone(), entry.metadata.timestamp))
        .collect();
    active.sort_by_key(|(_, ts)| *ts);

    let mut over_by = (inner.active_count() + 1).saturating_sub(max_entries);
    for (entry_id, _) in active {
        if over_by == 0 {
            break;
        }
        if let Some(mut entry) = inner.entries.remove(&entry_id) {
            inner.deindex_entry(&entry);
            entry.metadata.state = ContextState::Archived;
            inner.entries.insert(entry_id, entry);
            over_by -= 1;
        }
    }
}

fn union_metadata(entries: &[ContextEntry]) -> (HashSet<String>, HashSet<String>) {
    let mut tags = HashSet::new();
    let mut references = HashSet::new();
    for entry in entries {
        tags.extend(entry.metadata.tags.iter().cloned());
        references.extend(entry.metadata.references.iter().cloned());
    }
    (tags, references)
}

fn merge_latest_wins(entries: Vec<ContextEntry>) -> ContextEntry {
    let (tags, references) = union_metadata(&entries);
    let latest = entries
        .into_iter()
        .max_by_key(|e| e.metadata.timestamp)
        .expect("non-empty entries");

    let mut metadata = latest.metadata.clone();
    metadata.tags = tags;
    metadata.references = references;
    metadata.timestamp = Utc::now();

    ContextEntry {
        id: latest.id,
        content: latest.content,
        metadata,
    }
}

/// Recursive JSON object merge; later values win on conflicts, object
/// values merge key by key.
fn deep_merge(base: &mut serde_json::Map<String, Value>, overlay: &serde_json::Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_combine_all(entries: Vec<ContextEntry>) -> ContextEntry {
    let all_maps = entries.iter().all(|e| e.content.is_object());
    let content = if all_maps {
        let mut merged = serde_json::Map::new();
        for entry in &entries {
            if let Value::Object(map) = &entry.content {
                deep_merge(&mut merged, map);
            }
        }
        Value::Object(merged)
    } else {
        Value::String(
            entries
                .iter()
                .map(|e| match &e.content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };

    let highest_level = entries
        .iter()
        .map(|e| e.metadata.level)
        .max_by_key(ContextLevel::rank)
        .expect("non-empty entries");

    let (tags, references) = union_metadata(&entries);
    let mut custom_data = serde_json::Map::new();
    for entry in &entries {
        for (key, value) in &entry.metadata.custom_data {
            custom_data.insert(key.clone(), value.clone());
        }
    }

    let first = &entries[0];
    ContextEntry {
        id: first.id.clone(),
        content,
        metadata: ContextMetadata {
            source: first.metadata.source,
            level: highest_level,
            state: ContextState::Active,
            timestamp: Utc::now(),
            expiry: None,
            tags,
            references,
            custom_data,
        },
    }
}

fn merge_priority_based(entries: Vec<ContextEntry>) -> ContextEntry {
    let (tags, references) = union_metadata(&entries);
    let highest = entries
        .into_iter()
        .max_by_key(|e| e.metadata.level.rank())
        .expect("non-empty entries");

    let mut metadata = highest.metadata.clone();
    metadata.tags = tags;
    metadata.references = references;
    metadata.state = ContextState::Active;
    metadata.timestamp = Utc::now();

    ContextEntry {
        id: highest.id,
        content: highest.content,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<ContextStore> {
        ContextStore::new(EventBus::new(), ContextConfig::default())
    }

    fn metadata(source: ContextSource, level: ContextLevel) -> ContextMetadata {
        ContextMetadata::new(source, level)
    }

    #[tokio::test]
    async fn add_maintains_every_index() {
        let store = store();
        let entry = store
            .add_entry(
                json!({"text": "hello"}),
                metadata(ContextSource::Conversation, ContextLevel::Relevant)
                    .with_tags(["greeting".to_string()])
                    .with_references(["doc-1".to_string()]),
            )
            .await
            .unwrap();

        let by_source = store
            .query(&ContextQuery {
                sources: Some([ContextSource::Conversation].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].id, entry.id);

        let by_tag = store
            .query(&ContextQuery {
                tags: Some(["greeting".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_tag.len(), 1);
    }

    #[tokio::test]
    async fn remove_then_reinsert_restores_indexes() {
        let store = store();
        let entry = store
            .add_entry(
                json!({"text": "hello"}),
                metadata(ContextSource::Document, ContextLevel::Important)
                    .with_tags(["t1".to_string()])
                    .with_references(["r1".to_string()]),
            )
            .await
            .unwrap();

        let removed = store.remove_entry(&entry.id).await.unwrap();
        assert_eq!(store.entry_count().await, 0);
        assert!(store
            .query(&ContextQuery {
                tags: Some(["t1".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .await
            .is_empty());

        store.insert_entry(removed).await.unwrap();
        let by_tag = store
            .query(&ContextQuery {
                tags: Some(["t1".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, entry.id);
    }

    #[tokio::test]
    async fn query_sorts_newest_first_and_limits() {
        let store = store();
        for i in 0..5 {
            let mut meta = metadata(ContextSource::Conversation, ContextLevel::Relevant);
            meta.timestamp = Utc::now() - chrono::Duration::seconds(10 - i);
            store.add_entry(json!({"n": i}), meta).await.unwrap();
        }

        let results = store
            .query(&ContextQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content["n"], json!(4));
        assert_eq!(results[1].content["n"], json!(3));
    }

    #[tokio::test]
    async fn query_filters_by_state_and_time() {
        let store = store();
        let keep = store
            .add_entry(
                json!({}),
                metadata(ContextSource::System, ContextLevel::Relevant),
            )
            .await
            .unwrap();
        let archived = store
            .add_entry(
                json!({}),
                metadata(ContextSource::System, ContextLevel::Relevant),
            )
            .await
            .unwrap();
        store
            .update_entry(
                &archived.id,
                ContextUpdate {
                    state: Some(ContextState::Archived),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store
            .query(&ContextQuery {
                states: Some([ContextState::Active].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
    }

    #[tokio::test]
    async fn update_reindexes_tags() {
        let store = store();
        let entry = store
            .add_entry(
                json!({}),
                metadata(ContextSource::Analysis, ContextLevel::Relevant),
            )
            .await
            .unwrap();

        store
            .update_entry(
                &entry.id,
                ContextUpdate {
                    add_tags: ["fresh".to_string()].into_iter().collect(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let by_tag = store
            .query(&ContextQuery {
                tags: Some(["fresh".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_tag.len(), 1);
    }

    #[test]
    fn latest_wins_single_entry_is_identity() {
        let entry = ContextEntry {
            id: "e1".to_string(),
            content: json!({"a": 1}),
            metadata: metadata(ContextSource::Conversation, ContextLevel::Critical),
        };
        let merged =
            ContextStore::merge_entries(vec![entry.clone()], MergeStrategy::LatestWins).unwrap();
        assert_eq!(merged.id, entry.id);
        assert_eq!(merged.content, entry.content);
        assert_eq!(merged.metadata.timestamp, entry.metadata.timestamp);
    }

    #[test]
    fn latest_wins_takes_newest_content_and_unions() {
        let mut old_meta = metadata(ContextSource::Conversation, ContextLevel::Background)
            .with_tags(["old".to_string()]);
        old_meta.timestamp = Utc::now() - chrono::Duration::seconds(60);
        let old = ContextEntry {
            id: "old".to_string(),
            content: json!("old"),
            metadata: old_meta,
        };
        let new = ContextEntry {
            id: "new".to_string(),
            content: json!("new"),
            metadata: metadata(ContextSource::Document, ContextLevel::Critical)
                .with_tags(["new".to_string()]),
        };

        let merged =
            ContextStore::merge_entries(vec![old, new], MergeStrategy::LatestWins).unwrap();
        assert_eq!(merged.id, "new");
        assert_eq!(merged.content, json!("new"));
        assert!(merged.metadata.tags.contains("old"));
        assert!(merged.metadata.tags.contains("new"));
    }

    #[test]
    fn combine_all_deep_merges_maps() {
        let first = ContextEntry {
            id: "a".to_string(),
            content: json!({"outer": {"x": 1}, "keep": true}),
            metadata: metadata(ContextSource::Conversation, ContextLevel::Background),
        };
        let second = ContextEntry {
            id: "b".to_string(),
            content: json!({"outer": {"y": 2}}),
            metadata: metadata(ContextSource::Analysis, ContextLevel::Critical),
        };

        let merged =
            ContextStore::merge_entries(vec![first, second], MergeStrategy::CombineAll).unwrap();
        assert_eq!(merged.content["outer"]["x"], json!(1));
        assert_eq!(merged.content["outer"]["y"], json!(2));
        assert_eq!(merged.content["keep"], json!(true));
        assert_eq!(merged.metadata.level, ContextLevel::Critical);
        assert_eq!(merged.metadata.state, ContextState::Active);
    }

    #[test]
    fn combine_all_concatenates_non_maps() {
        let first = ContextEntry {
            id: "a".to_string(),
            content: json!("line one"),
            metadata: metadata(ContextSource::Conversation, ContextLevel::Relevant),
        };
        let second = ContextEntry {
            id: "b".to_string(),
            content: json!({"x": 1}),
            metadata: metadata(ContextSource::Conversation, ContextLevel::Relevant),
        };

        let merged =
            ContextStore::merge_entries(vec![first, second], MergeStrategy::CombineAll).unwrap();
        let text = merged.content.as_str().unwrap();
        assert!(text.contains("line one"));
        assert!(text.contains("{\"x\":1}"));
    }

    #[test]
    fn priority_based_takes_highest_level() {
        let low = ContextEntry {
            id: "low".to_string(),
            content: json!("background"),
            metadata: metadata(ContextSource::Conversation, ContextLevel::Background)
                .with_references(["r1".to_string()]),
        };
        let high = ContextEntry {
            id: "high".to_string(),
            content: json!("critical"),
            metadata: metadata(ContextSource::System, ContextLevel::Critical),
        };

        let merged =
            ContextStore::merge_entries(vec![low, high], MergeStrategy::PriorityBased).unwrap();
        assert_eq!(merged.id, "high");
        assert_eq!(merged.content, json!("critical"));
        assert!(merged.metadata.references.contains("r1"));
    }

    #[tokio::test]
    async fn archival_keeps_store_under_limit() {
        let config = ContextConfig {
            max_entries: 3,
            ..ContextConfig::default()
        };
        let store = ContextStore::new(EventBus::new(), config);

        for i in 0..5 {
            let mut meta = metadata(ContextSource::Conversation, ContextLevel::Relevant);
            meta.timestamp = Utc::now() - chrono::Duration::seconds(100 - i);
            store.add_entry(json!({"n": i}), meta).await.unwrap();
        }

        assert!(store.active_count().await <= 3);
        // Archived entries remain retrievable but leave the active indexes.
        assert_eq!(store.entry_count().await, 5);
        let archived = store
            .query(&ContextQuery {
                states: Some([ContextState::Archived].into_iter().collect()),
                ..Default::default()
            })
            .await;
        assert_eq!(archived.len(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let store = store();
        let mut meta = metadata(ContextSource::Conversation, ContextLevel::Relevant);
        meta.expiry = Some(Utc::now() - chrono::Duration::seconds(1));
        store.add_entry(json!({}), meta).await.unwrap();
        store
            .add_entry(
                json!({}),
                metadata(ContextSource::Conversation, ContextLevel::Relevant),
            )
            .await
            .unwrap();

        store.sweep_expired().await;
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn search_ranks_by_match_count() {
        let store = store();
        store
            .add_entry(
                json!({"text": "alpha beta alpha"}),
                metadata(ContextSource::Document, ContextLevel::Relevant),
            )
            .await
            .unwrap();
        store
            .add_entry(
                json!({"text": "alpha"}),
                metadata(ContextSource::Document, ContextLevel::Relevant),
            )
            .await
            .unwrap();

        let matches = store.search_content("alpha").await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].match_count, 2);
        assert_eq!(matches[1].match_count, 1);
    }

    #[tokio::test]
    async fn relationships_detect_shared_keys() {
        let store = store();
        store
            .add_entry(
                json!({}),
                metadata(ContextSource::Conversation, ContextLevel::Relevant)
                    .with_references(["shared".to_string()]),
            )
            .await
            .unwrap();
        store
            .add_entry(
                json!({}),
                metadata(ContextSource::Analysis, ContextLevel::Relevant)
                    .with_references(["shared".to_string()]),
            )
            .await
            .unwrap();

        let relationships = store.analyze_relationships(None).await;
        assert_eq!(relationships.shared_references.len(), 1);
        assert_eq!(relationships.shared_references[0].key, "shared");
        assert_eq!(relationships.shared_references[0].entries.len(), 2);
        // Both added within a minute of each other.
        assert_eq!(relationships.temporal.len(), 1);
    }
}
