use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use super::types::TrackAnalysis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub duration_seconds: f64,
}

/// Track metadata and cross-session analysis storage, owned by the host.
pub trait TrackCatalog: Send + Sync {
    fn track_info(&self, track_id: &str) -> Option<TrackInfo>;
    fn get_cached_analysis(&self, track_id: &str) -> Option<TrackAnalysis>;
    fn put_cached_analysis(&self, track_id: &str, analysis: TrackAnalysis);
}

/// In-process catalog for hosts without their own library database.
#[derive(Default)]
pub struct MemoryCatalog {
    tracks: Mutex<HashMap<String, TrackInfo>>,
    analyses: Mutex<HashMap<String, TrackAnalysis>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, info: TrackInfo) {
        self.tracks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(info.id.clone(), info);
    }
}

impl TrackCatalog for MemoryCatalog {
    fn track_info(&self, track_id: &str) -> Option<TrackInfo> {
        self.tracks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(track_id)
            .cloned()
    }

    fn get_cached_analysis(&self, track_id: &str) -> Option<TrackAnalysis> {
        self.analyses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(track_id)
            .cloned()
    }

    fn put_cached_analysis(&self, track_id: &str, analysis: TrackAnalysis) {
        self.analyses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(track_id.to_string(), analysis);
    }
}

/// Bounded least-recently-used set of analyses kept hot for planning.
#[derive(Debug)]
pub struct AnalysisCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Arc<TrackAnalysis>>,
}

impl AnalysisCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Lookup that also marks the entry as most recently used.
    pub fn get(&mut self, track_id: &str) -> Option<Arc<TrackAnalysis>> {
        let hit = self.entries.get(track_id).cloned()?;
        self.touch(track_id);
        Some(hit)
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.entries.contains_key(track_id)
    }

    /// Insert or refresh; returns the id evicted to make room, if any.
    pub fn insert(&mut self, analysis: Arc<TrackAnalysis>) -> Option<String> {
        let id = analysis.track_id.clone();
        if self.entries.insert(id.clone(), analysis).is_some() {
            self.touch(&id);
            return None;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            let evicted = self.order.pop_front()?;
            self.entries.remove(&evicted);
            log::debug!("Evicted analysis for {evicted}");
            return Some(evicted);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, track_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == track_id) {
            if let Some(id) = self.order.remove(pos) {
                self.order.push_back(id);
            }
        }
    }
}
