//! Per-user profile
//!
//! Holds the lazily maintained topic centroids (mean vector of a topic's
//! non-archived items) and the user's CRS configuration overrides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::CrsConfig;
use crate::model::item::TopicId;

/// Running centroid for one topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicCentroid {
    /// Mean vector of the topic's non-archived items
    pub vector: Vec<f32>,
    /// Number of items contributing to the mean
    pub item_count: usize,
}

impl TopicCentroid {
    /// Whether the topic has enough items for similarity to be meaningful
    pub fn is_established(&self) -> bool {
        self.item_count >= 3
    }

    /// Fold one vector into the running mean
    pub fn add(&mut self, vector: &[f32]) {
        if self.vector.len() != vector.len() {
            self.vector = vec![0.0; vector.len()];
            self.item_count = 0;
        }
        let n = self.item_count as f32;
        for (c, v) in self.vector.iter_mut().zip(vector) {
            *c = (*c * n + v) / (n + 1.0);
        }
        self.item_count += 1;
    }

    /// Remove one vector from the running mean
    pub fn remove(&mut self, vector: &[f32]) {
        if self.item_count == 0 || self.vector.len() != vector.len() {
            return;
        }
        let n = self.item_count as f32;
        if self.item_count == 1 {
            self.vector.iter_mut().for_each(|c| *c = 0.0);
        } else {
            for (c, v) in self.vector.iter_mut().zip(vector) {
                *c = (*c * n - v) / (n - 1.0);
            }
        }
        self.item_count -= 1;
    }
}

/// Per-user profile: topic centroids and CRS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Owning user
    pub user_id: String,
    /// Topic → running centroid, updated lazily on ingest/archive
    pub centroids: HashMap<TopicId, TopicCentroid>,
    /// Effective CRS configuration for this user
    pub crs: CrsConfig,
    /// Last profile mutation
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Fresh profile with the given CRS defaults
    pub fn new(user_id: &str, crs: CrsConfig) -> Self {
        Self {
            user_id: user_id.to_string(),
            centroids: HashMap::new(),
            crs,
            updated_at: Utc::now(),
        }
    }

    /// The centroid for a topic, if the topic is established (≥ 3 items)
    pub fn established_centroid(&self, topic: &TopicId) -> Option<&[f32]> {
        self.centroids
            .get(topic)
            .filter(|c| c.is_established())
            .map(|c| c.vector.as_slice())
    }

    /// Fold a new item vector into its topic centroid
    pub fn observe_item(&mut self, topic: &TopicId, vector: &[f32]) {
        self.centroids
            .entry(topic.clone())
            .or_insert_with(|| TopicCentroid {
                vector: vec![0.0; vector.len()],
                item_count: 0,
            })
            .add(vector);
        self.updated_at = Utc::now();
    }

    /// Remove an archived/erased item vector from its topic centroid
    pub fn forget_item(&mut self, topic: &TopicId, vector: &[f32]) {
        if let Some(centroid) = self.centroids.get_mut(topic) {
            centroid.remove(vector);
            if centroid.item_count == 0 {
                self.centroids.remove(topic);
            }
        }
        self.updated_at = Utc::now();
    }
}
