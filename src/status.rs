use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use ts_rs::TS;

/// Health status of a component.
#[derive(Debug, Clone, Serialize, PartialEq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ComponentStatus {
    Starting,
    Active,
    Connected,
    Draining,
    Error,
}

/// A timestamped status entry for a component.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status: ComponentStatus,
    pub updated_at: Instant,
}

/// Thread-safe registry for components to self-report their health status.
#[derive(Debug, Clone, Default)]
pub struct ComponentStatusRegistry {
    inner: Arc<DashMap<String, StatusEntry>>,
}

impl ComponentStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates the status for a named component.
    pub fn set(&self, name: &str, status: ComponentStatus) {
        self.inner.insert(
            name.to_owned(),
            StatusEntry {
                status,
                updated_at: Instant::now(),
            },
        );
    }

    /// Returns the current status of a named component, if present.
    pub fn get(&self, name: &str) -> Option<ComponentStatus> {
        self.inner.get(name).map(|entry| entry.status.clone())
    }

    /// Returns a snapshot of all component statuses.
    pub fn all(&self) -> Vec<(String, ComponentStatus)> {
        let mut statuses: Vec<_> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status.clone()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }
}
