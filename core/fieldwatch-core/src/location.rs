//! Location ingestion.
//!
//! Each worker has one track: the current fix plus a ring buffer of accepted
//! samples. The DashMap entry lock serializes writers for a single worker while
//! different workers proceed in parallel.
//!
//! Current location is ordered by *sample* time. A late or replayed sample is
//! accepted as a no-op so devices that retry never see an error for it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::LocationConfig;
use crate::error::{FieldwatchError, Result};
use crate::types::{LocationSample, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationOutcome {
    Accepted,
    /// Not newer than the stored fix; nothing changed.
    Stale,
}

#[derive(Debug, Default)]
struct WorkerTrack {
    current: Option<LocationSample>,
    history: VecDeque<LocationSample>,
}

#[derive(Debug)]
pub struct LocationIngestor {
    accuracy_threshold_m: f64,
    history_capacity: usize,
    tracks: DashMap<WorkerId, WorkerTrack>,
}

impl LocationIngestor {
    pub fn new(config: &LocationConfig) -> Self {
        Self {
            accuracy_threshold_m: config.accuracy_threshold_m,
            history_capacity: config.history_capacity.max(1),
            tracks: DashMap::new(),
        }
    }

    pub fn submit(&self, sample: LocationSample) -> Result<LocationOutcome> {
        if let Err(reason) = self.check_sample(&sample) {
            tracing::warn!(
                worker_id = %sample.worker_id,
                accuracy_m = sample.accuracy_m,
                reason = %reason,
                "Location sample rejected"
            );
            return Err(FieldwatchError::InvalidSample {
                worker_id: sample.worker_id,
                reason,
            });
        }

        let mut track = self.tracks.entry(sample.worker_id.clone()).or_default();
        if let Some(current) = &track.current {
            if sample.sampled_at <= current.sampled_at {
                tracing::debug!(
                    worker_id = %sample.worker_id,
                    sampled_at = %sample.sampled_at.to_rfc3339(),
                    current_at = %current.sampled_at.to_rfc3339(),
                    "Stale location sample ignored"
                );
                return Ok(LocationOutcome::Stale);
            }
        }

        if track.history.len() >= self.history_capacity {
            track.history.pop_front();
        }
        track.history.push_back(sample.clone());
        tracing::debug!(
            worker_id = %sample.worker_id,
            lat = sample.lat,
            lng = sample.lng,
            accuracy_m = sample.accuracy_m,
            "Location sample accepted"
        );
        track.current = Some(sample);
        Ok(LocationOutcome::Accepted)
    }

    fn check_sample(&self, sample: &LocationSample) -> std::result::Result<(), String> {
        if !sample.point().is_valid() {
            return Err(format!(
                "coordinates out of range ({}, {})",
                sample.lat, sample.lng
            ));
        }
        if !sample.accuracy_m.is_finite() || sample.accuracy_m < 0.0 {
            return Err(format!("accuracy {} is not a distance", sample.accuracy_m));
        }
        if sample.accuracy_m > self.accuracy_threshold_m {
            return Err(format!(
                "accuracy {:.1}m exceeds {:.1}m threshold",
                sample.accuracy_m, self.accuracy_threshold_m
            ));
        }
        Ok(())
    }

    pub fn current_location(&self, worker_id: &str) -> Option<LocationSample> {
        self.tracks
            .get(worker_id)
            .and_then(|track| track.current.clone())
    }

    /// Accepted samples, oldest first.
    pub fn history(&self, worker_id: &str) -> Vec<LocationSample> {
        self.tracks
            .get(worker_id)
            .map(|track| track.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_sampled_at(&self, worker_id: &str) -> Option<DateTime<Utc>> {
        self.tracks
            .get(worker_id)
            .and_then(|track| track.current.as_ref().map(|s| s.sampled_at))
    }

    pub fn forget(&self, worker_id: &str) {
        self.tracks.remove(worker_id);
    }
}
