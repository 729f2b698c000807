//! Worker registry: the leaf every other component looks workers up in.

use dashmap::DashMap;

use crate::error::{FieldwatchError, Result};
use crate::types::{ScheduledActivity, Worker, WorkerId};

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Worker) -> Result<()> {
        validate_id(&worker.id, "worker id")?;
        if worker.name.trim().is_empty() {
            return Err(FieldwatchError::InvalidRequest(
                "worker name is required".to_string(),
            ));
        }
        if let Some(activity) = &worker.activity {
            validate_activity(activity)?;
        }

        match self.workers.entry(worker.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(FieldwatchError::DuplicateWorker(worker.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    worker_id = %worker.id,
                    role = %worker.role,
                    department = %worker.department,
                    "Worker registered"
                );
                slot.insert(worker);
                Ok(())
            }
        }
    }

    pub fn deactivate(&self, worker_id: &str) -> Result<Worker> {
        let (_, worker) = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| FieldwatchError::UnknownWorker(worker_id.to_string()))?;
        tracing::info!(worker_id = %worker_id, "Worker deactivated");
        Ok(worker)
    }

    /// Replaces the worker's assigned activity; `None` clears the obligation.
    pub fn assign_activity(
        &self,
        worker_id: &str,
        activity: Option<ScheduledActivity>,
    ) -> Result<()> {
        if let Some(activity) = &activity {
            validate_activity(activity)?;
        }
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| FieldwatchError::UnknownWorker(worker_id.to_string()))?;
        tracing::info!(
            worker_id = %worker_id,
            activity_id = ?activity.as_ref().map(|a| a.id.as_str()),
            activity_type = ?activity.as_ref().map(|a| a.activity_type),
            "Activity assigned"
        );
        worker.activity = activity;
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.get(worker_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    pub fn require(&self, worker_id: &str) -> Result<Worker> {
        self.get(worker_id)
            .ok_or_else(|| FieldwatchError::UnknownWorker(worker_id.to_string()))
    }

    pub fn current_activity(&self, worker_id: &str) -> Result<Option<ScheduledActivity>> {
        self.workers
            .get(worker_id)
            .map(|worker| worker.activity.clone())
            .ok_or_else(|| FieldwatchError::UnknownWorker(worker_id.to_string()))
    }

    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.iter().map(|e| e.value().clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Workers with an assigned activity.
    pub fn ids_with_activity(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|entry| entry.activity.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

pub(crate) fn validate_id(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FieldwatchError::InvalidRequest(format!("{} is required", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(FieldwatchError::InvalidRequest(format!(
            "{} must be {} characters or fewer",
            field, MAX_ID_LEN
        )));
    }
    Ok(())
}

fn validate_activity(activity: &ScheduledActivity) -> Result<()> {
    validate_id(&activity.id, "activity id")?;
    if activity.end <= activity.start {
        return Err(FieldwatchError::InvalidRequest(
            "activity end must be after start".to_string(),
        ));
    }
    if activity.required_interval_minutes == 0 {
        return Err(FieldwatchError::InvalidRequest(
            "activity check-in interval must be positive".to_string(),
        ));
    }
    Ok(())
}
