//! Hosting surface for multiple sessions.
//!
//! The engine itself runs one transfer. Hosts that queue many of them talk
//! to an `Executor`: submit a session, pause or cancel it by its opaque id,
//! and bound how many run at once. `EngineRegistry` is the provided
//! implementation, a registry of live engines behind a permit pool.

use crate::engine::{DownloadEngine, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

/// The scheduling interface a hosting request handler programs against.
pub trait Executor: Send + Sync {
    /// Takes ownership of a prepared session and schedules it. The
    /// returned id addresses `pause` and `cancel`.
    fn submit(&self, engine: DownloadEngine) -> Uuid;
    fn pause(&self, id: Uuid);
    fn resume(&self, id: Uuid);
    fn cancel(&self, id: Uuid);
    /// How many sessions may run concurrently.
    fn degree_of_parallelism(&self) -> usize;
}

/// Registry of active engines with permit-bounded concurrency.
#[derive(Clone)]
pub struct EngineRegistry {
    active: Arc<Mutex<HashMap<Uuid, DownloadEngine>>>,
    permits: Arc<Semaphore>,
    parallelism: usize,
}

impl EngineRegistry {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active.lock().await.contains_key(&id)
    }

    /// Aggregate view for host status surfaces: active session count and
    /// their summed bytes/s.
    pub async fn global_status(&self) -> (usize, u64) {
        let active = self.active.lock().await;
        let mut total_speed = 0;
        for engine in active.values() {
            total_speed += engine.progress_snapshot().speed_bps;
        }
        (active.len(), total_speed)
    }

    async fn with_engine(&self, id: Uuid, f: impl FnOnce(&DownloadEngine)) {
        let active = self.active.lock().await;
        if let Some(engine) = active.get(&id) {
            f(engine);
        }
    }
}

impl Executor for EngineRegistry {
    fn submit(&self, engine: DownloadEngine) -> Uuid {
        let id = engine.id();
        let active = Arc::clone(&self.active);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            active.lock().await.insert(id, engine.clone());

            // Closed semaphores never happen here; the pool lives as long
            // as the registry.
            let Ok(_permit) = permits.acquire().await else {
                active.lock().await.remove(&id);
                return;
            };
            // The session may have been cancelled while queued.
            if engine.state() != SessionState::Cancelled {
                engine.start();
                let _ = engine.wait().await;
            }

            active.lock().await.remove(&id);
        });

        id
    }

    fn pause(&self, id: Uuid) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.with_engine(id, |engine| engine.pause()).await;
        });
    }

    fn resume(&self, id: Uuid) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.with_engine(id, |engine| engine.resume()).await;
        });
    }

    fn cancel(&self, id: Uuid) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.with_engine(id, |engine| engine.cancel()).await;
        });
    }

    fn degree_of_parallelism(&self) -> usize {
        self.parallelism
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_is_at_least_one() {
        let registry = EngineRegistry::new(0);
        assert_eq!(registry.degree_of_parallelism(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let registry = EngineRegistry::new(2);
        assert!(!registry.is_active(Uuid::new_v4()).await);
        // No panic on addressing a session that never existed.
        registry.pause(Uuid::new_v4());
        registry.cancel(Uuid::new_v4());
        let (count, speed) = registry.global_status().await;
        assert_eq!(count, 0);
        assert_eq!(speed, 0);
    }
}
