use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde::Serialize;

use crate::stores::now_ms;

/// One thread with an in-progress turn.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveThread {
    pub profile_id: String,
    pub thread_id: String,
    pub turn_id: Option<String>,
    pub started_at: i64,
}

/// In-memory, profile-scoped map of threads that currently have a turn in
/// flight. Non-persistent: empty after restart, and tolerant of completion
/// events for threads it never saw.
#[derive(Debug, Default)]
pub struct ActivityMap {
    inner: Mutex<HashMap<String, HashMap<String, ActiveThread>>>,
}

impl ActivityMap {
    /// Marks a thread started, preserving the original `started_at` and
    /// falling back to the previously known turn id when the event carries
    /// none.
    pub fn mark_started(&self, profile_id: &str, thread_id: &str, turn_id: Option<String>) {
        let mut guard = self.inner.lock().expect("activity map poisoned");
        let threads = guard.entry(profile_id.to_string()).or_default();
        match threads.get_mut(thread_id) {
            Some(existing) => {
                if turn_id.is_some() {
                    existing.turn_id = turn_id;
                }
            }
            None => {
                threads.insert(
                    thread_id.to_string(),
                    ActiveThread {
                        profile_id: profile_id.to_string(),
                        thread_id: thread_id.to_string(),
                        turn_id,
                        started_at: now_ms(),
                    },
                );
            }
        }
    }

    /// Drops a thread; removes the profile key once it holds no threads.
    pub fn mark_completed(&self, profile_id: &str, thread_id: &str) {
        let mut guard = self.inner.lock().expect("activity map poisoned");
        if let Some(threads) = guard.get_mut(profile_id) {
            threads.remove(thread_id);
            if threads.is_empty() {
                guard.remove(profile_id);
            }
        }
    }

    /// Drops every thread for a profile (stop/exit path).
    pub fn clear_profile(&self, profile_id: &str) {
        self.inner
            .lock()
            .expect("activity map poisoned")
            .remove(profile_id);
    }

    pub fn list(&self) -> Vec<ActiveThread> {
        let guard = self.inner.lock().expect("activity map poisoned");
        let mut threads: Vec<ActiveThread> = guard
            .values()
            .flat_map(|per_profile| per_profile.values().cloned())
            .collect();
        threads.sort_by(|a, b| {
            a.profile_id
                .cmp(&b.profile_id)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        threads
    }

    pub fn is_active(&self, profile_id: &str, thread_id: &str) -> bool {
        self.inner
            .lock()
            .expect("activity map poisoned")
            .get(profile_id)
            .is_some_and(|threads| threads.contains_key(thread_id))
    }
}
