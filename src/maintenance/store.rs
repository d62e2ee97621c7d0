// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Schedule and history store.
//!
//! Everything sits behind one mutex. Callers copy what they need out, drop
//! the lock, talk to the cluster, then come back to record the result.
//! Windows being worked on by a sweep (or a cancel) are "claimed" so no
//! other caller can act on them at the same time. A claim is a guard: if
//! its holder goes away without finishing, the claim is dropped with it.
//!
//! The state file is written outside the lock. Each mutation takes a
//! numbered snapshot and a snapshot older than the last one written is
//! discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{MaintenanceRecord, MaintenanceWindow};

/// What gets written to the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    windows: Vec<MaintenanceWindow>,
    #[serde(default)]
    records: Vec<MaintenanceRecord>,
}

#[derive(Default)]
struct StoreState {
    data: PersistedState,
    in_flight: HashSet<String>,
    revision: u64,
}

/// Windows handed to a sweep. Activations and expiries are claimed;
/// missed windows have already been retired.
pub struct DueWindows<'a> {
    pub activate: Vec<ClaimGuard<'a>>,
    pub expire: Vec<ClaimGuard<'a>>,
    pub missed: Vec<MaintenanceWindow>,
}

impl DueWindows<'_> {
    pub fn is_empty(&self) -> bool {
        self.activate.is_empty() && self.expire.is_empty() && self.missed.is_empty()
    }
}

/// Flag to set on a window when its claim is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTransition {
    Started,
    Completed,
}

/// Result of trying to claim a single window
pub enum Claim<'a> {
    Claimed(ClaimGuard<'a>),
    Busy,
    NotFound,
}

/// A claimed window. Dropping it without [`ClaimGuard::finish`] or
/// [`ClaimGuard::remove`] releases the claim and leaves the window as it was.
pub struct ClaimGuard<'a> {
    store: &'a MaintenanceStore,
    window: MaintenanceWindow,
    done: bool,
}

impl ClaimGuard<'_> {
    pub fn window(&self) -> &MaintenanceWindow {
        &self.window
    }

    /// Release the claim, applying `transition` if the work succeeded
    pub fn finish(mut self, transition: Option<WindowTransition>) {
        self.done = true;
        self.store.release(&self.window.id, transition);
    }

    /// Delete the claimed window
    pub fn remove(mut self) -> Option<MaintenanceWindow> {
        self.done = true;
        self.store.remove_window(&self.window.id, &self.window.cluster_id, &self.window.node)
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Dropping unfinished claim on maintenance window {}", self.window.id);
            self.store.release(&self.window.id, None);
        }
    }
}

/// Writes snapshots to the state file, newest wins
struct StateWriter {
    path: PathBuf,
    written: Mutex<u64>,
}

impl StateWriter {
    fn write(&self, revision: u64, json: &str) {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if revision <= *written {
            return;
        }
        match write_atomic(&self.path, json) {
            Ok(()) => *written = revision,
            Err(e) => warn!("Failed to save maintenance state to {}: {}", self.path.display(), e),
        }
    }
}

pub struct MaintenanceStore {
    state: Mutex<StoreState>,
    writer: Option<Arc<StateWriter>>,
}

impl MaintenanceStore {
    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            writer: None,
        }
    }

    /// Store backed by a JSON file. An unreadable file starts an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Ignoring unreadable maintenance state {}: {}", path.display(), e);
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        };
        debug!("Loaded {} windows and {} records from {}", data.windows.len(), data.records.len(), path.display());
        Self {
            state: Mutex::new(StoreState { data, in_flight: HashSet::new(), revision: 0 }),
            writer: Some(Arc::new(StateWriter { path, written: Mutex::new(0) })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot the state, drop the lock, then write the snapshot. On a
    /// tokio runtime the write goes to the blocking pool.
    fn commit(&self, mut state: MutexGuard<'_, StoreState>) {
        let Some(writer) = &self.writer else { return };
        state.revision += 1;
        let revision = state.revision;
        let json = match serde_json::to_string_pretty(&state.data) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize maintenance state: {}", e);
                return;
            }
        };
        drop(state);

        let writer = writer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || writer.write(revision, &json));
            }
            Err(_) => writer.write(revision, &json),
        }
    }

    // ─── Windows ───

    pub fn add_window(&self, window: MaintenanceWindow) {
        let mut state = self.lock();
        state.data.windows.push(window);
        self.commit(state);
    }

    #[cfg(test)]
    pub fn window(&self, id: &str) -> Option<MaintenanceWindow> {
        self.lock().data.windows.iter().find(|w| w.id == id).cloned()
    }

    /// Windows not yet completed, soonest first
    pub fn pending_windows(&self, cluster: Option<&str>, node: Option<&str>) -> Vec<MaintenanceWindow> {
        let mut windows: Vec<_> = self.all_windows(cluster, node).into_iter()
            .filter(|w| !w.completed)
            .collect();
        windows.sort_by_key(|w| w.scheduled_start);
        windows
    }

    pub fn all_windows(&self, cluster: Option<&str>, node: Option<&str>) -> Vec<MaintenanceWindow> {
        self.lock().data.windows.iter()
            .filter(|w| matches(&w.cluster_id, &w.node, cluster, node))
            .cloned()
            .collect()
    }

    /// Claim the windows a sweep at `now` has to act on, and retire the ones
    /// that ended without ever starting.
    pub fn claim_due(&self, now: DateTime<Utc>) -> DueWindows<'_> {
        let mut state = self.lock();
        let StoreState { data, in_flight, .. } = &mut *state;
        let mut due = DueWindows { activate: Vec::new(), expire: Vec::new(), missed: Vec::new() };

        for window in data.windows.iter_mut() {
            if window.completed || in_flight.contains(&window.id) {
                continue;
            }
            if !window.started {
                if window.scheduled_start <= now && now < window.scheduled_end {
                    in_flight.insert(window.id.clone());
                    due.activate.push(self.guard(window.clone()));
                } else if now >= window.scheduled_end {
                    window.completed = true;
                    window.missed = true;
                    due.missed.push(window.clone());
                }
            } else if now >= window.scheduled_end {
                in_flight.insert(window.id.clone());
                due.expire.push(self.guard(window.clone()));
            }
        }

        if !due.missed.is_empty() {
            self.commit(state);
        }
        due
    }

    fn guard(&self, window: MaintenanceWindow) -> ClaimGuard<'_> {
        ClaimGuard { store: self, window, done: false }
    }

    /// Claim one window for a caller outside the sweep
    pub fn claim(&self, id: &str, cluster: &str, node: &str) -> Claim<'_> {
        let mut state = self.lock();
        let Some(window) = state.data.windows.iter().find(|w| w.id == id && w.is_for(cluster, node)).cloned() else {
            return Claim::NotFound;
        };
        if !state.in_flight.insert(window.id.clone()) {
            return Claim::Busy;
        }
        drop(state);
        Claim::Claimed(self.guard(window))
    }

    fn release(&self, id: &str, transition: Option<WindowTransition>) {
        let mut state = self.lock();
        state.in_flight.remove(id);
        let Some(transition) = transition else { return };
        if let Some(window) = state.data.windows.iter_mut().find(|w| w.id == id) {
            match transition {
                WindowTransition::Started => window.started = true,
                WindowTransition::Completed => window.completed = true,
            }
            self.commit(state);
        }
    }

    /// Remove a window and drop any claim on it
    fn remove_window(&self, id: &str, cluster: &str, node: &str) -> Option<MaintenanceWindow> {
        let mut state = self.lock();
        let pos = state.data.windows.iter().position(|w| w.id == id && w.is_for(cluster, node))?;
        let window = state.data.windows.remove(pos);
        state.in_flight.remove(id);
        self.commit(state);
        Some(window)
    }

    #[cfg(test)]
    pub fn is_claimed(&self, id: &str) -> bool {
        self.lock().in_flight.contains(id)
    }

    // ─── Records ───

    /// Append a new open record, closing any record still open for the same
    /// node at the new record's start time. Returns the closed record ids.
    pub fn open_record(&self, record: MaintenanceRecord) -> Vec<String> {
        let mut state = self.lock();
        let mut superseded = Vec::new();
        for open in state.data.records.iter_mut()
            .filter(|r| r.is_open() && r.is_for(&record.cluster_id, &record.node))
        {
            open.end_time = Some(record.start_time);
            superseded.push(open.id.clone());
        }
        state.data.records.push(record);
        self.commit(state);
        superseded
    }

    /// Close the open record of a node. With `schedule_id`, a record opened
    /// by that window is preferred; otherwise the most recent open one.
    pub fn close_open_record(&self, cluster: &str, node: &str, schedule_id: Option<&str>, now: DateTime<Utc>) -> Option<MaintenanceRecord> {
        let mut state = self.lock();
        let records = &mut state.data.records;

        let preferred = schedule_id.and_then(|sid| {
            records.iter().rposition(|r| r.is_open() && r.is_for(cluster, node) && r.schedule_id.as_deref() == Some(sid))
        });
        let pos = preferred.or_else(|| records.iter().rposition(|r| r.is_open() && r.is_for(cluster, node)))?;

        records[pos].end_time = Some(now);
        let closed = records[pos].clone();
        self.commit(state);
        Some(closed)
    }

    /// Apply `f` to a record and return the updated copy
    pub fn update_record(&self, id: &str, f: impl FnOnce(&mut MaintenanceRecord)) -> Option<MaintenanceRecord> {
        let mut state = self.lock();
        let record = state.data.records.iter_mut().find(|r| r.id == id)?;
        f(record);
        let updated = record.clone();
        self.commit(state);
        Some(updated)
    }

    /// History, newest first
    pub fn records(&self, cluster: Option<&str>, node: Option<&str>) -> Vec<MaintenanceRecord> {
        let mut records: Vec<_> = self.lock().data.records.iter()
            .filter(|r| matches(&r.cluster_id, &r.node, cluster, node))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    pub fn open_record_for(&self, cluster: &str, node: &str) -> Option<MaintenanceRecord> {
        self.lock().data.records.iter()
            .rev()
            .find(|r| r.is_open() && r.is_for(cluster, node))
            .cloned()
    }
}

fn matches(rec_cluster: &str, rec_node: &str, cluster: Option<&str>, node: Option<&str>) -> bool {
    cluster.is_none_or(|c| c == rec_cluster) && node.is_none_or(|n| n == rec_node)
}

/// Write JSON next to the target and rename over it
fn write_atomic(path: &Path, json: &str) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create state dir: {}", e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| format!("Failed to write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, path).map_err(|e| format!("Failed to replace {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(id: &str, start: DateTime<Utc>, minutes: i64) -> MaintenanceWindow {
        MaintenanceWindow {
            id: id.to_string(),
            cluster_id: "lab".into(),
            node: "pve1".into(),
            scheduled_start: start,
            scheduled_end: start + Duration::minutes(minutes),
            migration_target: None,
            migrate_workloads: false,
            online_migration: false,
            exclude_vms: vec![],
            exclude_containers: vec![],
            notes: String::new(),
            created_at: start - Duration::hours(1),
            created_by: "ops".into(),
            started: false,
            completed: false,
            missed: false,
        }
    }

    fn record(id: &str, start: DateTime<Utc>) -> MaintenanceRecord {
        MaintenanceRecord {
            id: id.to_string(),
            cluster_id: "lab".into(),
            node: "pve1".into(),
            start_time: start,
            end_time: None,
            scheduled: false,
            schedule_id: None,
            triggered_by: "ops".into(),
            migration_details: None,
            warnings: vec![],
            notes: String::new(),
        }
    }

    #[test]
    fn test_claim_due_skips_in_flight_windows() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        store.add_window(window("w1", t, 30));

        let mut first = store.claim_due(t + Duration::minutes(1));
        assert_eq!(first.activate.len(), 1);

        // A concurrent sweep must not see the same window
        let second = store.claim_due(t + Duration::minutes(1));
        assert!(second.is_empty());

        first.activate.remove(0).finish(Some(WindowTransition::Started));
        assert!(store.window("w1").unwrap().started);
        assert!(!store.is_claimed("w1"));
        assert!(store.claim_due(t + Duration::minutes(2)).is_empty());
    }

    #[test]
    fn test_failed_claim_is_retried() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        store.add_window(window("w1", t, 30));

        let mut due = store.claim_due(t);
        due.activate.remove(0).finish(None);
        assert!(!store.window("w1").unwrap().started);
        assert_eq!(store.claim_due(t).activate.len(), 1);
    }

    #[test]
    fn test_dropped_claims_are_released() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        store.add_window(window("w1", t, 30));
        store.add_window(window("w2", t - Duration::hours(1), 30));
        let Claim::Claimed(claim) = store.claim("w2", "lab", "pve1") else { panic!("w2 should be claimable") };
        claim.finish(Some(WindowTransition::Started));

        let due = store.claim_due(t + Duration::minutes(1));
        assert_eq!((due.activate.len(), due.expire.len()), (1, 1));
        assert!(store.is_claimed("w1") && store.is_claimed("w2"));

        drop(due);

        assert!(!store.is_claimed("w1") && !store.is_claimed("w2"));
        let w1 = store.window("w1").unwrap();
        assert!(!w1.started && !w1.completed);
        assert!(matches!(store.claim("w1", "lab", "pve1"), Claim::Claimed(_)));
    }

    #[test]
    fn test_missed_window_is_retired() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        store.add_window(window("w1", t, 30));

        let due = store.claim_due(t + Duration::hours(2));
        assert_eq!(due.missed.len(), 1);
        assert!(due.activate.is_empty() && due.expire.is_empty());

        let w = store.window("w1").unwrap();
        assert!(w.completed && w.missed && !w.started);
        assert!(store.pending_windows(None, None).is_empty());
    }

    #[test]
    fn test_claim_reports_busy() {
        let store = MaintenanceStore::in_memory();
        store.add_window(window("w1", Utc::now(), 30));

        let held = store.claim("w1", "lab", "pve1");
        assert!(matches!(held, Claim::Claimed(_)));
        assert!(matches!(store.claim("w1", "lab", "pve1"), Claim::Busy));
        assert!(matches!(store.claim("w1", "lab", "pve2"), Claim::NotFound));

        drop(held);
        let Claim::Claimed(claim) = store.claim("w1", "lab", "pve1") else { panic!("window should be free") };
        assert_eq!(claim.remove().map(|w| w.id), Some("w1".to_string()));
        assert!(matches!(store.claim("w1", "lab", "pve1"), Claim::NotFound));
    }

    #[test]
    fn test_open_record_supersedes_open_one() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        store.open_record(record("r1", t));
        let superseded = store.open_record(record("r2", t + Duration::minutes(5)));

        assert_eq!(superseded, vec!["r1".to_string()]);
        let records = store.records(Some("lab"), Some("pve1"));
        assert_eq!(records.iter().filter(|r| r.is_open()).count(), 1);
        assert_eq!(records[0].id, "r2");
        assert_eq!(records[1].end_time, Some(t + Duration::minutes(5)));
    }

    #[test]
    fn test_close_prefers_schedule_record() {
        let store = MaintenanceStore::in_memory();
        let t = Utc::now();
        let mut scheduled = record("r1", t);
        scheduled.schedule_id = Some("w1".into());
        store.open_record(scheduled);
        let mut other = record("r2", t);
        other.node = "pve2".into();
        store.open_record(other);

        let closed = store.close_open_record("lab", "pve1", Some("w1"), t + Duration::minutes(1)).unwrap();
        assert_eq!(closed.id, "r1");
        assert!(store.close_open_record("lab", "pve1", None, t).is_none());
        assert!(store.open_record_for("lab", "pve2").is_some());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let t = Utc::now();

        {
            let store = MaintenanceStore::open(&path);
            store.add_window(window("w1", t, 30));
            store.open_record(record("r1", t));
            store.claim_due(t);
        }

        let store = MaintenanceStore::open(&path);
        assert_eq!(store.window("w1").unwrap().scheduled_start, t);
        assert_eq!(store.records(None, None).len(), 1);
        // Claims are process-local
        assert!(!store.is_claimed("w1"));
    }

    #[test]
    fn test_stale_snapshot_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = StateWriter { path: path.clone(), written: Mutex::new(0) };

        writer.write(2, "{\"records\": []}");
        writer.write(1, "{\"windows\": [], \"records\": [], \"stale\": true}");

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"records\": []}");
        assert_eq!(*writer.written.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_writes_from_async_context_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let t = Utc::now();

        let store = MaintenanceStore::open(&path);
        store.add_window(window("w1", t, 30));
        store.open_record(record("r1", t));

        // Writes run on the blocking pool; wait for the last one
        for _ in 0..100 {
            if MaintenanceStore::open(&path).records(None, None).len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reopened = MaintenanceStore::open(&path);
        assert_eq!(reopened.records(None, None).len(), 1);
        assert!(reopened.window("w1").is_some());
    }

    #[test]
    fn test_corrupt_state_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = MaintenanceStore::open(&path);
        assert!(store.records(None, None).is_empty());
    }
}
