//! StateStore: redb-backed persistence for the VM fleet.
//!
//! Single-record reads and writes open their own transaction. Anything
//! that must read, validate, and write as one step goes through
//! [`StateStore::write`] and the [`StoreTxn`] handle it passes in.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use vmfleet_core::{VmStatus, VmTemplate};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Codec))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every row whose key starts with `prefix` and passes `keep`.
fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
    mut keep: impl FnMut(&T) -> bool,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            continue;
        }
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
        if keep(&record) {
            results.push(record);
        }
    }
    Ok(results)
}

fn write_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(record).map_err(map_err!(Codec))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Begin))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [VMS, TEMPLATES, SESSIONS, TRANSITIONS, METRICS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Commit))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted when it
    /// returns `Err`, so nothing `f` wrote becomes visible. Write
    /// transactions are serialized by redb; `f` must not block on
    /// anything that itself needs a write transaction.
    pub fn write<T, E>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Begin))?;
        let outcome = f(&StoreTxn { txn: &txn });
        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Commit))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }

    fn get<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        prefix: &str,
        keep: impl FnMut(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_json(&table, prefix, keep)
    }

    fn put<T: Serialize>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        self.write(|txn| txn.put(def, key, record))
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Get a VM by id.
    pub fn get_vm(&self, vm_id: &str) -> StateResult<Option<VmRecord>> {
        self.get(VMS, vm_id)
    }

    /// Insert or overwrite a VM row without recording a transition.
    pub fn put_vm(&self, vm: &VmRecord) -> StateResult<()> {
        self.put(VMS, &vm.id, vm)?;
        debug!(vm_id = %vm.id, status = %vm.status, "vm stored");
        Ok(())
    }

    /// List all VMs.
    pub fn list_vms(&self) -> StateResult<Vec<VmRecord>> {
        self.scan(VMS, "", |_| true)
    }

    /// List VMs in a region.
    pub fn list_vms_by_region(&self, region: &str) -> StateResult<Vec<VmRecord>> {
        self.scan(VMS, "", |vm: &VmRecord| vm.region == region)
    }

    /// List VMs in a status.
    pub fn list_vms_by_status(&self, status: VmStatus) -> StateResult<Vec<VmRecord>> {
        self.scan(VMS, "", |vm: &VmRecord| vm.status == status)
    }

    /// Transition history of a VM, oldest first.
    pub fn list_transitions(&self, vm_id: &str) -> StateResult<Vec<StatusTransition>> {
        self.scan(TRANSITIONS, &format!("{vm_id}:"), |_| true)
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Insert or replace a template.
    pub fn put_template(&self, template: &VmTemplate) -> StateResult<()> {
        self.put(TEMPLATES, &template.id, template)?;
        debug!(template_id = %template.id, "template stored");
        Ok(())
    }

    /// Get a template by id.
    pub fn get_template(&self, template_id: &str) -> StateResult<Option<VmTemplate>> {
        self.get(TEMPLATES, template_id)
    }

    /// List all templates, by id.
    pub fn list_templates(&self) -> StateResult<Vec<VmTemplate>> {
        self.scan(TEMPLATES, "", |_| true)
    }

    /// Upsert every template in one transaction. Safe to run on every start.
    pub fn seed_templates(&self, templates: &[VmTemplate]) -> StateResult<usize> {
        self.write(|txn| {
            for template in templates {
                txn.put(TEMPLATES, &template.id, template)?;
            }
            Ok::<_, StateError>(())
        })?;
        debug!(count = templates.len(), "templates seeded");
        Ok(templates.len())
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Insert or replace a session.
    pub fn put_session(&self, session: &SessionRecord) -> StateResult<()> {
        self.put(SESSIONS, &session.id, session)
    }

    /// Get a session by id.
    pub fn get_session(&self, session_id: &str) -> StateResult<Option<SessionRecord>> {
        self.get(SESSIONS, session_id)
    }

    /// Sessions bound to a VM.
    pub fn list_sessions_for_vm(&self, vm_id: &str) -> StateResult<Vec<SessionRecord>> {
        self.scan(SESSIONS, "", |s: &SessionRecord| s.vm_id.as_deref() == Some(vm_id))
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Persist a snapshot, keyed by its timestamp.
    pub fn put_metrics(&self, snapshot: &OrchestratorMetrics) -> StateResult<()> {
        self.put(METRICS, &snapshot.table_key(), snapshot)
    }

    /// Most recent snapshots, newest first.
    pub fn list_metrics(&self, limit: usize) -> StateResult<Vec<OrchestratorMetrics>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(METRICS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: OrchestratorMetrics =
                serde_json::from_slice(value.value()).map_err(map_err!(Codec))?;
            results.push(snapshot);
        }
        Ok(results)
    }

    /// The most recent snapshot.
    pub fn latest_metrics(&self) -> StateResult<Option<OrchestratorMetrics>> {
        Ok(self.list_metrics(1)?.into_iter().next())
    }
}

/// Handle to an open write transaction, passed to [`StateStore::write`]
/// closures.
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StoreTxn<'_> {
    fn get<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn put<T: Serialize>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        write_json(&mut table, key, record)
    }

    /// Get a VM by id.
    pub fn get_vm(&self, vm_id: &str) -> StateResult<Option<VmRecord>> {
        self.get(VMS, vm_id)
    }

    /// Insert or replace a VM.
    pub fn put_vm(&self, vm: &VmRecord) -> StateResult<()> {
        self.put(VMS, &vm.id, vm)
    }

    /// Get a template by id.
    pub fn get_template(&self, template_id: &str) -> StateResult<Option<VmTemplate>> {
        self.get(TEMPLATES, template_id)
    }

    /// Get a session by id.
    pub fn get_session(&self, session_id: &str) -> StateResult<Option<SessionRecord>> {
        self.get(SESSIONS, session_id)
    }

    /// Insert or replace a session.
    pub fn put_session(&self, session: &SessionRecord) -> StateResult<()> {
        self.put(SESSIONS, &session.id, session)
    }

    /// Sessions bound to a VM.
    pub fn list_sessions_for_vm(&self, vm_id: &str) -> StateResult<Vec<SessionRecord>> {
        let table = self.txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        scan_json(&table, "", |s: &SessionRecord| s.vm_id.as_deref() == Some(vm_id))
    }

    /// Append a row to a VM's status history.
    pub fn append_transition(&self, transition: &StatusTransition) -> StateResult<()> {
        self.put(TRANSITIONS, &transition.table_key(), transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::catalog::default_templates;

    fn test_vm(id: &str, region: &str, status: VmStatus) -> VmRecord {
        let mut vm = VmRecord::new(id, &default_templates()[0], region, 1_000);
        vm.status = status;
        vm
    }

    // ── VM CRUD ────────────────────────────────────────────────────

    #[test]
    fn vm_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let vm = test_vm("vm-1", "us-east-1", VmStatus::Ready);

        store.put_vm(&vm).unwrap();
        assert_eq!(store.get_vm("vm-1").unwrap(), Some(vm));
        assert!(store.get_vm("vm-2").unwrap().is_none());
    }

    #[test]
    fn vm_queries_by_region_and_status() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&test_vm("a", "us-east-1", VmStatus::Ready)).unwrap();
        store.put_vm(&test_vm("b", "us-east-1", VmStatus::Booting)).unwrap();
        store.put_vm(&test_vm("c", "eu-west-1", VmStatus::Ready)).unwrap();

        assert_eq!(store.list_vms().unwrap().len(), 3);
        assert_eq!(store.list_vms_by_region("us-east-1").unwrap().len(), 2);
        let ready: Vec<_> = store
            .list_vms_by_status(VmStatus::Ready)
            .unwrap()
            .into_iter()
            .map(|vm| vm.id)
            .collect();
        assert_eq!(ready, vec!["a", "c"]);
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn write_commits_on_ok() {
        let store = StateStore::open_in_memory().unwrap();
        let vm = test_vm("vm-1", "us-east-1", VmStatus::Pending);
        store
            .write(|txn| {
                txn.put_vm(&vm)?;
                txn.append_transition(&StatusTransition {
                    vm_id: vm.id.clone(),
                    seq: 0,
                    from: None,
                    to: VmStatus::Pending,
                    reason: "created".into(),
                    at: 1_000,
                })
            })
            .unwrap();

        assert!(store.get_vm("vm-1").unwrap().is_some());
        assert_eq!(store.list_transitions("vm-1").unwrap().len(), 1);
    }

    #[test]
    fn write_aborts_on_err() {
        #[derive(Debug)]
        enum TestError {
            State,
            Rejected,
        }
        impl From<StateError> for TestError {
            fn from(_: StateError) -> Self {
                TestError::State
            }
        }

        let store = StateStore::open_in_memory().unwrap();
        let result: Result<(), TestError> = store.write(|txn| {
            txn.put_vm(&test_vm("vm-1", "us-east-1", VmStatus::Pending))?;
            Err(TestError::Rejected)
        });

        assert!(matches!(result, Err(TestError::Rejected)));
        assert!(store.get_vm("vm-1").unwrap().is_none());
    }

    #[test]
    fn writes_see_their_own_reads() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&test_vm("vm-1", "us-east-1", VmStatus::Ready)).unwrap();

        store
            .write(|txn| {
                let mut vm = txn.get_vm("vm-1")?.unwrap();
                vm.current_sessions += 1;
                txn.put_vm(&vm)?;
                assert_eq!(txn.get_vm("vm-1")?.unwrap().current_sessions, 1);
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn transitions_are_scoped_to_their_vm() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|txn| {
                for (vm_id, seq) in [("vm-1", 0), ("vm-1", 1), ("vm-10", 0)] {
                    txn.append_transition(&StatusTransition {
                        vm_id: vm_id.into(),
                        seq,
                        from: None,
                        to: VmStatus::Pending,
                        reason: String::new(),
                        at: 0,
                    })?;
                }
                Ok::<_, StateError>(())
            })
            .unwrap();

        let history = store.list_transitions("vm-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].seq, 1);
    }

    // ── Templates & sessions ───────────────────────────────────────

    #[test]
    fn template_seeding_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let templates = default_templates();
        store.seed_templates(&templates).unwrap();
        store.seed_templates(&templates).unwrap();

        assert_eq!(store.list_templates().unwrap().len(), templates.len());
        assert_eq!(store.get_template("l4-360").unwrap().unwrap().max_concurrent_sessions, 4);
    }

    #[test]
    fn sessions_for_vm() {
        let store = StateStore::open_in_memory().unwrap();
        let mut bound = SessionRecord::new("sess-1", 0);
        bound.vm_id = Some("vm-1".into());
        store.put_session(&bound).unwrap();
        store.put_session(&SessionRecord::new("sess-2", 0)).unwrap();

        let sessions = store.list_sessions_for_vm("vm-1").unwrap();
        assert_eq!(sessions, vec![bound]);
    }

    // ── Metrics ────────────────────────────────────────────────────

    #[test]
    fn metrics_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for timestamp in [100, 300, 200] {
            store
                .put_metrics(&OrchestratorMetrics { timestamp, ..Default::default() })
                .unwrap();
        }

        let recent: Vec<_> = store.list_metrics(2).unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(recent, vec![300, 200]);
        assert_eq!(store.latest_metrics().unwrap().unwrap().timestamp, 300);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_vm(&test_vm("vm-1", "us-east-1", VmStatus::Terminated)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let vm = store.get_vm("vm-1").unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Terminated);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_vms().unwrap().is_empty());
        assert!(store.list_templates().unwrap().is_empty());
        assert!(store.list_transitions("any").unwrap().is_empty());
        assert!(store.list_sessions_for_vm("any").unwrap().is_empty());
        assert!(store.latest_metrics().unwrap().is_none());
    }
}
