//! Core data model: documents, per-scope operation logs and their invariants.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConflictOperationError, StorageError};

/// Document type that marks a document as a drive (container).
pub const DRIVE_DOCUMENT_TYPE: &str = "opdrive/drive";

/// Default branch for every synchronization unit.
pub const MAIN_BRANCH: &str = "main";

/// The two operation scopes of a document.
///
/// `Global` state is shared with every remote; `Local` state never leaves
/// this reactor (listeners, triggers, sharing configuration live there).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Global,
    Local,
}

impl Scope {
    pub fn all() -> [Scope; 2] {
        [Scope::Global, Scope::Local]
    }
}

/// Identifies one independently synchronizable operation stream.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("{document_id}:{scope}:{branch}")]
pub struct SyncUnitId {
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
}

impl SyncUnitId {
    pub fn new(document_id: impl Into<String>, scope: Scope, branch: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            scope,
            branch: branch.into(),
        }
    }

    /// Unit for the main branch of a scope.
    pub fn main(document_id: impl Into<String>, scope: Scope) -> Self {
        Self::new(document_id, scope, MAIN_BRANCH)
    }
}

/// Reference to binary content attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub hash: String,
    pub mime_type: String,
}

/// Optional signing context carried with an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
}

/// One committed entry of a per-scope operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the log. Unique per `(document, scope, branch)`.
    pub index: u64,
    /// Number of prior operations this entry subsumes. A non-zero skip is
    /// the only permitted source of index gaps.
    #[serde(default)]
    pub skip: u64,
    pub scope: Scope,
    pub branch: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub input: Value,
    /// Content hash of the resulting per-scope state, used to detect
    /// divergence between replicas.
    pub hash: String,
    pub timestamp_utc_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Snapshot of the state after this operation. Trimmed from caches and
    /// from the wire; storage keeps it for fast replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<OperationContext>,
}

impl Operation {
    /// Strips the `resulting_state` snapshot, e.g. before caching or
    /// sending over the wire.
    pub fn trimmed(&self) -> Operation {
        Operation {
            resulting_state: None,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn test_stub(index: u64, scope: Scope, op_type: &str) -> Operation {
        Operation {
            index,
            skip: 0,
            scope,
            branch: MAIN_BRANCH.to_string(),
            op_type: op_type.to_string(),
            input: Value::Null,
            hash: String::new(),
            timestamp_utc_ms: 0,
            attachments: Vec::new(),
            resulting_state: None,
            context: None,
        }
    }
}

/// Per-scope document state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    #[serde(default)]
    pub global: Value,
    #[serde(default)]
    pub local: Value,
}

impl DocumentState {
    pub fn get(&self, scope: Scope) -> &Value {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
        }
    }

    pub fn set(&mut self, scope: Scope, value: Value) {
        match scope {
            Scope::Global => self.global = value,
            Scope::Local => self.local = value,
        }
    }
}

/// The per-scope operation logs of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    #[serde(default)]
    pub global: Vec<Operation>,
    #[serde(default)]
    pub local: Vec<Operation>,
}

/// Outcome of trying to append operations to a log.
///
/// The conflict path is a first-class value rather than an exception so the
/// two-writers-raced branch stays visible and testable.
#[derive(Debug)]
pub enum InsertOutcome {
    /// All operations appended.
    Inserted,
    /// An index was already occupied; carries the stored operation.
    Conflict(Operation),
    /// An index does not continue the log and its skip does not cover the
    /// gap.
    OutOfOrder { index: u64, skip: u64, revision: u64 },
}

impl OperationLog {
    pub fn get(&self, scope: Scope) -> &Vec<Operation> {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
        }
    }

    pub fn get_mut(&mut self, scope: Scope) -> &mut Vec<Operation> {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Local => &mut self.local,
        }
    }

    /// Appends a batch for one scope, all-or-nothing.
    ///
    /// Operations must share the scope of the log slice they land in. A
    /// duplicate index yields `Conflict` with the stored operation and
    /// leaves the log untouched; the same holds for an uncovered gap.
    pub fn try_append(&mut self, scope: Scope, operations: &[Operation]) -> InsertOutcome {
        let log = self.get_mut(scope);
        let mut revision = operations_to_revision(log);
        for op in operations {
            if let Some(existing) = log.iter().find(|o| o.index == op.index) {
                return InsertOutcome::Conflict(existing.clone());
            }
            if op.index < revision || op.index - revision > op.skip {
                return InsertOutcome::OutOfOrder {
                    index: op.index,
                    skip: op.skip,
                    revision,
                };
            }
            revision = op.index + 1;
        }
        log.extend(operations.iter().cloned());
        InsertOutcome::Inserted
    }
}

/// `revision == (max index) + 1`, zero for an empty log.
pub fn operations_to_revision(operations: &[Operation]) -> u64 {
    operations.last().map(|op| op.index + 1).unwrap_or(0)
}

/// Drops operations subsumed by a later `skip` marker.
///
/// An operation at index `i` with `skip = s` covers indices `i - s .. i`;
/// covered entries can be pruned without changing replay results because the
/// skipping operation's `resulting_state` already accounts for them.
pub fn garbage_collect(operations: &[Operation]) -> Vec<Operation> {
    let mut kept: Vec<Operation> = Vec::with_capacity(operations.len());
    for op in operations {
        if op.skip > 0 {
            let low = op.index.saturating_sub(op.skip);
            kept.retain(|o| o.index < low || o.index >= op.index);
        }
        kept.push(op.clone());
    }
    kept
}

/// Mutable header fields of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub id: String,
    pub slug: String,
    pub document_type: String,
    pub created_at_ms: u64,
    pub last_modified_ms: u64,
    /// Next operation index per scope.
    #[serde(default)]
    pub revision: BTreeMap<Scope, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl DocumentHeader {
    pub fn revision(&self, scope: Scope) -> u64 {
        self.revision.get(&scope).copied().unwrap_or(0)
    }
}

/// A document: header, initial state, current state and operation logs.
///
/// Invariant: for every scope, `state[scope]` equals the replay of
/// `operations[scope]` over `initial_state[scope]` in index order, and
/// `header.revision[scope]` equals the log's last index plus one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub header: DocumentHeader,
    pub initial_state: DocumentState,
    pub state: DocumentState,
    pub operations: OperationLog,
}

impl Document {
    /// A fresh document with no operations.
    pub fn new(
        id: impl Into<String>,
        slug: impl Into<String>,
        document_type: impl Into<String>,
        initial_state: DocumentState,
    ) -> Self {
        let now = timestamp_now_ms();
        Document {
            header: DocumentHeader {
                id: id.into(),
                slug: slug.into(),
                document_type: document_type.into(),
                created_at_ms: now,
                last_modified_ms: now,
                revision: BTreeMap::new(),
                meta: None,
            },
            state: initial_state.clone(),
            initial_state,
            operations: OperationLog::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn is_drive(&self) -> bool {
        self.header.document_type == DRIVE_DOCUMENT_TYPE
    }

    /// Copy with per-operation state snapshots stripped, bounding the memory
    /// held by caches. The latest state per scope stays in `state`.
    pub fn trimmed(&self) -> Document {
        let mut doc = self.clone();
        doc.operations.global = doc.operations.global.iter().map(Operation::trimmed).collect();
        doc.operations.local = doc.operations.local.iter().map(Operation::trimmed).collect();
        doc
    }

    /// Synchronization units this document exposes, one per scope on the
    /// main branch.
    pub fn sync_units(&self) -> Vec<SyncUnitId> {
        Scope::all()
            .into_iter()
            .map(|scope| SyncUnitId::main(self.header.id.clone(), scope))
            .collect()
    }

    /// Recomputes `header.revision` and `last_modified` from the logs.
    pub fn refresh_header(&mut self) {
        for scope in Scope::all() {
            let revision = operations_to_revision(self.operations.get(scope));
            self.header.revision.insert(scope, revision);
        }
        let last = Scope::all()
            .into_iter()
            .filter_map(|s| self.operations.get(s).last())
            .map(|op| op.timestamp_utc_ms)
            .max();
        if let Some(ts) = last {
            self.header.last_modified_ms = self.header.last_modified_ms.max(ts);
        }
    }
}

/// Whether stored hashes are verified during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckHashes {
    #[default]
    Yes,
    No,
}

/// Replays one scope's operations over the initial state.
///
/// The resulting state of each operation is taken from its stored snapshot
/// when present, otherwise recomputed through `apply`. With
/// [`CheckHashes::Yes`], a stored hash that disagrees with the recomputed
/// state fails the replay.
pub fn replay_scope<F>(
    initial: &Value,
    operations: &[Operation],
    check: CheckHashes,
    mut apply: F,
) -> Result<Value, StorageError>
where
    F: FnMut(&Value, &Operation) -> Result<Value, StorageError>,
{
    let mut state = initial.clone();
    for op in garbage_collect(operations) {
        state = match &op.resulting_state {
            Some(snapshot) => snapshot.clone(),
            None => apply(&state, &op)?,
        };
        if check == CheckHashes::Yes && !op.hash.is_empty() && hash_state(&state) != op.hash {
            return Err(StorageError::backend(anyhow::anyhow!(
                "hash mismatch replaying {} at index {}: log diverged",
                op.op_type,
                op.index
            )));
        }
    }
    Ok(state)
}

/// Content hash of a per-scope state: blake3 over the canonical JSON bytes.
pub fn hash_state(state: &Value) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Milliseconds since the unix epoch.
pub fn timestamp_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates a fresh document id.
pub fn new_document_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Ids are url-safe: 1..=255 chars of `[A-Za-z0-9._-]`.
pub fn is_valid_document_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Slugs are `[A-Za-z0-9_-]`, non-empty.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 255
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Checks an incoming batch against the stored log and produces the
/// conflict error for the first offending operation, if any.
pub fn check_append(
    document_id: &str,
    log: &OperationLog,
    scope: Scope,
    operations: &[Operation],
) -> Result<(), StorageError> {
    let existing = log.get(scope);
    let mut revision = operations_to_revision(existing);
    for op in operations {
        if let Some(stored) = existing.iter().find(|o| o.index == op.index) {
            return Err(ConflictOperationError {
                document_id: document_id.to_string(),
                existing_operation: stored.clone(),
                new_operation: op.clone(),
            }
            .into());
        }
        if op.index < revision || op.index - revision > op.skip {
            return Err(StorageError::InvalidOperationIndex {
                document_id: document_id.to_string(),
                index: op.index,
                skip: op.skip,
                revision,
            });
        }
        revision = op.index + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn op(index: u64, op_type: &str, state: Value) -> Operation {
        Operation {
            index,
            skip: 0,
            scope: Scope::Global,
            branch: MAIN_BRANCH.to_string(),
            op_type: op_type.to_string(),
            input: Value::Null,
            hash: hash_state(&state),
            timestamp_utc_ms: index,
            attachments: Vec::new(),
            resulting_state: Some(state),
            context: None,
        }
    }

    #[test]
    fn revision_is_last_index_plus_one() {
        assert_eq!(operations_to_revision(&[]), 0);
        let ops = vec![op(0, "A", json!(1)), op(1, "B", json!(2))];
        assert_eq!(operations_to_revision(&ops), 2);
    }

    #[test]
    fn try_append_detects_duplicate_index() {
        let mut log = OperationLog::default();
        let first = op(0, "ADD_FILE", json!({"files": 1}));
        assert!(matches!(
            log.try_append(Scope::Global, &[first.clone()]),
            InsertOutcome::Inserted
        ));

        let racing = op(0, "REMOVE_FILE", json!({"files": 0}));
        match log.try_append(Scope::Global, &[racing]) {
            InsertOutcome::Conflict(existing) => {
                assert_eq!(existing.op_type, "ADD_FILE");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // the failed batch must not change the log
        assert_eq!(log.global.len(), 1);
    }

    #[test]
    fn try_append_rejects_uncovered_gap() {
        let mut log = OperationLog::default();
        log.try_append(Scope::Global, &[op(0, "A", json!(0))]);
        let mut gapped = op(3, "B", json!(1));
        gapped.skip = 1; // gap of 2, skip only covers 1
        assert!(matches!(
            log.try_append(Scope::Global, &[gapped]),
            InsertOutcome::OutOfOrder { .. }
        ));

        let mut covered = op(3, "B", json!(1));
        covered.skip = 2;
        assert!(matches!(
            log.try_append(Scope::Global, &[covered]),
            InsertOutcome::Inserted
        ));
    }

    #[test]
    fn replay_reproduces_state() {
        let states = [json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
        let ops: Vec<_> = states
            .iter()
            .enumerate()
            .map(|(i, s)| op(i as u64, "SET", s.clone()))
            .collect();
        let replayed = replay_scope(&json!({"n": 0}), &ops, CheckHashes::Yes, |_, _| {
            panic!("snapshots cover every operation")
        })
        .unwrap();
        assert_eq!(replayed, json!({"n": 3}));
    }

    #[test]
    fn replay_detects_divergence() {
        let mut bad = op(0, "SET", json!({"n": 1}));
        bad.hash = hash_state(&json!({"n": 999}));
        let res = replay_scope(&Value::Null, &[bad], CheckHashes::Yes, |_, _| {
            unreachable!()
        });
        assert!(res.is_err());
    }

    #[test]
    fn garbage_collect_prunes_skipped_range() {
        let mut ops = vec![
            op(0, "A", json!(0)),
            op(1, "B", json!(1)),
            op(2, "C", json!(2)),
        ];
        let mut skipper = op(3, "SQUASH", json!(3));
        skipper.skip = 2; // covers indices 1 and 2
        ops.push(skipper);
        let kept = garbage_collect(&ops);
        let indices: Vec<u64> = kept.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 3]);
    }

    #[test]
    fn header_refresh_tracks_logs() {
        let mut doc = Document::new("d1", "d1", "test/doc", DocumentState::default());
        doc.operations.global = vec![op(0, "A", json!(1)), op(1, "B", json!(2))];
        doc.refresh_header();
        assert_eq!(doc.header.revision(Scope::Global), 2);
        assert_eq!(doc.header.revision(Scope::Local), 0);
    }

    #[test]
    fn id_and_slug_validation() {
        assert!(is_valid_document_id(&new_document_id()));
        assert!(is_valid_document_id("doc_1.v2-final"));
        assert!(!is_valid_document_id(""));
        assert!(!is_valid_document_id("has space"));
        assert!(!is_valid_document_id("slash/y"));
        assert!(is_valid_slug("my-drive_2"));
        assert!(!is_valid_slug("dots.not.allowed"));
        assert!(!is_valid_slug(""));
    }

    #[test]
    fn trimmed_drops_snapshots_but_keeps_state() {
        let mut doc = Document::new("d1", "d1", "test/doc", DocumentState::default());
        doc.operations.global = vec![op(0, "A", json!({"big": [1, 2, 3]}))];
        doc.state.global = json!({"big": [1, 2, 3]});
        let trimmed = doc.trimmed();
        assert!(trimmed.operations.global[0].resulting_state.is_none());
        assert_eq!(trimmed.state.global, doc.state.global);
    }
}
