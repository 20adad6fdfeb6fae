//! Patch engine
//!
//! Holds the pending edits of one session, grouped per file. Tools only
//! propose hunks; disk is touched when the host applies them. Every hunk is
//! computed against a snapshot of the file, and apply/cancel refuse to run
//! once the file has drifted from that snapshot.

pub mod diff;
pub mod search_replace;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rpc::RpcError;

pub use diff::{compute_hunks, split_lines, unified_diff, ProposedHunk};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{} changed on disk since the patch was proposed", .0.display())]
    Stale(PathBuf),

    #[error(
        "hunk at lines {start}-{end} of {} overlaps hunk at lines {other_start}-{other_end}",
        file.display()
    )]
    Overlap {
        file: PathBuf,
        start: usize,
        end: usize,
        other_start: usize,
        other_end: usize,
    },

    #[error("invalid hunk: {0}")]
    InvalidHunk(String),

    #[error("hunk {0} not found")]
    HunkNotFound(u64),

    #[error("hunk {id} is already {status}")]
    Resolved { id: u64, status: HunkStatus },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host edit failed: {0}")]
    Host(#[from] RpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HunkStatus {
    Pending,
    Applied,
    Cancelled,
}

impl fmt::Display for HunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HunkStatus::Pending => write!(f, "pending"),
            HunkStatus::Applied => write!(f, "applied"),
            HunkStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A contiguous line range proposed for replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub id: u64,
    /// First line, 1-based
    pub start: usize,
    /// One past the last line
    pub end: usize,
    pub original: String,
    pub replacement: String,
    pub status: HunkStatus,
}

impl Hunk {
    fn is_pending(&self) -> bool {
        self.status == HunkStatus::Pending
    }
}

/// A host-visible edit: replace lines `start_line..end_line` with `text`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// Read-only view of one file's patch
#[derive(Debug, Clone, Serialize)]
pub struct FilePatchView {
    pub file: PathBuf,
    /// False when the file did not exist at proposal time
    pub exists: bool,
    pub hunks: Vec<Hunk>,
}

/// Where applied content goes
#[async_trait]
pub trait PatchWriter: Send + Sync {
    /// `regions` are ordered from the highest start line to the lowest.
    /// `content` is the full resulting file.
    async fn write(&self, file: &Path, regions: &[Region], content: &str)
        -> Result<(), PatchError>;
}

/// Writes the resulting content straight to disk
pub struct DiskWriter;

#[async_trait]
impl PatchWriter for DiskWriter {
    async fn write(
        &self,
        file: &Path,
        _regions: &[Region],
        content: &str,
    ) -> Result<(), PatchError> {
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(file, content).await?;
        Ok(())
    }
}

/// Current on-disk content, `None` if the file does not exist
pub async fn read_snapshot(file: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(file).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

struct Patch {
    snapshot: Option<String>,
    hunks: Vec<Hunk>,
}

impl Patch {
    fn snapshot_lines(&self) -> Vec<String> {
        self.snapshot
            .as_deref()
            .map(|s| split_lines(s).into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn has_pending(&self) -> bool {
        self.hunks.iter().any(Hunk::is_pending)
    }

    fn find(&self, id: u64) -> Option<usize> {
        self.hunks.iter().position(|h| h.id == id)
    }
}

fn ranges_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    // Two insertions at the same point have no defined order
    if a.0 == a.1 && b.0 == b.1 {
        return a.0 == b.0;
    }
    a.0 < b.1 && b.0 < a.1
}

fn descending(hunks: &mut [&Hunk]) {
    hunks.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
}

/// Pending edits for one session
pub struct PatchEngine {
    patches: Mutex<BTreeMap<PathBuf, Patch>>,
    /// Final status of hunks whose patch has been closed
    resolved: parking_lot::Mutex<HashMap<u64, HunkStatus>>,
    next_id: AtomicU64,
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchEngine {
    pub fn new() -> Self {
        Self {
            patches: Mutex::new(BTreeMap::new()),
            resolved: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Merge `hunks`, computed against `snapshot`, into the patch for `file`
    ///
    /// The whole proposal is rejected if any hunk overlaps another new hunk
    /// or a pending one. A patch whose snapshot no longer matches is stale;
    /// its pending hunks are dropped in favour of the new proposal.
    pub async fn propose(
        &self,
        file: &Path,
        snapshot: Option<String>,
        hunks: Vec<ProposedHunk>,
    ) -> Result<Vec<Hunk>, PatchError> {
        let mut patches = self.patches.lock().await;

        if patches.get(file).is_some_and(|p| p.snapshot != snapshot) {
            warn!(file = %file.display(), "Replacing stale patch with new proposal");
            if let Some(old) = patches.remove(file) {
                self.close(old, HunkStatus::Cancelled);
            }
        }

        let lines: Vec<&str> = snapshot.as_deref().map(split_lines).unwrap_or_default();
        let pending: Vec<(usize, usize)> = patches
            .get(file)
            .map(|p| {
                p.hunks
                    .iter()
                    .filter(|h| h.is_pending())
                    .map(|h| (h.start, h.end))
                    .collect()
            })
            .unwrap_or_default();

        let mut accepted: Vec<(usize, usize)> = Vec::with_capacity(hunks.len());
        for hunk in &hunks {
            if hunk.start == 0 || hunk.end < hunk.start || hunk.end > lines.len() + 1 {
                return Err(PatchError::InvalidHunk(format!(
                    "range {}-{} is outside {} ({} lines)",
                    hunk.start,
                    hunk.end,
                    file.display(),
                    lines.len()
                )));
            }
            if lines[hunk.start - 1..hunk.end - 1].concat() != hunk.original {
                return Err(PatchError::InvalidHunk(format!(
                    "original text at lines {}-{} does not match {}",
                    hunk.start,
                    hunk.end,
                    file.display()
                )));
            }

            let range = (hunk.start, hunk.end);
            let clash = pending
                .iter()
                .chain(accepted.iter())
                .find(|other| ranges_overlap(range, **other));
            if let Some(&(other_start, other_end)) = clash {
                return Err(PatchError::Overlap {
                    file: file.to_path_buf(),
                    start: hunk.start,
                    end: hunk.end,
                    other_start,
                    other_end,
                });
            }
            accepted.push(range);
        }

        if hunks.is_empty() {
            return Ok(Vec::new());
        }

        let patch = patches.entry(file.to_path_buf()).or_insert_with(|| Patch {
            snapshot: snapshot.clone(),
            hunks: Vec::new(),
        });
        let mut created = Vec::with_capacity(hunks.len());
        for hunk in hunks {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let hunk = Hunk {
                id,
                start: hunk.start,
                end: hunk.end,
                original: hunk.original,
                replacement: hunk.replacement,
                status: HunkStatus::Pending,
            };
            created.push(hunk.clone());
            patch.hunks.push(hunk);
        }
        patch
            .hunks
            .sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

        info!(file = %file.display(), count = created.len(), "Proposed hunks");
        Ok(created)
    }

    /// Apply one hunk to disk. Returns false when it was already applied.
    pub async fn apply_hunk(
        &self,
        file: &Path,
        id: u64,
        writer: &dyn PatchWriter,
    ) -> Result<bool, PatchError> {
        let mut patches = self.patches.lock().await;
        let Some(patch) = patches.get_mut(file) else {
            return self.already_resolved(id, HunkStatus::Applied);
        };
        let Some(idx) = patch.find(id) else {
            return self.already_resolved(id, HunkStatus::Applied);
        };
        match patch.hunks[idx].status {
            HunkStatus::Applied => return Ok(false),
            HunkStatus::Cancelled => {
                return Err(PatchError::Resolved {
                    id,
                    status: HunkStatus::Cancelled,
                })
            }
            HunkStatus::Pending => {}
        }

        Self::check_fresh(file, patch).await?;

        let (start, end, replacement) = {
            let h = &patch.hunks[idx];
            (h.start, h.end, h.replacement.clone())
        };
        let mut lines = patch.snapshot_lines();
        diff::splice(&mut lines, start, end, &replacement);
        let content = lines.concat();
        let region = Region {
            start_line: start,
            end_line: end,
            text: replacement.clone(),
        };
        writer.write(file, &[region], &content).await?;

        // Later hunks move by the net line change of this one
        let new_len = split_lines(&replacement).len();
        let delta = new_len as isize - (end - start) as isize;
        for (i, other) in patch.hunks.iter_mut().enumerate() {
            if i != idx && other.start >= end {
                other.start = (other.start as isize + delta) as usize;
                other.end = (other.end as isize + delta) as usize;
            }
        }
        let hunk = &mut patch.hunks[idx];
        hunk.status = HunkStatus::Applied;
        hunk.end = start + new_len;
        patch.snapshot = Some(content);

        debug!(file = %file.display(), hunk = id, "Applied hunk");
        self.close_if_done(&mut patches, file);
        Ok(true)
    }

    /// Discard one hunk. Returns false when it was already cancelled.
    pub async fn cancel_hunk(&self, file: &Path, id: u64) -> Result<bool, PatchError> {
        let mut patches = self.patches.lock().await;
        let Some(patch) = patches.get_mut(file) else {
            return self.already_resolved(id, HunkStatus::Cancelled);
        };
        let Some(idx) = patch.find(id) else {
            return self.already_resolved(id, HunkStatus::Cancelled);
        };
        match patch.hunks[idx].status {
            HunkStatus::Cancelled => return Ok(false),
            HunkStatus::Applied => {
                return Err(PatchError::Resolved {
                    id,
                    status: HunkStatus::Applied,
                })
            }
            HunkStatus::Pending => {}
        }

        Self::check_fresh(file, patch).await?;
        patch.hunks[idx].status = HunkStatus::Cancelled;

        debug!(file = %file.display(), hunk = id, "Cancelled hunk");
        self.close_if_done(&mut patches, file);
        Ok(true)
    }

    /// Apply every pending hunk of `file` in one pass, highest start line first
    pub async fn apply_file(&self, file: &Path, writer: &dyn PatchWriter) -> Result<usize, PatchError> {
        let mut patches = self.patches.lock().await;
        let Some(patch) = patches.get_mut(file) else {
            return Ok(0);
        };
        if !patch.has_pending() {
            return Ok(0);
        }
        Self::check_fresh(file, patch).await?;

        let mut pending: Vec<&Hunk> = patch.hunks.iter().filter(|h| h.is_pending()).collect();
        descending(&mut pending);

        let mut lines = patch.snapshot_lines();
        let mut regions = Vec::with_capacity(pending.len());
        for hunk in &pending {
            diff::splice(&mut lines, hunk.start, hunk.end, &hunk.replacement);
            regions.push(Region {
                start_line: hunk.start,
                end_line: hunk.end,
                text: hunk.replacement.clone(),
            });
        }
        let content = lines.concat();
        writer.write(file, &regions, &content).await?;

        let count = regions.len();
        for hunk in patch.hunks.iter_mut().filter(|h| h.is_pending()) {
            hunk.status = HunkStatus::Applied;
        }
        patch.snapshot = Some(content);

        info!(file = %file.display(), count, "Applied file patch");
        self.close_if_done(&mut patches, file);
        Ok(count)
    }

    /// Discard every pending hunk of `file`
    pub async fn cancel_file(&self, file: &Path) -> Result<usize, PatchError> {
        let mut patches = self.patches.lock().await;
        let Some(patch) = patches.get_mut(file) else {
            return Ok(0);
        };
        if !patch.has_pending() {
            return Ok(0);
        }
        Self::check_fresh(file, patch).await?;

        let mut count = 0;
        for hunk in patch.hunks.iter_mut().filter(|h| h.is_pending()) {
            hunk.status = HunkStatus::Cancelled;
            count += 1;
        }

        info!(file = %file.display(), count, "Cancelled file patch");
        self.close_if_done(&mut patches, file);
        Ok(count)
    }

    /// Hunks of the open patch for `file`, sorted by start line
    pub async fn list(&self, file: &Path) -> Vec<Hunk> {
        self.patches
            .lock()
            .await
            .get(file)
            .map(|p| p.hunks.clone())
            .unwrap_or_default()
    }

    /// Every open patch
    pub async fn list_all(&self) -> Vec<FilePatchView> {
        self.patches
            .lock()
            .await
            .iter()
            .map(|(file, patch)| FilePatchView {
                file: file.clone(),
                exists: patch.snapshot.is_some(),
                hunks: patch.hunks.clone(),
            })
            .collect()
    }

    /// Files with an open patch
    pub async fn files(&self) -> Vec<PathBuf> {
        self.patches.lock().await.keys().cloned().collect()
    }

    /// Drop every open patch without touching disk
    pub async fn clear(&self) {
        let drained: Vec<Patch> = std::mem::take(&mut *self.patches.lock().await)
            .into_values()
            .collect();
        for patch in drained {
            self.close(patch, HunkStatus::Cancelled);
        }
    }

    async fn check_fresh(file: &Path, patch: &Patch) -> Result<(), PatchError> {
        let current = read_snapshot(file).await?;
        if current != patch.snapshot {
            warn!(file = %file.display(), "Patch is stale");
            return Err(PatchError::Stale(file.to_path_buf()));
        }
        Ok(())
    }

    fn already_resolved(&self, id: u64, wanted: HunkStatus) -> Result<bool, PatchError> {
        match self.resolved.lock().get(&id) {
            Some(status) if *status == wanted => Ok(false),
            Some(status) => Err(PatchError::Resolved {
                id,
                status: *status,
            }),
            None => Err(PatchError::HunkNotFound(id)),
        }
    }

    fn close_if_done(&self, patches: &mut BTreeMap<PathBuf, Patch>, file: &Path) {
        if patches.get(file).is_some_and(|p| !p.has_pending()) {
            if let Some(done) = patches.remove(file) {
                debug!(file = %file.display(), "Closed patch");
                self.close(done, HunkStatus::Cancelled);
            }
        }
    }

    /// Record final statuses; anything still pending gets `pending_as`
    fn close(&self, patch: Patch, pending_as: HunkStatus) {
        let mut resolved = self.resolved.lock();
        for hunk in patch.hunks {
            let status = if hunk.is_pending() {
                pending_as
            } else {
                hunk.status
            };
            resolved.insert(hunk.id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(content: &str) -> (TempDir, PathBuf, PatchEngine) {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.py");
        tokio::fs::write(&file, content).await.unwrap();
        (dir, file, PatchEngine::new())
    }

    async fn propose_diff(engine: &PatchEngine, file: &Path, new: &str) -> Result<Vec<Hunk>, PatchError> {
        let old = read_snapshot(file).await.unwrap();
        let hunks = compute_hunks(old.as_deref().unwrap_or(""), new);
        engine.propose(file, old, hunks).await
    }

    #[tokio::test]
    async fn test_rename_scenario() {
        let (_dir, file, engine) = setup("def foo():\n    return 1\n\nfoo()\n").await;
        let proposed = propose_diff(&engine, &file, "def bar():\n    return 1\n\nfoo()\n")
            .await
            .unwrap();
        assert_eq!(proposed.len(), 1);

        let listed = engine.list(&file).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, HunkStatus::Pending);

        let applied = engine.apply_file(&file, &DiskWriter).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(
            tokio::fs::read_to_string(&file).await.unwrap(),
            "def bar():\n    return 1\n\nfoo()\n"
        );
        assert!(engine.list(&file).await.is_empty());
        assert!(engine.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_proposal_is_rejected() {
        let (_dir, file, engine) = setup("1\n2\n3\n4\n").await;
        let first = propose_diff(&engine, &file, "1\nTWO\n3\n4\n").await.unwrap();

        let err = propose_diff(&engine, &file, "1\nzwei\ndrei\n4\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Overlap { .. }));

        let listed = engine.list(&file).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first[0].id);
        assert_eq!(listed[0].status, HunkStatus::Pending);
    }

    #[tokio::test]
    async fn test_touching_hunks_are_allowed() {
        let (_dir, file, engine) = setup("1\n2\n3\n4\n").await;
        propose_diff(&engine, &file, "one\n2\n3\n4\n").await.unwrap();
        propose_diff(&engine, &file, "1\ntwo\n3\n4\n").await.unwrap();
        assert_eq!(engine.list(&file).await.len(), 2);

        engine.apply_file(&file, &DiskWriter).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&file).await.unwrap(),
            "one\ntwo\n3\n4\n"
        );
    }

    #[tokio::test]
    async fn test_same_point_insertions_conflict() {
        let (_dir, file, engine) = setup("a\nb\n").await;
        let snapshot = Some("a\nb\n".to_string());
        let insert = |text: &str| ProposedHunk {
            start: 2,
            end: 2,
            original: String::new(),
            replacement: text.to_string(),
        };
        engine
            .propose(&file, snapshot.clone(), vec![insert("x\n")])
            .await
            .unwrap();
        let err = engine
            .propose(&file, snapshot, vec![insert("y\n")])
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Overlap { .. }));
    }

    #[tokio::test]
    async fn test_apply_hunk_is_idempotent() {
        let (_dir, file, engine) = setup("a\nb\nc\n").await;
        let hunks = propose_diff(&engine, &file, "a\nB\nc\n").await.unwrap();
        let id = hunks[0].id;

        assert!(engine.apply_hunk(&file, id, &DiskWriter).await.unwrap());
        assert!(!engine.apply_hunk(&file, id, &DiskWriter).await.unwrap());
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "a\nB\nc\n");
    }

    #[tokio::test]
    async fn test_cancel_hunk_is_idempotent_and_leaves_disk() {
        let (_dir, file, engine) = setup("a\nb\nc\n").await;
        let hunks = propose_diff(&engine, &file, "a\nB\nc\n").await.unwrap();
        let id = hunks[0].id;

        assert!(engine.cancel_hunk(&file, id).await.unwrap());
        assert!(!engine.cancel_hunk(&file, id).await.unwrap());
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "a\nb\nc\n");

        let err = engine.apply_hunk(&file, id, &DiskWriter).await.unwrap_err();
        assert!(matches!(
            err,
            PatchError::Resolved {
                status: HunkStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_file_refuses_apply() {
        let (_dir, file, engine) = setup("a\nb\n").await;
        let hunks = propose_diff(&engine, &file, "a\nB\n").await.unwrap();
        tokio::fs::write(&file, "edited elsewhere\n").await.unwrap();

        let err = engine
            .apply_hunk(&file, hunks[0].id, &DiskWriter)
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Stale(_)));
        assert_eq!(
            tokio::fs::read_to_string(&file).await.unwrap(),
            "edited elsewhere\n"
        );
        assert!(matches!(
            engine.cancel_file(&file).await.unwrap_err(),
            PatchError::Stale(_)
        ));
    }

    #[tokio::test]
    async fn test_reproposal_replaces_stale_patch() {
        let (_dir, file, engine) = setup("a\nb\n").await;
        let old = propose_diff(&engine, &file, "a\nB\n").await.unwrap();
        tokio::fs::write(&file, "a\nb\nc\n").await.unwrap();

        let fresh = propose_diff(&engine, &file, "A\nb\nc\n").await.unwrap();
        let listed = engine.list(&file).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, fresh[0].id);
        assert!(!engine.cancel_hunk(&file, old[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_apply_shifts_later_hunks() {
        let (_dir, file, engine) = setup("1\n2\n3\n4\n5\n").await;
        let hunks = propose_diff(&engine, &file, "1\n2a\n2b\n2c\n3\n4\nFIVE\n")
            .await
            .unwrap();
        assert_eq!(hunks.len(), 2);

        engine.apply_hunk(&file, hunks[0].id, &DiskWriter).await.unwrap();
        let listed = engine.list(&file).await;
        let later = listed.iter().find(|h| h.id == hunks[1].id).unwrap();
        assert_eq!((later.start, later.end), (7, 8));

        engine.apply_hunk(&file, hunks[1].id, &DiskWriter).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&file).await.unwrap(),
            "1\n2a\n2b\n2c\n3\n4\nFIVE\n"
        );
    }

    #[tokio::test]
    async fn test_apply_order_independent_of_proposal_order() {
        let original = "l1\nl2\nl3\nl4\nl5\nl6\n";
        let a = ProposedHunk {
            start: 1,
            end: 2,
            original: "l1\n".into(),
            replacement: "x1\nx1b\n".into(),
        };
        let b = ProposedHunk {
            start: 3,
            end: 5,
            original: "l3\nl4\n".into(),
            replacement: "".into(),
        };
        let c = ProposedHunk {
            start: 7,
            end: 7,
            original: "".into(),
            replacement: "tail\n".into(),
        };

        let mut results = Vec::new();
        for order in [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ] {
            let (_dir, file, engine) = setup(original).await;
            engine
                .propose(&file, Some(original.to_string()), order)
                .await
                .unwrap();
            engine.apply_file(&file, &DiskWriter).await.unwrap();
            results.push(tokio::fs::read_to_string(&file).await.unwrap());
        }
        assert_eq!(results[0], "x1\nx1b\nl2\nl5\nl6\ntail\n");
        assert!(results.iter().all(|r| r == &results[0]));
    }

    #[tokio::test]
    async fn test_round_trip_leaves_nothing_to_propose() {
        let (_dir, file, engine) = setup("a\nb\nc\n").await;
        let proposed_text = "a\nbee\nc\n";
        propose_diff(&engine, &file, proposed_text).await.unwrap();
        engine.apply_file(&file, &DiskWriter).await.unwrap();

        let disk = tokio::fs::read_to_string(&file).await.unwrap();
        assert!(compute_hunks(&disk, proposed_text).is_empty());
    }

    #[tokio::test]
    async fn test_new_file_created_on_apply() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("src/new.rs");
        let engine = PatchEngine::new();

        let hunks = compute_hunks("", "fn main() {}\n");
        engine.propose(&file, None, hunks).await.unwrap();
        let views = engine.list_all().await;
        assert!(!views[0].exists);

        engine.apply_file(&file, &DiskWriter).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&file).await.unwrap(),
            "fn main() {}\n"
        );
    }

    #[tokio::test]
    async fn test_clear_leaves_disk_alone() {
        let (_dir, file, engine) = setup("a\nb\n").await;
        propose_diff(&engine, &file, "a\nB\n").await.unwrap();

        engine.clear().await;
        assert!(engine.files().await.is_empty());
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn test_mismatched_original_rejected() {
        let (_dir, file, engine) = setup("a\nb\n").await;
        let err = engine
            .propose(
                &file,
                Some("a\nb\n".into()),
                vec![ProposedHunk {
                    start: 1,
                    end: 2,
                    original: "zzz\n".into(),
                    replacement: "y\n".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::InvalidHunk(_)));
    }

    #[tokio::test]
    async fn test_unknown_hunk() {
        let (_dir, file, engine) = setup("a\n").await;
        assert!(matches!(
            engine.apply_hunk(&file, 99, &DiskWriter).await.unwrap_err(),
            PatchError::HunkNotFound(99)
        ));
    }
}
