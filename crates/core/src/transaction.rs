use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Scopes one task's workspace mutations. Pre-images are captured before the
/// first touch of each path; abort restores them exactly, commit publishes.
pub struct Transaction {
    pub task_id: String,
    state: TxnState,
    /// Absolute path -> content before the task touched it (`None` = the
    /// path did not exist).
    pre_images: HashMap<PathBuf, Option<Vec<u8>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnState {
    Open,
    Committed,
    Aborted,
}

pub type TransactionHandle = Arc<Mutex<Transaction>>;

impl Transaction {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: TxnState::Open,
            pre_images: HashMap::new(),
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Capture a path's content before its first mutation in this task.
    /// Subsequent calls for the same path are no-ops, so the snapshot always
    /// reflects the true pre-task state.
    pub fn record_pre_image(&mut self, absolute_path: &Path) {
        if self.state != TxnState::Open || self.pre_images.contains_key(absolute_path) {
            return;
        }
        let content = std::fs::read(absolute_path).ok();
        self.pre_images.insert(absolute_path.to_path_buf(), content);
    }

    /// Paths this transaction touched, relative to the workspace root where
    /// possible.
    pub fn touched_paths(&self, workspace_root: &Path) -> Vec<String> {
        let mut paths: Vec<String> = self
            .pre_images
            .keys()
            .map(|p| {
                p.strip_prefix(workspace_root)
                    .unwrap_or(p)
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        paths.sort();
        paths
    }

    pub fn is_empty(&self) -> bool {
        self.pre_images.is_empty()
    }

    fn restore(&self) -> Result<()> {
        for (path, pre_image) in &self.pre_images {
            match pre_image {
                Some(content) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("recreating {}", parent.display()))?;
                    }
                    std::fs::write(path, content)
                        .with_context(|| format!("restoring {}", path.display()))?;
                }
                None => {
                    if path.exists() {
                        std::fs::remove_file(path)
                            .with_context(|| format!("removing {}", path.display()))?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Finalized transaction, kept so later gates can prove every destructive
/// task was either committed or aborted before the next task started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
    pub task_id: String,
    pub state: TxnState,
    pub touched: Vec<String>,
}

pub struct TransactionManager {
    workspace_root: PathBuf,
    records: Vec<TxnRecord>,
}

impl TransactionManager {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            records: Vec::new(),
        }
    }

    pub fn begin(&self, task_id: &str) -> TransactionHandle {
        Arc::new(Mutex::new(Transaction::new(task_id)))
    }

    /// Publish the task's mutations. The workspace already holds them; the
    /// transaction just transitions and is recorded.
    pub fn commit(&mut self, handle: &TransactionHandle) -> Result<TxnRecord> {
        let mut txn = handle.lock().expect("transaction lock");
        anyhow::ensure!(txn.state == TxnState::Open, "transaction not open");
        txn.state = TxnState::Committed;
        let record = TxnRecord {
            task_id: txn.task_id.clone(),
            state: TxnState::Committed,
            touched: txn.touched_paths(&self.workspace_root),
        };
        self.records.push(record.clone());
        Ok(record)
    }

    /// Roll the workspace back to the pre-task snapshot.
    pub fn abort(&mut self, handle: &TransactionHandle) -> Result<TxnRecord> {
        let mut txn = handle.lock().expect("transaction lock");
        anyhow::ensure!(txn.state == TxnState::Open, "transaction not open");
        txn.restore()?;
        txn.state = TxnState::Aborted;
        let record = TxnRecord {
            task_id: txn.task_id.clone(),
            state: TxnState::Aborted,
            touched: txn.touched_paths(&self.workspace_root),
        };
        self.records.push(record.clone());
        Ok(record)
    }

    pub fn record_for(&self, task_id: &str) -> Option<&TxnRecord> {
        self.records.iter().rev().find(|r| r.task_id == task_id)
    }

    pub fn records(&self) -> &[TxnRecord] {
        &self.records
    }
}
