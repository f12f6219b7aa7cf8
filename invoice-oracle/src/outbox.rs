//! Spool directory through which one-shot commands hand work to the watcher.
//!
//! sled locks its database to a single process, so only the long-running
//! watcher opens the store. Commands like `requester mint` write jobs here
//! and the watcher drains them between polls.

use anyhow::{Context, Result};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::dispatcher::RequestReceipt;
use crate::invoice::Invoice;
use crate::secrets::StagedSecrets;

const JOB_EXT: &str = "json";
const FAILED_EXT: &str = "failed";
const ERROR_EXT: &str = "error";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    /// Record an invoice NFT that was just minted on-chain
    Register {
        token_id: U256,
        amount: U256,
        amount_decimals: u8,
        due_date: u64,
        payer: Address,
        owner: Address,
        minted_at: u64,
    },
    /// Ask the DON whether an invoice has been paid
    Verify {
        token_id: U256,
        subscription_id: u64,
        don_id: H256,
        gas_limit: i64,
        secrets: Option<StagedSecrets>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Registered(Invoice),
    Dispatched(RequestReceipt),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub created_at: u64,
    pub job: Job,
}

pub struct Outbox {
    dir: PathBuf,
}

impl Outbox {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("creating outbox {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Enqueue `job`. The file is written under a hidden name and renamed into
    /// place, so `pending` never reads a partial job.
    pub fn submit(&self, job: Job, now: u64) -> Result<String> {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!(
            "{:020}-{:010}-{:06}",
            nanos,
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::SeqCst)
        );
        let queued = QueuedJob { id: id.clone(), created_at: now, job };

        let staging = self.dir.join(format!(".{}.tmp", id));
        fs::write(&staging, serde_json::to_vec_pretty(&queued)?)?;
        fs::rename(&staging, self.job_path(&id))?;

        info!("Queued job {} for the watcher", id);
        Ok(id)
    }

    /// Jobs waiting to run, oldest first. Entries that cannot be parsed are
    /// moved aside as failed.
    pub fn pending(&self) -> Result<Vec<QueuedJob>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(JOB_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_slice::<QueuedJob>(&raw)?));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!("Unreadable outbox entry {}: {}", path.display(), e);
                    self.set_aside(&path, &e.to_string())?;
                }
            }
        }

        Ok(jobs)
    }

    pub fn complete(&self, job: &QueuedJob) -> Result<()> {
        fs::remove_file(self.job_path(&job.id))?;
        Ok(())
    }

    /// Retire a job that cannot succeed, keeping it and its error for inspection
    pub fn fail(&self, job: &QueuedJob, error: &str) -> Result<()> {
        self.set_aside(&self.job_path(&job.id), error)
    }

    pub fn failed(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(FAILED_EXT) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    fn set_aside(&self, path: &Path, error: &str) -> Result<()> {
        fs::write(path.with_extension(ERROR_EXT), error)?;
        fs::rename(path, path.with_extension(FAILED_EXT))?;
        Ok(())
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, JOB_EXT))
    }
}
