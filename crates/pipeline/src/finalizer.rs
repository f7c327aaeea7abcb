use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use crate::bundle::BundleLayout;
use crate::config::{PipelineConfig, RetentionPolicy};
use crate::error::FinalizeError;
use crate::job::Job;
use crate::playlist::MasterPlaylist;
use crate::store::{ContentRecord, MetadataStore};

/// What a successful commit produced
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub token: String,
    pub bundle_bytes: u64,
    /// New location of the source, when it was relocated
    pub retained_source: Option<PathBuf>,
}

/// Publishes finished bundles and cleans up failed ones
pub struct Finalizer {
    store: Arc<dyn MetadataStore>,
    retention: RetentionPolicy,
    retained_dir: PathBuf,
}

impl Finalizer {
    pub fn new(store: Arc<dyn MetadataStore>, cfg: &PipelineConfig) -> Self {
        Finalizer {
            store,
            retention: cfg.retention.clone(),
            retained_dir: cfg.retained_dir.clone(),
        }
    }

    /// Persist the content record, then apply source retention.
    ///
    /// Retention runs only after the record exists; a failed relocation is
    /// logged and leaves the source where it was.
    pub fn commit(&self, job: &Job, master: &MasterPlaylist, layout: &BundleLayout) -> Result<Committed, FinalizeError> {
        let record = ContentRecord {
            token: Uuid::new_v4().to_string(),
            asset_key: job.asset_key(),
            job_id: job.id.clone(),
            display_name: job.display_name.clone(),
            bundle_root: layout.root().to_path_buf(),
            master_playlist: master.path.clone(),
            created_at: Utc::now(),
        };
        let token = self.store.put(record)?;
        info!("Job {}: published as {}", job.id, token);

        let retained_source = match self.retention {
            RetentionPolicy::Keep => None,
            RetentionPolicy::Relocate => match self.relocate(job) {
                Ok(dest) => {
                    info!("Job {}: source retained at {}", job.id, dest.display());
                    Some(dest)
                }
                Err(e) => {
                    warn!("Job {}: failed to relocate {}: {}", job.id, job.source_path.display(), e);
                    None
                }
            },
        };

        Ok(Committed {
            token,
            bundle_bytes: layout.size_bytes(),
            retained_source,
        })
    }

    /// Remove the partial bundle. Never touches the source; never fails.
    pub fn rollback(&self, job: &Job, layout: &BundleLayout) {
        match layout.remove() {
            Ok(()) => info!("🗑️  Job {}: removed partial bundle {}", job.id, layout.root().display()),
            Err(e) => warn!("Job {}: failed to remove partial bundle {}: {}", job.id, layout.root().display(), e),
        }
    }

    fn relocate(&self, job: &Job) -> io::Result<PathBuf> {
        let file_name = job
            .source_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        fs::create_dir_all(&self.retained_dir)?;
        let dest = self
            .retained_dir
            .join(format!("{}-{}", job.id, file_name.to_string_lossy()));
        move_file(&job.source_path, &dest)?;
        Ok(dest)
    }
}

/// Rename, falling back to copy + remove across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
