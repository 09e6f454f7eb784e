use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::mail_reader::Uid;

/// Last handled UID, as written to the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uid_validity: Option<u32>,
    pub last_seen_uid: Uid,
}

/// JSON file holding the [`Checkpoint`] between runs.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when there is no state file yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        // Older state files carry nothing but the bare UID.
        if let Ok(uid) = contents.trim().parse::<Uid>() {
            return Ok(Some(Checkpoint {
                uid_validity: None,
                last_seen_uid: uid,
            }));
        }

        let checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        debug!("Read checkpoint from {}: {:?}", self.path.display(), checkpoint);
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        // The state file is replaced atomically, never half written.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
