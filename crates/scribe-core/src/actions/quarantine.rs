//! Moves the event file into the quarantine directory for later inspection.
//! Files are never deleted, only moved.
//!
//! Layout: {quarantine_path}/{timestamp}_{original_filename}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;

pub struct QuarantineAction {
    root: PathBuf,
}

impl QuarantineAction {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700));
        }
        Ok(())
    }

    /// Returns the destination, or `None` when the source is already gone.
    pub fn quarantine_file(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        if !source.exists() {
            info!(path = %source.display(), "quarantine: source already gone");
            return Ok(None);
        }
        self.ensure_root()?;

        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let ts = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let dest = self.root.join(format!("{ts}_{filename}"));

        if let Err(rename_err) = fs::rename(source, &dest) {
            // Cross-device moves fail to rename.
            warn!(error = %rename_err, "rename into quarantine failed, copying");
            fs::copy(source, &dest)?;
            fs::remove_file(source)?;
        }
        info!(from = %source.display(), to = %dest.display(), "file quarantined");
        Ok(Some(dest))
    }
}

impl ActionPlugin for QuarantineAction {
    fn action_type(&self) -> &str {
        "quarantine"
    }

    fn execute(
        &self,
        file_content: &str,
        _match_info: &MatchInfo,
        file_path: &Path,
        _params: &Params,
    ) -> Result<String, ActionError> {
        self.quarantine_file(file_path).map_err(|e| {
            ActionError::execution(format!("quarantine {}: {e}", file_path.display()))
        })?;
        Ok(file_content.to_string())
    }
}
