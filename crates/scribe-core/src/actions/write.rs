use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::str_param;
use crate::atomic::{AtomicWriter, WriteMode};
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;
use crate::security::{resolve_param_path, SecurityManager};

/// Persists the current content through the atomic writer, to the event
/// file or to `path` (relative paths resolve next to the event file).
/// The resolved target is checked against the restricted paths again right
/// before the write.
pub struct WriteFileAction {
    writer: AtomicWriter,
    security: Arc<SecurityManager>,
}

impl WriteFileAction {
    pub fn new(writer: AtomicWriter, security: Arc<SecurityManager>) -> Self {
        Self { writer, security }
    }
}

fn target(file_path: &Path, param: Option<&str>) -> PathBuf {
    match param {
        None => file_path.to_path_buf(),
        Some(p) => resolve_param_path(file_path, p),
    }
}

impl ActionPlugin for WriteFileAction {
    fn action_type(&self) -> &str {
        "write_file"
    }

    fn execute(
        &self,
        file_content: &str,
        _match_info: &MatchInfo,
        file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let mode: WriteMode = str_param(params, "mode")?
            .unwrap_or("text")
            .parse()
            .map_err(|e| ActionError::execution(format!("{e}")))?;
        let target = target(file_path, str_param(params, "path")?);
        self.security
            .validate_path(&target)
            .map_err(|v| self.security.violation(v))?;

        self.writer
            .write(&target, file_content.as_bytes(), mode)
            .map_err(|e| ActionError::execution(e.to_string()))?;
        info!(path = %target.display(), bytes = file_content.len(), "file written");
        Ok(file_content.to_string())
    }

    fn validate_params(&self, params: &Params) -> bool {
        let mode_ok = match str_param(params, "mode") {
            Ok(None) => true,
            Ok(Some(m)) => m.parse::<WriteMode>().is_ok(),
            Err(_) => false,
        };
        mode_ok && str_param(params, "path").is_ok()
    }
}
