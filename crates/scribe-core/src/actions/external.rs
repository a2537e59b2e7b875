use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::substitute;
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin, PluginManifest};
use crate::rules::MatchInfo;
use crate::security::SecurityManager;

/// Action backed by a manifest from the plugin directory. The file content
/// is piped to the program on stdin and its stdout becomes the new content.
pub struct ExternalCommandAction {
    manifest: PluginManifest,
    security: Arc<SecurityManager>,
    timeout: Duration,
}

impl ExternalCommandAction {
    pub fn new(
        manifest: PluginManifest,
        security: Arc<SecurityManager>,
        default_timeout: Duration,
    ) -> Self {
        let timeout = manifest
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            manifest,
            security,
            timeout,
        }
    }
}

impl ActionPlugin for ExternalCommandAction {
    fn action_type(&self) -> &str {
        &self.manifest.action_type
    }

    fn execute(
        &self,
        file_content: &str,
        match_info: &MatchInfo,
        file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let argv: Vec<String> = self
            .manifest
            .command
            .iter()
            .map(|arg| substitute(arg, file_path, match_info, params))
            .collect();
        let output = self.security.execute_with_input(
            &argv,
            None,
            Some(self.timeout),
            file_content.as_bytes().to_vec(),
        )?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(ActionError::execution(format!(
                "plugin {} failed: {}",
                self.manifest.action_type,
                output.stderr.trim()
            )))
        }
    }

    fn get_required_params(&self) -> Vec<String> {
        self.manifest.required_params.clone()
    }
}
