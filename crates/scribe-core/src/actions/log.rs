use std::path::Path;

use tracing::{debug, error, info, trace, warn};

use super::{required_str, str_param, substitute};
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Emits an `action.log` entry. Content passes through unchanged.
#[derive(Debug, Default)]
pub struct LogAction;

impl ActionPlugin for LogAction {
    fn action_type(&self) -> &str {
        "log"
    }

    fn execute(
        &self,
        file_content: &str,
        match_info: &MatchInfo,
        file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let message = substitute(required_str(params, "message")?, file_path, match_info, params);
        let path = file_path.display();
        let matched = match_info.matched.as_str();
        match str_param(params, "level")?.unwrap_or("info") {
            "trace" => trace!(event = "action.log", %path, matched, "{message}"),
            "debug" => debug!(event = "action.log", %path, matched, "{message}"),
            "info" => info!(event = "action.log", %path, matched, "{message}"),
            "warn" => warn!(event = "action.log", %path, matched, "{message}"),
            "error" => error!(event = "action.log", %path, matched, "{message}"),
            other => return Err(ActionError::execution(format!("unknown log level {other:?}"))),
        }
        Ok(file_content.to_string())
    }

    fn get_required_params(&self) -> Vec<String> {
        vec!["message".into()]
    }

    fn validate_params(&self, params: &Params) -> bool {
        matches!(params.get("message"), Some(v) if v.is_string())
            && match str_param(params, "level") {
                Ok(None) => true,
                Ok(Some(level)) => LEVELS.contains(&level),
                Err(_) => false,
            }
    }
}
