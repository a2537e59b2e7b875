use std::path::Path;

use super::{bool_param, required_str, str_param};
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;

#[derive(Debug, Default)]
pub struct InsertTextAction;

impl ActionPlugin for InsertTextAction {
    fn action_type(&self) -> &str {
        "insert_text"
    }

    fn execute(
        &self,
        file_content: &str,
        _match_info: &MatchInfo,
        _file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let text = required_str(params, "text")?;
        // Idempotent by default so a rewrite does not feed itself.
        if bool_param(params, "unless_present", true)? && file_content.contains(text) {
            return Ok(file_content.to_string());
        }
        match str_param(params, "position")?.unwrap_or("end") {
            "start" => Ok(format!("{text}{file_content}")),
            "end" => Ok(format!("{file_content}{text}")),
            other => Err(ActionError::execution(format!(
                "unknown position {other:?}, expected start or end"
            ))),
        }
    }

    fn get_required_params(&self) -> Vec<String> {
        vec!["text".into()]
    }

    fn validate_params(&self, params: &Params) -> bool {
        matches!(params.get("text"), Some(v) if v.is_string())
            && matches!(str_param(params, "position"), Ok(None | Some("start" | "end")))
            && bool_param(params, "unless_present", true).is_ok()
    }
}
