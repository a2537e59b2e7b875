use std::path::Path;

use regex::Regex;

use super::{required_str, str_param, u64_param};
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;

/// Replaces the matched text, or every hit of `pattern` when given.
/// `count` limits the number of replacements; 0 or absent means all.
#[derive(Debug, Default)]
pub struct ReplaceAction;

impl ActionPlugin for ReplaceAction {
    fn action_type(&self) -> &str {
        "replace"
    }

    fn execute(
        &self,
        file_content: &str,
        match_info: &MatchInfo,
        _file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let replacement = required_str(params, "replacement")?;
        let count = u64_param(params, "count")?.unwrap_or(0) as usize;

        match str_param(params, "pattern")? {
            Some(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| ActionError::execution(format!("invalid pattern: {e}")))?;
                Ok(re.replacen(file_content, count, replacement).into_owned())
            }
            None => {
                if match_info.matched.is_empty() {
                    return Err(ActionError::execution("nothing to replace: empty match"));
                }
                Ok(if count == 0 {
                    file_content.replace(&match_info.matched, replacement)
                } else {
                    file_content.replacen(&match_info.matched, replacement, count)
                })
            }
        }
    }

    fn get_required_params(&self) -> Vec<String> {
        vec!["replacement".into()]
    }

    fn validate_params(&self, params: &Params) -> bool {
        matches!(params.get("replacement"), Some(v) if v.is_string())
            && str_param(params, "pattern").is_ok()
            && u64_param(params, "count").is_ok()
    }
}
