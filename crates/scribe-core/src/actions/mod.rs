//! Built-in actions.

mod command;
mod external;
mod insert;
mod log;
mod quarantine;
mod replace;
mod write;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Params;
use crate::plugins::{ActionError, BuiltinDeps, PluginLoader};
use crate::rules::MatchInfo;

pub use command::RunCommandAction;
pub use external::ExternalCommandAction;
pub use insert::InsertTextAction;
pub use log::LogAction;
pub use quarantine::QuarantineAction;
pub use replace::ReplaceAction;
pub use write::WriteFileAction;

pub(crate) fn register_builtins(loader: &mut PluginLoader, deps: BuiltinDeps) {
    loader.register_builtin("replace", || Arc::new(ReplaceAction));
    loader.register_builtin("insert_text", || Arc::new(InsertTextAction));
    loader.register_builtin("log", || Arc::new(LogAction));

    let d = deps.clone();
    loader.register_builtin("run_command", move || {
        Arc::new(RunCommandAction::new(d.security.clone(), d.command_timeout))
    });
    let d = deps.clone();
    loader.register_builtin("write_file", move || {
        Arc::new(WriteFileAction::new(d.writer.clone(), d.security.clone()))
    });
    loader.register_builtin("quarantine", move || {
        Arc::new(QuarantineAction::new(deps.quarantine_root.clone()))
    });
}

/// Expand `{file_path}`, `{match}` and `{param.NAME}` inside one argument.
/// Arguments are substituted individually and never re-split.
pub fn substitute(arg: &str, file_path: &Path, match_info: &MatchInfo, params: &Params) -> String {
    if !arg.contains('{') {
        return arg.to_string();
    }
    let mut out = arg
        .replace("{file_path}", &file_path.to_string_lossy())
        .replace("{match}", &match_info.matched);
    for (key, value) in params {
        let placeholder = format!("{{param.{key}}}");
        if out.contains(&placeholder) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &text);
        }
    }
    out
}

pub(crate) fn str_param<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ActionError::execution(format!("param {key} must be a string"))),
    }
}

pub(crate) fn required_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, ActionError> {
    str_param(params, key)?
        .ok_or_else(|| ActionError::execution(format!("missing required param {key}")))
}

pub(crate) fn bool_param(params: &Params, key: &str, default: bool) -> Result<bool, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ActionError::execution(format!("param {key} must be a boolean"))),
    }
}

pub(crate) fn u64_param(params: &Params, key: &str) -> Result<Option<u64>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ActionError::execution(format!("param {key} must be a non-negative integer"))
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn substitution_is_per_argument() {
        let p = params(json!({"tag": "urgent", "n": 3}));
        let m = matched("TODO; rm x");
        let path = Path::new("/w/a b.md");
        assert_eq!(substitute("{file_path}", path, &m, &p), "/w/a b.md");
        assert_eq!(substitute("--m={match}", path, &m, &p), "--m=TODO; rm x");
        assert_eq!(substitute("{param.tag}-{param.n}", path, &m, &p), "urgent-3");
        assert_eq!(substitute("plain", path, &m, &p), "plain");
    }
}
