use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{str_param, substitute, u64_param};
use crate::config::Params;
use crate::plugins::{ActionError, ActionPlugin};
use crate::rules::MatchInfo;
use crate::security::{command_argv, resolve_param_path, SecurityManager};

/// Runs an allow-listed program. The file content passes through unchanged.
pub struct RunCommandAction {
    security: Arc<SecurityManager>,
    default_timeout: Duration,
}

impl RunCommandAction {
    pub fn new(security: Arc<SecurityManager>, default_timeout: Duration) -> Self {
        Self {
            security,
            default_timeout,
        }
    }
}

impl ActionPlugin for RunCommandAction {
    fn action_type(&self) -> &str {
        "run_command"
    }

    fn execute(
        &self,
        file_content: &str,
        match_info: &MatchInfo,
        file_path: &Path,
        params: &Params,
    ) -> Result<String, ActionError> {
        let template = params
            .get("command")
            .and_then(command_argv)
            .ok_or_else(|| ActionError::execution("command must be a list of strings"))?;
        let argv: Vec<String> = template
            .iter()
            .map(|arg| substitute(arg, file_path, match_info, params))
            .collect();
        let cwd = str_param(params, "cwd")?.map(|dir| resolve_param_path(file_path, dir));
        let timeout = u64_param(params, "timeout_seconds")?
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let output = self.security.execute_command_safely(&argv, cwd.as_deref(), Some(timeout))?;
        if output.success {
            Ok(file_content.to_string())
        } else {
            let detail = output.stderr.trim();
            Err(ActionError::execution(match output.exit_code {
                Some(code) => format!("{} exited with {code}: {detail}", argv[0]),
                None => format!("{} did not complete: {detail}", argv[0]),
            }))
        }
    }

    fn get_required_params(&self) -> Vec<String> {
        vec!["command".into()]
    }

    fn validate_params(&self, params: &Params) -> bool {
        params
            .get("command")
            .and_then(command_argv)
            .map(|argv| !argv.is_empty())
            .unwrap_or(false)
            && str_param(params, "cwd").is_ok()
            && u64_param(params, "timeout_seconds").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{matched, params};
    use crate::security::{ProcessOutput, ProcessSpawner, SecurityPolicy, SpawnRequest};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Scripted {
        exit: i32,
        seen: Mutex<Vec<SpawnRequest>>,
    }

    impl ProcessSpawner for Scripted {
        fn run(&self, request: &SpawnRequest) -> std::io::Result<ProcessOutput> {
            self.seen.lock().push(request.clone());
            Ok(ProcessOutput {
                exit_code: Some(self.exit),
                stderr: b"boom".to_vec(),
                ..ProcessOutput::default()
            })
        }
    }

    fn action(exit: i32) -> (RunCommandAction, Arc<Scripted>) {
        let spawner = Arc::new(Scripted {
            exit,
            seen: Mutex::new(Vec::new()),
        });
        let mut policy = SecurityPolicy::default();
        policy.allowed_commands.insert("lint".into());
        let security = Arc::new(SecurityManager::new(policy).with_spawner(spawner.clone()));
        (RunCommandAction::new(security, Duration::from_secs(3)), spawner)
    }

    #[test]
    fn placeholders_expand_per_argument() {
        let (action, spawner) = action(0);
        let p = params(json!({"command": ["lint", "--file", "{file_path}", "{match}"]}));
        let out = action
            .execute("body", &matched("a b"), Path::new("/w/x y.md"), &p)
            .unwrap();
        assert_eq!(out, "body");
        let seen = spawner.seen.lock();
        assert_eq!(seen[0].args, vec!["--file", "/w/x y.md", "a b"]);
        assert_eq!(seen[0].timeout, Duration::from_secs(3));
    }

    #[test]
    fn nonzero_exit_is_execution_failure() {
        let (action, _) = action(2);
        let err = action
            .execute("b", &matched("x"), Path::new("/w/a"), &params(json!({"command": ["lint"]})))
            .unwrap_err();
        assert!(matches!(err, ActionError::Execution(msg) if msg.contains("exited with 2")));
    }

    #[test]
    fn disallowed_program_is_security_failure() {
        let (action, spawner) = action(0);
        let err = action
            .execute("b", &matched("x"), Path::new("/w/a"), &params(json!({"command": ["sh", "-c", "x"]})))
            .unwrap_err();
        assert!(matches!(err, ActionError::Security(_)));
        assert!(spawner.seen.lock().is_empty());
    }
}
