//! Command, path and environment policy, and the only place the engine
//! spawns processes.
//!
//! Commands are always an argv list handed straight to the OS. There is no
//! shell anywhere in this module: [`SpawnRequest::shell`] exists so that a
//! spawner can prove it was never asked for one, and [`SystemSpawner`]
//! refuses it outright.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ConfigError, Params, SecuritySettings};
use crate::metrics::Metrics;

pub const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SAFE_LOCALE: &str = "C.UTF-8";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PIPE_GRACE: Duration = Duration::from_millis(200);

const DANGEROUS_ENV: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "PYTHONPATH",
    "PYTHONHOME",
    "PERL5LIB",
    "RUBYLIB",
    "NODE_OPTIONS",
    "BASH_ENV",
    "ENV",
    "IFS",
];

const PATH_PARAMS: &[&str] = &["path", "target", "destination", "cwd", "output"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("security violation: {reason}")]
pub struct SecurityViolation {
    pub reason: String,
}

impl SecurityViolation {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub allowed_commands: HashSet<String>,
    pub restricted_path_fragments: Vec<String>,
    pub env_allowlist: HashSet<String>,
    pub dangerous_patterns: Vec<Regex>,
}

impl SecurityPolicy {
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, ConfigError> {
        let dangerous_patterns = settings
            .dangerous_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidDangerousPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed_commands: settings.allowed_commands.iter().cloned().collect(),
            restricted_path_fragments: settings
                .restricted_paths
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
            env_allowlist: settings.env_allowlist.iter().cloned().collect(),
            dangerous_patterns,
        })
    }

    fn dangerous_match(&self, text: &str) -> Option<&Regex> {
        self.dangerous_patterns.iter().find(|re| re.is_match(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub shell: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Process creation primitive. Tests substitute a recording implementation.
pub trait ProcessSpawner: Send + Sync {
    fn run(&self, request: &SpawnRequest) -> io::Result<ProcessOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn run(&self, request: &SpawnRequest) -> io::Result<ProcessOutput> {
        if request.shell {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "shell execution is not supported",
            ));
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .env_clear()
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        // The child leads its own process group so a timeout can take down
        // everything it started, not just the direct child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;

        if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), request.stdin.clone()) {
            // Detached: a child that never reads must not hold up the timeout.
            thread::spawn(move || {
                let _ = pipe.write_all(&payload);
            });
        }
        let mut pipes = [
            Pipe::new(child.stdout.take().map(drain_pipe)),
            Pipe::new(child.stderr.take().map(drain_pipe)),
        ];

        let deadline = Instant::now() + request.timeout;
        let (exit_code, mut timed_out) = loop {
            if let Some(status) = child.try_wait()? {
                break (status.code(), false);
            }
            if Instant::now() >= deadline {
                kill_process_group(&mut child);
                let _ = child.wait();
                break (None, true);
            }
            thread::sleep(POLL_INTERVAL);
        };

        let collect_until = if timed_out {
            Instant::now() + PIPE_GRACE
        } else {
            deadline
        };
        if !collect_pipes(&mut pipes, collect_until) && !timed_out {
            // The child exited but something it spawned still holds the pipes.
            kill_process_group(&mut child);
            timed_out = true;
            collect_pipes(&mut pipes, Instant::now() + PIPE_GRACE);
        }

        let [stdout, stderr] = pipes;
        Ok(ProcessOutput {
            exit_code,
            stdout: stdout.buf,
            stderr: stderr.buf,
            timed_out,
        })
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // process_group(0) made the child's pid its group id.
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg takes no pointers; an already-empty group yields ESRCH.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

struct Pipe {
    reader: Option<Receiver<Vec<u8>>>,
    buf: Vec<u8>,
}

impl Pipe {
    fn new(reader: Option<Receiver<Vec<u8>>>) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Waits for every pipe to reach EOF until `until`. Returns false while a
/// reader is still blocked on an open pipe.
fn collect_pipes(pipes: &mut [Pipe], until: Instant) -> bool {
    let mut closed = true;
    for pipe in pipes.iter_mut() {
        let Some(reader) = &pipe.reader else {
            continue;
        };
        match reader.recv_timeout(until.saturating_duration_since(Instant::now())) {
            Ok(bytes) => {
                pipe.buf = bytes;
                pipe.reader = None;
            }
            Err(RecvTimeoutError::Disconnected) => pipe.reader = None,
            Err(RecvTimeoutError::Timeout) => closed = false,
        }
    }
    closed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

pub struct SecurityManager {
    policy: RwLock<Arc<SecurityPolicy>>,
    spawner: Arc<dyn ProcessSpawner>,
    default_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityManager")
            .field("policy", &self.policy.read())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl SecurityManager {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            spawner: Arc::new(SystemSpawner),
            default_timeout: DEFAULT_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> Arc<SecurityPolicy> {
        self.policy.read().clone()
    }

    /// Swap the policy after a config reload. In-flight checks finish against
    /// the policy they started with.
    pub fn update_policy(&self, policy: SecurityPolicy) {
        *self.policy.write() = Arc::new(policy);
    }

    pub fn validate_command(&self, command: &[String]) -> Result<(), SecurityViolation> {
        let Some(program) = command.first().filter(|p| !p.trim().is_empty()) else {
            return Err(SecurityViolation::new("empty command"));
        };
        let policy = self.policy();
        let basename = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.clone());
        if !policy.allowed_commands.contains(&basename) {
            return Err(SecurityViolation::new(format!(
                "command not allowed: {basename}"
            )));
        }
        let joined = command.join(" ");
        for text in command.iter().chain(std::iter::once(&joined)) {
            if let Some(re) = policy.dangerous_match(text) {
                return Err(SecurityViolation::new(format!(
                    "command matches dangerous pattern {}",
                    re.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Rejects a path containing any restricted fragment, checked against
    /// both the path as given and its lexically normalised form.
    pub fn validate_path(&self, path: &Path) -> Result<(), SecurityViolation> {
        let policy = self.policy();
        let raw = path.to_string_lossy();
        let normalized = normalize(path);
        let normalized = normalized.to_string_lossy();
        for fragment in &policy.restricted_path_fragments {
            if raw.contains(fragment.as_str()) || normalized.contains(fragment.as_str()) {
                return Err(SecurityViolation::new(format!(
                    "path {raw} touches restricted location {fragment}"
                )));
            }
        }
        Ok(())
    }

    pub fn scrub_environment(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let policy = self.policy();
        let mut scrubbed: BTreeMap<String, String> = env
            .iter()
            .filter(|(k, _)| policy.env_allowlist.contains(k.as_str()))
            .filter(|(k, _)| !is_dangerous_env(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        scrubbed.insert("PATH".into(), SAFE_PATH.into());
        scrubbed.insert("LC_ALL".into(), SAFE_LOCALE.into());
        scrubbed.insert("LANG".into(), SAFE_LOCALE.into());
        scrubbed
    }

    pub fn execute_command_safely(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SecurityViolation> {
        self.execute(command, cwd, timeout, None)
    }

    /// Like [`execute_command_safely`](Self::execute_command_safely) with
    /// `stdin` piped to the child.
    pub fn execute_with_input(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        stdin: Vec<u8>,
    ) -> Result<CommandOutput, SecurityViolation> {
        self.execute(command, cwd, timeout, Some(stdin))
    }

    fn execute(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, SecurityViolation> {
        self.validate_command(command).map_err(|v| self.violation(v))?;
        if let Some(cwd) = cwd {
            self.validate_path(cwd).map_err(|v| self.violation(v))?;
        }

        let host_env: BTreeMap<String, String> = std::env::vars().collect();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let request = SpawnRequest {
            program: command[0].clone(),
            args: command[1..].to_vec(),
            env: self.scrub_environment(&host_env),
            cwd: cwd.map(Path::to_path_buf),
            stdin,
            timeout,
            shell: false,
        };

        debug!(program = %request.program, args = ?request.args, "spawning command");
        let output = match self.spawner.run(&request) {
            Ok(output) => output,
            Err(err) => {
                warn!(program = %request.program, error = %err, "command failed to start");
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("failed to start {}: {err}", request.program),
                    exit_code: None,
                    timed_out: false,
                });
            }
        };

        let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.timed_out {
            warn!(
                program = %request.program,
                timeout_secs = timeout.as_secs_f64(),
                "command timed out"
            );
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("timed out after {:.1}s", timeout.as_secs_f64()));
        }
        Ok(CommandOutput {
            success: !output.timed_out && output.exit_code == Some(0),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
        })
    }

    /// Gate run by the dispatcher before every action: the event file, every
    /// path-like param, every `command` param, and every string param against
    /// the dangerous patterns.
    pub fn apply_security_restrictions(
        &self,
        action_type: &str,
        params: &Params,
        file_path: &Path,
    ) -> Result<(), SecurityViolation> {
        let check = || -> Result<(), SecurityViolation> {
            self.validate_path(file_path)?;

            for key in PATH_PARAMS {
                if let Some(Value::String(p)) = params.get(*key) {
                    self.validate_path(Path::new(p))?;
                    self.validate_path(&resolve_param_path(file_path, p))?;
                }
            }

            if let Some(command) = params.get("command") {
                let argv = command_argv(command).ok_or_else(|| {
                    SecurityViolation::new("command must be a list of strings")
                })?;
                self.validate_command(&argv)?;
            }

            let policy = self.policy();
            for (key, value) in params {
                for text in strings_in(value) {
                    if let Some(re) = policy.dangerous_match(text) {
                        return Err(SecurityViolation::new(format!(
                            "param {key} matches dangerous pattern {}",
                            re.as_str()
                        )));
                    }
                }
            }
            Ok(())
        };
        check().map_err(|v| {
            let v = self.violation(v);
            warn!(
                action = action_type,
                path = %file_path.display(),
                "action blocked by security policy"
            );
            v
        })
    }

    /// Record a violation: logged and counted exactly once per occurrence.
    pub fn violation(&self, violation: SecurityViolation) -> SecurityViolation {
        warn!(event = "security.violation", reason = %violation.reason, "security violation");
        if let Some(metrics) = &self.metrics {
            Metrics::incr(&metrics.security_violations);
        }
        violation
    }
}

/// `command` params are argv lists; a bare string is never split.
pub fn command_argv(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn strings_in(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().flat_map(strings_in).collect(),
        Value::Object(map) => map.values().flat_map(strings_in).collect(),
        _ => Vec::new(),
    }
}

fn is_dangerous_env(key: &str) -> bool {
    key.starts_with("DYLD_") || DANGEROUS_ENV.contains(&key)
}

/// Where a path-like action param points: absolute values as given, relative
/// ones next to the event file. The result is lexically normalised.
pub fn resolve_param_path(file_path: &Path, param: &str) -> PathBuf {
    let param = Path::new(param);
    if param.is_absolute() {
        return normalize(param);
    }
    match file_path.parent() {
        Some(dir) => normalize(&dir.join(param)),
        None => normalize(param),
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSpawner {
        calls: Mutex<Vec<SpawnRequest>>,
    }

    impl ProcessSpawner for RecordingSpawner {
        fn run(&self, request: &SpawnRequest) -> io::Result<ProcessOutput> {
            self.calls.lock().push(request.clone());
            Ok(ProcessOutput {
                exit_code: Some(0),
                stdout: request.args.join(" ").into_bytes(),
                ..ProcessOutput::default()
            })
        }
    }

    fn policy() -> SecurityPolicy {
        SecurityPolicy::from_settings(&SecuritySettings {
            allowed_commands: vec!["echo".into(), "cat".into()],
            restricted_paths: vec!["/etc/".into(), ".ssh".into()],
            dangerous_patterns: vec![r"rm\s+-rf".into(), r"\$\(".into()],
            env_allowlist: vec!["HOME".into(), "LD_PRELOAD".into()],
        })
        .unwrap()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_validation() {
        let sm = SecurityManager::new(policy());
        assert!(sm.validate_command(&argv(&["echo", "hi"])).is_ok());
        assert!(sm.validate_command(&argv(&["/bin/echo", "hi"])).is_ok());
        assert!(sm.validate_command(&[]).is_err());
        assert!(sm.validate_command(&argv(&["", "x"])).is_err());
        assert!(sm.validate_command(&argv(&["rm", "-rf", "/"])).is_err());
        let err = sm.validate_command(&argv(&["echo", "rm -rf /"])).unwrap_err();
        assert!(err.reason.contains("dangerous"));
        assert!(sm.validate_command(&argv(&["echo", "$(whoami)"])).is_err());
    }

    #[test]
    fn path_validation_sees_through_dot_dot() {
        let sm = SecurityManager::new(policy());
        assert!(sm.validate_path(Path::new("/srv/notes/a.md")).is_ok());
        assert!(sm.validate_path(Path::new("/etc/passwd")).is_err());
        assert!(sm.validate_path(Path::new("/srv/../etc/passwd")).is_err());
        assert!(sm.validate_path(Path::new("/home/u/.ssh/id_rsa")).is_err());
    }

    #[test]
    fn environment_is_scrubbed() {
        let sm = SecurityManager::new(policy());
        let env = BTreeMap::from([
            ("HOME".to_string(), "/home/u".to_string()),
            ("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string()),
            ("SECRET_TOKEN".to_string(), "x".to_string()),
            ("PATH".to_string(), "/tmp/bin".to_string()),
        ]);
        let scrubbed = sm.scrub_environment(&env);
        assert_eq!(scrubbed.get("HOME").map(String::as_str), Some("/home/u"));
        assert!(!scrubbed.contains_key("LD_PRELOAD"));
        assert!(!scrubbed.contains_key("SECRET_TOKEN"));
        assert_eq!(scrubbed["PATH"], SAFE_PATH);
        assert_eq!(scrubbed["LC_ALL"], "C.UTF-8");
        assert_eq!(scrubbed["LANG"], "C.UTF-8");
        assert!(is_dangerous_env("DYLD_INSERT_LIBRARIES"));
    }

    #[test]
    fn spawns_argv_without_shell() {
        let spawner = Arc::new(RecordingSpawner::default());
        let metrics = Arc::new(Metrics::new());
        let sm = SecurityManager::new(policy())
            .with_spawner(spawner.clone())
            .with_metrics(metrics.clone());

        let out = sm
            .execute_command_safely(&argv(&["echo", "a b; ls"]), None, None)
            .unwrap();
        assert!(out.success);

        let calls = spawner.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "echo");
        assert_eq!(calls[0].args, vec!["a b; ls".to_string()]);
        assert!(!calls[0].shell);
        assert_eq!(calls[0].env["PATH"], SAFE_PATH);
        drop(calls);

        let err = sm
            .execute_command_safely(&argv(&["rm", "-rf", "/"]), None, None)
            .unwrap_err();
        assert!(err.reason.contains("not allowed"));
        assert_eq!(spawner.calls.lock().len(), 1);
        assert_eq!(metrics.snapshot().security_violations, 1);
    }

    #[test]
    fn system_spawner_refuses_shell() {
        let request = SpawnRequest {
            program: "echo".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(1),
            shell: true,
        };
        let err = SystemSpawner.run(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[cfg(unix)]
    #[test]
    fn real_process_output_and_stdin() {
        let sm = SecurityManager::new(policy());
        let out = sm
            .execute_command_safely(&argv(&["echo", "hello world"]), None, None)
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello world");

        let out = sm
            .execute_with_input(&argv(&["cat"]), None, None, b"piped".to_vec())
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_child() {
        let mut p = policy();
        p.allowed_commands.insert("sleep".into());
        let sm = SecurityManager::new(p);
        let started = Instant::now();
        let out = sm
            .execute_command_safely(&argv(&["sleep", "5"]), None, Some(Duration::from_millis(200)))
            .unwrap();
        assert!(!out.success);
        assert!(out.timed_out);
        assert!(out.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_takes_down_background_descendants() {
        let mut p = policy();
        p.allowed_commands.insert("sh".into());
        let sm = SecurityManager::new(p);
        let started = Instant::now();
        let out = sm
            .execute_command_safely(
                &argv(&["sh", "-c", "sleep 30 & sleep 60"]),
                None,
                Some(Duration::from_millis(300)),
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn lingering_descendant_holding_output_is_killed_at_deadline() {
        let mut p = policy();
        p.allowed_commands.insert("sh".into());
        let sm = SecurityManager::new(p);
        let started = Instant::now();
        let out = sm
            .execute_command_safely(
                &argv(&["sh", "-c", "echo early; sleep 30 &"]),
                None,
                Some(Duration::from_millis(300)),
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(out.stdout.contains("early"));
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[test]
    fn relative_param_paths_resolve_next_to_event_file() {
        assert_eq!(
            resolve_param_path(Path::new("/srv/kb/a.md"), "../secret/x"),
            PathBuf::from("/srv/secret/x")
        );
        assert_eq!(
            resolve_param_path(Path::new("/srv/kb/a.md"), "/abs/./y"),
            PathBuf::from("/abs/y")
        );

        let mut p = policy();
        p.restricted_path_fragments.push("/srv/secret".into());
        let sm = SecurityManager::new(p);
        let file = Path::new("/srv/kb/a.md");
        let escape = json!({"path": "../secret/x"});
        let err = sm
            .apply_security_restrictions("write_file", escape.as_object().unwrap(), file)
            .unwrap_err();
        assert!(err.reason.contains("/srv/secret"));

        let sibling = json!({"path": "../public/x"});
        assert!(sm
            .apply_security_restrictions("write_file", sibling.as_object().unwrap(), file)
            .is_ok());
    }

    #[test]
    fn restrictions_cover_params() {
        let sm = SecurityManager::new(policy());
        let file = Path::new("/srv/notes/a.md");
        let ok = json!({"message": "hello"});
        assert!(sm
            .apply_security_restrictions("log", ok.as_object().unwrap(), file)
            .is_ok());

        let bad_path = json!({"path": "/etc/shadow"});
        assert!(sm
            .apply_security_restrictions("write_file", bad_path.as_object().unwrap(), file)
            .is_err());

        let bad_cmd = json!({"command": ["curl", "x"]});
        assert!(sm
            .apply_security_restrictions("run_command", bad_cmd.as_object().unwrap(), file)
            .is_err());

        let string_cmd = json!({"command": "echo hi"});
        assert!(sm
            .apply_security_restrictions("run_command", string_cmd.as_object().unwrap(), file)
            .is_err());

        let sneaky = json!({"replacement": "x $(reboot)"});
        assert!(sm
            .apply_security_restrictions("replace", sneaky.as_object().unwrap(), file)
            .is_err());

        assert!(sm
            .apply_security_restrictions("log", ok.as_object().unwrap(), Path::new("/etc/hosts"))
            .is_err());
    }
}
