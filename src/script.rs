use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::error::ProcessError;

static SCRIPT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+\.py$").unwrap());

/// Variables copied from the host environment into the child.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "PYTHONPATH", "SYSTEMROOT"];

/// How long to wait for the output readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const STREAMS_HELD_OPEN: &str =
    "output streams still held open after exit; captured output may be incomplete";

pub fn is_valid_script_name(name: &str) -> bool {
    SCRIPT_NAME.is_match(name)
}

/// Parse the caller's JSON input string.  Blank means "no input".
pub fn parse_input(raw: &str) -> Result<Option<serde_json::Value>, ProcessError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(raw)?))
}

/// Resource limits applied to the child via `pre_exec`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    /// RLIMIT_CPU, seconds.
    pub max_cpu_secs: u64,
    /// RLIMIT_FSIZE, bytes.
    pub max_file_size_bytes: u64,
    /// RLIMIT_NOFILE.
    pub max_open_files: u64,
}

impl From<&ProcessConfig> for ProcessLimits {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            max_cpu_secs: config.max_cpu_secs,
            max_file_size_bytes: config.max_file_size_bytes,
            max_open_files: config.max_open_files,
        }
    }
}

/// Runs between fork and exec, so it only calls setrlimit.
#[cfg(unix)]
fn apply_process_limits(limits: &ProcessLimits) -> std::io::Result<()> {
    use rlimit::Resource;

    let set = |resource: Resource, limit: u64| -> std::io::Result<()> {
        resource
            .set(limit, limit)
            .map_err(|e| std::io::Error::other(format!("setrlimit failed: {e}")))
    };

    set(Resource::CPU, limits.max_cpu_secs)?;
    set(Resource::FSIZE, limits.max_file_size_bytes)?;
    set(Resource::NOFILE, limits.max_open_files)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    /// `None` when the child was killed or aborted.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn render(self, cap: usize) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(&format!("\n[output truncated at {cap} bytes]"));
        }
        (text, self.truncated)
    }
}

/// Executes vetted interpreter scripts from a single directory.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    config: ProcessConfig,
}

impl ScriptRunner {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.config.scripts_dir
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Validate and resolve `name` to a script inside the scripts directory.
    fn locate(&self, name: &str) -> Result<PathBuf, ProcessError> {
        if !is_valid_script_name(name) {
            return Err(ProcessError::InvalidScriptName(name.to_string()));
        }
        let path = self.config.scripts_dir.join(name);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(ProcessError::ScriptNotFound(name.to_string())),
        }
    }

    /// Input-rejected and spawn failures come back as `Err`.  Once the child
    /// is running every outcome, including a timeout, is a `ProcessResult`.
    pub async fn run(
        &self,
        name: &str,
        input: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ProcessResult, ProcessError> {
        let input = parse_input(input)?;
        let script = self.locate(name)?;
        let payload = input.map(|v| serde_json::to_vec(&v)).transpose()?;
        let timeout = self.config.timeout(timeout_ms);
        let cap = self.config.max_output_bytes;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&script)
            .current_dir(&self.config.scripts_dir)
            .env_clear()
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in INHERITED_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        #[cfg(unix)]
        {
            let limits = ProcessLimits::from(&self.config);
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setpgid(0, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    apply_process_limits(&limits)
                });
            }
        }

        debug!(script = name, interpreter = %self.config.interpreter, ?timeout, "spawning script");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            let (Some(mut stdin), Some(payload)) = (stdin, payload) else {
                return;
            };
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "script closed stdin early");
                return;
            }
            let _ = stdin.shutdown().await;
        });

        let stdout = child.stdout.take().map(|s| Drain::spawn(s, cap));
        let stderr = child.stderr.take().map(|s| Drain::spawn(s, cap));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                // Anything the script left running in its group would keep the pipes open.
                kill_group(pid);
                (status?.code(), false)
            }
            Err(_) => {
                warn!(script = name, timeout_ms = timeout.as_millis() as u64, "script timed out, killing");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "kill after timeout failed");
                }
                (None, true)
            }
        };
        writer.abort();

        let ((stdout, stdout_done), (stderr, stderr_done)) =
            tokio::join!(Drain::collect(stdout), Drain::collect(stderr));
        let (stdout, stdout_truncated) = stdout.render(cap);
        let (stderr, stderr_truncated) = stderr.render(cap);
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = if timed_out {
            Some(ProcessError::TimedOut(timeout.as_millis() as u64).to_string())
        } else if !(stdout_done && stderr_done) {
            warn!(script = name, "output readers outlived the script");
            Some(STREAMS_HELD_OPEN.to_string())
        } else {
            None
        };
        let success = exit_code == Some(0);

        info!(script = name, ?exit_code, duration_ms, timed_out, "script finished");
        Ok(ProcessResult {
            success,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration_ms,
            timed_out,
            error,
        })
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn lock(shared: &Mutex<Captured>) -> MutexGuard<'_, Captured> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A reader task whose bytes stay reachable even if the task is aborted.
struct Drain {
    shared: Arc<Mutex<Captured>>,
    handle: JoinHandle<()>,
}

impl Drain {
    fn spawn<R>(reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Captured::default()));
        let handle = tokio::spawn(read_capped(reader, cap, Arc::clone(&shared)));
        Self { shared, handle }
    }

    /// Returns what was captured and whether the stream reached EOF in time.
    async fn collect(drain: Option<Self>) -> (Captured, bool) {
        let Some(Self { shared, mut handle }) = drain else {
            return (Captured::default(), true);
        };
        let done = match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                handle.abort();
                false
            }
        };
        let captured = std::mem::take(&mut *lock(&shared));
        (captured, done)
    }
}

/// Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize, out: Arc<Mutex<Captured>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut out = lock(&out);
        let room = cap.saturating_sub(out.bytes.len());
        if n > room {
            out.bytes.extend_from_slice(&buf[..room]);
            out.truncated = true;
        } else {
            out.bytes.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner_with(scripts: &[(&str, &str)], tweak: impl FnOnce(&mut ProcessConfig)) -> (TempDir, ScriptRunner) {
        let dir = TempDir::new().unwrap();
        for (name, body) in scripts {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let mut config = ProcessConfig {
            scripts_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        tweak(&mut config);
        (dir, ScriptRunner::new(config))
    }

    #[test]
    fn script_name_allow_list() {
        for ok in ["ok.py", "a_b-c.py", "X9.py"] {
            assert!(is_valid_script_name(ok), "{ok}");
        }
        for bad in [
            "../x.py", "a/b.py", "x.py.txt", "x.js", ".py", "x.py\n", "a\\b.py", "x y.py", "", "x.PY",
        ] {
            assert!(!is_valid_script_name(bad), "{bad:?}");
        }
    }

    #[test]
    fn input_parsing() {
        assert!(parse_input("").unwrap().is_none());
        assert!(parse_input("  \n").unwrap().is_none());
        assert_eq!(parse_input(r#"{"n":1}"#).unwrap().unwrap()["n"], 1);
        assert!(matches!(parse_input("{nope"), Err(ProcessError::InvalidJsonInput(_))));
    }

    #[tokio::test]
    async fn invalid_name_rejected_before_filesystem() {
        let runner = ScriptRunner::new(ProcessConfig {
            scripts_dir: PathBuf::from("/nonexistent/scripts"),
            ..Default::default()
        });
        let err = runner.run("../x.py", "", None).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidScriptName(_)));
    }

    #[tokio::test]
    async fn invalid_json_rejected() {
        let (_dir, runner) = runner_with(&[("ok.py", "print(1)\n")], |_| {});
        let err = runner.run("ok.py", "{broken", None).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidJsonInput(_)));
    }

    #[tokio::test]
    async fn missing_script_reported() {
        let (_dir, runner) = runner_with(&[], |_| {});
        let err = runner.run("absent.py", "", None).await.unwrap_err();
        assert!(matches!(err, ProcessError::ScriptNotFound(_)));
    }

    #[tokio::test]
    async fn runs_script_with_json_input() {
        let script = "import json, sys\ndata = json.load(sys.stdin)\nprint(json.dumps({\"n\": data[\"n\"] + 1}))\n";
        let (_dir, runner) = runner_with(&[("ok.py", script)], |_| {});
        let result = runner.run("ok.py", r#"{"n":1}"#, None).await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("\"n\": 2"));
        assert!(!result.timed_out);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn no_input_closes_stdin() {
        let script = "import sys\nprint(len(sys.stdin.read()))\n";
        let (_dir, runner) = runner_with(&[("count.py", script)], |_| {});
        let result = runner.run("count.py", "", Some(5_000)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "0");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let script = "import sys\nsys.stderr.write('bad things')\nsys.exit(3)\n";
        let (_dir, runner) = runner_with(&[("fail.py", script)], |_| {});
        let result = runner.run("fail.py", "", None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, "bad things");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn output_is_capped_with_marker() {
        let script = "import sys\nsys.stdout.write('x' * 50000)\n";
        let (_dir, runner) = runner_with(&[("loud.py", script)], |c| c.max_output_bytes = 100);
        let result = runner.run("loud.py", "", None).await.unwrap();
        assert!(result.success);
        assert!(result.stdout_truncated);
        assert!(result.stdout.starts_with(&"x".repeat(100)));
        assert!(result.stdout.ends_with("[output truncated at 100 bytes]"));
        assert!(!result.stdout.contains(&"x".repeat(101)));
    }

    #[tokio::test]
    async fn stderr_is_capped_independently() {
        let script = "import sys\nprint('fine')\nsys.stderr.write('e' * 50000)\n";
        let (_dir, runner) = runner_with(&[("noisy.py", script)], |c| c.max_output_bytes = 100);
        let result = runner.run("noisy.py", "", None).await.unwrap();
        assert!(result.success);
        assert!(result.stderr_truncated);
        assert!(result.stderr.ends_with("[output truncated at 100 bytes]"));
        assert!(!result.stderr.contains(&"e".repeat(101)));
        assert!(!result.stdout_truncated);
        assert_eq!(result.stdout.trim(), "fine");
    }

    #[tokio::test]
    async fn background_child_does_not_swallow_output() {
        let script = "import subprocess\nprint('important result', flush=True)\nsubprocess.Popen(['sleep', '5'])\n";
        let (_dir, runner) = runner_with(&[("bg.py", script)], |_| {});
        let result = runner.run("bg.py", "", Some(10_000)).await.unwrap();
        assert!(result.success, "{result:?}");
        assert!(result.stdout.contains("important result"));
        assert!(result.error.is_none());
        assert!(result.duration_ms < 4_000, "{}", result.duration_ms);
    }

    #[tokio::test]
    async fn escaped_child_keeps_partial_output_and_warns() {
        let script = "import subprocess\nprint('partial', flush=True)\nsubprocess.Popen(['sleep', '5'], start_new_session=True)\n";
        let (_dir, runner) = runner_with(&[("escape.py", script)], |_| {});
        let result = runner.run("escape.py", "", Some(10_000)).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("partial"));
        assert!(result.error.unwrap().contains("held open"));
        assert!(result.duration_ms < 5_000, "{}", result.duration_ms);
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let script = "import time\ntime.sleep(30)\n";
        let (_dir, runner) = runner_with(&[("slow.py", script)], |_| {});
        let result = runner.run("slow.py", "", Some(300)).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn child_environment_is_minimal() {
        let script = "import os\nprint(sorted(k for k in os.environ if k in ('CARGO', 'PYTHONIOENCODING')))\n";
        let (_dir, runner) = runner_with(&[("env.py", script)], |_| {});
        let result = runner.run("env.py", "", None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "['PYTHONIOENCODING']");
    }
}
