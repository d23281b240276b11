//! Runner for the out-of-process stage tools.
//!
//! Tools live in one fixed directory and receive their whole input on the
//! command line. Exit 0 is the only success signal; stderr is diagnosis.
//! Nothing here blocks the scheduler: the child runs on the runtime's
//! process reactor and the caller just awaits it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use reelflow_types::CoreError;

/// Log lines never carry more than this much captured output.
const LOG_CAPTURE_LIMIT: usize = 4096;

/// Flag-style arguments whose following value is a secret.
const SECRET_FLAGS: [&str; 4] = ["--api-key", "--token", "--secret", "--password"];

/// Environment entries that never reach a child tool.
const STRIPPED_ENV: [&str; 4] = [
    "CRYPTO_KEY",
    "DB_URL",
    "PLANNING_API_TOKEN",
    "REELFLOW_WEBHOOK_SECRET",
];

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    tools_dir: PathBuf,
    cwd: PathBuf,
}

impl ToolRunner {
    pub fn new(tools_dir: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            cwd: cwd.into(),
        }
    }

    /// Run `tools/<program> [args...]` with a hard timeout. On timeout the
    /// child is killed and `CoreError::Timeout` is returned; a non-zero
    /// exit becomes `CoreError::ToolFailure` with the captured stderr.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, CoreError> {
        let executable = self.resolve(program)?;

        debug!(
            program,
            args = %redact_args(args).join(" "),
            timeout_secs = timeout.as_secs(),
            "running tool"
        );

        let mut command = Command::new(&executable);
        command
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in STRIPPED_ENV {
            command.env_remove(key);
        }

        let child = command.spawn().map_err(|e| CoreError::ToolFailure {
            program: program.to_string(),
            exit_code: -1,
            stderr: format!("failed to spawn: {e}"),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CoreError::ToolFailure {
                    program: program.to_string(),
                    exit_code: -1,
                    stderr: format!("failed to collect output: {e}"),
                })
            }
            Err(_) => {
                // wait_with_output consumed the child; kill_on_drop already
                // reaped it when the future was dropped by the timeout.
                warn!(program, timeout_secs = timeout.as_secs(), "tool timed out");
                return Err(CoreError::Timeout {
                    program: program.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(
                program,
                exit_code,
                stderr = %truncate_for_log(&stderr),
                "tool failed"
            );
            return Err(CoreError::ToolFailure {
                program: program.to_string(),
                exit_code,
                stderr: truncate_for_log(&stderr).into_owned(),
            });
        }

        debug!(
            program,
            stdout = %truncate_for_log(&stdout),
            "tool finished"
        );
        Ok(ToolOutput { stdout, stderr })
    }

    /// Resolve a program name inside the tools directory. Anything that
    /// walks out of it, via separators, `..`, or symlinks, is rejected.
    fn resolve(&self, program: &str) -> Result<PathBuf, CoreError> {
        if program.is_empty() || program.contains(['/', '\\']) || program == "." || program == ".."
        {
            return Err(CoreError::PathEscape(program.to_string()));
        }

        let candidate = self.tools_dir.join(program);
        let tools_dir = self
            .tools_dir
            .canonicalize()
            .map_err(|_| CoreError::PathEscape(self.tools_dir.display().to_string()))?;
        let resolved = candidate
            .canonicalize()
            .map_err(|_| CoreError::NotFound(format!("tool `{program}` is not installed")))?;
        if !resolved.starts_with(&tools_dir) {
            return Err(CoreError::PathEscape(program.to_string()));
        }
        Ok(resolved)
    }
}

/// Replace secret-bearing arguments before they reach a log line.
pub fn redact_args(args: &[String]) -> Vec<String> {
    static SECRET_VALUE: OnceLock<Regex> = OnceLock::new();
    let secret_value = SECRET_VALUE
        .get_or_init(|| Regex::new(r"(?i)(api_?key|token|secret|password)=").expect("regex"));

    let mut redacted = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            redacted.push("[REDACTED]".to_string());
            mask_next = false;
            continue;
        }
        if SECRET_FLAGS.contains(&arg.as_str()) {
            redacted.push(arg.clone());
            mask_next = true;
            continue;
        }
        if secret_value.is_match(arg) {
            redacted.push("[REDACTED]".to_string());
            continue;
        }
        redacted.push(arg.clone());
    }
    redacted
}

/// Clamp captured output to the log budget on a char boundary. The full
/// text stays available to the caller; only log lines are clamped.
pub fn truncate_for_log(text: &str) -> std::borrow::Cow<'_, str> {
    if text.len() <= LOG_CAPTURE_LIMIT {
        return std::borrow::Cow::Borrowed(text);
    }
    let mut end = LOG_CAPTURE_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!("{}… [truncated {} bytes]", &text[..end], text.len() - end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[cfg(unix)]
    fn install_tool(dir: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[cfg(unix)]
    fn runner() -> (tempfile::TempDir, ToolRunner) {
        let temp = tempfile::tempdir().expect("tempdir");
        let tools = temp.path().join("tools");
        std::fs::create_dir_all(&tools).expect("tools dir");
        let runner = ToolRunner::new(&tools, temp.path());
        (temp, runner)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_zero_is_success_with_captured_stdout() {
        let (temp, runner) = runner();
        install_tool(&temp.path().join("tools"), "echo_ok", r#"echo "rendered $1""#);

        let output = runner
            .run("echo_ok", &["scene-3".to_string()], Duration::from_secs(5))
            .await
            .expect("run");
        assert_eq!(output.stdout.trim(), "rendered scene-3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_tool_failure_with_stderr() {
        let (temp, runner) = runner();
        install_tool(
            &temp.path().join("tools"),
            "broken",
            r#"echo "quota exhausted for model" >&2; exit 3"#,
        );

        let err = runner
            .run("broken", &[], Duration::from_secs(5))
            .await
            .expect_err("failure");
        match err {
            CoreError::ToolFailure {
                program,
                exit_code,
                stderr,
            } => {
                assert_eq!(program, "broken");
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("quota exhausted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (temp, runner) = runner();
        install_tool(&temp.path().join("tools"), "sleepy", "sleep 30");

        let started = std::time::Instant::now();
        let err = runner
            .run("sleepy", &[], Duration::from_millis(200))
            .await
            .expect_err("timeout");
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn traversal_out_of_tools_dir_is_rejected() {
        let (_temp, runner) = runner();
        for bad in ["../sh", "/bin/sh", "a/../../b", "..\\x"] {
            let err = runner
                .run(bad, &[], Duration::from_secs(1))
                .await
                .expect_err(bad);
            assert!(matches!(err, CoreError::PathEscape(_)), "{bad}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_tool_is_not_found() {
        let (_temp, runner) = runner();
        let err = runner
            .run("no_such_tool", &[], Duration::from_secs(1))
            .await
            .expect_err("missing");
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn redacts_flag_values_and_embedded_secrets() {
        let args = vec![
            "--input".to_string(),
            "scene.json".to_string(),
            "--api-key".to_string(),
            "sk-live-123".to_string(),
            "upload_token=abcd".to_string(),
            "API_KEY=zzzz".to_string(),
            "--quality".to_string(),
            "high".to_string(),
        ];
        let redacted = redact_args(&args);
        assert_eq!(
            redacted,
            vec![
                "--input",
                "scene.json",
                "--api-key",
                "[REDACTED]",
                "[REDACTED]",
                "[REDACTED]",
                "--quality",
                "high",
            ]
        );
    }

    #[test]
    fn log_truncation_clamps_at_limit() {
        let short = "x".repeat(100);
        assert_eq!(truncate_for_log(&short), short.as_str());

        let long = "y".repeat(LOG_CAPTURE_LIMIT + 500);
        let clamped = truncate_for_log(&long);
        assert!(clamped.contains("[truncated 500 bytes]"));
        assert!(clamped.len() < long.len());
    }
}
