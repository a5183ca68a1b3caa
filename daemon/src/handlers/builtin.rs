//! Built-in command handlers. These are the defaults every daemon ships
//! with; more can be added through `Registry::register`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::process::Command;

use alfred_protocol::Params;

use super::{failure, success, Registry};
use crate::stats;

/// Default timeout for handlers that run external processes.
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;

/// Output cap per command (2 MiB).
const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

pub fn register_builtins(registry: &Registry) {
    // Core commands
    registry.register("ping", handle_ping);
    registry.register("shell", handle_shell);
    registry.register("exec", handle_shell); // generic exec is shell
    registry.register("read_file", handle_read_file);
    registry.register("write_file", handle_write_file);
    registry.register("delete_file", handle_delete_file);
    registry.register("list_files", handle_list_files);
    registry.register("system_info", handle_system_info);

    // Process management
    registry.register("list_processes", handle_list_processes);
    registry.register("kill_process", handle_kill_process);

    // Tooling
    registry.register("docker", handle_docker);
    registry.register("git", handle_git);
    registry.register("manage_service", handle_manage_service);
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn u64_param(params: &Params, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

fn bool_param(params: &Params, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn args_param(params: &Params, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Process execution
// ---------------------------------------------------------------------------

/// Run a prepared command with a timeout, reporting combined output and exit
/// code. The child is killed on timeout (kill_on_drop reaps it when the
/// output future is dropped).
async fn run_with_timeout(mut cmd: Command, timeout_secs: u64) -> Params {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await;
    match output {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let mut text = truncated_lossy(output.stdout);
            text.push_str(&truncated_lossy(output.stderr));

            let mut result = Params::new();
            result.insert("success".into(), Value::Bool(exit_code == 0));
            result.insert("output".into(), Value::String(text));
            result.insert("exit_code".into(), json!(exit_code));
            if exit_code != 0 {
                result.insert(
                    "error".into(),
                    Value::String(format!("command exited with code {exit_code}")),
                );
            }
            result
        }
        Ok(Err(e)) => failure(format!("failed to run command: {e}")),
        Err(_) => {
            let mut result = failure(format!("command timed out after {timeout_secs}s"));
            result.insert("exit_code".into(), json!(-1));
            result
        }
    }
}

fn truncated_lossy(mut bytes: Vec<u8>) -> String {
    if bytes.len() > MAX_OUTPUT_BYTES {
        bytes.truncate(MAX_OUTPUT_BYTES);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        text.push_str("\n... (truncated)");
        return text;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn run_shell_line(command: &str, workdir: Option<&str>, timeout_secs: u64) -> Params {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    run_with_timeout(cmd, timeout_secs).await
}

async fn run_program(
    program: &str,
    args: &[String],
    workdir: Option<&str>,
    timeout_secs: u64,
) -> Params {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    run_with_timeout(cmd, timeout_secs).await
}

// ---------------------------------------------------------------------------
// Core commands
// ---------------------------------------------------------------------------

async fn handle_ping(_params: Params) -> Params {
    let mut result = success();
    result.insert("output".into(), json!("pong"));
    result.insert("time".into(), json!(Utc::now().to_rfc3339()));
    result
}

async fn handle_shell(params: Params) -> Params {
    let Some(command) = str_param(&params, "command") else {
        return failure("no command provided");
    };
    let command = if bool_param(&params, "use_sudo") {
        format!("sudo {command}")
    } else {
        command.to_string()
    };
    let timeout = u64_param(&params, "timeout")
        .filter(|t| *t > 0)
        .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
    let workdir = str_param(&params, "working_directory");
    run_shell_line(&command, workdir, timeout).await
}

async fn handle_read_file(params: Params) -> Params {
    let Some(path) = str_param(&params, "path") else {
        return failure("no path provided");
    };
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => return failure(format!("failed to read {path}: {e}")),
    };

    let offset = u64_param(&params, "offset").unwrap_or(0) as usize;
    let limit = u64_param(&params, "limit").unwrap_or(0) as usize;

    let lines: Vec<&str> = content.split('\n').collect();
    let total_lines = lines.len();
    let selected = if offset > 0 || limit > 0 {
        let start = offset.min(lines.len());
        let end = if limit > 0 {
            (start + limit).min(lines.len())
        } else {
            lines.len()
        };
        lines[start..end].join("\n")
    } else {
        content
    };

    let mut result = success();
    result.insert("size".into(), json!(selected.len()));
    result.insert("total_lines".into(), json!(total_lines));
    result.insert("content".into(), Value::String(selected));
    result
}

async fn handle_write_file(params: Params) -> Params {
    let Some(path) = str_param(&params, "path") else {
        return failure("no path provided");
    };
    let content = params
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let write = async {
        if bool_param(&params, "append") {
            let mut options = tokio::fs::OpenOptions::new();
            options.append(true).create(true);
            let mut file = options.open(path).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await?;
        } else {
            tokio::fs::write(path, content).await?;
        }
        if let Some(mode) = u64_param(&params, "mode") {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode as u32)).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    match write.await {
        Ok(()) => {
            let mut result = success();
            result.insert("path".into(), json!(path));
            result.insert("size".into(), json!(content.len()));
            result
        }
        Err(e) => failure(format!("failed to write {path}: {e}")),
    }
}

async fn handle_delete_file(params: Params) -> Params {
    let Some(path) = str_param(&params, "path") else {
        return failure("no path provided");
    };

    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) => return failure(format!("failed to delete {path}: {e}")),
    };

    let deleted = if meta.is_dir() {
        if bool_param(&params, "recursive") {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        }
    } else {
        tokio::fs::remove_file(path).await
    };

    match deleted {
        Ok(()) => {
            let mut result = success();
            result.insert("path".into(), json!(path));
            result
        }
        Err(e) => failure(format!("failed to delete {path}: {e}")),
    }
}

async fn handle_list_files(params: Params) -> Params {
    let path = str_param(&params, "path").unwrap_or(".").to_string();
    let recursive = bool_param(&params, "recursive");
    let pattern = match str_param(&params, "pattern") {
        Some(raw) => match glob::Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(e) => return failure(format!("invalid pattern {raw:?}: {e}")),
        },
        None => None,
    };

    let root = PathBuf::from(&path);
    let walk = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        walk_dir(&root, recursive, pattern.as_ref(), &mut files)?;
        Ok::<Vec<Value>, std::io::Error>(files)
    })
    .await;

    match walk {
        Ok(Ok(files)) => {
            let mut result = success();
            result.insert("count".into(), json!(files.len()));
            result.insert("files".into(), Value::Array(files));
            result
        }
        Ok(Err(e)) => failure(format!("failed to list {path}: {e}")),
        Err(e) => failure(format!("list task failed: {e}")),
    }
}

fn walk_dir(
    dir: &Path,
    recursive: bool,
    pattern: Option<&glob::Pattern>,
    out: &mut Vec<Value>,
) -> std::io::Result<()> {
    let meta = std::fs::metadata(dir)?;
    if !meta.is_dir() {
        if matches_pattern(dir, pattern) {
            out.push(file_entry(dir, &meta));
        }
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if matches_pattern(&path, pattern) {
            out.push(file_entry(&path, &meta));
        }
        if recursive && meta.is_dir() {
            // Unreadable subtrees are skipped, not fatal.
            let _ = walk_dir(&path, recursive, pattern, out);
        }
    }
    Ok(())
}

fn matches_pattern(path: &Path, pattern: Option<&glob::Pattern>) -> bool {
    match pattern {
        Some(pattern) => path
            .file_name()
            .map(|name| pattern.matches(&name.to_string_lossy()))
            .unwrap_or(false),
        None => true,
    }
}

fn file_entry(path: &Path, meta: &std::fs::Metadata) -> Value {
    use std::os::unix::fs::PermissionsExt;

    let mod_time = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
    json!({
        "name": path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        "path": path.to_string_lossy(),
        "size": meta.len(),
        "is_dir": meta.is_dir(),
        "mode": format_permissions(meta.permissions().mode()),
        "mod_time": mod_time,
    })
}

/// Unix permission string, e.g. "rwxr-xr-x".
fn format_permissions(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

async fn handle_system_info(_params: Params) -> Params {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let (disk_total, disk_free) = stats::disk_usage(Path::new("/")).unwrap_or((0, 0));

    let mut result = success();
    result.insert("hostname".into(), json!(crate::config::system_hostname()));
    result.insert("os".into(), json!(std::env::consts::OS));
    result.insert("arch".into(), json!(std::env::consts::ARCH));
    result.insert("num_cpus".into(), json!(num_cpus));
    result.insert("memory_percent".into(), json!(stats::memory_percent()));
    result.insert("disk_total".into(), json!(disk_total));
    result.insert("disk_free".into(), json!(disk_free));
    result.insert("pid".into(), json!(std::process::id()));
    result.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    result
}

// ---------------------------------------------------------------------------
// Process management
// ---------------------------------------------------------------------------

async fn handle_list_processes(_params: Params) -> Params {
    let result = run_program("ps", &["aux".to_string()], None, DEFAULT_EXEC_TIMEOUT_SECS).await;
    // Only the text matters here; drop the exit_code field shell adds.
    let mut trimmed = Params::new();
    for key in ["success", "output", "error"] {
        if let Some(value) = result.get(key) {
            trimmed.insert(key.into(), value.clone());
        }
    }
    trimmed
}

async fn handle_kill_process(params: Params) -> Params {
    let Some(pid) = u64_param(&params, "pid").filter(|p| *p > 0) else {
        return failure("no pid provided");
    };
    let signal = u64_param(&params, "signal").unwrap_or(15) as i32;
    let pid = pid as i32;

    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return failure(format!("process {pid} not found"));
        }
        return failure(format!("failed to signal process {pid}: {err}"));
    }

    let mut result = success();
    result.insert("pid".into(), json!(pid));
    result.insert("signal".into(), json!(signal));
    result
}

// ---------------------------------------------------------------------------
// Tooling
// ---------------------------------------------------------------------------

async fn handle_docker(params: Params) -> Params {
    let args = args_param(&params, "args");
    run_program("docker", &args, None, DEFAULT_EXEC_TIMEOUT_SECS).await
}

async fn handle_git(params: Params) -> Params {
    let args = args_param(&params, "args");
    let workdir = str_param(&params, "working_directory");
    run_program("git", &args, workdir, DEFAULT_EXEC_TIMEOUT_SECS).await
}

async fn handle_manage_service(params: Params) -> Params {
    let Some(service) = str_param(&params, "service_name") else {
        return failure("no service_name provided");
    };
    let action = str_param(&params, "action").unwrap_or("status");

    // systemctl where present, SysV service otherwise.
    let args = if command_in_path("systemctl") {
        vec![
            "systemctl".to_string(),
            action.to_string(),
            service.to_string(),
        ]
    } else {
        vec![
            "service".to_string(),
            service.to_string(),
            action.to_string(),
        ]
    };

    let mut result = run_program("sudo", &args, None, DEFAULT_EXEC_TIMEOUT_SECS).await;
    result.insert("service".into(), json!(service));
    result.insert("action".into(), json!(action));
    result
}

fn command_in_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // ping
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn ping_returns_pong_with_time() {
        let result = handle_ping(Params::new()).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["output"], "pong");
        assert!(result["time"].as_str().unwrap().contains('T'));
    }

    // -----------------------------------------------------------------------
    // shell
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn shell_runs_command() {
        let result = handle_shell(params(&[("command", json!("echo hi"))])).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["output"], "hi\n");
        assert_eq!(result["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn shell_requires_command() {
        let result = handle_shell(Params::new()).await;
        assert_eq!(result["success"], Value::Bool(false));
        assert_eq!(result["error"], "no command provided");
    }

    #[tokio::test]
    async fn shell_reports_nonzero_exit() {
        let result = handle_shell(params(&[("command", json!("exit 3"))])).await;
        assert_eq!(result["success"], Value::Bool(false));
        assert_eq!(result["exit_code"], json!(3));
        assert!(result["error"].as_str().unwrap().contains("3"));
    }

    #[tokio::test]
    async fn shell_times_out() {
        let result = handle_shell(params(&[
            ("command", json!("sleep 5")),
            ("timeout", json!(1)),
        ]))
        .await;
        assert_eq!(result["success"], Value::Bool(false));
        assert!(
            result["error"].as_str().unwrap().contains("timed out"),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn shell_honors_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = handle_shell(params(&[
            ("command", json!("pwd")),
            (
                "working_directory",
                json!(dir.path().to_string_lossy().into_owned()),
            ),
        ]))
        .await;
        assert_eq!(result["success"], Value::Bool(true));
        // Resolve symlinks (macOS /tmp) before comparing.
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            result["output"].as_str().unwrap().trim_end(),
            canonical.to_string_lossy()
        );
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn read_file_returns_content_and_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "one\ntwo\nthree").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let result = handle_read_file(params(&[("path", json!(path))])).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["content"], "one\ntwo\nthree");
        assert_eq!(result["total_lines"], json!(3));
        assert_eq!(result["size"], json!("one\ntwo\nthree".len()));
    }

    #[tokio::test]
    async fn read_file_applies_offset_and_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a\nb\nc\nd").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let result = handle_read_file(params(&[
            ("path", json!(path)),
            ("offset", json!(1)),
            ("limit", json!(2)),
        ]))
        .await;
        assert_eq!(result["content"], "b\nc");
        assert_eq!(result["total_lines"], json!(4));
    }

    #[tokio::test]
    async fn read_file_requires_path() {
        let result = handle_read_file(Params::new()).await;
        assert_eq!(result["error"], "no path provided");
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let result =
            handle_read_file(params(&[("path", json!("/definitely/not/here.txt"))])).await;
        assert_eq!(result["success"], Value::Bool(false));
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt").to_string_lossy().into_owned();

        let result = handle_write_file(params(&[
            ("path", json!(path.clone())),
            ("content", json!("hello")),
        ]))
        .await;
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["size"], json!(5));

        let result = handle_read_file(params(&[("path", json!(path))])).await;
        assert_eq!(result["content"], "hello");
    }

    #[tokio::test]
    async fn write_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt").to_string_lossy().into_owned();

        handle_write_file(params(&[
            ("path", json!(path.clone())),
            ("content", json!("a")),
        ]))
        .await;
        handle_write_file(params(&[
            ("path", json!(path.clone())),
            ("content", json!("b")),
            ("append", json!(true)),
        ]))
        .await;

        let result = handle_read_file(params(&[("path", json!(path))])).await;
        assert_eq!(result["content"], "ab");
    }

    #[tokio::test]
    async fn delete_file_and_recursive_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let result =
            handle_delete_file(params(&[("path", json!(file.to_string_lossy()))])).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert!(!file.exists());

        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("inner.txt"), "x").unwrap();

        // Non-recursive delete of a non-empty dir fails
        let result = handle_delete_file(params(&[("path", json!(sub.to_string_lossy()))])).await;
        assert_eq!(result["success"], Value::Bool(false));

        let result = handle_delete_file(params(&[
            ("path", json!(sub.to_string_lossy())),
            ("recursive", json!(true)),
        ]))
        .await;
        assert_eq!(result["success"], Value::Bool(true));
        assert!(!sub.exists());
    }

    #[tokio::test]
    async fn list_files_filters_by_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("c.log"), "x").unwrap();

        let result = handle_list_files(params(&[
            ("path", json!(dir.path().to_string_lossy())),
            ("pattern", json!("*.log")),
        ]))
        .await;
        assert_eq!(result["count"], json!(1));

        let result = handle_list_files(params(&[
            ("path", json!(dir.path().to_string_lossy())),
            ("pattern", json!("*.log")),
            ("recursive", json!(true)),
        ]))
        .await;
        assert_eq!(result["count"], json!(2));

        let entry = &result["files"][0];
        assert!(entry["name"].as_str().unwrap().ends_with(".log"));
        assert_eq!(entry["is_dir"], Value::Bool(false));
        assert!(entry["mode"].as_str().unwrap().len() == 9);
    }

    #[tokio::test]
    async fn list_files_invalid_pattern_fails() {
        let result = handle_list_files(params(&[("pattern", json!("[unclosed"))])).await;
        assert_eq!(result["success"], Value::Bool(false));
        assert!(result["error"].as_str().unwrap().contains("pattern"));
    }

    #[test]
    fn permission_strings() {
        assert_eq!(format_permissions(0o777), "rwxrwxrwx");
        assert_eq!(format_permissions(0o755), "rwxr-xr-x");
        assert_eq!(format_permissions(0o644), "rw-r--r--");
        assert_eq!(format_permissions(0o000), "---------");
    }

    // -----------------------------------------------------------------------
    // system_info / processes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn system_info_reports_host_snapshot() {
        let result = handle_system_info(Params::new()).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert!(!result["hostname"].as_str().unwrap().is_empty());
        assert!(result["num_cpus"].as_u64().unwrap() >= 1);
        assert_eq!(result["os"], std::env::consts::OS);
    }

    #[tokio::test]
    async fn kill_process_requires_pid() {
        let result = handle_kill_process(Params::new()).await;
        assert_eq!(result["error"], "no pid provided");
    }

    #[tokio::test]
    async fn kill_process_reports_missing_process() {
        // PID near i32::MAX is vanishingly unlikely to exist.
        let result = handle_kill_process(params(&[("pid", json!(2147483000u64))])).await;
        assert_eq!(result["success"], Value::Bool(false));
        assert!(result["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn kill_process_signals_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let result = handle_kill_process(params(&[("pid", json!(pid))])).await;
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["signal"], json!(15));

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    // -----------------------------------------------------------------------
    // Tooling handlers are total even when the binary is absent
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn docker_handler_always_returns_a_result() {
        let result = handle_docker(params(&[("args", json!(["version"]))])).await;
        assert!(result.contains_key("success"));
    }

    #[tokio::test]
    async fn manage_service_requires_name() {
        let result = handle_manage_service(Params::new()).await;
        assert_eq!(result["error"], "no service_name provided");
    }
}
