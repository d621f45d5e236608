use std::{
    ffi::OsStr,
    fs,
    io::Write,
    net::SocketAddr,
    path::Path,
    process::{Command, Output, Stdio},
};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::tempdir;
use tokio::net::TcpListener;

const TAB: &str = "https://a.test";

fn write_config(path: &Path, storage_path: &Path) {
    let config = format!(
        r#"
[storage]
path = "{}"

[logging]
level = "warn"
"#,
        storage_path.display()
    );
    fs::write(path, config).expect("config should be written");
}

fn wsinspect_command<I, S>(args: I, cwd: &Path, home: &Path) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_wsinspect"));
    command.args(args).env("HOME", home).current_dir(cwd);
    command
}

fn run_wsinspect<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    wsinspect_command(args, cwd, home)
        .output()
        .expect("wsinspect command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout should be JSON ({err})\nstdout:\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("echo listener should bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[test]
fn messages_and_clear_work_on_an_empty_store() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home = sandbox.path().join("home");
    fs::create_dir_all(&home).expect("home dir should be created");
    write_config(
        &sandbox.path().join("wsinspect.toml"),
        &sandbox.path().join("db").join("messages.db"),
    );

    let messages = run_wsinspect(["messages", "--tab-url", TAB], sandbox.path(), &home);
    assert_success(&messages);
    let body = stdout_json(&messages);
    assert_eq!(body["activeTabUrl"], TAB);
    assert_eq!(body["messages"], serde_json::json!({}));
    assert!(sandbox.path().join("db").join("messages.db").is_file());

    let clear = run_wsinspect(["clear"], sandbox.path(), &home);
    assert_success(&clear);
    assert_eq!(stdout_json(&clear), serde_json::json!({ "success": true }));
}

#[test]
fn storage_defaults_to_home_directory() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home = sandbox.path().join("home");
    let project = sandbox.path().join("project");
    fs::create_dir_all(&home).expect("home dir should be created");
    fs::create_dir_all(&project).expect("project dir should be created");

    let installed = run_wsinspect(["installed", "install"], &project, &home);
    assert_success(&installed);
    assert_eq!(stdout_json(&installed), serde_json::json!({ "success": true }));
    assert!(home.join(".wsinspect").join("messages.db").is_file());
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    let storage_dir = sandbox.path().join("storage");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".wsinspect")).expect("home config dir should be created");

    let project_config = project_dir.join("wsinspect.toml");
    let home_config = home_dir.join(".wsinspect").join("config.toml");
    let override_config = sandbox.path().join("override.toml");

    write_config(&project_config, &storage_dir.join("project.db"));
    fs::write(&home_config, "[store]\nunknown_key = 1\n").expect("home config should be written");

    let prefers_project = run_wsinspect(["messages"], &project_dir, &home_dir);
    assert_success(&prefers_project);
    assert!(storage_dir.join("project.db").is_file());

    fs::remove_file(&project_config).expect("project config should be removed");
    write_config(&home_config, &storage_dir.join("home.db"));

    let falls_back_to_home = run_wsinspect(["messages"], &project_dir, &home_dir);
    assert_success(&falls_back_to_home);
    assert!(storage_dir.join("home.db").is_file());

    fs::write(&project_config, "[store]\nmax_messages = 0\n")
        .expect("project config should be rewritten as invalid");
    write_config(&override_config, &storage_dir.join("override.db"));

    let without_override = run_wsinspect(["messages"], &project_dir, &home_dir);
    assert!(
        !without_override.status.success(),
        "expected failure without override\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stdout),
        String::from_utf8_lossy(&without_override.stderr)
    );
    assert!(
        String::from_utf8_lossy(&without_override.stderr).contains("project ./wsinspect.toml"),
        "stderr should indicate the project source\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stderr)
    );

    let with_override = run_wsinspect(
        [
            OsStr::new("messages"),
            OsStr::new("--config"),
            override_config.as_os_str(),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&with_override);
    assert!(storage_dir.join("override.db").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tap_prints_captured_frames_and_persists_them() {
    let addr = spawn_echo_server().await;
    let sandbox = tempdir().expect("tempdir should be created");
    let home = sandbox.path().join("home");
    fs::create_dir_all(&home).expect("home dir should be created");
    write_config(
        &sandbox.path().join("wsinspect.toml"),
        &sandbox.path().join("messages.db"),
    );
    let cwd = sandbox.path().to_path_buf();
    let socket_url = format!("ws://{addr}/ws");

    let tap = {
        let cwd = cwd.clone();
        let home = home.clone();
        let socket_url = socket_url.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = wsinspect_command(
                ["tap", socket_url.as_str(), "--tab-url", TAB],
                &cwd,
                &home,
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("tap should start");
            {
                let mut stdin = child.stdin.take().expect("stdin should be piped");
                writeln!(stdin, "hello").expect("stdin should accept a line");
            }
            child.wait_with_output().expect("tap should exit")
        })
        .await
        .expect("tap task should join")
    };
    assert_success(&tap);

    let printed: Vec<Value> = String::from_utf8_lossy(&tap.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each stdout line should be JSON"))
        .collect();
    let kinds: Vec<&str> = printed
        .iter()
        .map(|m| m["kind"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(kinds.first(), Some(&"connection-opened"), "{kinds:?}");
    assert_eq!(kinds.last(), Some(&"connection-closed"), "{kinds:?}");
    assert!(
        printed
            .iter()
            .any(|m| m["kind"] == "frame-sent" && m["payload"] == "hello"),
        "{printed:?}"
    );
    assert!(printed.iter().all(|m| m["tabUrl"] == TAB));
    let ids: Vec<u64> = printed.iter().filter_map(|m| m["id"].as_u64()).collect();
    assert_eq!(ids, (1..=printed.len() as u64).collect::<Vec<_>>());

    let messages = run_wsinspect(["messages", "--tab-url", TAB], &cwd, &home);
    assert_success(&messages);
    let stored = stdout_json(&messages)["messages"][TAB]
        .as_array()
        .cloned()
        .expect("tab should have stored messages");
    assert_eq!(stored.len(), printed.len());
    assert_eq!(stored[0]["kind"], "connection-closed");
    assert!(
        stored.iter().all(|m| m["isNew"] == false),
        "printed messages should be marked seen: {stored:?}"
    );
}

#[test]
fn log_level_env_var_overrides_config() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home = sandbox.path().join("home");
    fs::create_dir_all(&home).expect("home dir should be created");
    write_config(
        &sandbox.path().join("wsinspect.toml"),
        &sandbox.path().join("messages.db"),
    );

    let output = wsinspect_command(["messages"], sandbox.path(), &home)
        .env("WSINSPECT_LOG", "chatty")
        .output()
        .expect("wsinspect command should execute");
    assert!(
        !output.status.success(),
        "expected failure with an invalid env level\nstdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("invalid log level `chatty`"),
        "stderr should name the env level\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let quiet = wsinspect_command(["messages"], sandbox.path(), &home)
        .env("WSINSPECT_LOG", "off")
        .output()
        .expect("wsinspect command should execute");
    assert_success(&quiet);
    assert!(
        quiet.stderr.is_empty(),
        "logging should be off\nstderr:\n{}",
        String::from_utf8_lossy(&quiet.stderr)
    );
}
