use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn storage_path(&self) -> PathBuf {
        self.xdg_data.join("dealpulse/storage.db")
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("dealpulse");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(assert_cmd::cargo::cargo_bin!("dealpulse"));
        command
            .args(args)
            .env("HOME", &self.home)
            .env("XDG_DATA_HOME", &self.xdg_data)
            .env("XDG_CONFIG_HOME", &self.xdg_config)
            .env("XDG_STATE_HOME", &self.xdg_state)
            .env_remove("RUST_LOG");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args)
            .stdin(Stdio::null())
            .output()
            .unwrap_or_else(|e| panic!("failed to execute dealpulse: {e}"))
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &str) -> Output {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn dealpulse: {e}"));
        child
            .stdin
            .take()
            .expect("stdin is piped")
            .write_all(stdin.as_bytes())
            .expect("failed to write stdin");
        child.wait_with_output().expect("failed to wait for dealpulse")
    }
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "dealpulse {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Value after `label` on the first line that starts with it
fn field<'a>(stdout: &'a str, label: &str) -> Option<&'a str> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(label))
        .map(str::trim)
}

#[test]
fn status_reports_defaults_and_a_durable_visitor() {
    let env = CliTestEnv::new();

    let first = env.run(&["status"]);
    assert_success(&["status"], &first);
    let stdout = stdout_of(&first);
    assert!(stdout.contains("dealpulse Configuration"));
    assert_eq!(field(&stdout, "Ingest:"), Some("disabled"));
    assert_eq!(field(&stdout, "Storage status:"), Some("available"));
    assert_eq!(field(&stdout, "Saved draft:"), Some("none"));

    let visitor = field(&stdout, "Visitor ID:").expect("visitor id printed").to_string();
    assert!(visitor.starts_with("visitor_"), "unexpected id {visitor}");
    assert!(env.storage_path().exists());

    let second = env.run(&["status"]);
    assert_success(&["status"], &second);
    assert_eq!(field(&stdout_of(&second), "Visitor ID:"), Some(visitor.as_str()));
}

#[test]
fn status_shows_company_domain_from_referrer() {
    let env = CliTestEnv::new();
    let args = ["status", "--referrer", "https://www.acme-industrial.com/team"];

    let output = env.run(&args);
    assert_success(&args, &output);
    assert_eq!(
        field(&stdout_of(&output), "Company domain:"),
        Some("acme-industrial.com")
    );
}

#[test]
fn track_with_ingest_disabled_is_accepted_locally() {
    let env = CliTestEnv::new();
    let args = ["track", "cta_click", "--path", "/pricing", "--data", "label=Get valuation"];

    let output = env.run(&args);
    assert_success(&args, &output);
    assert!(stdout_of(&output).contains("Ingest disabled: cta_click accepted locally"));
}

#[test]
fn track_against_unreachable_backend_still_exits_cleanly() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[ingest]
enabled = true
base_url = "http://127.0.0.1:9"
timeout_ms = 500
"#,
    );
    let args = ["track", "page_view"];

    let output = env.run(&args);
    assert_success(&args, &output);
    assert!(
        stdout_of(&output).contains("Delivery failed (1 consecutive failures)"),
        "unexpected stdout:\n{}",
        stdout_of(&output)
    );
    assert!(String::from_utf8_lossy(&output.stderr).contains("event_transport failed"));
}

#[test]
fn track_rejects_malformed_data() {
    let env = CliTestEnv::new();
    let output = env.run(&["track", "cta_click", "--data", "label"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("expected KEY=VALUE"));
}

#[test]
fn invalid_config_is_reported() {
    let env = CliTestEnv::new();
    env.write_config("[ingest]\nenabled = true\n");

    let output = env.run(&["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load configuration"));
}

#[test]
fn autosave_session_is_abandoned_on_eof_and_resumed() {
    let env = CliTestEnv::new();
    let args = ["autosave"];

    let output = env.run_with_stdin(&args, "company_name=Acme\nrevenue=1200000\n:step 2\n");
    assert_success(&args, &output);
    let stdout = stdout_of(&output);
    assert!(stdout.contains("No saved draft"));
    let token = field(&stdout, "Draft ")
        .expect("draft token printed")
        .to_string();
    assert_eq!(field(&stdout, "Phase:"), Some("abandoned"));
    assert_eq!(field(&stdout, "Draft:"), Some(token.as_str()));

    let resumed = env.run_with_stdin(&args, "");
    assert_success(&args, &resumed);
    let stdout = stdout_of(&resumed);
    assert_eq!(field(&stdout, "Resumed draft"), Some(token.as_str()));

    let status = env.run(&["status"]);
    assert_success(&["status"], &status);
    assert!(field(&stdout_of(&status), "Saved draft:")
        .expect("saved draft printed")
        .starts_with(&token));
}

#[test]
fn autosave_trivial_first_value_does_not_create_a_draft() {
    let env = CliTestEnv::new();
    let args = ["autosave"];

    let output = env.run_with_stdin(&args, "company_name=A\n");
    assert_success(&args, &output);
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Not saved yet (company_name)"));
    assert_eq!(field(&stdout, "Phase:"), Some("pending"));
}

#[test]
fn autosave_finalize_completes_the_draft() {
    let env = CliTestEnv::new();
    let args = ["autosave"];

    let output = env.run_with_stdin(
        &args,
        "company_name=Acme\nemail=ceo@acme.com\nphone=(415) 555-0134\n:finalize\n",
    );
    assert_success(&args, &output);
    assert_eq!(field(&stdout_of(&output), "Phase:"), Some("finalized"));
}

#[test]
fn autosave_clear_forgets_the_draft() {
    let env = CliTestEnv::new();
    let args = ["autosave"];

    let output = env.run_with_stdin(&args, "company_name=Acme\n:clear\n");
    assert_success(&args, &output);
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Draft cleared"));
    assert_eq!(field(&stdout, "Phase:"), Some("pending"));

    let status = env.run(&["status"]);
    assert_success(&["status"], &status);
    assert_eq!(field(&stdout_of(&status), "Saved draft:"), Some("none"));
}
