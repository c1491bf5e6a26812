use assert_cmd::Command;
use heimdell::store::{self, Credentials, Platform};
use heimdell::{EnvironmentManager, Layout};
use tempfile::TempDir;

fn heimdell(project: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("heimdell").unwrap();
    cmd.env("HEIMDELL_PROJECT_DIR", project.path())
        .env_remove("HEIMDELL_SESSION_KEY")
        .env_remove("RUST_LOG");
    cmd
}

fn credentials(tag: &str) -> Credentials {
    Credentials {
        base_url: "https://ota.example.com".into(),
        username: "deploy".into(),
        password: "hunter2".into(),
        tag: tag.into(),
        platforms: vec![Platform::Android, Platform::Ios],
        environment: None,
    }
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn test_env_unknown_fails() {
    let project = TempDir::new().unwrap();

    let output = heimdell(&project)
        .args(["env", "nonexistent"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();

    let stderr = String::from_utf8(output).unwrap();
    assert!(stderr.contains("no credentials found for environment \"nonexistent\""));
}

#[test]
fn test_env_list_marks_current() {
    let project = TempDir::new().unwrap();
    let manager = EnvironmentManager::new(Layout::new(project.path()));
    manager.save_login(Some("dev"), credentials("app"), None).unwrap();
    manager.save_login(Some("prod"), credentials("app"), None).unwrap();

    let stdout = stdout_of(heimdell(&project).args(["env", "--list"]));

    assert_eq!(stdout, "  dev\n* prod\n");
}

#[test]
fn test_env_list_empty_project() {
    let project = TempDir::new().unwrap();
    let stdout = stdout_of(heimdell(&project).args(["env", "--list"]));
    assert!(stdout.contains("No environments found."));
}

#[test]
fn test_env_requires_a_target() {
    let project = TempDir::new().unwrap();
    heimdell(&project).arg("env").assert().failure();
}

#[test]
fn test_env_switch_and_reset() {
    let project = TempDir::new().unwrap();
    let layout = Layout::new(project.path());
    let manager = EnvironmentManager::new(layout.clone());
    manager.save_login(None, credentials("default-app"), None).unwrap();
    manager.save_login(Some("dev"), credentials("dev-app"), None).unwrap();
    manager.switch_to(None).unwrap();

    let stdout = stdout_of(heimdell(&project).args(["env", "dev"]));
    assert!(stdout.contains("Switched to environment \"dev\""));
    assert_eq!(store::read_plain(&layout.credentials_path()).unwrap().tag, "dev-app");

    let stdout = stdout_of(heimdell(&project).args(["env", "--default"]));
    assert!(stdout.contains("default environment"));
    assert_eq!(
        store::read_plain(&layout.credentials_path()).unwrap().tag,
        "default-app"
    );
}

#[test]
fn test_whoami_with_plain_credentials() {
    let project = TempDir::new().unwrap();
    let manager = EnvironmentManager::new(Layout::new(project.path()));
    manager.save_login(Some("staging"), credentials("mobile"), None).unwrap();

    let stdout = stdout_of(heimdell(&project).arg("whoami"));

    assert!(stdout.contains("https://ota.example.com"));
    assert!(stdout.contains("mobile"));
    assert!(stdout.contains("android, ios"));
    assert!(stdout.contains("staging"));
    assert!(!stdout.contains("hunter2"));
}

#[test]
fn test_whoami_with_session_key_env() {
    let project = TempDir::new().unwrap();
    let manager = EnvironmentManager::new(Layout::new(project.path()));
    manager
        .save_login(None, credentials("sealed"), Some("passphrase"))
        .unwrap();

    let stdout = stdout_of(
        heimdell(&project)
            .env("HEIMDELL_SESSION_KEY", "passphrase")
            .arg("whoami"),
    );

    assert!(stdout.contains("sealed"));
    assert!(stdout.contains("default"));
}

#[test]
fn test_whoami_without_login_fails() {
    let project = TempDir::new().unwrap();

    let output = heimdell(&project)
        .arg("whoami")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();

    let stderr = String::from_utf8(output).unwrap();
    assert!(stderr.contains("not logged in, please run `heimdell login` first"));
    assert!(stderr.contains("credentials not found"));
}
