use std::cell::Cell;
use std::collections::VecDeque;
use std::fs;

use heimdell::loader::{load_with_cached_key, INVALID_KEY_MESSAGE};
use heimdell::store::{self, Credentials, Platform};
use heimdell::{
    autoload_credentials, load_credentials, CredentialLoader, HeimdellError, KeyCache, KeyPrompt,
    Layout, MemoryKeyCache, SessionKeyCache,
};
use tempfile::TempDir;
use zeroize::Zeroizing;

fn staging() -> Credentials {
    Credentials {
        base_url: "https://s".into(),
        username: "u".into(),
        password: "p".into(),
        tag: "t".into(),
        platforms: vec![Platform::Android],
        environment: None,
    }
}

/// Answers prompts from a fixed script and records what it was shown.
#[derive(Default)]
struct ScriptedPrompt {
    answers: VecDeque<&'static str>,
    errors_shown: Vec<Option<String>>,
}

impl ScriptedPrompt {
    fn new(answers: &[&'static str]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            errors_shown: Vec::new(),
        }
    }
}

impl KeyPrompt for ScriptedPrompt {
    fn prompt_key(
        &mut self,
        _message: &str,
        error: Option<&str>,
    ) -> heimdell::Result<Zeroizing<String>> {
        self.errors_shown.push(error.map(str::to_owned));
        self.answers
            .pop_front()
            .map(|k| Zeroizing::new(k.to_string()))
            .ok_or_else(|| HeimdellError::Prompt("script exhausted".into()))
    }
}

fn encrypted_project(passphrase: &str) -> (TempDir, Layout) {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    store::write_encrypted(&layout.credentials_path(), &staging(), passphrase).unwrap();
    (dir, layout)
}

#[test]
fn test_load_plain_and_encrypted() {
    let dir = TempDir::new().unwrap();
    let plain = dir.path().join("plain.json");
    let sealed = dir.path().join("sealed.json");
    store::write(&plain, &staging()).unwrap();
    store::write_encrypted(&sealed, &staging(), "passphrase").unwrap();

    assert_eq!(load_credentials(&plain, None).unwrap(), staging());
    assert_eq!(load_credentials(&sealed, Some("passphrase")).unwrap(), staging());
    assert!(matches!(
        load_credentials(&sealed, None),
        Err(HeimdellError::MissingKey(_))
    ));
}

#[test]
fn test_wrong_cached_key_is_cleared() {
    let (_dir, layout) = encrypted_project("right-key");
    let mut cache = MemoryKeyCache::with_key("wrong-key");

    assert!(matches!(
        load_with_cached_key(&layout.credentials_path(), &mut cache),
        Err(HeimdellError::InvalidKey)
    ));
    assert!(cache.get().is_none());

    // The next attempt has no key at all.
    assert!(matches!(
        load_with_cached_key(&layout.credentials_path(), &mut cache),
        Err(HeimdellError::MissingKey(_))
    ));
}

#[test]
fn test_wrong_cached_key_removes_session_file() {
    let (dir, layout) = encrypted_project("right-key");
    let mut cache = SessionKeyCache::with_file(dir.path().join("session"));
    cache.set("wrong-key").unwrap();

    assert!(load_with_cached_key(&layout.credentials_path(), &mut cache).is_err());
    assert!(cache.get().is_none());
    assert!(!cache.file().exists());
}

#[test]
fn test_autoload_never_fails() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    let mut cache = MemoryKeyCache::new();
    assert!(autoload_credentials(&layout, &mut cache).is_none());

    fs::create_dir_all(layout.store_dir()).unwrap();
    fs::write(layout.credentials_path(), "{ broken").unwrap();
    assert!(autoload_credentials(&layout, &mut cache).is_none());

    store::write_encrypted(&dir.path().join("other.json"), &staging(), "k").unwrap();
    fs::rename(dir.path().join("other.json"), layout.credentials_path()).unwrap();
    assert!(autoload_credentials(&layout, &mut cache).is_none());

    let mut cache = MemoryKeyCache::with_key("k");
    let session = autoload_credentials(&layout, &mut cache).unwrap();
    assert_eq!(session.credentials(), &staging());
    assert_eq!(session.source(), layout.credentials_path());
}

#[test]
fn test_resolve_without_file_is_unauthenticated() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&[]),
    );

    assert!(loader.resolve("whoami").unwrap().is_none());
    assert!(loader.prompt().errors_shown.is_empty());
}

#[test]
fn test_resolve_plain_file_never_prompts() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    store::write(&layout.credentials_path(), &staging()).unwrap();
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&[]),
    );

    let session = loader.resolve("whoami").unwrap().unwrap();
    assert_eq!(session.credentials(), &staging());
    assert!(loader.prompt().errors_shown.is_empty());
}

#[test]
fn test_resolve_uses_cached_key_without_prompting() {
    let (_dir, layout) = encrypted_project("right-key");
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::with_key("right-key"),
        ScriptedPrompt::new(&[]),
    );

    assert!(loader.resolve("whoami").unwrap().is_some());
    assert!(loader.prompt().errors_shown.is_empty());
}

#[test]
fn test_prompt_retries_until_valid_and_caches() {
    let (_dir, layout) = encrypted_project("right-key");
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::with_key("stale-key"),
        ScriptedPrompt::new(&["typo", "still-wrong", "right-key"]),
    );

    let session = loader.resolve("whoami").unwrap().unwrap();

    assert_eq!(session.credentials(), &staging());
    assert_eq!(loader.cache().get().unwrap().as_str(), "right-key");
    assert_eq!(
        loader.prompt().errors_shown,
        vec![
            None,
            Some(INVALID_KEY_MESSAGE.to_string()),
            Some(INVALID_KEY_MESSAGE.to_string()),
        ]
    );
}

#[test]
fn test_aborted_prompt_aborts_resolution() {
    let (_dir, layout) = encrypted_project("right-key");
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&["wrong"]),
    );

    assert!(matches!(
        loader.resolve("whoami"),
        Err(HeimdellError::Prompt(_))
    ));
    assert!(loader.cache().get().is_none());
}

#[test]
fn test_non_key_errors_propagate_without_prompting() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    fs::create_dir_all(layout.store_dir()).unwrap();
    fs::write(layout.credentials_path(), r#"{"baseUrl":"https://s"}"#).unwrap();
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&["anything"]),
    );

    assert!(matches!(
        loader.resolve("whoami"),
        Err(HeimdellError::MalformedDocument { .. })
    ));
    assert!(loader.prompt().errors_shown.is_empty());
}

#[test]
fn test_protected_command_runs_body_once() {
    let (_dir, layout) = encrypted_project("right-key");
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&["wrong", "right-key"]),
    );
    let runs = Cell::new(0);

    let tag = loader
        .execute_protected_command("whoami", |session| -> heimdell::Result<String> {
            runs.set(runs.get() + 1);
            Ok(session.credentials().tag.clone())
        })
        .unwrap();

    assert_eq!(tag, "t");
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_protected_command_requires_login() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&[]),
    );
    let runs = Cell::new(0);

    let result = loader.execute_protected_command("whoami", |_| -> heimdell::Result<()> {
        runs.set(runs.get() + 1);
        Ok(())
    });

    assert!(matches!(result, Err(HeimdellError::NotFound(_))));
    assert_eq!(runs.get(), 0);
}

#[test]
fn test_protected_command_body_errors_pass_through() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    store::write(&layout.credentials_path(), &staging()).unwrap();
    let mut loader = CredentialLoader::new(
        layout.credentials_path(),
        MemoryKeyCache::new(),
        ScriptedPrompt::new(&[]),
    );

    let result: Result<(), HeimdellError> = loader.execute_protected_command("deploy", |_| {
        Err(HeimdellError::EnvironmentNotFound("prod".into()))
    });

    assert!(matches!(result, Err(HeimdellError::EnvironmentNotFound(_))));
}
