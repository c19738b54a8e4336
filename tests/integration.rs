use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn askrepo_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("askrepo");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Two local directories standing in for fetched resources.
    let docs_dir = root.join("docs");
    fs::create_dir_all(docs_dir.join("guide")).unwrap();
    fs::write(
        docs_dir.join("guide/intro.md"),
        "# Introduction\n\nThe project builds a typed event stream codec.",
    )
    .unwrap();
    fs::write(docs_dir.join("README.md"), "# Docs\n\nTop-level readme.").unwrap();

    let notes_dir = root.join("notes");
    fs::create_dir_all(&notes_dir).unwrap();
    fs::write(notes_dir.join("todo.txt"), "ship it").unwrap();

    let config_content = format!(
        r#"[data]
dir = "{root}/data"

[cache]
ttl_secs = 900

[server]
bind = "127.0.0.1:7341"

[resources.docs]
ref = "{root}/docs"

[resources.notes]
ref = "{root}/notes"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("askrepo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_askrepo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = askrepo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run askrepo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Extract the collection key from `fetch` output (`collection <key>`).
fn collection_key(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("collection "))
        .unwrap_or_else(|| panic!("no collection key in output: {}", stdout))
        .trim()
        .to_string()
}

#[test]
fn test_resources_lists_configured_entries() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_askrepo(&config_path, &["resources"]);
    assert!(success);
    assert!(stdout.contains("docs"));
    assert!(stdout.contains("notes"));
    assert!(stdout.contains("local"));
}

#[test]
fn test_fetch_builds_collection_with_complete_manifest() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_askrepo(&config_path, &["fetch", "docs"]);
    assert!(success, "fetch failed: stdout={}, stderr={}", stdout, stderr);

    let key = collection_key(&stdout);
    assert_eq!(key.len(), 16, "key should be a 16-char hash: {}", key);

    let manifest_path = tmp
        .path()
        .join("data/collections")
        .join(&key)
        .join("manifest.json");
    assert!(manifest_path.exists(), "manifest not written");

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["complete"], true);
    assert_eq!(manifest["key"], key.as_str());
    assert_eq!(manifest["resources"][0]["name"], "docs");
}

#[test]
fn test_fetch_reuses_collection_across_runs() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout1, _, success1) = run_askrepo(&config_path, &["fetch", "docs"]);
    assert!(success1);
    let (stdout2, _, success2) = run_askrepo(&config_path, &["fetch", "docs"]);
    assert!(success2);

    assert_eq!(
        collection_key(&stdout1),
        collection_key(&stdout2),
        "same resource set must map to the same collection"
    );
}

#[test]
fn test_fetch_key_ignores_request_order() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout1, _, _) = run_askrepo(&config_path, &["fetch", "docs", "notes"]);
    let (stdout2, _, _) = run_askrepo(&config_path, &["fetch", "notes", "docs"]);
    assert_eq!(collection_key(&stdout1), collection_key(&stdout2));
}

#[test]
fn test_distinct_resource_sets_get_distinct_keys() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout1, _, _) = run_askrepo(&config_path, &["fetch", "docs"]);
    let (stdout2, _, _) = run_askrepo(&config_path, &["fetch", "docs", "notes"]);
    assert_ne!(collection_key(&stdout1), collection_key(&stdout2));
}

#[test]
fn test_fetch_raw_local_reference() {
    let (tmp, config_path) = setup_test_env();

    let raw = tmp.path().join("docs");
    let (stdout, stderr, success) =
        run_askrepo(&config_path, &["fetch", raw.to_str().unwrap()]);
    assert!(success, "fetch failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("resources docs"));
}

#[test]
fn test_cache_clear_removes_collections() {
    let (tmp, config_path) = setup_test_env();

    run_askrepo(&config_path, &["fetch", "docs"]);
    assert!(tmp.path().join("data/collections").exists());

    let (stdout, _, success) = run_askrepo(&config_path, &["cache", "clear"]);
    assert!(success);
    assert!(stdout.contains("cleared"));
    assert!(!tmp.path().join("data/collections").exists());
}

#[test]
fn test_fetch_unknown_resource_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_askrepo(&config_path, &["fetch", "nosuchname"]);
    assert!(!success, "Unknown resource should fail");
    assert!(
        stderr.contains("nosuchname"),
        "Should name the bad reference, got: {}",
        stderr
    );
}

#[test]
fn test_fetch_http_reference_rejected() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) =
        run_askrepo(&config_path, &["fetch", "http://github.com/a/b"]);
    assert!(!success, "Plain-http reference should be rejected");
    assert!(
        stderr.contains("http://github.com/a/b"),
        "Should echo the bad reference, got: {}",
        stderr
    );
}

#[test]
fn test_ask_fails_when_model_disabled() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) =
        run_askrepo(&config_path, &["ask", "what is this?", "-r", "docs"]);
    assert!(!success, "ask should fail when the model provider is disabled");
    assert!(
        stderr.contains("disabled"),
        "Should mention disabled, got: {}",
        stderr
    );
}

#[test]
fn test_bad_config_resource_fails_at_startup() {
    let (tmp, config_path) = setup_test_env();

    let broken = format!(
        "[data]\ndir = \"{}/data\"\n\n[resources.bad]\nref = \"ftp://example.com/x\"\n",
        tmp.path().display()
    );
    fs::write(&config_path, broken).unwrap();

    let (_, stderr, success) = run_askrepo(&config_path, &["resources"]);
    assert!(!success, "Config with a bad reference should fail to load");
    assert!(
        stderr.contains("bad"),
        "Should name the broken resource entry, got: {}",
        stderr
    );
}
