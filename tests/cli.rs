use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn conductor_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("conductor");
    path
}

fn write_config(root: &Path, name: &str, provider: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join(name);
    fs::write(
        &path,
        format!(
            r#"[db]
path = "{}"

[embedding]
provider = "{}"
model = "text-embedding-3-small"
dims = 128
max_retries = 0

[retrieval]
top_k = 3
"#,
            root.join("data/conductor.sqlite").display(),
            provider
        ),
    )
    .unwrap();
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let config = write_config(&root, "conductor.toml", "hash");

    let chatgpt = root.join("exports/chatgpt");
    fs::create_dir_all(&chatgpt).unwrap();
    let export = json!([
        {
            "id": "tls",
            "title": "Ingress TLS",
            "create_time": 1717000000.0,
            "mapping": {
                "a": { "message": {
                    "author": { "role": "user" },
                    "create_time": 1717000001.0,
                    "content": { "parts": ["How do I terminate TLS at the kubernetes ingress?"] }
                }},
                "b": { "message": {
                    "author": { "role": "assistant" },
                    "create_time": 1717000002.0,
                    "content": { "parts": ["Create a TLS secret and reference it from the ingress spec."] }
                }}
            }
        },
        {
            "id": "bread",
            "title": "Sourdough",
            "create_time": 1717100000.0,
            "mapping": {
                "a": { "message": {
                    "author": { "role": "user" },
                    "create_time": 1717100001.0,
                    "content": { "parts": ["What hydration for a sourdough loaf?"] }
                }}
            }
        }
    ]);
    fs::write(chatgpt.join("conversations.json"), export.to_string()).unwrap();

    let grok = root.join("exports/grok");
    fs::create_dir_all(&grok).unwrap();
    fs::write(
        grok.join("chat.json"),
        json!({
            "conversation_id": "garden",
            "title": "Tomatoes",
            "created_at": "2024-05-01T10:00:00Z",
            "messages": [
                { "sender": "human", "message": "When should I plant tomatoes outdoors?" },
                { "sender": "assistant", "message": "After the last frost." }
            ]
        })
        .to_string(),
    )
    .unwrap();

    (tmp, config)
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(conductor_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("OPENAI_API_KEY")
        .output()
        .expect("failed to run conductor")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn ingest_all(root: &Path, config: &Path) -> Output {
    run(
        config,
        &[
            "ingest",
            "--chatgpt",
            root.join("exports/chatgpt").to_str().unwrap(),
            "--grok",
            root.join("exports/grok").to_str().unwrap(),
            "--progress",
            "off",
        ],
    )
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let output = run(&config, &["init"]);
    assert!(output.status.success(), "init failed: {:?}", output);
    assert!(tmp.path().join("data/conductor.sqlite").exists());

    // Idempotent.
    let again = run(&config, &["init"]);
    assert!(again.status.success());
}

#[test]
fn test_ingest_and_ask() {
    let (tmp, config) = setup_test_env();
    let output = ingest_all(tmp.path(), &config);
    assert!(output.status.success(), "ingest failed: {:?}", output);
    let out = stdout(&output);
    assert!(out.contains("ingest chatgpt"));
    assert!(out.contains("ingest grok"));
    assert!(out.trim_end().ends_with("ok"));

    let output = run(&config, &["ask", "kubernetes ingress TLS", "--json"]);
    assert!(output.status.success(), "ask failed: {:?}", output);
    let v: Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(v["status"], "found");
    assert_eq!(v["degraded"], false);
    assert_eq!(v["retrieved_context"][0]["conversation_id"], "tls");
    assert!(v["context"]
        .as_str()
        .unwrap()
        .starts_with("[Source: CHATGPT - Ingress TLS]"));
}

#[test]
fn test_ask_platform_filter() {
    let (tmp, config) = setup_test_env();
    assert!(ingest_all(tmp.path(), &config).status.success());

    let output = run(
        &config,
        &["ask", "plant tomatoes", "--platform", "chatgpt", "--json"],
    );
    assert!(output.status.success());
    let v: Value = serde_json::from_str(&stdout(&output)).unwrap();
    let items = v["retrieved_context"].as_array().unwrap();
    assert!(!items.is_empty());
    assert!(items.iter().all(|i| i["platform"] == "chatgpt"));
}

#[test]
fn test_reingest_is_idempotent() {
    let (tmp, config) = setup_test_env();
    assert!(ingest_all(tmp.path(), &config).status.success());
    let before: Value =
        serde_json::from_str(&stdout(&run(&config, &["stats", "--json"]))).unwrap();

    let second = ingest_all(tmp.path(), &config);
    assert!(second.status.success());
    assert!(stdout(&second).contains("new entries: 0"));

    let after: Value =
        serde_json::from_str(&stdout(&run(&config, &["stats", "--json"]))).unwrap();
    assert_eq!(before["collections"], after["collections"]);
}

#[test]
fn test_broken_export_fails_only_its_platform() {
    let (tmp, config) = setup_test_env();
    let output = run(
        &config,
        &[
            "ingest",
            "--chatgpt",
            tmp.path().join("exports/chatgpt").to_str().unwrap(),
            "--gemini",
            tmp.path().join("exports/missing").to_str().unwrap(),
            "--progress",
            "off",
        ],
    );
    assert!(!output.status.success());
    let out = stdout(&output);
    assert!(out.contains("ingest gemini"));
    assert!(out.contains("error:"));

    let ask = run(&config, &["ask", "sourdough hydration", "--json"]);
    let v: Value = serde_json::from_str(&stdout(&ask)).unwrap();
    assert_eq!(v["retrieved_context"][0]["conversation_id"], "bread");
}

#[test]
fn test_ask_degrades_without_provider() {
    let (tmp, config) = setup_test_env();
    assert!(ingest_all(tmp.path(), &config).status.success());

    // Same database, but an OpenAI provider with no API key.
    let remote = write_config(tmp.path(), "remote.toml", "openai");
    let output = run(&remote, &["ask", "sourdough hydration"]);
    assert!(output.status.success(), "ask failed: {:?}", output);
    assert!(String::from_utf8_lossy(&output.stderr).contains("retrieval degraded"));
    assert!(stdout(&output).contains("Sourdough"));

    let output = run(&remote, &["ask", "sourdough hydration", "--json"]);
    let v: Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(v["status"], "degraded");
    assert_eq!(v["degraded"], true);
}

#[test]
fn test_reset_empties_index() {
    let (tmp, config) = setup_test_env();
    assert!(ingest_all(tmp.path(), &config).status.success());

    let output = run(&config, &["reset", "--platform", "grok"]);
    assert!(output.status.success());
    let stats: Value =
        serde_json::from_str(&stdout(&run(&config, &["stats", "--json"]))).unwrap();
    let platforms = stats["platforms"].as_array().unwrap();
    assert!(platforms.iter().all(|p| p["platform"] != "grok"));

    let output = run(&config, &["reset"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("index cleared"));

    let output = run(&config, &["ask", "kubernetes ingress"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No relevant history found."));

    let v: Value = serde_json::from_str(&stdout(&run(
        &config,
        &["ask", "kubernetes ingress", "--json"],
    )))
    .unwrap();
    assert_eq!(v["status"], "no_context");
    assert_eq!(v["degraded"], false);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!output.status.success());
}

#[test]
fn test_gemini_html_and_code_language_search() {
    let (tmp, config) = setup_test_env();
    let gemini = tmp.path().join("exports/gemini");
    fs::create_dir_all(&gemini).unwrap();
    fs::write(
        gemini.join("saved.html"),
        r#"<html><head><title>Gemini</title></head><body>
        <h1>Rust error handling</h1>
        <div class="user-message">Should a library return anyhow errors?</div>
        <div class="model-response">Prefer a thiserror enum in libraries.</div>
        </body></html>"#,
    )
    .unwrap();
    fs::write(
        gemini.join("files.json"),
        json!({
            "id": "files",
            "title": "Reading files",
            "messages": [
                { "role": "user", "content": "read a file line by line" },
                { "role": "model", "content": "```python\nfor line in open('a.txt'):\n    print(line)\n```\n```rust\nlet text = std::fs::read_to_string(\"a.txt\")?;\n```" }
            ]
        })
        .to_string(),
    )
    .unwrap();

    let output = run(
        &config,
        &["ingest", "--gemini", gemini.to_str().unwrap(), "--progress", "off"],
    );
    assert!(output.status.success(), "ingest failed: {:?}", output);
    assert!(stdout(&output).contains("conversations: 2"));

    let v: Value = serde_json::from_str(&stdout(&run(
        &config,
        &["ask", "thiserror library errors", "--json"],
    )))
    .unwrap();
    assert_eq!(v["retrieved_context"][0]["conversation_id"], "saved");
    assert_eq!(v["retrieved_context"][0]["title"], "Rust error handling");

    let v: Value = serde_json::from_str(&stdout(&run(
        &config,
        &["ask", "read a.txt", "--language", "Python", "--json"],
    )))
    .unwrap();
    let items = v["retrieved_context"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["collection"], "code");
    assert_eq!(items[0]["language"], "python");
}
