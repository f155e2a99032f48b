use reqwest::blocking::multipart::{Form, Part};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tempfile::TempDir;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup_server_env(port: u16) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[tasks]
root = "{}/task"

[chunking]
max_chars = 120
overlap_chars = 20

[embedding]
provider = "hash"
dims = 128

[rerank]
provider = "lexical"

[server]
bind = "127.0.0.1:{}"
"#,
        root.display(),
        port
    );

    let config_path = config_dir.join("pfind.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

/// Running server process, killed on drop.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

fn start_server(config_path: &Path, port: u16) -> Server {
    let child = Command::new(env!("CARGO_BIN_EXE_pfind"))
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("serve")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to start server: {}", e));
    let server = Server(child);

    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if let Ok(resp) = reqwest::blocking::get(&url) {
            if resp.status().is_success() {
                return server;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

fn upload_form(task_name: &str) -> Form {
    Form::new()
        .text("task_name", task_name.to_string())
        .part(
            "fresh_file",
            Part::bytes(b"Reading about gradient descent today.".to_vec())
                .file_name("reading.txt"),
        )
        .part(
            "bulk_files",
            Part::bytes(
                b"Gradient descent minimises a loss by stepping against the gradient.\x0cLearning rate schedules decay the step size."
                    .to_vec(),
            )
            .file_name("optim.txt"),
        )
        .part(
            "bulk_files",
            Part::bytes(b"Sourdough needs a lively starter and a long cold proof.".to_vec())
                .file_name("bread.md"),
        )
}

#[test]
fn test_server_health() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_server_env(port);
    let _server = start_server(&config_path, port);

    let resp = reqwest::blocking::get(format!("http://127.0.0.1:{}/health", port)).unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["embedding_model"], "hash-128");
    assert_eq!(body["embeddings_available"], true);
}

#[test]
fn test_upload_then_recommend() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_server_env(port);
    let _server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let resp = client
        .post(format!("http://127.0.0.1:{}/upload_task", port))
        .multipart(upload_form("lecture 1"))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["task_name"], "lecture 1");
    assert!(body["chunks_indexed"].as_u64().unwrap() >= 3);
    assert!(body["documents_failed"].as_array().unwrap().is_empty());

    let resp = client
        .post(format!("http://127.0.0.1:{}/get_recommendations", port))
        .json(&serde_json::json!({
            "task_name": "lecture 1",
            "query_text": [{"text": "  gradient descent step  "}],
            "top_n": 2
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    let recs = body["recommendations"].as_array().unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0]["document_name"], "optim.txt");
    assert_eq!(recs[0]["page_number"], 1);
    assert!(recs[0]["text"].is_string());
    assert!(recs[0]["score"].as_f64().unwrap() >= recs[1]["score"].as_f64().unwrap());

    let resp = client
        .get(format!("http://127.0.0.1:{}/tasks", port))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let tasks: serde_json::Value = resp.json().unwrap();
    let task = &tasks.as_array().unwrap()[0];
    assert_eq!(task["task_name"], "lecture 1");
    assert_eq!(task["status"], "ready");
    assert_eq!(task["fresh_files"], serde_json::json!(["reading.txt"]));
    assert_eq!(task["bulk_files"].as_array().unwrap().len(), 2);
}

#[test]
fn test_download_document() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_server_env(port);
    let _server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    client
        .post(format!("http://127.0.0.1:{}/upload_task", port))
        .multipart(upload_form("docs"))
        .send()
        .unwrap();

    let resp = client
        .get(format!("http://127.0.0.1:{}/pdfs/docs/reading.txt", port))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(resp.text().unwrap(), "Reading about gradient descent today.");

    let resp = client
        .get(format!("http://127.0.0.1:{}/pdfs/docs/missing.pdf", port))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[test]
fn test_duplicate_upload_conflicts() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_server_env(port);
    let _server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();
    let url = format!("http://127.0.0.1:{}/upload_task", port);

    let first = client.post(&url).multipart(upload_form("dup")).send().unwrap();
    assert_eq!(first.status(), 200);

    let second = client.post(&url).multipart(upload_form("dup")).send().unwrap();
    assert_eq!(second.status(), 409);
    let body: serde_json::Value = second.json().unwrap();
    assert_eq!(body["error"]["code"], "conflict");
}

#[test]
fn test_recommendations_errors() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_server_env(port);
    let _server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();
    let url = format!("http://127.0.0.1:{}/get_recommendations", port);

    let resp = client
        .post(&url)
        .json(&serde_json::json!({"task_name": "nope", "query_text": "anything"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    client
        .post(format!("http://127.0.0.1:{}/upload_task", port))
        .multipart(upload_form("errs"))
        .send()
        .unwrap();

    let resp = client
        .post(&url)
        .json(&serde_json::json!({"task_name": "errs", "query_text": {"data": "   "}}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(&url)
        .json(&serde_json::json!({"task_name": "errs", "query_text": "bread", "top_n": 0}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);
}
