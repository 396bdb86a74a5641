use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sb_workbench::{WorkbenchConfig, WorkbenchState, build_workbench_app};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

static TEST_DIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unique_data_dir(test_name: &str) -> PathBuf {
    let seq = TEST_DIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("sb-workbench-{test_name}-{now}-{seq}"))
}

fn test_config(data_dir: &Path) -> WorkbenchConfig {
    let mut config = WorkbenchConfig::default();
    config.sketch_dir = data_dir.join("sketches");
    config.template_dir = data_dir.join("templates");
    config.toolchain.build_root = data_dir.join("build");
    // Poisoned program path: any accidental spawn fails loudly as 502.
    config.toolchain.program = PathBuf::from("/definitely/not/a/real/arduino-cli");
    config.toolchain.invoke_timeout = Duration::from_secs(5);
    config.assistant.probe_timeout = Duration::from_millis(500);
    config.assistant.request_timeout = Duration::from_secs(2);
    config
}

async fn spawn_workbench(config: WorkbenchConfig) -> (SocketAddr, JoinHandle<()>, WorkbenchState) {
    let state = WorkbenchState::new(config).expect("state should initialize");
    let app = build_workbench_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("workbench should run");
    });
    (addr, handle, state)
}

async fn save_sketch(client: &reqwest::Client, addr: SocketAddr, name: &str, content: &str) {
    let response = client
        .put(format!("http://{addr}/v1/sketches/{name}"))
        .json(&json!({ "content": content }))
        .send()
        .await
        .expect("save should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn sketch_round_trip_then_delete_yields_not_found() {
    let data_dir = unique_data_dir("round-trip");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let content = "void setup(){} void loop(){}";
    save_sketch(&client, addr, "Blink.ino", content).await;

    let read = client
        .get(format!("http://{addr}/v1/sketches/Blink.ino"))
        .send()
        .await
        .expect("read should complete");
    assert_eq!(read.status(), reqwest::StatusCode::OK);
    let body = read.json::<Value>().await.expect("read body should decode");
    assert_eq!(body["name"], "Blink.ino");
    assert_eq!(body["content"], content);

    let delete = client
        .delete(format!("http://{addr}/v1/sketches/Blink.ino"))
        .send()
        .await
        .expect("delete should complete");
    assert_eq!(delete.status(), reqwest::StatusCode::OK);

    let read_again = client
        .get(format!("http://{addr}/v1/sketches/Blink.ino"))
        .send()
        .await
        .expect("second read should complete");
    assert_eq!(read_again.status(), reqwest::StatusCode::NOT_FOUND);

    // Deleting a nonexistent sketch is NotFound, never silent success.
    let delete_again = client
        .delete(format!("http://{addr}/v1/sketches/Blink.ino"))
        .send()
        .await
        .expect("second delete should complete");
    assert_eq!(delete_again.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}

#[tokio::test]
async fn saving_without_extension_appends_it_and_listing_is_sorted() {
    let data_dir = unique_data_dir("listing");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    save_sketch(&client, addr, "Zeta", "void setup(){} void loop(){}").await;
    save_sketch(&client, addr, "Alpha", "void setup(){} void loop(){}").await;

    let listing = client
        .get(format!("http://{addr}/v1/sketches"))
        .send()
        .await
        .expect("listing should complete")
        .json::<Value>()
        .await
        .expect("listing should decode");
    let names = listing["sketches"]
        .as_array()
        .expect("sketches should be an array")
        .iter()
        .map(|entry| entry["name"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Alpha.ino", "Zeta.ino"]);

    handle.abort();
}

#[tokio::test]
async fn traversal_names_are_rejected() {
    let data_dir = unique_data_dir("bad-names");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    for bad in ["..%2Fevil", ".hidden", "a..b"] {
        let response = client
            .put(format!("http://{addr}/v1/sketches/{bad}"))
            .json(&json!({ "content": "void setup(){} void loop(){}" }))
            .send()
            .await
            .expect("save should complete");
        assert_eq!(
            response.status(),
            reqwest::StatusCode::BAD_REQUEST,
            "{bad} should be rejected"
        );
    }

    handle.abort();
}

#[tokio::test]
async fn board_catalog_is_fixed_across_calls() {
    let data_dir = unique_data_dir("boards");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let first = client
        .get(format!("http://{addr}/v1/boards"))
        .send()
        .await
        .expect("first listing should complete")
        .json::<Value>()
        .await
        .expect("first listing should decode");
    let second = client
        .get(format!("http://{addr}/v1/boards"))
        .send()
        .await
        .expect("second listing should complete")
        .json::<Value>()
        .await
        .expect("second listing should decode");
    assert_eq!(first, second);

    let boards = first["boards"].as_array().expect("boards should be an array");
    assert_eq!(boards.len(), 6);
    assert!(boards.iter().any(|board| {
        board["fqbn"] == "arduino:avr:uno" && board["display_name"] == "Arduino Uno"
    }));

    handle.abort();
}

#[tokio::test]
async fn port_listing_degrades_instead_of_failing() {
    let data_dir = unique_data_dir("ports");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/v1/ports"))
        .send()
        .await
        .expect("port listing should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.json::<Value>().await.expect("body should decode");
    assert!(body["ports"].is_array());

    handle.abort();
}

#[tokio::test]
async fn compile_unknown_board_fails_before_any_spawn() {
    let data_dir = unique_data_dir("unknown-board");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    save_sketch(&client, addr, "Blink.ino", "void setup(){} void loop(){}").await;

    // The poisoned toolchain path would turn any spawn attempt into a 502;
    // a 400 proves the catalog check ran first.
    let response = client
        .post(format!("http://{addr}/v1/compile"))
        .json(&json!({ "sketch": "Blink.ino", "board": "not:a:board" }))
        .send()
        .await
        .expect("compile should complete");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = response.json::<Value>().await.expect("body should decode");
    assert!(
        body["error"]
            .as_str()
            .unwrap_or_default()
            .contains("unsupported board")
    );

    handle.abort();
}

#[tokio::test]
async fn compile_missing_sketch_is_not_found() {
    let data_dir = unique_data_dir("missing-sketch");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/v1/compile"))
        .json(&json!({ "sketch": "Ghost.ino", "board": "arduino:avr:uno" }))
        .send()
        .await
        .expect("compile should complete");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn compile_with_stub_toolchain_reports_captured_output() {
    let data_dir = unique_data_dir("stub-compile");
    let mut config = test_config(&data_dir);
    config.toolchain.program = PathBuf::from("echo");
    let (addr, handle, _state) = spawn_workbench(config).await;
    let client = reqwest::Client::new();

    save_sketch(&client, addr, "Blink.ino", "void setup(){} void loop(){}").await;

    let response = client
        .post(format!("http://{addr}/v1/compile"))
        .json(&json!({ "sketch": "Blink.ino", "board": "arduino:avr:uno" }))
        .send()
        .await
        .expect("compile should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.json::<Value>().await.expect("body should decode");
    assert_eq!(body["success"], true);
    assert_eq!(body["exit_code"], 0);
    assert!(
        body["output"]
            .as_str()
            .unwrap_or_default()
            .contains("--fqbn")
    );

    handle.abort();
}

#[tokio::test]
async fn upload_conflicts_with_active_serial_session() {
    let data_dir = unique_data_dir("upload-conflict");
    let (addr, handle, state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    save_sketch(&client, addr, "Blink.ino", "void setup(){} void loop(){}").await;

    let claim = state
        .relay_registry()
        .claim("/dev/ttyUSB9")
        .expect("claim should succeed");

    let response = client
        .post(format!("http://{addr}/v1/upload"))
        .json(&json!({
            "sketch": "Blink.ino",
            "board": "arduino:avr:uno",
            "port": "/dev/ttyUSB9"
        }))
        .send()
        .await
        .expect("upload should complete");
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    // Releasing the session clears the conflict; the poisoned toolchain
    // path then fails at launch, not at the registry.
    drop(claim);
    let retry = client
        .post(format!("http://{addr}/v1/upload"))
        .json(&json!({
            "sketch": "Blink.ino",
            "board": "arduino:avr:uno",
            "port": "/dev/ttyUSB9"
        }))
        .send()
        .await
        .expect("retry should complete");
    assert_eq!(retry.status(), reqwest::StatusCode::BAD_GATEWAY);

    handle.abort();
}

#[tokio::test]
async fn templates_are_seeded_and_read_only_accessible() {
    let data_dir = unique_data_dir("templates");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let listing = client
        .get(format!("http://{addr}/v1/templates"))
        .send()
        .await
        .expect("listing should complete")
        .json::<Value>()
        .await
        .expect("listing should decode");
    let names = listing["templates"]
        .as_array()
        .expect("templates should be an array")
        .iter()
        .map(|name| name.as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert!(names.contains(&"blink.ino".to_string()));
    assert!(names.contains(&"serial_hello.ino".to_string()));

    let template = client
        .get(format!("http://{addr}/v1/templates/blink.ino"))
        .send()
        .await
        .expect("template read should complete")
        .json::<Value>()
        .await
        .expect("template should decode");
    assert!(
        template["content"]
            .as_str()
            .unwrap_or_default()
            .contains("digitalWrite")
    );

    handle.abort();
}

#[tokio::test]
async fn assistant_unreachable_maps_to_bad_gateway() {
    // Bind then drop to get a port with nothing listening on it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let dead_addr = listener.local_addr().expect("listener should have addr");
    drop(listener);

    let data_dir = unique_data_dir("assistant-dead");
    let mut config = test_config(&data_dir);
    config.assistant.base_url = format!("http://{dead_addr}");
    let (addr, handle, _state) = spawn_workbench(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/v1/assistant/generate"))
        .json(&json!({ "prompt": "blink an LED" }))
        .send()
        .await
        .expect("generate should complete");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);

    handle.abort();
}

#[tokio::test]
async fn assistant_round_trips_through_stub_server() {
    let stub = axum::Router::new()
        .route(
            "/api/tags",
            axum::routing::get(|| async {
                axum::Json(json!({ "models": [{ "name": "codellama:latest" }] }))
            }),
        )
        .route(
            "/api/generate",
            axum::routing::post(|| async {
                axum::Json(json!({ "response": "void setup() {}", "done": true }))
            }),
        );
    let stub_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub listener should bind");
    let stub_addr = stub_listener.local_addr().expect("stub should have addr");
    tokio::spawn(async move {
        axum::serve(stub_listener, stub).await.expect("stub should run");
    });

    let data_dir = unique_data_dir("assistant-stub");
    let mut config = test_config(&data_dir);
    config.assistant.base_url = format!("http://{stub_addr}");
    let (addr, handle, _state) = spawn_workbench(config).await;
    let client = reqwest::Client::new();

    let generated = client
        .post(format!("http://{addr}/v1/assistant/generate"))
        .json(&json!({ "prompt": "blink an LED" }))
        .send()
        .await
        .expect("generate should complete")
        .json::<Value>()
        .await
        .expect("generate should decode");
    assert_eq!(generated["code"], "void setup() {}");
    assert_eq!(generated["model"], "codellama");

    let models = client
        .get(format!("http://{addr}/v1/assistant/models"))
        .send()
        .await
        .expect("models should complete")
        .json::<Value>()
        .await
        .expect("models should decode");
    assert_eq!(models["models"][0]["name"], "codellama:latest");

    handle.abort();
}

#[tokio::test]
async fn health_and_metrics_are_exposed() {
    let data_dir = unique_data_dir("observability");
    let (addr, handle, _state) = spawn_workbench(test_config(&data_dir)).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .expect("healthz should complete")
        .json::<Value>()
        .await
        .expect("healthz should decode");
    assert_eq!(health["status"], "ok");

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics should complete")
        .text()
        .await
        .expect("metrics should be text");
    assert!(metrics.contains("sb_workbench_uptime_seconds"));
    assert!(metrics.contains("sb_workbench_compile_requests_total"));

    handle.abort();
}
