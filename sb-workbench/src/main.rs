use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use sb_workbench::{WorkbenchConfig, WorkbenchState, build_workbench_app};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if wants_version_flag() {
        println!("{}", binary_version_text());
        return Ok(());
    }

    init_logging();
    info!("{}", binary_version_text());

    let addr = parse_addr("WORKBENCH_ADDR", "0.0.0.0:8600")?;
    let data_dir = PathBuf::from(
        env::var("WORKBENCH_DATA_DIR").unwrap_or_else(|_| ".sketchbench".to_string()),
    );

    let mut config = WorkbenchConfig::default();
    config.sketch_dir = data_dir.join("sketches");
    config.template_dir = data_dir.join("templates");
    config.toolchain.build_root = data_dir.join("build");
    config.toolchain.program = PathBuf::from(
        env::var("WORKBENCH_ARDUINO_CLI").unwrap_or_else(|_| "arduino-cli".to_string()),
    );
    config.toolchain.invoke_timeout =
        Duration::from_millis(parse_u64("WORKBENCH_TOOLCHAIN_TIMEOUT_MS", 120_000)?);
    if let Ok(value) = env::var("WORKBENCH_ASSISTANT_URL") {
        config.assistant.base_url = value;
    }
    if let Ok(value) = env::var("WORKBENCH_ASSISTANT_MODEL") {
        config.assistant.model = value;
    }
    config.assistant.request_timeout =
        Duration::from_millis(parse_u64("WORKBENCH_ASSISTANT_TIMEOUT_MS", 60_000)?);

    let state = WorkbenchState::new(config)?;
    match state.toolchain().probe_version().await {
        Some(version) => info!("toolchain available: {version}"),
        None => warn!("arduino-cli not found; compile and upload will fail until it is installed"),
    }

    let app = build_workbench_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("workbench listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(value.parse()?)
}

fn parse_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn wants_version_flag() -> bool {
    env::args()
        .skip(1)
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("SB_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("SB_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let git_dirty = option_env!("SB_BUILD_GIT_DIRTY").unwrap_or("false");
    let dirty = matches!(git_dirty, "true" | "1" | "yes" | "dirty");

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}
