//! HTTP server command — `anvil serve`.

use anyhow::Result;
use std::path::Path;

use anvil::config::AnvilConfig;
use anvil::server::{ServerConfig, start_server};

pub async fn cmd_serve(project_dir: &Path, port: Option<u16>, dev: bool) -> Result<()> {
    let mut config = AnvilConfig::load(project_dir)?;
    for warning in config.validate()? {
        eprintln!("Warning: {}", warning);
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let db_path = project_dir.join(".anvil").join("continuations.db");
    start_server(ServerConfig {
        config,
        db_path,
        dev_mode: dev,
    })
    .await
}
