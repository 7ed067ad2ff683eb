use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tollgate::config::{has_flag, ServerConfig, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    // Logs go to stderr so stdio mode keeps stdout for protocol traffic
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = ServerConfig::from_env_and_args(&args)?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "tollgate starting: RUST_LOG='{}', bind={}:{}, stdio={}, backend='{}', credentials='{}'",
        rust_log, config.host, config.port, config.stdio, config.backend_url, config.credentials_path.display()
    );

    tollgate::server::run(config).await
}
