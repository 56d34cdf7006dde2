use sentinel_relay::config::Config;
use sentinel_relay::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("sentinel-relay starting");

    let config = Config::from_env()?;
    let port = config.port;

    let client = reqwest::Client::builder()
        .build()
        .expect("reqwest client config is static and always valid");

    let app = server::router(AppState { client, config });

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr, "sentinel-relay listening");
    axum::serve(listener, app).await?;

    tracing::info!("sentinel-relay shutting down");
    Ok(())
}
