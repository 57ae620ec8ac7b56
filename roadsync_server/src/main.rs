use clap::Parser;
use roadsync_core::config::SyncConfig;
use roadsync_core::service::IntegrationService;
use roadsync_core::store::SqliteSyncStore;
use roadsync_server::cli::{Cli, Commands};
use roadsync_server::server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    roadsync_server::telemetry::init_tracing();
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        db_path: std::env::var("ROADSYNC_DB_PATH")
            .unwrap_or_else(|_| ".roadsync/sync.db".to_string())
            .into(),
    });

    match cmd {
        Commands::Serve {
            host,
            port,
            db_path,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let config = SyncConfig::from_env()?;
            let store = Arc::new(SqliteSyncStore::new(&db_path).await?);
            let service = IntegrationService::from_config(&config, store)?;
            tracing::info!(
                db_path = %db_path.display(),
                oauth = config.oauth.is_some(),
                llm = config.llm.is_some(),
                "roadsync configured"
            );
            roadsync_server::server::serve(addr, AppState::new(Arc::new(service))).await?;
        }
        Commands::CheckConfig => {
            let config = SyncConfig::from_env()?;
            config.state_signing_secret()?;
            println!("crm api base:      {}", config.crm.api_base);
            println!("crm timeout:       {:?}", config.crm.timeout);
            println!("oauth app:         {}", enabled(config.oauth.is_some()));
            println!("mapping suggester: {}", enabled(config.llm.is_some()));
            println!(
                "enrich rate limit: {} per {:?}",
                config.enrich_rate_limit.max_requests, config.enrich_rate_limit.window
            );
        }
    }

    Ok(())
}

fn enabled(on: bool) -> &'static str {
    if on { "enabled" } else { "disabled" }
}
