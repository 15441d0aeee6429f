//! Gateway server: authenticates bearer tokens and dispatches the order tools.
//!
//! Settings come from the JSON file given by `--config` / `TOOLGATE_CONFIG`,
//! or from the provisioning environment variables (a `.env` file is honored).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use toolgate::config::Settings;
use toolgate::gateway::Gateway;
use toolgate::server_adapters::{ResponseOptions, axum::router};
use toolgate::tools::{OrderStore, ToolRegistry, register_order_tools};

#[derive(Debug, Parser)]
#[command(
    name = "toolgate-gateway",
    version,
    about = "Authenticating tool gateway (REST and MCP over HTTP)"
)]
struct Args {
    /// JSON settings file; provisioning environment variables are used when absent.
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "TOOLGATE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

/// A missing `.env` file is fine; an unreadable or malformed one is not.
fn tolerate_missing<T>(loaded: Result<T, dotenvy::Error>) -> Result<(), dotenvy::Error> {
    match loaded {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before parsing so it can supply the TOOLGATE_* values.
    tolerate_missing(dotenvy::dotenv())?;
    let args = Args::parse();
    let _guard = toolgate::telemetry::init_from_env()?;

    let settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env()?,
    };

    let mut registry = ToolRegistry::new();
    register_order_tools(&mut registry, Arc::new(OrderStore::with_sample_orders()))?;
    let gateway = Gateway::from_settings(&settings, registry, reqwest::Client::new())?;

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(Arc::new(gateway), ResponseOptions::production()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    tracing::info!("gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_override_the_defaults() {
        let args = Args::try_parse_from([
            "toolgate-gateway",
            "--config",
            "toolgate.json",
            "--listen",
            "0.0.0.0:9099",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("toolgate.json")));
        assert_eq!(args.listen, "0.0.0.0:9099".parse::<SocketAddr>().unwrap());

        assert!(Args::try_parse_from(["toolgate-gateway", "--listen", "not-an-address"]).is_err());
    }

    #[test]
    fn missing_env_file_is_tolerated_but_malformed_is_not() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tolerate_missing(dotenvy::from_path(dir.path().join("absent.env"))).is_ok());

        let malformed = dir.path().join("malformed.env");
        std::fs::write(&malformed, "this line has no assignment\n").unwrap();
        assert!(tolerate_missing(dotenvy::from_path(&malformed)).is_err());
    }
}
