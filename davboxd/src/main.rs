use tracing_subscriber::EnvFilter;

use davboxd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--sync-once" => mode = CliMode::SyncOnce,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: davboxd [--sync-once]");
            println!("  --sync-once   Run a single account sync pass and exit");
            return Ok(());
        }
        CliMode::SyncOnce => {
            let config = DaemonConfig::from_env()?;
            let daemon = DaemonRuntime::bootstrap(config)?;
            return daemon.sync_account_once(true).await;
        }
        CliMode::Run => {}
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config)?;
    daemon.run().await
}
