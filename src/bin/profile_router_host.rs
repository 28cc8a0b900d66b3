use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use profile_router::config::{RouterSettings, default_config_path};
use profile_router::host::{NativeHost, serve};
use profile_router::telemetry::init_tracing;
use tokio::{io, signal};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "profile-router-host", version, about = "Profile router native messaging host", long_about = None)]
struct Args {
    /// Override path to the router config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Answer requests without spawning the browser
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Caller origin and window handle appended by the browser; ignored.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    caller: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = RouterSettings::load_or_default(&config_path)?;
    let _telemetry = init_tracing("profile-router-host", args.verbose, &settings.telemetry)?;

    let host = NativeHost::from_settings(&settings.chrome)?.with_dry_run(args.dry_run);
    info!(
        local_state = %host.local_state().display(),
        caller = ?args.caller,
        "profile host ready"
    );

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    tokio::select! {
        result = serve(&host, &mut stdin, &mut stdout) => match result {
            Ok(handled) => {
                info!(handled, "browser closed the connection");
                Ok(())
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "native messaging loop failed");
                Err(err)
            }
        },
        _ = signal::ctrl_c() => {
            info!("interrupted; shutting down");
            Ok(())
        }
    }
}
