use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use dialoguer::{Confirm, FuzzySelect, Select, theme::ColorfulTheme};
use profile_router::config::{RouterSettings, default_config_path};
use profile_router::detect::{EnvAccount, FixedAccount};
use profile_router::profile::{Profile, ProfileId};
use profile_router::store::MappingKind;
use profile_router::telemetry::init_tracing;
use profile_router::{Decision, HostConnection, NavigationEvent, ProfileRouter};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "profile-router", version, about = "Route links to the right browser profile", long_about = None)]
struct Args {
    /// Override path to the router config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override path to the mapping database
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route a freshly opened link as the extension would.
    Route {
        url: String,
        /// The link was opened from another tab of this browser.
        #[arg(long, action = ArgAction::SetTrue)]
        from_app: bool,
    },
    /// Show which profile a URL resolves to, and why.
    Resolve { url: String },
    /// Remember a profile for a URL's domain or path.
    Remember {
        url: String,
        profile: String,
        #[arg(long, value_enum, default_value_t = Scope::Domain)]
        scope: Scope,
    },
    /// Remove a remembered mapping by key.
    Forget {
        key: String,
        #[arg(long, value_enum, default_value_t = Scope::Domain)]
        scope: Scope,
    },
    /// List remembered mappings.
    List,
    /// Remove every remembered mapping.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// List browser profiles known to the host.
    Profiles {
        #[arg(long, action = ArgAction::SetTrue)]
        refresh: bool,
    },
    /// Detect which profile an account id belongs to.
    Whoami {
        /// Account id; defaults to $PROFILE_ROUTER_ACCOUNT_ID.
        #[arg(long)]
        account: Option<String>,
    },
    /// Open a URL in a profile through the host.
    Open { url: String, profile: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scope {
    Domain,
    Url,
}

impl From<Scope> for MappingKind {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Domain => MappingKind::Domain,
            Scope::Url => MappingKind::Url,
        }
    }
}

fn resolve_config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

fn interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(args.config.clone())?;
    let settings = RouterSettings::load_or_default(&config_path)?;
    let _telemetry = init_tracing("profile-router", args.verbose, &settings.telemetry)?;
    debug!(path = %config_path.display(), "using router config");

    let router = ProfileRouter::from_settings(&settings, args.store.clone())?;

    match args.command {
        Command::Route { url, from_app } => route(&router, url, from_app).await,
        Command::Resolve { url } => {
            match router.resolver().explain(&url)? {
                Some(resolution) => println!("{} ({})", resolution.profile, resolution.rule),
                None => println!("no mapping for {url}"),
            }
            Ok(())
        }
        Command::Remember {
            url,
            profile,
            scope,
        } => {
            let kind = MappingKind::from(scope);
            let key = router.remember(&url, &ProfileId::new(profile.clone()), kind)?;
            println!("{kind} {key} -> {profile}");
            Ok(())
        }
        Command::Forget { key, scope } => {
            let kind = MappingKind::from(scope);
            if router.forget(kind, &key)? {
                println!("forgot {kind} {key}");
            } else {
                println!("no {kind} mapping for {key}");
            }
            Ok(())
        }
        Command::List => {
            let entries = router.store().entries()?;
            if entries.is_empty() {
                println!("no remembered mappings");
            }
            for entry in entries {
                println!("{:<6} {:<40} {}", entry.kind, entry.key, entry.profile);
            }
            Ok(())
        }
        Command::Clear { yes } => {
            let count = router.store().mapping_count()?;
            if !yes && interactive() {
                let proceed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Forget all {count} remembered mappings?"))
                    .default(false)
                    .interact()?;
                if !proceed {
                    println!("Nothing cleared.");
                    return Ok(());
                }
            }
            router.store().clear_all()?;
            println!("cleared {count} mappings");
            Ok(())
        }
        Command::Profiles { refresh } => {
            let profiles = if refresh {
                router.refresh_profiles().await?
            } else {
                router.list_profiles().await?
            };
            print_profiles(&profiles);
            Ok(())
        }
        Command::Whoami { account } => {
            let router = match account {
                Some(id) => router.with_account_source(Box::new(FixedAccount(Some(id)))),
                None => router.with_account_source(Box::new(EnvAccount::default())),
            };
            match router.detect_current_profile().await {
                Some(profile) => {
                    let name = router.directory().display_name(&profile).await;
                    println!("{profile} ({name})");
                }
                None => println!("current profile unknown"),
            }
            Ok(())
        }
        Command::Open { url, profile } => {
            let marked = router.launch(&url, &ProfileId::new(profile.clone())).await?;
            println!("opened {marked} in {profile}");
            Ok(())
        }
    }
}

async fn route(router: &ProfileRouter<HostConnection>, url: String, from_app: bool) -> Result<()> {
    let event = NavigationEvent {
        url,
        from_app_context: from_app,
    };
    let decision = router.on_navigation(&event).await?;
    let decision = match decision {
        Decision::Confirm { url } if interactive() => confirm(router, &url).await?,
        other => other,
    };
    report(&decision)
}

/// Terminal rendition of the confirmation page: pick a profile, then
/// optionally remember the choice.
async fn confirm(router: &ProfileRouter<HostConnection>, url: &str) -> Result<Decision> {
    let profiles = router
        .list_profiles()
        .await
        .context("cannot offer a profile choice")?;
    if profiles.is_empty() {
        bail!("the host reported no profiles");
    }
    let current = router.current_profile();
    let labels: Vec<String> = profiles
        .iter()
        .map(|profile| format!("{} ({})", profile.name, profile.directory))
        .collect();
    let default_index = current
        .as_ref()
        .and_then(|id| profiles.iter().position(|profile| &profile.directory == id))
        .unwrap_or(0);

    let theme = ColorfulTheme::default();
    let Some(choice) = FuzzySelect::with_theme(&theme)
        .with_prompt(format!("Open {url} in"))
        .items(&labels)
        .default(default_index)
        .interact_opt()?
    else {
        info!(url, "confirmation dismissed");
        return Ok(Decision::Confirm {
            url: url.to_string(),
        });
    };
    let profile = profiles[choice].directory.clone();

    let remember = match Select::with_theme(&theme)
        .with_prompt("Remember this choice?")
        .items(&["Just this once", "For this domain", "For this page"])
        .default(0)
        .interact()?
    {
        1 => Some(MappingKind::Domain),
        2 => Some(MappingKind::Url),
        _ => None,
    };

    router.choose(url, &profile, remember).await
}

fn report(decision: &Decision) -> Result<()> {
    match decision {
        Decision::Ignore => println!("ignored"),
        Decision::Proceed { url } => println!("proceed {url}"),
        Decision::AutoLaunched {
            marked_url,
            profile,
            rule,
        } => match rule {
            Some(rule) => println!("launched {marked_url} in {profile} ({rule})"),
            None => println!("launched {marked_url} in {profile}"),
        },
        Decision::Confirm { url } => println!("confirm {url}"),
        Decision::LaunchFailed {
            url,
            profile,
            error,
        } => {
            bail!("could not open {url} in {profile}: {error}");
        }
    }
    Ok(())
}

fn print_profiles(profiles: &[Profile]) {
    if profiles.is_empty() {
        println!("no profiles");
    }
    for profile in profiles {
        match &profile.gaia_id {
            Some(gaia) => println!("{:<12} {} [{}]", profile.directory, profile.name, gaia),
            None => println!("{:<12} {}", profile.directory, profile.name),
        }
    }
}
