use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::ChromeSettings;
use crate::native::{HostClient, HostRequest, HostResponse, read_message, write_message};
use crate::profile::{Profile, ProfileId};

const CHROME_BINARY_ENV: &str = "PROFILE_ROUTER_CHROME_BINARY";
const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Materialised command ready to be spawned or logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        command
    }

    pub fn describe(&self) -> String {
        let args = self.args.join(" ");
        format!("{} {}", self.binary.display(), args)
    }
}

/// Builds the command that opens a URL inside a given Chrome profile.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    binary: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl ChromeLauncher {
    pub fn new(binary: Option<PathBuf>, extra_args: Vec<String>) -> Self {
        Self { binary, extra_args }
    }

    fn configured_binary(&self) -> Option<PathBuf> {
        self.binary
            .clone()
            .or_else(|| env::var_os(CHROME_BINARY_ENV).map(PathBuf::from))
    }

    pub fn build_command(&self, url: &str, profile: &str) -> Result<CommandSpec> {
        let profile_arg = format!("--profile-directory={profile}");

        if let Some(binary) = self.configured_binary() {
            let mut args = self.extra_args.clone();
            args.push(profile_arg);
            args.push(url.to_string());
            return Ok(CommandSpec::new(binary, args));
        }

        if cfg!(target_os = "macos") {
            let mut args = vec!["-na".into(), "Google Chrome".into(), "--args".into()];
            args.extend(self.extra_args.iter().cloned());
            args.push(profile_arg);
            args.push(url.to_string());
            return Ok(CommandSpec::new(PathBuf::from("open"), args));
        }

        for candidate in CHROME_CANDIDATES {
            if let Ok(binary) = which::which(candidate) {
                let mut args = self.extra_args.clone();
                args.push(profile_arg);
                args.push(url.to_string());
                return Ok(CommandSpec::new(binary, args));
            }
        }
        bail!(
            "Chrome binary not found; set {CHROME_BINARY_ENV} or configure chrome.binary_path"
        )
    }
}

/// Host-side implementation of the two native actions.
#[derive(Debug, Clone)]
pub struct NativeHost {
    local_state: PathBuf,
    launcher: ChromeLauncher,
    dry_run: bool,
}

impl NativeHost {
    pub fn new(local_state: PathBuf, launcher: ChromeLauncher) -> Self {
        Self {
            local_state,
            launcher,
            dry_run: false,
        }
    }

    pub fn from_settings(settings: &ChromeSettings) -> Result<Self> {
        let local_state = settings.resolve_local_state()?;
        let launcher = ChromeLauncher::new(settings.binary_path.clone(), settings.extra_args.clone());
        Ok(Self::new(local_state, launcher))
    }

    /// Build launch commands without spawning them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn local_state(&self) -> &Path {
        &self.local_state
    }

    /// Enumerate profiles from Chrome's `Local State`, sorted by directory.
    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        if !self.local_state.exists() {
            bail!("Chrome Local State file not found");
        }
        let raw = fs::read_to_string(&self.local_state).with_context(|| {
            format!("Failed to read Local State at {}", self.local_state.display())
        })?;
        let parsed: Value = serde_json::from_str(&raw).with_context(|| {
            format!("Failed to parse Local State at {}", self.local_state.display())
        })?;
        profiles_from_local_state(&parsed)
    }

    /// Open `url` in `profile`. Returns the command that was (or would be) run.
    pub fn open(&self, url: &str, profile: &str) -> Result<CommandSpec> {
        if url.trim().is_empty() {
            bail!("No URL provided");
        }
        if profile.trim().is_empty() {
            bail!("No profile directory provided");
        }

        let command = self.launcher.build_command(url, profile)?;
        if self.dry_run {
            info!(command = %command.describe(), "dry run; not launching");
            return Ok(command);
        }

        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to open URL via {}", command.binary().display()))?;
        info!(profile, pid = child.id(), command = %command.describe(), "launched profile");
        reap(child)?;
        Ok(command)
    }

    /// Dispatch one decoded message to the matching action.
    pub fn handle(&self, message: &Value) -> HostResponse {
        match message.get("action").and_then(Value::as_str) {
            Some("list_profiles") => match self.list_profiles() {
                Ok(profiles) => HostResponse::with_profiles(profiles),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "profile listing failed");
                    HostResponse::error(format!("{err:#}"))
                }
            },
            Some("open") => match self.open(str_field(message, "url"), str_field(message, "profile")) {
                Ok(_) => HostResponse::success(),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "open failed");
                    HostResponse::error(format!("Failed to open URL: {err:#}"))
                }
            },
            Some(other) => HostResponse::error(format!("Unknown action: {other}")),
            None => HostResponse::error("Unknown action: missing"),
        }
    }

    fn handle_request(&self, request: HostRequest) -> HostResponse {
        match serde_json::to_value(&request) {
            Ok(message) => self.handle(&message),
            Err(err) => HostResponse::error(format!("invalid request: {err}")),
        }
    }
}

impl HostClient for NativeHost {
    async fn send(&self, request: HostRequest) -> Result<HostResponse> {
        Ok(self.handle_request(request))
    }
}

/// Wait for a launched browser off the request loop so it never lingers as a
/// zombie while the host keeps serving.
fn reap(mut child: Child) -> Result<thread::JoinHandle<()>> {
    let pid = child.id();
    thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(pid, ?status, "launched browser exited"),
            Err(err) => warn!(pid, error = %err, "failed to wait on launched browser"),
        })
        .context("Failed to start browser reaper thread")
}

fn str_field<'a>(message: &'a Value, name: &str) -> &'a str {
    message.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn profiles_from_local_state(local_state: &Value) -> Result<Vec<Profile>> {
    let info_cache = local_state
        .get("profile")
        .and_then(|profile| profile.get("info_cache"))
        .and_then(Value::as_object)
        .filter(|cache| !cache.is_empty())
        .context("No profiles found in Local State")?;

    let mut profiles: Vec<Profile> = info_cache
        .iter()
        .map(|(directory, info)| {
            let name = info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(directory);
            let mut profile = Profile::new(ProfileId::new(directory.as_str()), name);
            if let Some(gaia) = info
                .get("gaia_id")
                .and_then(Value::as_str)
                .filter(|gaia| !gaia.is_empty())
            {
                profile = profile.with_gaia_id(gaia);
            }
            profile
        })
        .collect();
    profiles.sort_by(|a, b| a.directory.cmp(&b.directory));
    Ok(profiles)
}

/// Answer framed requests from `reader` until EOF. Returns how many were handled.
pub async fn serve<R, W>(host: &NativeHost, reader: &mut R, writer: &mut W) -> Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handled = 0;
    while let Some(payload) = read_message(reader).await? {
        let response = if payload.is_empty() {
            HostResponse::error("invalid request payload: empty message")
        } else {
            match serde_json::from_slice::<Value>(&payload) {
                Ok(message) => {
                    debug!(action = ?message.get("action"), "received native message");
                    host.handle(&message)
                }
                Err(err) => HostResponse::error(format!("invalid request payload: {err}")),
            }
        };
        write_message(writer, &response).await?;
        handled += 1;
    }
    Ok(handled)
}
