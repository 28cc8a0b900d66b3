pub mod config;
pub mod detect;
pub mod directory;
pub mod host;
pub mod marker;
pub mod native;
pub mod normalize;
pub mod profile;
pub mod resolve;
pub mod store;
pub mod telemetry;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use crate::config::RouterSettings;
use crate::detect::{AccountSource, CurrentProfileDetector, FixedAccount};
use crate::directory::ProfileDirectory;
use crate::host::NativeHost;
use crate::native::{HostClient, HostRequest, HostResponse, ProcessHostClient, round_trip};
use crate::normalize::{domain_of, is_routable, path_key_of};
use crate::profile::{Profile, ProfileId};
use crate::resolve::{MatchedRule, Resolution, RouteResolver};
use crate::store::{MappingKind, MappingStore};

/// A freshly opened browsing context, as reported by the extension shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub url: String,
    /// Opened from another tab of the same browser; never intercepted.
    pub from_app_context: bool,
}

impl NavigationEvent {
    pub fn external(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            from_app_context: false,
        }
    }

    pub fn in_app(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            from_app_context: true,
        }
    }
}

/// What the shell should do with the originating browsing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Decision {
    /// Not ours to route: in-app origin or an internal page.
    Ignore,
    /// A URL we launched has come back; let it load without the marker.
    Proceed { url: String },
    /// Handed to `profile`; the origin may be closed.
    AutoLaunched {
        marked_url: String,
        profile: ProfileId,
        #[serde(skip_serializing_if = "Option::is_none")]
        rule: Option<MatchedRule>,
    },
    /// No remembered rule; ask the user.
    Confirm { url: String },
    /// The launch failed; keep the origin open.
    LaunchFailed {
        url: String,
        profile: ProfileId,
        error: String,
    },
}

impl Decision {
    pub fn closes_origin(&self) -> bool {
        matches!(self, Decision::AutoLaunched { .. })
    }
}

/// Routing engine: resolves navigations against remembered mappings and hands
/// them to the profile host.
pub struct ProfileRouter<C> {
    store: Arc<MappingStore>,
    resolver: RouteResolver,
    client: Arc<C>,
    directory: ProfileDirectory<C>,
    detector: CurrentProfileDetector,
    timeout: Duration,
}

impl<C: HostClient> ProfileRouter<C> {
    pub fn new(store: Arc<MappingStore>, client: Arc<C>, timeout: Duration) -> Self {
        let resolver = RouteResolver::new(Arc::clone(&store));
        let directory = ProfileDirectory::new(Arc::clone(&client), timeout);
        Self {
            store,
            resolver,
            client,
            directory,
            detector: CurrentProfileDetector::new(Box::new(FixedAccount::default())),
            timeout,
        }
    }

    pub fn with_account_source(mut self, source: Box<dyn AccountSource>) -> Self {
        self.detector = CurrentProfileDetector::new(source);
        self
    }

    pub fn with_profile_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.directory = self.directory.with_ttl(ttl);
        self
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub fn directory(&self) -> &ProfileDirectory<C> {
        &self.directory
    }

    /// Warm the profile cache and detect the current profile. Never fails.
    pub async fn startup(&self) -> Option<ProfileId> {
        if let Err(err) = self.directory.list_profiles().await {
            warn!(error = %format!("{err:#}"), "failed to load profiles at startup");
        }
        self.detector.detect_current_profile(&self.directory).await
    }

    pub fn current_profile(&self) -> Option<ProfileId> {
        self.detector.current()
    }

    pub async fn detect_current_profile(&self) -> Option<ProfileId> {
        self.detector.detect_current_profile(&self.directory).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.directory.list_profiles().await
    }

    pub async fn refresh_profiles(&self) -> Result<Vec<Profile>> {
        self.directory.refresh().await
    }

    /// Decide what happens to a freshly opened browsing context.
    ///
    /// Errors only come from the mapping store; launch failures are reported
    /// as [`Decision::LaunchFailed`].
    pub async fn on_navigation(&self, event: &NavigationEvent) -> Result<Decision> {
        let span = info_span!(
            "router.navigation",
            url = %event.url,
            from_app_context = event.from_app_context
        );
        self.decide(event).instrument(span).await
    }

    async fn decide(&self, event: &NavigationEvent) -> Result<Decision> {
        if event.from_app_context {
            return Ok(Decision::Ignore);
        }
        if marker::is_marked(&event.url) {
            let url = marker::strip(&event.url);
            info!(url = %url, "re-delivered launch; letting it through");
            return Ok(Decision::Proceed { url });
        }
        if !is_routable(&event.url) {
            return Ok(Decision::Ignore);
        }

        match self.resolver.explain(&event.url)? {
            Some(Resolution { profile, rule }) => {
                info!(profile = %profile, rule = %rule, "remembered mapping matched");
                Ok(self.dispatch(&event.url, profile, Some(rule)).await)
            }
            None => {
                info!("no remembered mapping; deferring to confirmation");
                Ok(Decision::Confirm {
                    url: event.url.clone(),
                })
            }
        }
    }

    /// Confirmation-flow callback: optionally remember the choice, then launch.
    pub async fn choose(
        &self,
        url: &str,
        profile: &ProfileId,
        remember: Option<MappingKind>,
    ) -> Result<Decision> {
        if let Some(kind) = remember {
            let key = self.remember(url, profile, kind)?;
            info!(%kind, key = %key, profile = %profile, "remembered choice");
        }
        Ok(self.dispatch(url, profile.clone(), None).await)
    }

    /// Store a mapping for `url` under the key `kind` derives. Returns the key.
    pub fn remember(&self, url: &str, profile: &ProfileId, kind: MappingKind) -> Result<String> {
        let key = match kind {
            MappingKind::Domain => domain_of(url),
            MappingKind::Url => path_key_of(url),
        }
        .with_context(|| format!("cannot derive a {kind} key from {url}"))?;
        self.store.set_mapping(kind, &key, profile)?;
        Ok(key)
    }

    pub fn forget(&self, kind: MappingKind, key: &str) -> Result<bool> {
        self.store.remove_mapping(kind, key)
    }

    /// Mark `url` and ask the host to open it in `profile`. Returns the marked URL.
    pub async fn launch(&self, url: &str, profile: &ProfileId) -> Result<String> {
        let marked_url = marker::mark(url);
        let request = HostRequest::Open {
            url: marked_url.clone(),
            profile: profile.clone(),
        };
        round_trip(&*self.client, request, self.timeout)
            .await
            .with_context(|| format!("Failed to open {url} in profile {profile}"))?;
        Ok(marked_url)
    }

    async fn dispatch(&self, url: &str, profile: ProfileId, rule: Option<MatchedRule>) -> Decision {
        match self.launch(url, &profile).await {
            Ok(marked_url) => {
                info!(profile = %profile, "launched in profile");
                Decision::AutoLaunched {
                    marked_url,
                    profile,
                    rule,
                }
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(profile = %profile, error = %error, "launch failed; keeping origin open");
                Decision::LaunchFailed {
                    url: url.to_string(),
                    profile,
                    error,
                }
            }
        }
    }
}

/// How the router reaches the host: a separate process, or the host logic
/// linked in directly.
#[derive(Debug, Clone)]
pub enum HostConnection {
    Process(ProcessHostClient),
    InProcess(NativeHost),
}

impl HostConnection {
    pub fn from_settings(settings: &RouterSettings) -> Result<Self> {
        match &settings.host.command {
            Some(command) => Ok(HostConnection::Process(ProcessHostClient::new(
                command.clone(),
                settings.host.args.clone(),
            ))),
            None => Ok(HostConnection::InProcess(NativeHost::from_settings(
                &settings.chrome,
            )?)),
        }
    }
}

impl HostClient for HostConnection {
    async fn send(&self, request: HostRequest) -> Result<HostResponse> {
        match self {
            HostConnection::Process(client) => client.send(request).await,
            HostConnection::InProcess(host) => host.send(request).await,
        }
    }
}

impl ProfileRouter<HostConnection> {
    /// Build a router from settings, opening the SQLite store.
    pub fn from_settings(
        settings: &RouterSettings,
        store_override: Option<PathBuf>,
    ) -> Result<Self> {
        let store_path = match store_override {
            Some(path) => path,
            None => settings.resolve_store_path()?,
        };
        let store = Arc::new(MappingStore::open_sqlite(&store_path)?);
        info!(path = %store_path.display(), "opened mapping store");
        let connection = Arc::new(HostConnection::from_settings(settings)?);
        Ok(Self::new(store, connection, settings.host.timeout())
            .with_profile_ttl(settings.profile_cache_ttl()))
    }
}
