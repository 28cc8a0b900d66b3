use std::{env, sync::RwLock};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::directory::ProfileDirectory;
use crate::native::HostClient;
use crate::profile::ProfileId;

/// Supplies the signed-in account identifier of the hosting browser, if any.
pub trait AccountSource: Send + Sync {
    fn account_id(&self) -> Result<Option<String>>;
}

/// An account id known up front (e.g. passed on the command line).
#[derive(Debug, Clone, Default)]
pub struct FixedAccount(pub Option<String>);

impl AccountSource for FixedAccount {
    fn account_id(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Reads the account id from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvAccount {
    var: String,
}

impl EnvAccount {
    pub const DEFAULT_VAR: &'static str = "PROFILE_ROUTER_ACCOUNT_ID";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvAccount {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl AccountSource for EnvAccount {
    fn account_id(&self) -> Result<Option<String>> {
        match env::var(&self.var) {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("{} is not valid unicode", self.var)),
        }
    }
}

/// Best-effort "which profile are we running in". Failures only cost the
/// badge; they never propagate.
pub struct CurrentProfileDetector {
    source: Box<dyn AccountSource>,
    current: RwLock<Option<ProfileId>>,
}

impl CurrentProfileDetector {
    pub fn new(source: Box<dyn AccountSource>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Last detected profile.
    pub fn current(&self) -> Option<ProfileId> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    pub async fn detect_current_profile<C: HostClient>(
        &self,
        directory: &ProfileDirectory<C>,
    ) -> Option<ProfileId> {
        let detected = match self.lookup(directory).await {
            Ok(Some(profile)) => {
                info!(profile = %profile, "detected current profile");
                Some(profile)
            }
            Ok(None) => {
                warn!("current profile unknown");
                None
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "current profile detection failed");
                None
            }
        };
        if let Ok(mut current) = self.current.write() {
            *current = detected.clone();
        }
        detected
    }

    async fn lookup<C: HostClient>(
        &self,
        directory: &ProfileDirectory<C>,
    ) -> Result<Option<ProfileId>> {
        let Some(account) = self.source.account_id()? else {
            return Ok(None);
        };
        let profiles = directory.list_profiles().await?;
        Ok(profiles
            .into_iter()
            .find(|profile| profile.gaia_id.as_deref() == Some(account.as_str()))
            .map(|profile| profile.directory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{HostRequest, HostResponse};
    use crate::profile::Profile;
    use anyhow::bail;
    use std::{sync::Arc, time::Duration};

    struct Host {
        reachable: bool,
    }

    impl HostClient for Host {
        async fn send(&self, _request: HostRequest) -> Result<HostResponse> {
            if !self.reachable {
                bail!("Specified native messaging host not found.");
            }
            Ok(HostResponse::with_profiles(vec![
                Profile::new("Default", "Personal").with_gaia_id("100"),
                Profile::new("Profile 1", "Work").with_gaia_id("200"),
            ]))
        }
    }

    fn directory(reachable: bool) -> ProfileDirectory<Host> {
        ProfileDirectory::new(Arc::new(Host { reachable }), Duration::from_secs(1))
    }

    struct DeniedAccount;

    impl AccountSource for DeniedAccount {
        fn account_id(&self) -> Result<Option<String>> {
            bail!("identity.email permission not granted")
        }
    }

    #[tokio::test]
    async fn matches_profile_by_account_id() {
        let detector = CurrentProfileDetector::new(Box::new(FixedAccount(Some("200".into()))));
        let detected = detector.detect_current_profile(&directory(true)).await;
        assert_eq!(detected, Some(ProfileId::new("Profile 1")));
        assert_eq!(detector.current(), Some(ProfileId::new("Profile 1")));
    }

    #[tokio::test]
    async fn unknown_account_yields_none() {
        let detector = CurrentProfileDetector::new(Box::new(FixedAccount(Some("999".into()))));
        assert_eq!(detector.detect_current_profile(&directory(true)).await, None);

        let detector = CurrentProfileDetector::new(Box::new(FixedAccount(None)));
        assert_eq!(detector.detect_current_profile(&directory(true)).await, None);
    }

    #[tokio::test]
    async fn failures_degrade_to_unknown() {
        let detector = CurrentProfileDetector::new(Box::new(DeniedAccount));
        assert_eq!(detector.detect_current_profile(&directory(true)).await, None);

        let detector = CurrentProfileDetector::new(Box::new(FixedAccount(Some("100".into()))));
        assert_eq!(detector.detect_current_profile(&directory(false)).await, None);
        assert_eq!(detector.current(), None);
    }

    #[test]
    fn env_account_ignores_blank_values() {
        let source = EnvAccount::new("PROFILE_ROUTER_TEST_ACCOUNT_UNSET");
        assert_eq!(source.account_id().unwrap(), None);
    }
}
