use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

use crate::native::{HostClient, HostRequest, round_trip};
use crate::profile::{Profile, ProfileId};

struct CachedProfiles {
    profiles: Vec<Profile>,
    fetched_at: Instant,
}

/// Memoised profile enumeration.
///
/// The first successful `list_profiles` answer is kept until `refresh`, or
/// until `ttl` elapses when one is configured. Failures are never cached.
pub struct ProfileDirectory<C> {
    client: Arc<C>,
    timeout: Duration,
    ttl: Option<Duration>,
    cache: Mutex<Option<CachedProfiles>>,
}

impl<C: HostClient> ProfileDirectory<C> {
    pub fn new(client: Arc<C>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            ttl: None,
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            let fresh = self
                .ttl
                .is_none_or(|ttl| cached.fetched_at.elapsed() < ttl);
            if fresh {
                return Ok(cached.profiles.clone());
            }
            debug!("profile cache expired");
        }

        let profiles = self.fetch().await?;
        *cache = Some(CachedProfiles {
            profiles: profiles.clone(),
            fetched_at: Instant::now(),
        });
        Ok(profiles)
    }

    /// Drop the cached list and query the host again.
    pub async fn refresh(&self) -> Result<Vec<Profile>> {
        self.cache.lock().await.take();
        self.list_profiles().await
    }

    /// Current snapshot without contacting the host.
    pub async fn cached(&self) -> Option<Vec<Profile>> {
        self.cache
            .lock()
            .await
            .as_ref()
            .map(|cached| cached.profiles.clone())
    }

    /// Human-readable name for `id`, falling back to the id itself.
    pub async fn display_name(&self, id: &ProfileId) -> String {
        match self.list_profiles().await {
            Ok(profiles) => profiles
                .into_iter()
                .find(|profile| &profile.directory == id)
                .map(|profile| profile.name)
                .unwrap_or_else(|| id.to_string()),
            Err(_) => id.to_string(),
        }
    }

    async fn fetch(&self) -> Result<Vec<Profile>> {
        let response = round_trip(&*self.client, HostRequest::ListProfiles, self.timeout)
            .await
            .context("Failed to list browser profiles")?;
        let profiles = response
            .profiles
            .context("profile host reply did not include profiles")?;
        info!(count = profiles.len(), "loaded browser profiles");
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::HostResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHost {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl CountingHost {
        fn new(fail_first: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HostClient for CountingHost {
        async fn send(&self, request: HostRequest) -> Result<HostResponse> {
            assert_eq!(request, HostRequest::ListProfiles);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Ok(HostResponse::error("native host has exited"));
            }
            Ok(HostResponse::with_profiles(vec![
                Profile::new("Default", "Personal"),
                Profile::new("Profile 1", format!("Work {call}")),
            ]))
        }
    }

    #[tokio::test]
    async fn first_success_is_memoised() {
        let host = CountingHost::new(false);
        let directory = ProfileDirectory::new(Arc::clone(&host), Duration::from_secs(1));
        assert!(directory.cached().await.is_none());

        let first = directory.list_profiles().await.unwrap();
        let second = directory.list_profiles().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(host.calls(), 1);
        assert_eq!(directory.cached().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let host = CountingHost::new(true);
        let directory = ProfileDirectory::new(Arc::clone(&host), Duration::from_secs(1));

        let err = directory.list_profiles().await.unwrap_err();
        assert!(format!("{err:#}").contains("native host has exited"));
        assert!(directory.cached().await.is_none());

        let profiles = directory.list_profiles().await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(host.calls(), 2);
    }

    #[tokio::test]
    async fn refresh_requeries() {
        let host = CountingHost::new(false);
        let directory = ProfileDirectory::new(Arc::clone(&host), Duration::from_secs(1));
        directory.list_profiles().await.unwrap();
        let refreshed = directory.refresh().await.unwrap();
        assert_eq!(refreshed[1].name, "Work 1");
        assert_eq!(host.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_cache() {
        let host = CountingHost::new(false);
        let directory = ProfileDirectory::new(Arc::clone(&host), Duration::from_secs(1))
            .with_ttl(Some(Duration::from_secs(30)));
        directory.list_profiles().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        directory.list_profiles().await.unwrap();
        assert_eq!(host.calls(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        directory.list_profiles().await.unwrap();
        assert_eq!(host.calls(), 2);
    }

    #[tokio::test]
    async fn display_name_falls_back_to_id() {
        let host = CountingHost::new(false);
        let directory = ProfileDirectory::new(host, Duration::from_secs(1));
        assert_eq!(
            directory.display_name(&ProfileId::new("Default")).await,
            "Personal"
        );
        assert_eq!(
            directory.display_name(&ProfileId::new("Profile 9")).await,
            "Profile 9"
        );
    }
}
