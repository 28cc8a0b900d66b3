use std::{cmp::Reverse, fmt, sync::Arc};

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::normalize::{domain_of, path_key_of};
use crate::profile::ProfileId;
use crate::store::{MappingStore, MappingTable};

/// Which remembered rule produced a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum MatchedRule {
    UrlPrefix { key: String },
    Domain { key: String },
}

impl fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchedRule::UrlPrefix { key } => write!(f, "url prefix {key}"),
            MatchedRule::Domain { key } => write!(f, "domain {key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub profile: ProfileId,
    #[serde(flatten)]
    pub rule: MatchedRule,
}

/// Owns the precedence policy: URL-prefix rules beat domain rules, and among
/// prefixes the longest key wins.
#[derive(Clone)]
pub struct RouteResolver {
    store: Arc<MappingStore>,
}

impl RouteResolver {
    pub fn new(store: Arc<MappingStore>) -> Self {
        Self { store }
    }

    pub fn resolve(&self, url: &str) -> Result<Option<ProfileId>> {
        Ok(self.explain(url)?.map(|resolution| resolution.profile))
    }

    /// Resolve `url` and report the rule that matched.
    ///
    /// Unparseable URLs resolve to `None`; only storage failures are errors.
    pub fn explain(&self, url: &str) -> Result<Option<Resolution>> {
        if let Some(path_key) = path_key_of(url) {
            let prefixes = self.store.url_mappings()?;
            if let Some((key, profile)) = longest_prefix_match(&prefixes, &path_key) {
                debug!(path_key, key, profile = %profile, "url prefix mapping matched");
                return Ok(Some(Resolution {
                    profile: profile.clone(),
                    rule: MatchedRule::UrlPrefix {
                        key: key.to_string(),
                    },
                }));
            }
        }

        let Some(domain) = domain_of(url) else {
            return Ok(None);
        };
        let domains = self.store.domain_mappings()?;
        Ok(domains.get(&domain).map(|profile| {
            debug!(domain, profile = %profile, "domain mapping matched");
            Resolution {
                profile: profile.clone(),
                rule: MatchedRule::Domain { key: domain.clone() },
            }
        }))
    }
}

/// Find the longest stored key equal to `path_key` or a `/`-bounded prefix of it.
///
/// Equal-length keys are visited in lexicographic order.
pub fn longest_prefix_match<'a>(
    table: &'a MappingTable,
    path_key: &str,
) -> Option<(&'a str, &'a ProfileId)> {
    let mut candidates: Vec<(&'a String, &'a ProfileId)> = table.iter().collect();
    candidates.sort_by(|(a, _), (b, _)| {
        Reverse(a.len()).cmp(&Reverse(b.len())).then_with(|| a.cmp(b))
    });
    candidates
        .into_iter()
        .find(|(key, _)| prefix_matches(key, path_key))
        .map(|(key, profile)| (key.as_str(), profile))
}

fn prefix_matches(key: &str, path_key: &str) -> bool {
    match path_key.strip_prefix(key) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (Arc<MappingStore>, RouteResolver) {
        let store = Arc::new(MappingStore::in_memory().unwrap());
        (Arc::clone(&store), RouteResolver::new(store))
    }

    fn pid(id: &str) -> ProfileId {
        ProfileId::new(id)
    }

    #[test]
    fn empty_tables_resolve_to_nothing() {
        let (_, resolver) = resolver();
        assert_eq!(resolver.resolve("https://b.com/").unwrap(), None);
    }

    #[test]
    fn prefix_beats_domain_and_domain_is_fallback() {
        let (store, resolver) = resolver();
        store.set_domain_mapping("a.com", &pid("Profile1")).unwrap();
        assert_eq!(
            resolver.resolve("https://a.com/page").unwrap(),
            Some(pid("Profile1"))
        );

        store.set_url_mapping("a.com/docs", &pid("Profile2")).unwrap();
        assert_eq!(
            resolver.resolve("https://a.com/docs/readme").unwrap(),
            Some(pid("Profile2"))
        );
        assert_eq!(
            resolver.resolve("https://a.com/other").unwrap(),
            Some(pid("Profile1"))
        );
    }

    #[test]
    fn longer_prefix_wins_regardless_of_insert_order() {
        let (store, resolver) = resolver();
        store.set_url_mapping("a.com/x/y", &pid("Deep")).unwrap();
        store.set_url_mapping("a.com/x", &pid("Shallow")).unwrap();
        store.set_url_mapping("a.com", &pid("Root")).unwrap();

        assert_eq!(
            resolver.resolve("https://a.com/x/y/z").unwrap(),
            Some(pid("Deep"))
        );
        assert_eq!(
            resolver.resolve("https://a.com/x/other").unwrap(),
            Some(pid("Shallow"))
        );
        assert_eq!(
            resolver.resolve("https://a.com/elsewhere").unwrap(),
            Some(pid("Root"))
        );
    }

    #[test]
    fn prefix_requires_segment_boundary() {
        let (store, resolver) = resolver();
        store.set_url_mapping("a.com/doc", &pid("Docs")).unwrap();
        assert_eq!(resolver.resolve("https://a.com/docs").unwrap(), None);
        assert_eq!(
            resolver.resolve("https://a.com/doc").unwrap(),
            Some(pid("Docs"))
        );
        assert_eq!(
            resolver.resolve("https://a.com/doc/").unwrap(),
            Some(pid("Docs"))
        );
    }

    #[test]
    fn query_and_fragment_do_not_affect_matching() {
        let (store, resolver) = resolver();
        store.set_url_mapping("a.com/docs", &pid("Docs")).unwrap();
        assert_eq!(
            resolver.resolve("https://a.com/docs?tab=2#intro").unwrap(),
            Some(pid("Docs"))
        );
    }

    #[test]
    fn unparseable_url_is_no_match() {
        let (store, resolver) = resolver();
        store.set_domain_mapping("a.com", &pid("P1")).unwrap();
        assert_eq!(resolver.resolve("a.com/page").unwrap(), None);
        assert_eq!(resolver.explain("%%%").unwrap(), None);
    }

    #[test]
    fn explain_reports_rule() {
        let (store, resolver) = resolver();
        store.set_domain_mapping("a.com", &pid("P1")).unwrap();
        store.set_url_mapping("a.com/docs", &pid("P2")).unwrap();

        let hit = resolver.explain("https://a.com/docs/x").unwrap().unwrap();
        assert_eq!(
            hit.rule,
            MatchedRule::UrlPrefix {
                key: "a.com/docs".into()
            }
        );
        let hit = resolver.explain("https://a.com/").unwrap().unwrap();
        assert_eq!(hit.rule, MatchedRule::Domain { key: "a.com".into() });
        assert_eq!(hit.profile, pid("P1"));
    }

    #[test]
    fn equal_length_keys_are_visited_deterministically() {
        let mut table = MappingTable::new();
        table.insert("a.com/b".into(), pid("B"));
        table.insert("a.com/a".into(), pid("A"));
        assert_eq!(
            longest_prefix_match(&table, "a.com/b/1"),
            Some(("a.com/b", &pid("B")))
        );
        assert_eq!(longest_prefix_match(&table, "a.com/c"), None);
    }
}
