//! Group membership resolution.
//!
//! Direct memberships come from a multi-valued attribute on the user
//! entry; the DNs are looked up in batches to stay under server
//! query-size limits. Nested resolution walks "parent of" edges upward
//! with a visited set so membership cycles terminate.

use std::collections::{HashSet, VecDeque};

use crate::config::LdapConfig;
use crate::errors::Result;

use super::client::{ldap_escape, DirectoryConnection, DirectoryEntry, SearchScope};

/// Maximum group DNs folded into a single lookup filter.
pub const GROUP_LOOKUP_BATCH_SIZE: usize = 50;

fn group_search_base(config: &LdapConfig) -> &str {
    config
        .group_search_base
        .as_deref()
        .unwrap_or(&config.user_search_base)
}

fn group_attributes(config: &LdapConfig) -> Vec<String> {
    vec![
        config.group_name_attribute.clone(),
        config.group_dn_attribute.clone(),
        config.group_member_mapping_attribute.clone(),
    ]
}

/// Look up the group entries named by `member_dns`, batching the DNs
/// into OR-filters of at most [`GROUP_LOOKUP_BATCH_SIZE`] terms.
pub async fn resolve_direct_groups(
    conn: &mut dyn DirectoryConnection,
    config: &LdapConfig,
    member_dns: &[String],
) -> Result<Vec<DirectoryEntry>> {
    let attributes = group_attributes(config);
    let mut groups = Vec::new();
    for batch in member_dns.chunks(GROUP_LOOKUP_BATCH_SIZE) {
        let terms: String = batch
            .iter()
            .map(|dn| {
                format!(
                    "({}={})",
                    config.group_dn_attribute,
                    ldap_escape(dn.as_str())
                )
            })
            .collect();
        let filter = format!(
            "(&(objectClass={})(|{terms}))",
            ldap_escape(&config.group_object_class)
        );
        let entries = conn
            .search(
                group_search_base(config),
                SearchScope::Subtree,
                &filter,
                &attributes,
            )
            .await?;
        groups.extend(entries);
    }
    Ok(groups)
}

/// Expand `direct` with every ancestor group reachable through the
/// configured member-mapping attribute. Ancestors are deduplicated by
/// DN and any search failure aborts the whole resolution.
pub async fn resolve_nested_groups(
    conn: &mut dyn DirectoryConnection,
    config: &LdapConfig,
    direct: Vec<DirectoryEntry>,
) -> Result<Vec<DirectoryEntry>> {
    let attributes = group_attributes(config);
    let mut seen: HashSet<String> = direct.iter().map(|g| g.dn.clone()).collect();
    let mut queue: VecDeque<String> = direct.iter().map(|g| g.dn.clone()).collect();
    let mut groups = direct;

    while let Some(dn) = queue.pop_front() {
        let filter = format!(
            "(&(objectClass={})({}={}))",
            ldap_escape(&config.group_object_class),
            config.group_member_mapping_attribute,
            ldap_escape(&dn)
        );
        let parents = conn
            .search(
                group_search_base(config),
                SearchScope::Subtree,
                &filter,
                &attributes,
            )
            .await?;
        for parent in parents {
            if seen.insert(parent.dn.clone()) {
                queue.push_back(parent.dn.clone());
                groups.push(parent);
            }
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ldap::testing::FakeDirectory;

    fn config() -> LdapConfig {
        crate::providers::ldap::testing::test_config()
    }

    fn group(dn: &str) -> DirectoryEntry {
        let mut entry = DirectoryEntry {
            dn: dn.to_string(),
            ..Default::default()
        };
        let cn = dn.split(',').next().unwrap().trim_start_matches("cn=");
        entry.attributes.insert("cn".into(), vec![cn.to_string()]);
        entry
    }

    #[tokio::test]
    async fn direct_lookup_batches_filters() {
        let dns: Vec<String> = (0..120)
            .map(|i| format!("cn=g{i},ou=groups,dc=foo,dc=bar"))
            .collect();
        let mut dir = FakeDirectory::default();
        for dn in &dns {
            dir.add_entry(group(dn));
        }
        let mut conn = dir.connect();
        let groups = resolve_direct_groups(&mut conn, &config(), &dns)
            .await
            .unwrap();
        assert_eq!(groups.len(), 120);
        // 120 DNs at 50 per filter is three searches.
        assert_eq!(conn.search_count(), 3);
    }

    #[tokio::test]
    async fn nested_walk_terminates_on_cycle_and_deduplicates() {
        // A -> B -> C -> A membership cycle.
        let a = "cn=a,ou=groups,dc=foo,dc=bar";
        let b = "cn=b,ou=groups,dc=foo,dc=bar";
        let c = "cn=c,ou=groups,dc=foo,dc=bar";
        let mut dir = FakeDirectory::default();
        dir.add_entry(group(a));
        dir.add_entry(group(b));
        dir.add_entry(group(c));
        dir.link_parent(a, b);
        dir.link_parent(b, c);
        dir.link_parent(c, a);

        let mut conn = dir.connect();
        let groups = resolve_nested_groups(&mut conn, &config(), vec![group(a)])
            .await
            .unwrap();
        let mut dns: Vec<_> = groups.iter().map(|g| g.dn.as_str()).collect();
        dns.sort_unstable();
        assert_eq!(dns, vec![a, b, c]);
    }
}
