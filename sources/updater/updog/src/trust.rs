//! The client's root of trust.
//!
//! The provisioned root file is read on every check and never written. Newer roots are only
//! accepted through the rotation chain: `<N+1>.root.json` must be signed by a threshold of root
//! N's root keys and by a threshold of its own, and must say it is version N+1. Accepted roots
//! are kept in the metadata cache so the chain doesn't have to be downloaded again.

use crate::config::Config;
use crate::error::{self, Result};
use crate::io::Fetcher;
use crate::{check_expiry, join_url, parse};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use snafu::{ensure, ResultExt};
use std::fs;
use tuf_schema::{RoleType, Root, Signed};
use tuf_store::MetadataStore;

/// Reads the provisioned root and checks that it is signed by its own root keys.
pub(crate) fn load_trusted_root(config: &Config) -> Result<Signed<Root>> {
    let path = &config.trusted_root;
    let bytes = fs::read(path).context(error::TrustedRootReadSnafu { path })?;
    let root: Signed<Root> =
        serde_json::from_slice(&bytes).context(error::TrustedRootParseSnafu { path })?;
    root.signed
        .verify_role(&root)
        .context(error::TrustedRootSignatureSnafu { path })?;
    Ok(root)
}

/// Walks the root chain from the provisioned root to the newest root the repository offers and
/// returns it. Roots already in `cache` are re-verified but not fetched again.
///
/// When a newly fetched root changes the timestamp or snapshot keys, the cached timestamp and
/// snapshot are dropped so that their versions no longer pin future fetches.
pub(crate) async fn update_root(
    config: &Config,
    fetcher: &Fetcher<'_>,
    cache: &MetadataStore,
    now: DateTime<Utc>,
) -> Result<Signed<Root>> {
    let mut current = load_trusted_root(config)?;
    debug!("Trusted root is version {}", current.signed.version);

    let mut accepted = 0;
    loop {
        let next_version = current.signed.version.saturating_add(1);
        let file = RoleType::Root.versioned_filename(next_version);
        let (bytes, fetched) = match cache.read(&file).context(error::StoreSnafu)? {
            Some(bytes) => (bytes, false),
            None => {
                let url = join_url(&config.metadata_base_url, &file)?;
                match fetcher.fetch_optional(&url, config.max_metadata_size).await? {
                    Some(bytes) => (bytes, true),
                    None => break,
                }
            }
        };

        // Counting cached links as well bounds a chain that was seeded into the cache.
        ensure!(
            accepted < config.max_root_updates,
            error::RootUpdateLimitSnafu {
                max: config.max_root_updates
            }
        );

        let next: Signed<Root> = parse(&bytes)?;
        current
            .signed
            .verify_successor(&next)
            .context(error::SignatureSnafu {
                role: RoleType::Root,
            })?;
        ensure!(
            next.signed.version == next_version,
            error::RootVersionSnafu {
                expected: next_version.get(),
                actual: next.signed.version.get(),
            }
        );

        if fetched {
            info!("Accepted root metadata version {}", next_version);
            cache.write(&file, &bytes).context(error::StoreSnafu)?;
            for role in invalidated(&current.signed, &next.signed) {
                warn!("Root version {} drops cached {} metadata", next_version, role);
                cache.remove(role).context(error::StoreSnafu)?;
            }
        }
        accepted += 1;
        current = next;
    }

    check_expiry(&current.signed, now, config.clock_skew())?;
    Ok(current)
}

/// Cached roles that no longer pin anything once `next` replaces `current`. A change to either
/// timestamp or snapshot keys drops both. Targets stay cached so a republished release can still
/// be compared with what was first trusted.
fn invalidated(current: &Root, next: &Root) -> Vec<RoleType> {
    let chained = [RoleType::Timestamp, RoleType::Snapshot];
    if chained
        .iter()
        .any(|role| current.role_changed(next, *role))
    {
        chained.to_vec()
    } else {
        Vec::new()
    }
}
