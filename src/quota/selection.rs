use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use tracing::info;

use crate::quota::access::AccessControlStore;
use crate::quota::ledger::{UsageLedger, UsageSnapshot};

/// Replace the allow-list with `packages` and normalize their limits
///
/// Each selected package gets its entry from `limits` (or no limit). Every
/// package the ledger already knows that is not selected has its limit
/// cleared. `lock` additionally sets the selection lock; it never clears it.
pub fn apply_selection(
    access: &dyn AccessControlStore,
    ledger: &dyn UsageLedger,
    packages: &BTreeSet<String>,
    limits: &HashMap<String, u32>,
    lock: bool,
) -> Result<()> {
    access.set_allowed(packages)?;

    let mut normalized: HashMap<String, Option<u32>> = packages
        .iter()
        .map(|package_id| (package_id.clone(), limits.get(package_id).copied()))
        .collect();
    for package_id in ledger.snapshot()?.into_keys() {
        if !packages.contains(&package_id) {
            normalized.insert(package_id, None);
        }
    }
    ledger.set_limits(&normalized)?;

    if lock {
        access.set_locked(true)?;
    }

    info!(
        "Applied selection of {} package(s){}",
        packages.len(),
        if lock { ", selection locked" } else { "" }
    );
    Ok(())
}

/// Candidates the user may currently launch
///
/// With an empty allow-list every candidate passes the first filter. A
/// candidate is then hidden only when it has a limit with no minutes left.
pub fn visible_packages<'a, I>(
    candidates: I,
    allowed: &BTreeSet<String>,
    snapshot: &UsageSnapshot,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .filter(|package_id| allowed.is_empty() || allowed.contains(*package_id))
        .filter(|package_id| {
            snapshot
                .get(*package_id)
                .and_then(|r| r.remaining_minutes())
                .is_none_or(|remaining| remaining > 0)
        })
        .map(str::to_string)
        .collect()
}
