use envforge_core::ReleaseVersion;

use crate::error::UpgradeError;

/// Ubuntu LTS releases. `do-release-upgrade` only moves between supported
/// releases, and interim releases fall out of support within a year, so the
/// built-in catalog follows the LTS-to-LTS upgrade edges. Manifests that
/// need interim hops list them under `[upgrade] releases`.
const DEFAULT_RELEASES: &[(u32, u32)] = &[(18, 4), (20, 4), (22, 4), (24, 4), (26, 4)];

pub fn default_catalog() -> Vec<ReleaseVersion> {
    DEFAULT_RELEASES
        .iter()
        .map(|&(major, minor)| ReleaseVersion::new(major, minor))
        .collect()
}

/// Every catalog release in `(current, target]`, ascending. Recomputable from
/// `current` alone, so resuming never revisits a finished hop.
pub fn hop_path(
    catalog: &[ReleaseVersion],
    current: ReleaseVersion,
    target: ReleaseVersion,
) -> Result<Vec<ReleaseVersion>, UpgradeError> {
    if !catalog.contains(&target) {
        return Err(UpgradeError::UnknownTarget { target });
    }

    let mut hops = catalog
        .iter()
        .copied()
        .filter(|release| *release > current && *release <= target)
        .collect::<Vec<_>>();
    hops.sort();
    hops.dedup();
    Ok(hops)
}
