use std::collections::{BTreeMap, BTreeSet, HashMap};

use envforge_core::Manifest;

/// Orders included modules by ascending phase; inside a phase, Kahn's
/// algorithm with the declaration index as tie-break. Returns the ordered
/// positions, or the positions left unplaced when a cycle blocks progress.
pub(crate) fn phase_order(
    manifest: &Manifest,
    included: &BTreeSet<usize>,
    index: &HashMap<&str, usize>,
) -> Result<Vec<usize>, Vec<usize>> {
    let mut buckets: BTreeMap<u8, BTreeSet<usize>> = BTreeMap::new();
    for &position in included {
        buckets
            .entry(manifest.modules[position].phase)
            .or_default()
            .insert(position);
    }

    let mut ordered = Vec::with_capacity(included.len());
    for members in buckets.values() {
        let mut reverse: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        let mut in_degree: BTreeMap<usize, usize> = BTreeMap::new();

        for &position in members {
            in_degree.entry(position).or_insert(0);
            for dependency in &manifest.modules[position].dependencies {
                let Some(&target) = index.get(dependency.as_str()) else {
                    continue;
                };
                if !members.contains(&target) {
                    continue;
                }
                if reverse.entry(target).or_default().insert(position) {
                    *in_degree.entry(position).or_insert(0) += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter_map(|(position, degree)| (*degree == 0).then_some(*position))
            .collect();
        let mut placed = 0_usize;

        while let Some(next) = ready.pop_first() {
            ordered.push(next);
            placed += 1;
            if let Some(children) = reverse.get(&next) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }

        if placed != members.len() {
            let placed_set: BTreeSet<usize> = ordered.iter().copied().collect();
            return Err(members
                .iter()
                .filter(|position| !placed_set.contains(position))
                .copied()
                .collect());
        }
    }

    Ok(ordered)
}
