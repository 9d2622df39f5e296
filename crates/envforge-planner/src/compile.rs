use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use envforge_core::{InstallMode, Manifest, Module};
use log::debug;

use crate::error::{PlanError, SelectionError, ValidationError};
use crate::order::phase_order;
use crate::types::{ExecutionPlan, InclusionReason, PlanEntry, Selection, Selector, PLAN_SCHEMA_VERSION};
use crate::validate::{module_index, validate};

const CRITICAL_TAG: &str = "critical";

pub fn compile(manifest: &Manifest, selection: &Selection) -> Result<ExecutionPlan, PlanError> {
    let errors = validate(manifest);
    if !errors.is_empty() {
        return Err(PlanError::Invalid(errors));
    }

    let index = module_index(manifest);
    let skipped = resolve_skips(&index, &selection.skip)?;
    let seeds = seed_set(manifest, selection, &skipped)?;
    let included = dependency_closure(manifest, &index, seeds);

    for (position, reason) in &included {
        if !skipped.contains(position) {
            continue;
        }
        let excluded = manifest.modules[*position].id.clone();
        let dependent = match reason {
            InclusionReason::DependencyClosure { required_by } => required_by.clone(),
            _ => first_dependent(manifest, &included, &excluded).unwrap_or_default(),
        };
        return Err(SelectionError::UnsatisfiableExclusion {
            excluded,
            dependent,
        }
        .into());
    }

    let positions = included.keys().copied().collect::<BTreeSet<_>>();
    let ordered = phase_order(manifest, &positions, &index).map_err(|stuck| {
        let mut path = stuck
            .iter()
            .map(|&position| manifest.modules[position].id.clone())
            .collect::<Vec<_>>();
        if let Some(first) = path.first().cloned() {
            path.push(first);
        }
        PlanError::Invalid(vec![ValidationError::DependencyCycle { path }])
    })?;

    let mut reasons = included;
    let entries = ordered
        .into_iter()
        .map(|position| {
            let module = &manifest.modules[position];
            PlanEntry {
                id: module.id.clone(),
                phase: module.phase,
                optional: module.optional,
                reason: reasons
                    .remove(&position)
                    .unwrap_or(InclusionReason::Default),
            }
        })
        .collect::<Vec<_>>();
    debug!("compiled plan with {} module(s)", entries.len());

    Ok(ExecutionPlan {
        schema_version: PLAN_SCHEMA_VERSION,
        mode: manifest.defaults.mode,
        entries,
    })
}

fn resolve_skips(
    index: &HashMap<&str, usize>,
    skip: &[String],
) -> Result<BTreeSet<usize>, SelectionError> {
    skip.iter()
        .map(|id| {
            index
                .get(id.as_str())
                .copied()
                .ok_or_else(|| SelectionError::UnknownModule { id: id.clone() })
        })
        .collect()
}

fn seed_set(
    manifest: &Manifest,
    selection: &Selection,
    skipped: &BTreeSet<usize>,
) -> Result<Vec<(usize, InclusionReason)>, SelectionError> {
    let mut seeds: Vec<(usize, InclusionReason)> = Vec::new();
    let mut seen = BTreeSet::new();

    if selection.only.is_empty() {
        for (position, module) in manifest.modules.iter().enumerate() {
            if is_default_seed(module, manifest.defaults.mode) && !skipped.contains(&position) {
                seen.insert(position);
                seeds.push((position, InclusionReason::Default));
            }
        }
        return Ok(seeds);
    }

    for selector in &selection.only {
        let selector = resolve_selector(manifest, selector)?;
        let reason = match &selector {
            Selector::Tag(tag) => InclusionReason::Tag { tag: tag.clone() },
            Selector::Category(category) => InclusionReason::Category {
                category: category.clone(),
            },
            Selector::Id(_) | Selector::Auto(_) => InclusionReason::Explicit,
        };
        for (position, module) in manifest.modules.iter().enumerate() {
            if !selector_matches(&selector, module) || skipped.contains(&position) {
                continue;
            }
            if seen.insert(position) {
                seeds.push((position, reason.clone()));
            }
        }
    }

    Ok(seeds)
}

fn is_default_seed(module: &Module, mode: InstallMode) -> bool {
    match mode {
        InstallMode::Full => module.enabled_by_default,
        InstallMode::Minimal => module.enabled_by_default && module.has_tag(CRITICAL_TAG),
    }
}

fn resolve_selector(manifest: &Manifest, selector: &Selector) -> Result<Selector, SelectionError> {
    let resolved = match selector {
        Selector::Auto(token) => {
            if manifest.module(token).is_some() {
                Selector::Id(token.clone())
            } else if manifest.modules.iter().any(|module| module.has_tag(token)) {
                Selector::Tag(token.clone())
            } else {
                Selector::Category(token.clone())
            }
        }
        other => other.clone(),
    };

    if manifest
        .modules
        .iter()
        .any(|module| selector_matches(&resolved, module))
    {
        Ok(resolved)
    } else {
        Err(SelectionError::UnknownSelector {
            selector: selector.to_string(),
        })
    }
}

fn selector_matches(selector: &Selector, module: &Module) -> bool {
    match selector {
        Selector::Id(id) | Selector::Auto(id) => module.id == *id,
        Selector::Tag(tag) => module.has_tag(tag),
        Selector::Category(category) => module.category() == category,
    }
}

fn dependency_closure(
    manifest: &Manifest,
    index: &HashMap<&str, usize>,
    seeds: Vec<(usize, InclusionReason)>,
) -> BTreeMap<usize, InclusionReason> {
    let mut included = BTreeMap::new();
    let mut queue = VecDeque::new();
    for (position, reason) in seeds {
        if included.insert(position, reason).is_none() {
            queue.push_back(position);
        }
    }

    while let Some(position) = queue.pop_front() {
        let module = &manifest.modules[position];
        for dependency in &module.dependencies {
            let Some(&target) = index.get(dependency.as_str()) else {
                continue;
            };
            if included.contains_key(&target) {
                continue;
            }
            included.insert(
                target,
                InclusionReason::DependencyClosure {
                    required_by: module.id.clone(),
                },
            );
            queue.push_back(target);
        }
    }

    included
}

fn first_dependent(
    manifest: &Manifest,
    included: &BTreeMap<usize, InclusionReason>,
    id: &str,
) -> Option<String> {
    included.keys().find_map(|&position| {
        let module = &manifest.modules[position];
        module
            .dependencies
            .iter()
            .any(|dependency| dependency == id)
            .then(|| module.id.clone())
    })
}
