use std::collections::{BTreeSet, HashMap};

use envforge_core::{ChecksumRegistry, Manifest};

use crate::error::ValidationError;

/// Identifiers the orchestrator generates for its own use.
pub const RESERVED_NAMES: &[&str] = &[
    "main",
    "run",
    "install",
    "verify",
    "resume",
    "status",
    "log",
    "die",
    "cleanup",
    "require_root",
    "run_as_root",
    "run_as_user",
    "print_plan",
    "list_modules",
    "envforge",
];

pub fn normalized_name(id: &str) -> String {
    id.chars()
        .map(|ch| match ch {
            '.' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Runs every graph check and returns all findings; never stops at the first.
pub fn validate(manifest: &Manifest) -> Vec<ValidationError> {
    let index = module_index(manifest);
    let mut errors = Vec::new();
    errors.extend(check_duplicates(manifest));
    errors.extend(check_existence(manifest, &index));
    errors.extend(check_cycles(manifest, &index));
    errors.extend(check_phases(manifest, &index));
    errors.extend(check_name_collisions(manifest));
    errors
}

pub fn validate_installers(manifest: &Manifest, registry: &ChecksumRegistry) -> Vec<ValidationError> {
    manifest
        .modules
        .iter()
        .filter_map(|module| {
            let installer = module.verified_installer()?;
            (!registry.contains(installer.registry_key())).then(|| {
                ValidationError::MissingChecksum {
                    module: module.id.clone(),
                    key: installer.registry_key().to_string(),
                }
            })
        })
        .collect()
}

pub fn validate_all(manifest: &Manifest, registry: &ChecksumRegistry) -> Vec<ValidationError> {
    let mut errors = validate(manifest);
    errors.extend(validate_installers(manifest, registry));
    errors
}

/// First declaration wins for duplicated ids.
pub(crate) fn module_index(manifest: &Manifest) -> HashMap<&str, usize> {
    let mut index = HashMap::new();
    for (position, module) in manifest.modules.iter().enumerate() {
        index.entry(module.id.as_str()).or_insert(position);
    }
    index
}

fn check_duplicates(manifest: &Manifest) -> Vec<ValidationError> {
    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    let mut errors = Vec::new();
    for module in &manifest.modules {
        if !seen.insert(module.id.as_str()) && reported.insert(module.id.as_str()) {
            errors.push(ValidationError::DuplicateModule {
                id: module.id.clone(),
            });
        }
    }
    errors
}

fn check_existence(manifest: &Manifest, index: &HashMap<&str, usize>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for module in &manifest.modules {
        for dependency in &module.dependencies {
            if !index.contains_key(dependency.as_str()) {
                errors.push(ValidationError::MissingDependency {
                    module: module.id.clone(),
                    missing: dependency.clone(),
                });
            }
        }
    }
    errors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

struct CycleSearch<'a> {
    manifest: &'a Manifest,
    index: &'a HashMap<&'a str, usize>,
    colors: Vec<Color>,
    stack: Vec<usize>,
    seen: BTreeSet<Vec<usize>>,
    cycles: Vec<Vec<usize>>,
}

impl CycleSearch<'_> {
    fn visit(&mut self, node: usize) {
        self.colors[node] = Color::Gray;
        self.stack.push(node);

        let manifest = self.manifest;
        for dependency in &manifest.modules[node].dependencies {
            let Some(&next) = self.index.get(dependency.as_str()) else {
                continue;
            };
            match self.colors[next] {
                Color::White => self.visit(next),
                Color::Gray => self.record_back_edge(next),
                Color::Black => {}
            }
        }

        self.stack.pop();
        self.colors[node] = Color::Black;
    }

    fn record_back_edge(&mut self, target: usize) {
        let Some(start) = self.stack.iter().rposition(|&node| node == target) else {
            return;
        };
        let cycle = self.stack[start..].to_vec();
        if self.seen.insert(canonical_rotation(&cycle)) {
            self.cycles.push(cycle);
        }
    }
}

fn canonical_rotation(cycle: &[usize]) -> Vec<usize> {
    let pivot = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| **node)
        .map(|(position, _)| position)
        .unwrap_or(0);
    cycle[pivot..]
        .iter()
        .chain(cycle[..pivot].iter())
        .copied()
        .collect()
}

fn check_cycles(manifest: &Manifest, index: &HashMap<&str, usize>) -> Vec<ValidationError> {
    let mut search = CycleSearch {
        manifest,
        index,
        colors: vec![Color::White; manifest.modules.len()],
        stack: Vec::new(),
        seen: BTreeSet::new(),
        cycles: Vec::new(),
    };
    for node in 0..manifest.modules.len() {
        if search.colors[node] == Color::White {
            search.visit(node);
        }
    }

    search
        .cycles
        .into_iter()
        .map(|cycle| {
            let mut path = cycle
                .iter()
                .map(|&node| manifest.modules[node].id.clone())
                .collect::<Vec<_>>();
            if let Some(first) = path.first().cloned() {
                path.push(first);
            }
            ValidationError::DependencyCycle { path }
        })
        .collect()
}

fn check_phases(manifest: &Manifest, index: &HashMap<&str, usize>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for module in &manifest.modules {
        for dependency in &module.dependencies {
            let Some(&position) = index.get(dependency.as_str()) else {
                continue;
            };
            let target = &manifest.modules[position];
            if target.phase > module.phase {
                errors.push(ValidationError::PhaseViolation {
                    module: module.id.clone(),
                    module_phase: module.phase,
                    dependency: target.id.clone(),
                    dependency_phase: target.phase,
                });
            }
        }
    }
    errors
}

fn check_name_collisions(manifest: &Manifest) -> Vec<ValidationError> {
    let mut claimed: HashMap<String, &str> = HashMap::new();
    let mut errors = Vec::new();
    for module in &manifest.modules {
        let normalized = normalized_name(&module.id);
        if RESERVED_NAMES.contains(&normalized.as_str()) {
            errors.push(ValidationError::ReservedNameCollision {
                module: module.id.clone(),
                normalized: normalized.clone(),
            });
        }
        match claimed.get(normalized.as_str()) {
            Some(first) if *first != module.id => {
                errors.push(ValidationError::NameCollision {
                    first: (*first).to_string(),
                    second: module.id.clone(),
                    normalized,
                });
            }
            Some(_) => {}
            None => {
                claimed.insert(normalized, module.id.as_str());
            }
        }
    }
    errors
}
