use std::collections::BTreeSet;

use envforge_core::{
    ChecksumRegistry, Defaults, InstallMode, InstallSpec, Manifest, Module, RunAs, Step,
    VerifiedInstaller,
};
use proptest::prelude::*;

use super::*;

fn module(id: &str, phase: u8, dependencies: &[&str]) -> Module {
    Module {
        id: id.to_string(),
        phase,
        run_as: RunAs::Root,
        description: None,
        dependencies: dependencies.iter().map(|dep| dep.to_string()).collect(),
        tags: BTreeSet::new(),
        optional: false,
        enabled_by_default: true,
        installed_check: None,
        install: InstallSpec::Steps(vec![Step {
            run_as: RunAs::Root,
            command: format!("install-{id}"),
        }]),
        verify: vec![Step {
            run_as: RunAs::Root,
            command: format!("verify-{id}"),
        }],
    }
}

fn tagged(mut module: Module, tags: &[&str]) -> Module {
    module.tags = tags.iter().map(|tag| tag.to_string()).collect();
    module
}

fn not_default(mut module: Module) -> Module {
    module.enabled_by_default = false;
    module
}

fn manifest(modules: Vec<Module>) -> Manifest {
    Manifest {
        version: 1,
        defaults: Defaults::default(),
        modules,
        upgrade: None,
    }
}

fn plan_ids(plan: &ExecutionPlan) -> Vec<&str> {
    plan.ids().collect()
}

#[test]
fn later_phase_dependency_reports_exactly_one_phase_violation() {
    let manifest = manifest(vec![
        module("a", 1, &[]),
        module("b", 2, &["a"]),
        module("c", 1, &["b"]),
    ]);

    let errors = validate(&manifest);
    assert_eq!(
        errors,
        vec![ValidationError::PhaseViolation {
            module: "c".to_string(),
            module_phase: 1,
            dependency: "b".to_string(),
            dependency_phase: 2,
        }]
    );
}

#[test]
fn reports_missing_dependency() {
    let manifest = manifest(vec![module("a", 1, &["ghost"])]);
    assert_eq!(
        validate(&manifest),
        vec![ValidationError::MissingDependency {
            module: "a".to_string(),
            missing: "ghost".to_string(),
        }]
    );
}

#[test]
fn cycle_closing_edge_reports_every_module_in_the_cycle() {
    for size in 2..=6_usize {
        let ids = (0..size).map(|n| format!("m{n}")).collect::<Vec<_>>();
        let mut modules = Vec::new();
        for (position, id) in ids.iter().enumerate() {
            let dependencies = if position == 0 {
                vec![ids[size - 1].as_str()]
            } else {
                vec![ids[position - 1].as_str()]
            };
            modules.push(module(id, 1, &dependencies));
        }
        let errors = validate(&manifest(modules));

        let cycles = errors
            .iter()
            .filter_map(|error| match error {
                ValidationError::DependencyCycle { path } => Some(path),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(cycles.len(), 1, "size {size}: unexpected errors {errors:?}");
        let path = cycles[0];
        assert_eq!(path.first(), path.last(), "cycle path must be closed");
        let members = path.iter().cloned().collect::<BTreeSet<_>>();
        let expected = ids.iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(members, expected);
        assert_eq!(path.len(), size + 1);
    }
}

#[test]
fn self_dependency_is_a_cycle() {
    let errors = validate(&manifest(vec![module("a", 1, &["a"])]));
    assert_eq!(
        errors,
        vec![ValidationError::DependencyCycle {
            path: vec!["a".to_string(), "a".to_string()],
        }]
    );
}

#[test]
fn cycle_rendering_names_the_full_path() {
    let errors = validate(&manifest(vec![
        module("a", 1, &["b"]),
        module("b", 1, &["a"]),
    ]));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "dependency cycle: a -> b -> a");
}

#[test]
fn name_collisions_and_reserved_names_are_reported() {
    let errors = validate(&manifest(vec![
        module("tools.node-js", 1, &[]),
        module("tools.node_js", 1, &[]),
        module("print.plan", 1, &[]),
    ]));
    assert_eq!(
        errors,
        vec![
            ValidationError::NameCollision {
                first: "tools.node-js".to_string(),
                second: "tools.node_js".to_string(),
                normalized: "tools_node_js".to_string(),
            },
            ValidationError::ReservedNameCollision {
                module: "print.plan".to_string(),
                normalized: "print_plan".to_string(),
            },
        ]
    );
}

#[test]
fn duplicate_ids_are_reported_once() {
    let errors = validate(&manifest(vec![
        module("a", 1, &[]),
        module("a", 1, &[]),
        module("a", 1, &[]),
    ]));
    assert_eq!(
        errors,
        vec![ValidationError::DuplicateModule {
            id: "a".to_string()
        }]
    );
}

#[test]
fn validation_accumulates_every_category_of_error() {
    let errors = validate(&manifest(vec![
        module("a", 2, &["missing"]),
        module("b", 1, &["c"]),
        module("c", 1, &["b"]),
        module("d", 1, &["a"]),
        module("run", 1, &[]),
    ]));

    assert!(errors
        .iter()
        .any(|error| matches!(error, ValidationError::MissingDependency { .. })));
    assert!(errors
        .iter()
        .any(|error| matches!(error, ValidationError::DependencyCycle { .. })));
    assert!(errors
        .iter()
        .any(|error| matches!(error, ValidationError::PhaseViolation { .. })));
    assert!(errors
        .iter()
        .any(|error| matches!(error, ValidationError::ReservedNameCollision { .. })));
}

#[test]
fn verified_installer_without_registry_entry_is_invalid() {
    let mut rust = module("runtimes.rust", 2, &[]);
    rust.install = InstallSpec::Verified(VerifiedInstaller {
        tool: "rustup".to_string(),
        url: "https://example.test/rustup.sh".to_string(),
        runner: "sh".to_string(),
        args: vec!["-y".to_string()],
    });
    let manifest = manifest(vec![rust]);

    let empty = ChecksumRegistry::default();
    assert_eq!(
        validate_all(&manifest, &empty),
        vec![ValidationError::MissingChecksum {
            module: "runtimes.rust".to_string(),
            key: "rustup".to_string(),
        }]
    );

    let mut registry = ChecksumRegistry::default();
    registry
        .insert(
            "rustup",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .expect("valid digest");
    assert!(validate_all(&manifest, &registry).is_empty());
}

#[test]
fn default_selection_uses_enabled_by_default_modules() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        not_default(module("extras.games", 3, &["system.base"])),
        module("runtimes.node", 2, &["system.base"]),
    ]);
    let plan = compile(&manifest, &Selection::default()).expect("must compile");
    assert_eq!(plan_ids(&plan), vec!["system.base", "runtimes.node"]);
    assert!(plan
        .entries
        .iter()
        .all(|entry| entry.reason == InclusionReason::Default));
}

#[test]
fn minimal_mode_seeds_only_critical_modules() {
    let mut manifest = manifest(vec![
        tagged(module("system.base", 1, &[]), &["critical"]),
        module("runtimes.node", 2, &["system.base"]),
        tagged(module("shell.zsh", 2, &["system.base"]), &["critical"]),
    ]);
    manifest.defaults.mode = InstallMode::Minimal;
    let plan = compile(&manifest, &Selection::default()).expect("must compile");
    assert_eq!(plan_ids(&plan), vec!["system.base", "shell.zsh"]);
    assert_eq!(plan.mode, InstallMode::Minimal);
}

#[test]
fn tag_selection_pulls_runtime_through_closure() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        tagged(module("runtimes.node", 2, &["system.base"]), &["runtime"]),
        tagged(
            not_default(module("agents.codex", 5, &["runtimes.node"])),
            &["agents"],
        ),
        module("editors.vim", 3, &["system.base"]),
    ]);

    let selection = Selection::from_tokens(&["tag:agents"], &[]);
    let plan = compile(&manifest, &selection).expect("must compile");

    assert_eq!(
        plan_ids(&plan),
        vec!["system.base", "runtimes.node", "agents.codex"]
    );
    let runtime = plan.entry("runtimes.node").expect("runtime included");
    assert_eq!(
        runtime.reason,
        InclusionReason::DependencyClosure {
            required_by: "agents.codex".to_string()
        }
    );
    assert!(runtime.reason.to_string().starts_with("dependency-closure"));
    assert_eq!(
        plan.entry("agents.codex").map(|entry| &entry.reason),
        Some(&InclusionReason::Tag {
            tag: "agents".to_string()
        })
    );
}

#[test]
fn bare_selector_resolves_id_then_tag_then_category() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        tagged(module("runtimes.node", 2, &["system.base"]), &["web"]),
        module("runtimes.go", 2, &["system.base"]),
    ]);

    let by_id = compile(&manifest, &Selection::from_tokens(&["runtimes.go"], &[]))
        .expect("must compile");
    assert_eq!(plan_ids(&by_id), vec!["system.base", "runtimes.go"]);
    assert_eq!(
        by_id.entry("runtimes.go").map(|entry| &entry.reason),
        Some(&InclusionReason::Explicit)
    );

    let by_tag =
        compile(&manifest, &Selection::from_tokens(&["web"], &[])).expect("must compile");
    assert_eq!(plan_ids(&by_tag), vec!["system.base", "runtimes.node"]);

    let by_category =
        compile(&manifest, &Selection::from_tokens(&["runtimes"], &[])).expect("must compile");
    assert_eq!(
        plan_ids(&by_category),
        vec!["system.base", "runtimes.node", "runtimes.go"]
    );
}

#[test]
fn unknown_selector_is_a_selection_error() {
    let manifest = manifest(vec![module("system.base", 1, &[])]);
    let err = compile(&manifest, &Selection::from_tokens(&["tag:nope"], &[]))
        .expect_err("unknown tag must fail");
    assert_eq!(
        err,
        PlanError::Selection(SelectionError::UnknownSelector {
            selector: "tag:nope".to_string()
        })
    );
}

#[test]
fn skipping_a_required_dependency_is_unsatisfiable() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        module("runtimes.node", 2, &["system.base"]),
    ]);
    let err = compile(&manifest, &Selection::from_tokens(&[], &["system.base"]))
        .expect_err("skip of required dependency must fail");
    assert_eq!(
        err,
        PlanError::Selection(SelectionError::UnsatisfiableExclusion {
            excluded: "system.base".to_string(),
            dependent: "runtimes.node".to_string(),
        })
    );
}

#[test]
fn skipping_a_leaf_module_drops_it() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        module("runtimes.node", 2, &["system.base"]),
    ]);
    let plan = compile(&manifest, &Selection::from_tokens(&[], &["runtimes.node"]))
        .expect("must compile");
    assert_eq!(plan_ids(&plan), vec!["system.base"]);
}

#[test]
fn skipping_unknown_module_is_rejected() {
    let manifest = manifest(vec![module("system.base", 1, &[])]);
    let err = compile(&manifest, &Selection::from_tokens(&[], &["nope"]))
        .expect_err("unknown skip must fail");
    assert_eq!(
        err,
        PlanError::Selection(SelectionError::UnknownModule {
            id: "nope".to_string()
        })
    );
}

#[test]
fn invalid_manifest_never_compiles() {
    let manifest = manifest(vec![module("a", 1, &["b"]), module("b", 2, &[])]);
    match compile(&manifest, &Selection::default()) {
        Err(PlanError::Invalid(errors)) => assert_eq!(errors.len(), 1),
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn same_phase_dependencies_come_first_then_declaration_order() {
    let manifest = manifest(vec![
        module("tools.zeta", 2, &["tools.alpha"]),
        module("tools.beta", 2, &[]),
        module("tools.alpha", 2, &[]),
        module("system.base", 1, &[]),
    ]);
    let plan = compile(&manifest, &Selection::default()).expect("must compile");
    assert_eq!(
        plan_ids(&plan),
        vec!["system.base", "tools.beta", "tools.alpha", "tools.zeta"]
    );
}

#[test]
fn compiling_twice_is_byte_identical() {
    let manifest = manifest(vec![
        module("system.base", 1, &[]),
        tagged(module("runtimes.node", 2, &["system.base"]), &["runtime"]),
        module("runtimes.go", 2, &["system.base"]),
        tagged(module("agents.codex", 4, &["runtimes.node"]), &["agents"]),
    ]);
    let selection = Selection::from_tokens(&["agents", "runtimes.go"], &[]);

    let first = compile(&manifest, &selection)
        .expect("must compile")
        .to_json()
        .expect("must serialize");
    let second = compile(&manifest, &selection)
        .expect("must compile")
        .to_json()
        .expect("must serialize");
    assert_eq!(first, second);
    assert!(first.contains("\"dependency-closure\""));
}

#[test]
fn selector_parse_recognizes_prefixes() {
    assert_eq!(Selector::parse("tag:agents"), Selector::Tag("agents".to_string()));
    assert_eq!(
        Selector::parse("category:runtimes"),
        Selector::Category("runtimes".to_string())
    );
    assert_eq!(Selector::parse("id:a.b"), Selector::Id("a.b".to_string()));
    assert_eq!(Selector::parse("a.b"), Selector::Auto("a.b".to_string()));
}

fn generated_manifest(shape: &[(u8, Vec<prop::sample::Index>)]) -> Manifest {
    let mut phases: Vec<u8> = Vec::new();
    let mut modules = Vec::new();
    for (position, (phase, picks)) in shape.iter().enumerate() {
        let mut dependencies = BTreeSet::new();
        if position > 0 {
            for pick in picks {
                dependencies.insert(pick.index(position));
            }
        }
        let phase = dependencies
            .iter()
            .map(|&dep| phases[dep])
            .max()
            .map_or(*phase, |max| max.max(*phase));
        phases.push(phase);
        let ids = dependencies
            .iter()
            .map(|dep| format!("m{dep}"))
            .collect::<Vec<_>>();
        let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
        modules.push(module(&format!("m{position}"), phase, &refs));
    }
    modules.reverse();
    manifest(modules)
}

proptest! {
    #[test]
    fn accepted_manifests_compile_to_dependency_respecting_plans(
        shape in prop::collection::vec(
            (1_u8..=10, prop::collection::vec(any::<prop::sample::Index>(), 0..3)),
            1..14,
        )
    ) {
        let manifest = generated_manifest(&shape);
        prop_assert!(validate(&manifest).is_empty());

        for module in &manifest.modules {
            for dependency in &module.dependencies {
                let target = manifest.module(dependency).expect("dependency exists");
                prop_assert!(target.phase <= module.phase);
            }
        }

        let plan = compile(&manifest, &Selection::default()).expect("must compile");
        prop_assert_eq!(plan.len(), manifest.modules.len());
        for entry in &plan.entries {
            let module = manifest.module(&entry.id).expect("module exists");
            let position = plan.position(&entry.id).expect("entry present");
            for dependency in &module.dependencies {
                let dependency_position = plan.position(dependency).expect("dependency planned");
                prop_assert!(dependency_position < position);
            }
        }
        let phases = plan.entries.iter().map(|entry| entry.phase).collect::<Vec<_>>();
        prop_assert!(phases.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
