use std::collections::BTreeSet;

use proptest::prelude::*;
use warden_plan::{
    ChangeKind, CommandRole, CommandSpec, ContentHash, FileChange, FileScope, FreezeLimits,
    InputSnapshot, PlanContent, PlanEnvelope, ToolchainManifest,
};

fn plan_with_scope(paths: &BTreeSet<String>) -> PlanContent {
    let mut scope = FileScope::new();
    for p in paths {
        scope = scope.modify(p);
    }
    PlanContent {
        stack: "rust".into(),
        install_command: None,
        compile_command: Some(CommandSpec::new(CommandRole::Compile, "cargo build").unwrap()),
        lint_command: Some(CommandSpec::new(CommandRole::Lint, "cargo clippy").unwrap()),
        run_command: None,
        test_command: Some(CommandSpec::new(CommandRole::Test, "cargo test").unwrap()),
        run_commands: Vec::new(),
        scope,
        test_files: BTreeSet::new(),
        dependencies: BTreeSet::new(),
        lockfile_hash: ContentHash::compute(b"Cargo.lock"),
    }
}

#[test]
fn test_envelope_round_trips_through_json_with_same_hash() {
    let paths: BTreeSet<String> = ["src/lib.rs".to_string()].into_iter().collect();
    let env = PlanEnvelope::freeze(
        plan_with_scope(&paths),
        ContentHash::compute(b"snapshot"),
        "base",
        &FreezeLimits::default(),
    )
    .unwrap();
    let json = serde_json::to_string_pretty(&env).unwrap();
    let back: PlanEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(back.plan_envelope_hash(), env.plan_envelope_hash());
    back.verify_integrity().unwrap();
}

#[test]
fn test_rejects_config_file_outside_app_scope() {
    let content = PlanContent {
        scope: FileScope::new().modify("app.py").create("test_app.py"),
        ..plan_with_scope(&BTreeSet::new())
    };
    let env = PlanEnvelope::freeze(content, ContentHash::default(), "base", &FreezeLimits::default())
        .unwrap();
    let observed = [
        FileChange::new("app.py", ChangeKind::Modified),
        FileChange::new("test_app.py", ChangeKind::Created),
        FileChange::new("config.yaml", ChangeKind::Created),
    ];
    let err = env.check_changes(&observed).unwrap_err();
    assert_eq!(err.offending, vec![FileChange::new("config.yaml", ChangeKind::Created)]);
}

proptest! {
    #[test]
    fn prop_frozen_hash_is_stable(
        paths in proptest::collection::btree_set("[a-z]{1,8}/[a-z]{1,8}\\.rs", 0..20)
    ) {
        let env = PlanEnvelope::freeze(
            plan_with_scope(&paths),
            ContentHash::default(),
            "base",
            &FreezeLimits::default(),
        ).unwrap();
        let observed = env.plan_envelope_hash();
        prop_assert_eq!(observed, env.content().hash().unwrap());
        prop_assert!(env.verify_integrity().is_ok());
        prop_assert_eq!(observed, env.clone().plan_envelope_hash());
    }

    #[test]
    fn prop_snapshot_hash_is_deterministic(
        request in ".{0,64}",
        repo_map in ".{0,64}",
        tree in "[0-9a-f]{40}",
        tools in proptest::collection::btree_map("[a-z]{1,6}", "[0-9.]{1,6}", 0..5),
    ) {
        let manifest: ToolchainManifest = tools.clone().into_iter().collect();
        let a = InputSnapshot::new(request.clone(), repo_map.clone(), tree.clone(), manifest.clone());
        let b = InputSnapshot::new(request, repo_map, tree, manifest);
        prop_assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn prop_undeclared_paths_are_rejected(
        declared in proptest::collection::btree_set("[a-m]{1,6}\\.py", 1..10),
        stray in "[n-z]{1,6}\\.py",
    ) {
        let env = PlanEnvelope::freeze(
            plan_with_scope(&declared),
            ContentHash::default(),
            "base",
            &FreezeLimits::default(),
        ).unwrap();
        let ok: Vec<FileChange> = declared
            .iter()
            .map(|p| FileChange::new(p, ChangeKind::Modified))
            .collect();
        prop_assert!(env.check_changes(&ok).is_ok());

        let mut bad = ok;
        bad.push(FileChange::new(&stray, ChangeKind::Created));
        prop_assert!(env.check_changes(&bad).is_err());
    }
}
