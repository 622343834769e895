// tests/catalog_integration.rs

//! Runs driven by a TOML module catalog.

mod common;

use common::{CATALOG, SOFTWARE_HIVE, TELEMETRY_KEY, setup_host};
use wimsmith::{
    Catalog, Environment, IntegrityCheck, ModuleRegistry, ModuleStatus, RegValue, RunOutcome,
    RunRequest,
};

fn catalog_registry(content: &str) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    Catalog::parse(content)
        .unwrap()
        .register_into(&mut registry)
        .unwrap();
    registry
}

#[test]
fn test_catalog_plan_includes_always_modules() {
    let host = setup_host();
    let orchestrator = host.orchestrator(catalog_registry(CATALOG));

    let plan = orchestrator
        .plan(&RunRequest::new(&host.image, 1).with_modules(["remove_smb1"]))
        .unwrap();
    assert_eq!(plan.order(), vec!["remove_smb1", "audit_marker"]);
}

#[test]
fn test_catalog_run_applies_registry_and_features() {
    let host = setup_host();
    let orchestrator = host.orchestrator(catalog_registry(CATALOG));

    let result = orchestrator.run(
        &RunRequest::new(&host.image, 1).with_modules(["remove_smb1", "disable_telemetry"]),
    );

    assert_eq!(result.outcome, RunOutcome::Committed);
    assert_eq!(
        result.plan,
        vec!["disable_telemetry", "remove_smb1", "audit_marker"]
    );
    for report in &result.modules {
        assert_eq!(report.status, ModuleStatus::Succeeded, "{}", report.id);
    }

    let hive = host.stored_hive(&host.image, SOFTWARE_HIVE);
    assert_eq!(
        hive.get(TELEMETRY_KEY).and_then(|values| values.get("AllowTelemetry")),
        Some(&RegValue::Dword(0))
    );
    assert_eq!(
        hive.get("wimsmith").and_then(|values| values.get("Customized")),
        Some(&RegValue::String("yes".to_string()))
    );
    assert_eq!(host.stored_features(&host.image).get("SMB1Protocol"), Some(&false));
    assert!(host.sim.loaded_hives().is_empty());
}

#[test]
fn test_failing_critical_catalog_module_rolls_back() {
    let host = setup_host();
    let before = host.hash();
    let catalog = r#"
[[module]]
id = "drop_cortana"
label = "Remove Cortana policy"
priority = 5
critical = true

[[module.registry]]
hive = "software"
key = 'Policies\Microsoft\Windows\Windows Search'
name = "AllowCortana"
delete = true
"#;
    let orchestrator = host.orchestrator(catalog_registry(catalog));

    let result = orchestrator.run(&RunRequest::new(&host.image, 1).with_modules(["drop_cortana"]));

    assert_eq!(result.outcome, RunOutcome::RolledBack);
    assert!(result.status_of("drop_cortana").unwrap().is_failed());
    assert_eq!(result.integrity, IntegrityCheck::Verified);
    assert_eq!(host.hash(), before);
    assert!(host.sim.loaded_hives().is_empty());
}

#[test]
fn test_feature_module_excluded_without_feature_capability() {
    let host = setup_host();
    let orchestrator = host
        .orchestrator(catalog_registry(CATALOG))
        .with_environment(Environment::with_capabilities([
            wimsmith::Capability::Registry,
        ]));

    let result = orchestrator.run(&RunRequest::new(&host.image, 1).with_modules(["remove_smb1"]));

    assert_eq!(result.outcome, RunOutcome::Committed);
    assert_eq!(result.plan, vec!["audit_marker"]);
    assert!(result.status_of("remove_smb1").unwrap().is_skipped());
    assert!(host.stored_features(&host.image).is_empty());
}
