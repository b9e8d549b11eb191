use stackup::mock::{MockRuntime, RuntimeCall};
use stackup::{ConfigError, ServiceId, ServiceState, TopologyError};
use stackup_sample::{Deployment, UpOutcome};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn bundled_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("stackup.toml")
}

/// The bundled deployment file loads, starts and stops cleanly against the mock runtime.
#[tokio::test]
async fn test_bundled_deployment_up_and_down() {
    let mock = Arc::new(MockRuntime::new());
    mock.expect_probes("db").not_ready(2).then_ready();
    let deployment = Deployment::load(bundled_file(), mock.clone()).expect("Failed to load deployment");

    let (start, stop) = deployment.plan().unwrap();
    assert_eq!(start, [ServiceId::from("db"), ServiceId::from("bot")]);
    assert_eq!(stop, [ServiceId::from("bot"), ServiceId::from("db")]);

    let db = deployment.topology().service(&"db".into()).unwrap();
    assert_eq!(db.environment["POSTGRES_PASSWORD"], "change-me");

    let report = deployment.up().await;
    assert!(report.all_ready(), "unexpected report:\n{report}");
    assert_eq!(mock.count(&RuntimeCall::Probe("db".into())), 3);

    let report = deployment.shutdown().await;
    assert_eq!(report.state_of(&"db".into()), Some(ServiceState::Stopped));
    assert_eq!(report.state_of(&"bot".into()), Some(ServiceState::Stopped));
    mock.verify();
}

#[tokio::test]
async fn test_cycle_in_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [[services]]
        name = "a"
        image = "img"
        depends_on = ["b"]

        [[services]]
        name = "b"
        image = "img"
        depends_on = ["a"]
        "#
    )
    .unwrap();

    let result = Deployment::load(file.path(), Arc::new(MockRuntime::new()));

    assert!(matches!(
        result,
        Err(ConfigError::Topology(TopologyError::CyclicDependency(_)))
    ));
}

#[tokio::test]
async fn test_missing_env_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stackup.toml");
    std::fs::write(
        &path,
        "[[services]]\nname = \"db\"\nimage = \"postgres\"\nenv_file = \"missing.env\"\n",
    )
    .unwrap();

    let result = Deployment::load(&path, Arc::new(MockRuntime::new()));

    assert!(matches!(
        result,
        Err(ConfigError::Io { ref path, .. }) if path.ends_with("missing.env")
    ));
}

/// An interrupt mid-start winds the start down and halts the container it returns late.
#[tokio::test]
async fn test_interrupted_up_leaves_no_container_behind() {
    let mock = Arc::new(MockRuntime::new());
    mock.slow_start("db", Duration::from_millis(50));
    let deployment = Deployment::load(bundled_file(), mock.clone()).expect("Failed to load deployment");

    let outcome = deployment
        .up_until(tokio::time::sleep(Duration::from_millis(10)))
        .await;

    let UpOutcome::Interrupted(report) = outcome else {
        panic!("expected the start to be interrupted, got {outcome:?}");
    };
    assert_eq!(report.state_of(&"db".into()), Some(ServiceState::Stopped));
    assert_eq!(report.state_of(&"bot".into()), Some(ServiceState::Stopped));
    assert_eq!(mock.count(&RuntimeCall::Start("bot".into())), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.count(&RuntimeCall::Start("db".into())), 1);
    assert_eq!(mock.count(&RuntimeCall::Stop("db".into())), 1);
}
