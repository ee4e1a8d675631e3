// tests/integration/qos_test.rs

//! QoS classification and assignment scenarios.

use crate::integration::test_helpers::TestContext;
use garnetfs::core::CoreError;
use garnetfs::core::namespace::qos::{ATTR_QOS_CLASS, ATTR_QOS_TARGET, QosClass, layout_id};

fn bronze() -> QosClass {
    QosClass {
        name: "bronze".to_string(),
        layout: "replica".to_string(),
        replica: 2,
        checksum: "adler".to_string(),
        placement: "scattered".to_string(),
    }
}

/// A container whose layout tuple matches a registered class converges onto
/// that class name: the first listing derives and persists it, the second
/// reads the stored attribute.
#[tokio::test]
async fn test_qos_convergence_on_container() {
    let ctx = TestContext::new();
    ctx.engine().qos.register(bronze()).unwrap();

    let registry = &ctx.engine().registry;
    registry.make_dir_p("/data/proj", 0, 0).unwrap();

    for (key, value) in [
        ("sys.forced.layout", "replica"),
        ("sys.forced.nstripes", "2"),
        ("sys.forced.checksum", "adler"),
        ("sys.forced.placement", "scattered"),
    ] {
        ctx.engine()
            .attr_set("/data/proj", key, value, &ctx.vid_root, false)
            .unwrap();
    }

    let current = ctx.engine().qos_ls("/data/proj", &ctx.vid_root).unwrap();
    assert_eq!(current, "bronze");

    // Derivation persisted the class.
    let stored = ctx
        .engine()
        .attr_get("/data/proj", ATTR_QOS_CLASS, &ctx.vid_root)
        .unwrap();
    assert_eq!(stored, "bronze");

    // Remove the forced attributes: the second listing must not re-derive.
    ctx.engine()
        .attr_rm("/data/proj", "sys.forced.layout", &ctx.vid_root)
        .unwrap();
    let again = ctx.engine().qos_ls("/data/proj", &ctx.vid_root).unwrap();
    assert_eq!(again, "bronze");
}

/// Assigning the class an entity already has is refused.
#[tokio::test]
async fn test_qos_set_rejects_same_target() {
    let ctx = TestContext::new();
    ctx.engine().qos.register(bronze()).unwrap();

    let registry = &ctx.engine().registry;
    registry.make_dir_p("/data/proj", 0, 0).unwrap();
    ctx.engine()
        .attr_set("/data/proj", ATTR_QOS_CLASS, "bronze", &ctx.vid_root, false)
        .unwrap();

    let err = ctx
        .engine()
        .qos_set("/data/proj", &ctx.vid_root, "bronze")
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));
}

/// Assigning a class to a file synthesizes a conversion identifier, creates
/// the proc marker entry and stores the pending target.
#[tokio::test]
async fn test_qos_set_on_file_schedules_conversion() {
    let ctx = TestContext::new();
    ctx.engine().qos.register(bronze()).unwrap();

    let fid = ctx.make_file("payload", 100, &[]);

    let conversion_id = ctx
        .engine()
        .qos_set("/data/payload", &ctx.vid_root, "bronze")
        .unwrap();

    let expected_lid = layout_id::build(layout_id::TYPE_REPLICA, layout_id::CKS_ADLER, 2);
    assert_eq!(
        conversion_id,
        format!("{fid:016x}:default#{expected_lid:08x}~scattered")
    );

    // The marker entry exists under the proc conversion container.
    let marker = format!("/proc/conversion/{conversion_id}");
    assert!(ctx.engine().registry.resolve_file(&marker).is_ok());

    let target = ctx
        .engine()
        .attr_get("/data/payload", ATTR_QOS_TARGET, &ctx.vid_root)
        .unwrap();
    assert_eq!(target, "bronze");
}

/// Assigning a class to a container stores the target attribute only.
#[tokio::test]
async fn test_qos_set_on_container_stores_target() {
    let ctx = TestContext::new();
    ctx.engine().qos.register(bronze()).unwrap();

    ctx.engine().registry.make_dir_p("/data/cold", 0, 0).unwrap();
    let id = ctx
        .engine()
        .qos_set("/data/cold", &ctx.vid_root, "bronze")
        .unwrap();
    assert_eq!(id, "/data/cold|bronze");

    let target = ctx
        .engine()
        .attr_get("/data/cold", ATTR_QOS_TARGET, &ctx.vid_root)
        .unwrap();
    assert_eq!(target, "bronze");

    assert!(
        ctx.engine()
            .registry
            .resolve_file(&format!("/proc/conversion/{id}"))
            .is_err()
    );
}

/// Unknown classes and out-of-range replica counts are rejected at
/// registration.
#[tokio::test]
async fn test_qos_registry_validation() {
    let ctx = TestContext::new();

    let mut bad = bronze();
    bad.replica = 17;
    assert!(matches!(
        ctx.engine().qos.register(bad),
        Err(CoreError::Invalid(_))
    ));

    let mut bad = bronze();
    bad.layout = "mirrored".to_string();
    assert!(matches!(
        ctx.engine().qos.register(bad),
        Err(CoreError::Invalid(_))
    ));

    let err = ctx
        .engine()
        .qos_set("/data", &ctx.vid_root, "gold")
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}
