// tests/integration/stripes_test.rs

//! Stripe lifecycle scenarios: verify, drop and replicate.

use crate::integration::test_helpers::TestContext;
use garnetfs::core::CoreError;
use garnetfs::core::namespace::attr::ATTR_FS_TRACKING;
use garnetfs::core::namespace::entity::{Identity, TAPE_FS_ID};
use garnetfs::core::namespace::TrackerType;

/// Verification builds the opaque out-of-band query and sends it to the
/// owning storage node without touching metadata.
#[tokio::test]
async fn test_verify_stripe_sends_query() {
    let ctx = TestContext::new();
    ctx.register_fs(7);
    let fid = ctx.make_file("v1", 100, &[7]);

    ctx.engine()
        .verify_stripe("/data/v1", &ctx.vid_root, 7, "&mgm.verify.checksum=1")
        .await
        .unwrap();

    let recorded = ctx.storage.recorded();
    assert_eq!(recorded.len(), 1);

    let (host, port, request) = &recorded[0];
    assert_eq!(host, "fst07.example");
    assert_eq!(*port, 1095);
    assert!(request.starts_with("/?fst.pcmd=verify"));
    assert!(request.contains(&format!("&mgm.fid={fid:08x}")));
    assert!(request.contains("&mgm.access=verify"));
    assert!(request.contains("&mgm.fsid=7"));
    assert!(request.contains("&mgm.localprefix=/data07"));
    assert!(request.contains("&mgm.path=/data/v1"));
    assert!(request.contains("&mgm.verify.checksum=1"));
}

/// Verification against a filesystem the view does not know returns the
/// not-found kind.
#[tokio::test]
async fn test_verify_stripe_unknown_filesystem() {
    let ctx = TestContext::new();
    ctx.make_file("v2", 100, &[]);

    let err = ctx
        .engine()
        .verify_stripe("/data/v2", &ctx.vid_root, 99, "")
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::NotFound(_)));
    assert_eq!(err.errno(), libc::ENOENT);
}

/// An unreachable storage node surfaces as a transport error and leaves the
/// metadata untouched.
#[tokio::test]
async fn test_verify_stripe_transport_failure() {
    let ctx = TestContext::new();
    ctx.register_fs(7);
    ctx.make_file("v3", 100, &[7]);
    ctx.storage.set_fail(true);

    let err = ctx
        .engine()
        .verify_stripe("/data/v3", &ctx.vid_root, 7, "")
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Transport(_)));
    assert_eq!(err.errno(), libc::ECOMM);
}

/// A soft drop unlinks the location and appends the membership change to
/// the tracking attribute.
#[tokio::test]
async fn test_drop_stripe_soft() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.register_fs(5);
    let fid = ctx.make_file("d1", 100, &[3, 5]);

    ctx.engine()
        .drop_stripe("/data/d1", &ctx.vid_root, 3, false)
        .unwrap();

    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert_eq!(file.locations(), vec![5]);
    assert_eq!(file.xattr(ATTR_FS_TRACKING).as_deref(), Some("-3"));

    // The unlinked location is kept for the physical deletion pass.
    let unlinked = file.md().run_read_op(|f| f.unlinked_locations.clone());
    assert_eq!(unlinked, vec![3]);
}

/// A forced drop removes the location outright and erases the reverse
/// filesystem index entry.
#[tokio::test]
async fn test_drop_stripe_force() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    let fid = ctx.make_file("d2", 100, &[3]);
    assert_eq!(ctx.engine().fsview.files_on(3), vec![fid]);

    ctx.engine()
        .drop_stripe("/data/d2", &ctx.vid_root, 3, true)
        .unwrap();

    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert!(file.locations().is_empty());
    assert!(file.md().run_read_op(|f| f.unlinked_locations.is_empty()));
    assert!(ctx.engine().fsview.files_on(3).is_empty());
}

/// Dropping a location the file does not have reports not-found.
#[tokio::test]
async fn test_drop_stripe_missing_location() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.make_file("d3", 100, &[3]);

    let err = ctx
        .engine()
        .drop_stripe("/data/d3", &ctx.vid_root, 8, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

/// A file whose only location is the tape sentinel is left alone.
#[tokio::test]
async fn test_drop_stripe_tape_only_is_noop() {
    let ctx = TestContext::new();
    let fid = ctx.make_file("t1", 100, &[TAPE_FS_ID]);

    ctx.engine()
        .drop_stripe("/data/t1", &ctx.vid_root, TAPE_FS_ID, true)
        .unwrap();

    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert_eq!(file.locations(), vec![TAPE_FS_ID]);
}

/// Drop-all unlinks every location but skips the tape sentinel.
#[tokio::test]
async fn test_drop_all_stripes_skips_tape() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.register_fs(5);
    let fid = ctx.make_file("d4", 100, &[3, 5, TAPE_FS_ID]);

    ctx.engine()
        .drop_all_stripes("/data/d4", &ctx.vid_root, true)
        .unwrap();

    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert_eq!(file.locations(), vec![TAPE_FS_ID]);
}

/// Replication validates source and target locations and deduplicates per
/// file id.
#[tokio::test]
async fn test_replicate_stripe_validation_and_tracking() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.register_fs(5);
    let fid = ctx.make_file("r1", 100, &[3]);

    // Source missing.
    let err = ctx
        .engine()
        .replicate_stripe("/data/r1", &ctx.vid_root, 8, 5, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::NoSuchLocation(_)));
    assert_eq!(err.errno(), libc::ENODATA);

    // Target already present.
    let err = ctx
        .engine()
        .replicate_stripe("/data/r1", &ctx.vid_root, 3, 3, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));

    // First valid schedule succeeds and tracks the fid.
    ctx.engine()
        .replicate_stripe("/data/r1", &ctx.vid_root, 3, 5, false)
        .unwrap();
    assert!(ctx.engine().fid_tracker.is_tracked(fid));

    // A second schedule for the same fid is busy.
    let err = ctx
        .engine()
        .replicate_stripe("/data/r1", &ctx.vid_root, 3, 5, true)
        .unwrap_err();
    assert!(matches!(err, CoreError::Busy(_)));
    assert_eq!(err.errno(), libc::ETXTBSY);

    ctx.engine().fid_tracker.remove_entry(fid);
    assert!(!ctx.engine().fid_tracker.is_tracked(fid));
}

/// The tracker distinguishes nothing by type: one entry per fid.
#[tokio::test]
async fn test_fid_tracker_dedupe() {
    let ctx = TestContext::new();
    let tracker = &ctx.engine().fid_tracker;

    assert!(tracker.add_entry(42, TrackerType::Drain));
    assert!(!tracker.add_entry(42, TrackerType::Balance));
    tracker.remove_entry(42);
    assert!(tracker.add_entry(42, TrackerType::Convert));
    tracker.remove_entry(42);
}

/// Stripe mutations demand W+X on the parent; a token scope does not
/// qualify.
#[tokio::test]
async fn test_stripe_permissions() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.make_file("p1", 100, &[3]);

    let plain = Identity::user(1001, 100);
    let err = ctx
        .engine()
        .drop_stripe("/data/p1", &plain, 3, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotPermitted(_)));

    let mut token = Identity::root();
    token.has_token = true;
    token.sudoer = false;
    token.uid = 1001;
    let err = ctx
        .engine()
        .drop_stripe("/data/p1", &token, 3, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotPermitted(_)));
}
