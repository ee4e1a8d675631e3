// tests/integration/commit_test.rs

//! Storage-node commit protocol scenarios.

use crate::integration::test_helpers::TestContext;
use garnetfs::core::CoreError;
use garnetfs::core::namespace::commit::CommitArgs;
use garnetfs::core::namespace::registry::ConfigStatus;

/// A replica commit advertising the wrong size is rejected with the size
/// conflict kind and leaves the location list unchanged.
#[tokio::test]
async fn test_commit_size_mismatch() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.register_fs(7);

    let fid = ctx.make_file("f1", 1000, &[3]);

    let args = CommitArgs::replica(7, fid, "/data/f1", 999);
    let err = ctx.engine().commit(&args, &ctx.vid_root).unwrap_err();

    assert!(matches!(err, CoreError::SizeMismatch(_)));
    assert_eq!(err.errno(), libc::EBADE);

    // The rejected location is absent, the original one untouched.
    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert_eq!(file.locations(), vec![3]);
}

/// A replica commit advertising the wrong checksum maps to the distinct
/// checksum conflict kind.
#[tokio::test]
async fn test_commit_checksum_mismatch() {
    let ctx = TestContext::new();
    ctx.register_fs(5);

    let fid = ctx.make_file("f2", 4096, &[]);
    let file = ctx.engine().registry.get_file(fid).unwrap();
    file.md().run_write_op(|f| f.checksum = vec![0xaa, 0xbb]);

    let mut args = CommitArgs::replica(5, fid, "/data/f2", 4096);
    args.commit_checksum = true;
    args.checksum = vec![0xde, 0xad];

    let err = ctx.engine().commit(&args, &ctx.vid_root).unwrap_err();
    assert!(matches!(err, CoreError::ChecksumMismatch(_)));
    assert_eq!(err.errno(), libc::EBADR);
    assert!(file.locations().is_empty());
}

/// A matching replica commit registers the new location and drops the
/// requested sibling.
#[tokio::test]
async fn test_commit_success_adds_location_and_drops_sibling() {
    let ctx = TestContext::new();
    ctx.register_fs(3);
    ctx.register_fs(7);

    let fid = ctx.make_file("f3", 2048, &[3]);

    let mut args = CommitArgs::replica(7, fid, "/data/f3", 2048);
    args.drop_fsid = Some(3);
    ctx.engine().commit(&args, &ctx.vid_root).unwrap();

    let file = ctx.engine().registry.get_file(fid).unwrap();
    assert_eq!(file.locations(), vec![7]);
}

/// Commits against a filesystem below the drain state are refused.
#[tokio::test]
async fn test_commit_rejected_on_non_operational_filesystem() {
    let ctx = TestContext::new();
    ctx.register_fs(4);
    ctx.engine().fsview.set_config_status(4, ConfigStatus::Empty);

    let fid = ctx.make_file("f4", 100, &[]);
    let args = CommitArgs::replica(4, fid, "/data/f4", 100);

    let err = ctx.engine().commit(&args, &ctx.vid_root).unwrap_err();
    assert!(matches!(err, CoreError::NonOperational(_)));
    assert_eq!(err.errno(), libc::EIO);
}

/// A commit for a vanished file reports the identifier as removed.
#[tokio::test]
async fn test_commit_gone_file() {
    let ctx = TestContext::new();
    ctx.register_fs(4);

    let args = CommitArgs::replica(4, 424242, "/data/none", 1);
    let err = ctx.engine().commit(&args, &ctx.vid_root).unwrap_err();
    assert!(matches!(err, CoreError::Gone(_)));
    assert_eq!(err.errno(), libc::EIDRM);
}

/// A commit whose path resolves to a different file id is invalid.
#[tokio::test]
async fn test_commit_wrong_file_id() {
    let ctx = TestContext::new();
    ctx.register_fs(4);

    let fid_a = ctx.make_file("a", 10, &[]);
    let _fid_b = ctx.make_file("b", 10, &[]);

    let args = CommitArgs::replica(4, fid_a, "/data/b", 10);
    let err = ctx.engine().commit(&args, &ctx.vid_root).unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));
    assert_eq!(err.errno(), libc::EINVAL);
}

/// An atomic upload materializes its final name on commit, displacing the
/// previous version to a `.delete` name for asynchronous removal.
#[tokio::test]
async fn test_commit_atomic_rename() {
    let ctx = TestContext::new();
    ctx.register_fs(4);

    let old_fid = ctx.make_file("report", 500, &[4]);
    let tmp_fid = ctx.make_file(".report.atomic.1", 700, &[]);

    let mut args = CommitArgs::replica(4, tmp_fid, "/data/report", 700);
    args.atomic = true;
    ctx.engine().commit(&args, &ctx.vid_root).unwrap();

    let registry = &ctx.engine().registry;
    let final_file = registry.resolve_file("/data/report").unwrap();
    assert_eq!(final_file.id(), tmp_fid);

    // The previous version was moved aside, not destroyed.
    let aside = registry.resolve_file("/data/report.delete").unwrap();
    assert_eq!(aside.id(), old_fid);
}

/// A non-final chunk updates metadata without de-atomizing; the closing
/// chunk performs the rename.
#[tokio::test]
async fn test_commit_chunked_upload() {
    let ctx = TestContext::new();
    ctx.register_fs(4);

    let tmp_fid = ctx.make_file(".big.atomic.7", 0, &[]);

    let mut chunk = CommitArgs::replica(4, tmp_fid, "/data/big", 1024);
    chunk.atomic = true;
    chunk.oc_chunk = true;
    chunk.oc_chunk_n = 1;
    chunk.is_replica = false;
    ctx.engine().commit(&chunk, &ctx.vid_root).unwrap();

    // Not yet final, the temporary name stands.
    assert!(ctx.engine().registry.resolve_file("/data/big").is_err());

    let mut last = CommitArgs::replica(4, tmp_fid, "/data/big", 4096);
    last.atomic = true;
    last.oc_chunk = true;
    last.oc_chunk_n = 4;
    last.oc_done = true;
    last.is_replica = false;
    ctx.engine().commit(&last, &ctx.vid_root).unwrap();

    let final_file = ctx.engine().registry.resolve_file("/data/big").unwrap();
    assert_eq!(final_file.id(), tmp_fid);
    assert_eq!(final_file.size(), 4096);
}
