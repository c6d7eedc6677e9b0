//! Property tests from SPEC_FULL.md §8, run against `Operations` and the
//! metadata-lifecycle module directly. Each case spins its own `tokio`
//! runtime since `proptest!` generates plain synchronous `#[test]` fns.

mod common;

use proptest::prelude::*;

use s3ql::database::{extents, objects};
use s3ql::fs::operations::{CTRL_INODE, ROOT_INODE};
use s3ql::metadata::lifecycle::backend_seq_no;

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// For any sequence of writes (small offsets, small payloads, within a
    /// handful of 64-byte blocks) followed by a flush, the content read
    /// back equals the concatenation of the latest writes at each offset.
    #[test]
    fn write_then_flush_round_trips_latest_writes(
        writes in prop::collection::vec((0u16..180, prop::collection::vec(any::<u8>(), 1..30)), 1..10)
    ) {
        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let (backend, key) = common::fresh_backend("prop-write", 64, dir.path()).await;
            let mount = common::mount(backend, key, dir.path().join("mnt")).await;
            let file = mount.ops.mknod(ROOT_INODE, b"f", 0o100644, 0, 0, 0).await.unwrap();

            let mut shadow: Vec<u8> = Vec::new();
            for (offset, data) in &writes {
                let offset = *offset as usize;
                if shadow.len() < offset + data.len() {
                    shadow.resize(offset + data.len(), 0);
                }
                shadow[offset..offset + data.len()].copy_from_slice(data);
                mount.ops.write(file.id, offset as i64, data).await.unwrap();
            }

            mount.ops.setxattr(CTRL_INODE, b"flushcache", b"").await.unwrap();
            let read_back = mount.ops.read(file.id, 0, shadow.len() as u32).await.unwrap();
            prop_assert_eq!(read_back, shadow);
            Ok(())
        })?;
    }

    /// After flushing, every object's refcount equals the number of extents
    /// referencing it.
    #[test]
    fn object_refcount_matches_extent_references(
        blocks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..6)
    ) {
        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let (backend, key) = common::fresh_backend("prop-refcount", 16, dir.path()).await;
            let mount = common::mount(backend, key, dir.path().join("mnt")).await;
            let file = mount.ops.mknod(ROOT_INODE, b"f", 0o100644, 0, 0, 0).await.unwrap();

            for (i, block) in blocks.iter().enumerate() {
                mount.ops.write(file.id, (i as i64) * 16, block).await.unwrap();
            }
            mount.ops.destroy().await.unwrap();

            let file_extents = extents::list_for_inode(mount.db.pool(), file.id).await.unwrap();
            for extent in &file_extents {
                let object = objects::get(mount.db.pool(), extent.obj_id).await.unwrap();
                let refs = extents::count_for_object(mount.db.pool(), extent.obj_id).await.unwrap();
                prop_assert_eq!(object.refcount, refs);
            }
            Ok(())
        })?;
    }

    /// Two identical-content writes (in different files) dedup to exactly
    /// one backend object.
    #[test]
    fn identical_content_dedups_to_one_object(payload in prop::collection::vec(any::<u8>(), 1..60)) {
        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let (backend, key) = common::fresh_backend("prop-dedup", 4096, dir.path()).await;
            let mount = common::mount(backend.clone(), key, dir.path().join("mnt")).await;

            let a = mount.ops.mknod(ROOT_INODE, b"a", 0o100644, 0, 0, 0).await.unwrap();
            let b = mount.ops.mknod(ROOT_INODE, b"b", 0o100644, 0, 0, 0).await.unwrap();
            mount.ops.write(a.id, 0, &payload).await.unwrap();
            mount.ops.write(b.id, 0, &payload).await.unwrap();
            mount.ops.destroy().await.unwrap();

            let extent_a = extents::get(mount.db.pool(), a.id, 0).await.unwrap().unwrap();
            let extent_b = extents::get(mount.db.pool(), b.id, 0).await.unwrap().unwrap();
            prop_assert_eq!(extent_a.obj_id, extent_b.obj_id);

            let object = objects::get(mount.db.pool(), extent_a.obj_id).await.unwrap();
            prop_assert_eq!(object.refcount, 2);

            let data_keys = backend.list("s3ql_data_").await.unwrap();
            prop_assert_eq!(data_keys.len(), 1);
            Ok(())
        })?;
    }

    /// Unmount -> mount round-trip yields byte-identical file contents and
    /// identical stat metadata, modulo atime.
    #[test]
    fn unmount_mount_round_trip_preserves_content_and_metadata(
        payload in prop::collection::vec(any::<u8>(), 0..90)
    ) {
        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let (backend, key) = common::fresh_backend("prop-roundtrip", 32, dir.path()).await;
            let cache_dir = dir.path().join("mnt");

            let mount = common::mount(backend.clone(), key.clone(), cache_dir.clone()).await;
            let file = mount.ops.mknod(ROOT_INODE, b"f", 0o100640, 0, 7, 9).await.unwrap();
            mount.ops.write(file.id, 0, &payload).await.unwrap();
            let before = mount.ops.getattr(file.id).await.unwrap();
            mount.unmount().await;

            let remounted = common::mount(backend, key, cache_dir).await;
            let entry = remounted.ops.lookup(ROOT_INODE, b"f").await.unwrap();
            let after = remounted.ops.getattr(entry.id).await.unwrap();
            let read_back = remounted.ops.read(entry.id, 0, payload.len() as u32).await.unwrap();

            prop_assert_eq!(read_back, payload);
            prop_assert_eq!(before.mode, after.mode);
            prop_assert_eq!(before.uid, after.uid);
            prop_assert_eq!(before.gid, after.gid);
            prop_assert_eq!(before.size, after.size);
            prop_assert_eq!(before.mtime, after.mtime);
            prop_assert_eq!(before.ctime, after.ctime);
            Ok(())
        })?;
    }

    /// Key escape/unescape is an involution on arbitrary (valid UTF-8)
    /// byte strings, complementing escape.rs's own deterministic corpus
    /// with randomized input.
    #[test]
    fn key_escape_unescape_is_an_involution(s in ".*") {
        let escaped = s3ql::util::escape::escape(&s);
        prop_assert_eq!(s3ql::util::escape::unescape(&escaped), s);
    }
}

/// seq_no is strictly monotonic across repeated mount/unmount cycles on the
/// same backend (not a proptest: the property only needs a handful of
/// sequential cycles, not randomized input).
#[tokio::test]
async fn seq_no_is_strictly_monotonic_across_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, key) = common::fresh_backend("seq-no", 131072, dir.path()).await;
    let cache_dir = dir.path().join("mnt");

    let mut seq_nos = Vec::new();
    for _ in 0..4 {
        let mount = common::mount(backend.clone(), key.clone(), cache_dir.clone()).await;
        seq_nos.push(mount.lifecycle.params.seq_no);
        mount.unmount().await;
    }

    for window in seq_nos.windows(2) {
        assert!(window[1] > window[0], "seq_no must strictly increase across mounts: {seq_nos:?}");
    }
    assert_eq!(backend_seq_no(backend.as_ref()).await.unwrap(), *seq_nos.last().unwrap());
}
