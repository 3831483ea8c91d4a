//! End-to-end scenarios for the remote output service: build lifecycle,
//! pre-build reconciliation, bulk creation and stat, and the filesystem root.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;

use rosfs::cas::{
    CasTreeFetcher, Digest, DigestFunction, DigestKind, InMemoryBlobStore, InstanceName,
};
use rosfs::outputs::{OutputServiceNode, ServiceError};
use rosfs::path::Component;
use rosfs::proto;
use rosfs::vfs::{
    EMPTY_DIRECTORY_LINK_COUNT, InMemoryOutputPathFactory, InodeGenerator, NoopEntryNotifier,
};

struct World {
    node: OutputServiceNode,
    blobs: Arc<InMemoryBlobStore>,
}

fn world() -> World {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let inodes = Arc::new(InodeGenerator::new());
    let notifier = Arc::new(NoopEntryNotifier);
    let node = OutputServiceNode::new(
        inodes.clone(),
        notifier.clone(),
        Arc::new(InMemoryOutputPathFactory::new(inodes, notifier)),
        blobs.clone(),
        Arc::new(CasTreeFetcher::new(blobs.clone())),
    );
    World { node, blobs }
}

fn function_for(instance: &str) -> DigestFunction {
    DigestFunction::new(InstanceName::new(instance).unwrap(), DigestKind::Sha256)
}

fn start_request(base: &str, build: &str) -> proto::StartBuildRequest {
    proto::StartBuildRequest {
        output_base_id: base.to_string(),
        build_id: build.to_string(),
        instance_name: String::new(),
        digest_function: proto::DigestFunction::Sha256 as i32,
        output_path_prefix: "/out".to_string(),
        output_path_aliases: HashMap::new(),
    }
}

fn proto_digest(digest: &Digest) -> proto::Digest {
    proto::Digest {
        hash: digest.hash().to_string(),
        size_bytes: digest.size_bytes() as i64,
    }
}

fn file_entry(path: &str, digest: &Digest) -> proto::OutputFile {
    proto::OutputFile {
        path: path.to_string(),
        digest: Some(proto_digest(digest)),
        is_executable: false,
    }
}

fn symlink_entry(path: &str, target: &str) -> proto::OutputSymlink {
    proto::OutputSymlink {
        path: path.to_string(),
        target: target.to_string(),
    }
}

fn create_request(build: &str) -> proto::BatchCreateRequest {
    proto::BatchCreateRequest {
        build_id: build.to_string(),
        path_prefix: String::new(),
        clean_path_prefix: false,
        files: vec![],
        directories: vec![],
        symlinks: vec![],
    }
}

async fn stat_one(
    node: &OutputServiceNode,
    build: &str,
    path: &str,
    follow_symlinks: bool,
    include_file_digest: bool,
) -> proto::StatResponse {
    let response = node
        .batch_stat(&proto::BatchStatRequest {
            build_id: build.to_string(),
            follow_symlinks,
            include_file_digest,
            paths: vec![path.to_string()],
        })
        .await
        .unwrap();
    response.responses.into_iter().next().unwrap()
}

fn file_type(response: &proto::StatResponse) -> Option<&proto::file_status::FileType> {
    response.file_status.as_ref()?.file_type.as_ref()
}

#[tokio::test]
async fn orphan_recovery_evicts_unfinalized_build() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"payload");

    let r1 = w.node.start_build(&start_request("wsA", "b1")).await.unwrap();
    assert_eq!(r1.output_path_suffix, "wsA");
    let r2 = w.node.start_build(&start_request("wsA", "b2")).await.unwrap();
    assert_eq!(r2.output_path_suffix, "wsA");

    let mut stale = create_request("b1");
    stale.files.push(file_entry("x", &digest));
    let err = w.node.batch_create(&stale).await.unwrap_err();
    assert!(matches!(err, ServiceError::FailedPrecondition(_)));

    let mut fresh = create_request("b2");
    fresh.files.push(file_entry("x", &digest));
    w.node.batch_create(&fresh).await.unwrap();
}

#[tokio::test]
async fn reconciliation_removes_entries_with_missing_blobs() {
    let w = world();
    let function = function_for("");
    let present = w.blobs.store(&function, b"still here");
    let absent = function.new_digest(&"e".repeat(64), 3).unwrap();

    w.node.start_build(&start_request("ws", "b0")).await.unwrap();
    let mut create = create_request("b0");
    create.files.push(file_entry("a", &present));
    create.files.push(file_entry("b", &absent));
    w.node.batch_create(&create).await.unwrap();
    w.node
        .finalize_build(&proto::FinalizeBuildRequest {
            build_id: "b0".to_string(),
        })
        .await
        .unwrap();

    w.node.start_build(&start_request("ws", "b1")).await.unwrap();

    let a = stat_one(&w.node, "b1", "a", false, false).await;
    assert!(matches!(
        file_type(&a),
        Some(proto::file_status::FileType::File(_))
    ));
    let b = stat_one(&w.node, "b1", "b", false, false).await;
    assert!(b.file_status.is_none());

    // The directory listing agrees with the stat view.
    let (root, _) = w.node.lookup(&Component::new("ws").unwrap()).await.unwrap();
    let names: Vec<String> = root
        .read_dir()
        .await
        .unwrap()
        .into_iter()
        .map(|(name, _)| name.as_str().to_string())
        .collect();
    assert_eq!(names, vec!["a".to_string()]);
}

#[tokio::test]
async fn reconciliation_removes_cross_instance_entries() {
    let w = world();
    let f1 = function_for("i1");
    let f2 = function_for("i2");
    // The blob exists under both instances; the entry still has to go.
    let digest_i1 = w.blobs.store(&f1, b"shared");
    w.blobs.store(&f2, b"shared");

    let mut start = start_request("ws", "b1");
    start.instance_name = "i1".to_string();
    w.node.start_build(&start).await.unwrap();
    let mut create = create_request("b1");
    create.files.push(file_entry("c", &digest_i1));
    w.node.batch_create(&create).await.unwrap();

    let mut start = start_request("ws", "b2");
    start.instance_name = "i2".to_string();
    w.node.start_build(&start).await.unwrap();

    let c = stat_one(&w.node, "b2", "c", false, false).await;
    assert!(c.file_status.is_none());
}

#[tokio::test]
async fn directory_create_replaces_conflicting_file() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"old file");

    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    create.files.push(file_entry("p", &digest));
    w.node.batch_create(&create).await.unwrap();

    let mut prefixed = create_request("b");
    prefixed.path_prefix = "p/q".to_string();
    w.node.batch_create(&prefixed).await.unwrap();

    let p = stat_one(&w.node, "b", "p", false, false).await;
    assert!(matches!(
        file_type(&p),
        Some(proto::file_status::FileType::Directory(_))
    ));
}

#[tokio::test]
async fn external_symlink_reports_residual_path() {
    let w = world();
    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    create.symlinks.push(symlink_entry("link", "/tmp/elsewhere"));
    w.node.batch_create(&create).await.unwrap();

    let followed = stat_one(&w.node, "b", "link", true, false).await;
    match file_type(&followed) {
        Some(proto::file_status::FileType::External(external)) => {
            assert_eq!(external.next_path, "/tmp/elsewhere");
        }
        other => panic!("expected external status, got {other:?}"),
    }

    // Without following, the symlink's own status is returned.
    let unfollowed = stat_one(&w.node, "b", "link", false, false).await;
    match file_type(&unfollowed) {
        Some(proto::file_status::FileType::Symlink(symlink)) => {
            assert_eq!(symlink.target, "/tmp/elsewhere");
        }
        other => panic!("expected symlink status, got {other:?}"),
    }
}

#[tokio::test]
async fn dotdot_past_the_root_is_external() {
    let w = world();
    w.node.start_build(&start_request("ws", "b")).await.unwrap();

    let response = stat_one(&w.node, "b", "../x", true, false).await;
    match file_type(&response) {
        Some(proto::file_status::FileType::External(external)) => {
            assert_eq!(external.next_path, "../x");
        }
        other => panic!("expected external status, got {other:?}"),
    }
}

#[tokio::test]
async fn symlink_loops_fail_the_batch() {
    let w = world();
    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    // Absolute targets that re-enter the output path through the virtual
    // root, chasing each other.
    create.symlinks.push(symlink_entry("a", "/out/ws/b"));
    create.symlinks.push(symlink_entry("b", "/out/ws/a"));
    w.node.batch_create(&create).await.unwrap();

    let err = w
        .node
        .batch_stat(&proto::BatchStatRequest {
            build_id: "b".to_string(),
            follow_symlinks: true,
            include_file_digest: false,
            paths: vec!["a".to_string()],
        })
        .await
        .unwrap_err();
    match err {
        ServiceError::Resolve { path, source, .. } => {
            assert_eq!(path, "a");
            assert!(matches!(
                source,
                rosfs::path::ResolveError::SymlinkLoop
            ));
        }
        other => panic!("expected resolve error, got {other}"),
    }
}

#[tokio::test]
async fn relative_symlink_loops_are_detected_too() {
    let w = world();
    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    create.symlinks.push(symlink_entry("c", "d"));
    create.symlinks.push(symlink_entry("d", "c"));
    w.node.batch_create(&create).await.unwrap();

    let err = w
        .node
        .batch_stat(&proto::BatchStatRequest {
            build_id: "b".to_string(),
            follow_symlinks: true,
            include_file_digest: false,
            paths: vec!["c".to_string()],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Resolve { .. }));
}

#[tokio::test]
async fn midpath_symlinks_are_always_followed() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"inner file");
    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    create.files.push(file_entry("real/inner", &digest));
    create.symlinks.push(symlink_entry("dirlink", "/out/ws/real"));
    w.node.batch_create(&create).await.unwrap();

    // follow_symlinks=false only applies to the terminal component.
    let response = stat_one(&w.node, "b", "dirlink/inner", false, true).await;
    match file_type(&response) {
        Some(proto::file_status::FileType::File(file)) => {
            assert_eq!(file.digest.as_ref().unwrap().hash, digest.hash());
        }
        other => panic!("expected file status, got {other:?}"),
    }
}

#[tokio::test]
async fn aliases_reanchor_absolute_targets() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"aliased");

    let mut start = start_request("ws", "b");
    start
        .output_path_aliases
        .insert("/views/current".to_string(), "sub".to_string());
    w.node.start_build(&start).await.unwrap();

    let mut create = create_request("b");
    create.files.push(file_entry("sub/data", &digest));
    create
        .symlinks
        .push(symlink_entry("shortcut", "/views/current/data"));
    w.node.batch_create(&create).await.unwrap();

    let response = stat_one(&w.node, "b", "shortcut", true, true).await;
    match file_type(&response) {
        Some(proto::file_status::FileType::File(file)) => {
            assert_eq!(file.digest.as_ref().unwrap().hash, digest.hash());
        }
        other => panic!("expected file status, got {other:?}"),
    }
}

#[tokio::test]
async fn clean_path_prefix_leaves_only_new_entries() {
    let w = world();
    let function = function_for("");
    let old = w.blobs.store(&function, b"old");
    let new = w.blobs.store(&function, b"new");

    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let mut create = create_request("b");
    create.path_prefix = "sub".to_string();
    create.files.push(file_entry("a", &old));
    create.files.push(file_entry("b", &old));
    w.node.batch_create(&create).await.unwrap();

    let mut replace = create_request("b");
    replace.path_prefix = "sub".to_string();
    replace.clean_path_prefix = true;
    replace.files.push(file_entry("c", &new));
    w.node.batch_create(&replace).await.unwrap();

    assert!(stat_one(&w.node, "b", "sub/a", false, false)
        .await
        .file_status
        .is_none());
    assert!(stat_one(&w.node, "b", "sub/b", false, false)
        .await
        .file_status
        .is_none());
    assert!(stat_one(&w.node, "b", "sub/c", false, false)
        .await
        .file_status
        .is_some());
}

#[tokio::test]
async fn finalize_build_invalidates_the_build_id() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"x");
    w.node.start_build(&start_request("ws", "k")).await.unwrap();
    w.node
        .finalize_build(&proto::FinalizeBuildRequest {
            build_id: "k".to_string(),
        })
        .await
        .unwrap();

    let mut create = create_request("k");
    create.files.push(file_entry("x", &digest));
    assert!(matches!(
        w.node.batch_create(&create).await.unwrap_err(),
        ServiceError::FailedPrecondition(_)
    ));
    assert!(matches!(
        w.node
            .batch_stat(&proto::BatchStatRequest {
                build_id: "k".to_string(),
                follow_symlinks: false,
                include_file_digest: false,
                paths: vec!["x".to_string()],
            })
            .await
            .unwrap_err(),
        ServiceError::FailedPrecondition(_)
    ));

    // Finalizing again (or any unknown build) stays silent.
    w.node
        .finalize_build(&proto::FinalizeBuildRequest {
            build_id: "k".to_string(),
        })
        .await
        .unwrap();
    w.node
        .finalize_build(&proto::FinalizeBuildRequest {
            build_id: "never-started".to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn clean_removes_the_base_everywhere() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"data");
    w.node.start_build(&start_request("gone", "b")).await.unwrap();
    let mut create = create_request("b");
    create.files.push(file_entry("f", &digest));
    w.node.batch_create(&create).await.unwrap();

    w.node
        .clean(&proto::CleanRequest {
            output_base_id: "gone".to_string(),
        })
        .await
        .unwrap();

    assert!(w.node.lookup(&Component::new("gone").unwrap()).await.is_err());
    assert!(w.node.readdir().is_empty());
    // The build bound to the cleaned base is gone with it.
    assert!(matches!(
        w.node.batch_create(&create).await.unwrap_err(),
        ServiceError::FailedPrecondition(_)
    ));

    // Cleaning an unknown base is not an error.
    w.node
        .clean(&proto::CleanRequest {
            output_base_id: "never-seen".to_string(),
        })
        .await
        .unwrap();
    // An invalid one is.
    assert!(matches!(
        w.node
            .clean(&proto::CleanRequest {
                output_base_id: "a/b".to_string(),
            })
            .await
            .unwrap_err(),
        ServiceError::InvalidArgument(_)
    ));
}

#[tokio::test]
async fn root_attributes_track_live_bases() {
    let w = world();
    assert_eq!(w.node.getattr().nlink, EMPTY_DIRECTORY_LINK_COUNT);

    w.node.start_build(&start_request("ws1", "b1")).await.unwrap();
    w.node.start_build(&start_request("ws2", "b2")).await.unwrap();
    assert_eq!(w.node.getattr().nlink, EMPTY_DIRECTORY_LINK_COUNT + 2);

    let mut names: Vec<String> = w
        .node
        .readdir()
        .into_iter()
        .map(|entry| entry.name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["ws1".to_string(), "ws2".to_string()]);

    let plus = w.node.readdirplus().await.unwrap();
    assert_eq!(plus.len(), 2);
    for (root, entry) in &plus {
        assert_eq!(entry.attr.ino, root.ino());
    }

    w.node
        .clean(&proto::CleanRequest {
            output_base_id: "ws1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(w.node.getattr().nlink, EMPTY_DIRECTORY_LINK_COUNT + 1);
}

#[tokio::test]
async fn tree_directories_expand_lazily_and_reconcile() {
    let w = world();
    let function = function_for("");
    let inner_file = w.blobs.store(&function, b"generated");

    let manifest = proto::TreeManifest {
        files: vec![proto::TreeFile {
            name: "result".to_string(),
            digest: Some(proto_digest(&inner_file)),
            is_executable: false,
        }],
        directories: vec![],
        symlinks: vec![],
    };
    let tree_digest = w.blobs.store(&function, &manifest.encode_to_vec());
    let untouched_manifest = proto::TreeManifest {
        files: vec![],
        directories: vec![],
        symlinks: vec![proto::TreeSymlink {
            name: "pointer".to_string(),
            target: "elsewhere".to_string(),
        }],
    };
    let untouched_digest = w.blobs.store(&function, &untouched_manifest.encode_to_vec());

    w.node.start_build(&start_request("ws", "b1")).await.unwrap();
    let mut create = create_request("b1");
    create.directories.push(proto::OutputDirectory {
        path: "gen".to_string(),
        tree_digest: Some(proto_digest(&tree_digest)),
    });
    create.directories.push(proto::OutputDirectory {
        path: "untouched".to_string(),
        tree_digest: Some(proto_digest(&untouched_digest)),
    });
    w.node.batch_create(&create).await.unwrap();

    // Entering `gen` materializes it; `untouched` stays pending.
    let response = stat_one(&w.node, "b1", "gen/result", false, true).await;
    match file_type(&response) {
        Some(proto::file_status::FileType::File(file)) => {
            assert_eq!(file.digest.as_ref().unwrap().hash, inner_file.hash());
        }
        other => panic!("expected file status, got {other:?}"),
    }

    // Drop both manifests. The pending directory loses its only backing and
    // is removed by the next reconciliation; the materialized one now
    // depends on its expanded children, whose blob is still present.
    w.blobs.remove(&tree_digest);
    w.blobs.remove(&untouched_digest);
    w.node.start_build(&start_request("ws", "b2")).await.unwrap();

    assert!(
        stat_one(&w.node, "b2", "untouched", false, false)
            .await
            .file_status
            .is_none()
    );
    assert!(
        stat_one(&w.node, "b2", "gen/result", false, false)
            .await
            .file_status
            .is_some()
    );
}

#[tokio::test]
async fn create_rejects_paths_leaving_the_output_path() {
    let w = world();
    let digest = w.blobs.store(&function_for(""), b"x");
    w.node.start_build(&start_request("ws", "b")).await.unwrap();

    let mut escape = create_request("b");
    escape.files.push(file_entry("../escape", &digest));
    assert!(w.node.batch_create(&escape).await.is_err());

    let mut absolute = create_request("b");
    absolute.files.push(file_entry("/abs", &digest));
    assert!(w.node.batch_create(&absolute).await.is_err());

    let mut to_dir = create_request("b");
    to_dir.files.push(file_entry(".", &digest));
    assert!(matches!(
        w.node.batch_create(&to_dir).await.unwrap_err(),
        ServiceError::InvalidArgument(_)
    ));
}

#[tokio::test]
async fn stat_of_the_empty_path_is_the_root_directory() {
    let w = world();
    w.node.start_build(&start_request("ws", "b")).await.unwrap();
    let response = stat_one(&w.node, "b", "", false, false).await;
    assert!(matches!(
        file_type(&response),
        Some(proto::file_status::FileType::Directory(_))
    ));

    // A lookup of a directory child keeps the directory handle usable.
    let (root, attr) = w.node.lookup(&Component::new("ws").unwrap()).await.unwrap();
    assert_eq!(attr.ino, root.ino());
    assert!(
        root.lookup_child(&Component::new("missing").unwrap())
            .await
            .unwrap()
            .is_none()
    );
}
