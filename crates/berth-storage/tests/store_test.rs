//! End-to-end storage engine scenarios: uploads, manifests, referrers,
//! dedup and garbage collection against a real LMDB-backed index.

use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use berth_cache::{BlobCache, LmdbCache};
use berth_storage::{
    Digest, DigestAlgorithm, Error, ImageStore, Linter, DEFAULT_GC_DELAY,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_ORAS_ARTIFACT,
};
use tempfile::TempDir;

const TAG: &str = "1.0";

fn sha256(data: &[u8]) -> Digest {
    Digest::compute(DigestAlgorithm::Sha256, data)
}

fn new_store(root: &Path, gc: bool, gc_delay: Duration, dedupe: bool) -> ImageStore {
    let cache: Option<Arc<dyn BlobCache>> = if dedupe {
        Some(Arc::new(LmdbCache::open(root, "cache", true).unwrap()))
    } else {
        None
    };
    ImageStore::new(root, gc, gc_delay, dedupe, true, None, cache).unwrap()
}

fn upload(store: &ImageStore, repo: &str, content: &[u8]) -> Digest {
    let digest = sha256(content);
    store.full_blob_upload(repo, content, &digest).unwrap();
    digest
}

fn config_blob(seed: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {"type": "layers", "diff_ids": []},
        "config": {"Labels": {"seed": seed}},
    }))
    .unwrap()
}

fn image_manifest(config: (&Digest, usize), layers: &[(&Digest, usize)]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|(digest, size)| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": digest.to_string(),
                "size": size,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.0.to_string(),
            "size": config.1,
        },
        "layers": layers,
    }))
    .unwrap()
}

fn push_image(store: &ImageStore, repo: &str, reference: &str, layer: &[u8], seed: &str) -> Digest {
    let layer_digest = upload(store, repo, layer);
    let config = config_blob(seed);
    let config_digest = upload(store, repo, &config);
    let manifest = image_manifest((&config_digest, config.len()), &[(&layer_digest, layer.len())]);
    let (digest, subject) = store
        .put_image_manifest(repo, reference, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();
    assert_eq!(subject, "");
    assert_eq!(digest, sha256(&manifest));
    digest
}

fn inode(path: &Path) -> (u64, u64) {
    let meta = fs::metadata(path).unwrap();
    (meta.dev(), meta.ino())
}

#[test]
fn chunked_upload_then_check_blob() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, DEFAULT_GC_DELAY, true);

    store.init_repo("test").unwrap();

    let content = b"test-data1";
    let digest = sha256(content);
    let session = store.new_blob_upload("test").unwrap();
    let written = store
        .put_blob_chunk("test", &session, 0, content.len() as u64, &content[..])
        .unwrap();
    assert_eq!(written, 10);
    store
        .finish_blob_upload("test", &session, std::io::empty(), &digest)
        .unwrap();

    assert_eq!(store.check_blob("test", &digest).unwrap(), (true, 10));
}

#[test]
fn blob_read_size_and_digest_agree() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let content = b"coherence check";
    let digest = upload(&store, "test", content);

    let (mut reader, size) = store
        .get_blob("test", &digest, "application/octet-stream")
        .unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).unwrap();

    assert_eq!(size, content.len() as u64);
    assert_eq!(store.check_blob("test", &digest).unwrap(), (true, size));
    assert_eq!(sha256(&buf), digest);
}

#[test]
fn manifest_roundtrip_by_tag_and_digest() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, DEFAULT_GC_DELAY, true);

    let layer = b"test-data1";
    let layer_digest = upload(&store, "test", layer);
    let config = config_blob("roundtrip");
    let config_digest = upload(&store, "test", &config);
    let manifest = image_manifest((&config_digest, config.len()), &[(&layer_digest, layer.len())]);

    let (digest, subject) = store
        .put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();
    assert_eq!(subject, "");

    let (by_tag, tag_digest, media_type) = store.get_image_manifest("test", TAG).unwrap();
    assert_eq!(by_tag, manifest);
    assert_eq!(tag_digest, digest);
    assert_eq!(media_type, MEDIA_TYPE_IMAGE_MANIFEST);

    let (by_digest, _, _) = store
        .get_image_manifest("test", &digest.to_string())
        .unwrap();
    assert_eq!(by_digest, manifest);

    assert_eq!(store.get_image_tags("test").unwrap(), vec![TAG]);
}

#[test]
fn manifest_with_missing_layer_leaves_no_partial_state() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, DEFAULT_GC_DELAY, true);

    let config = config_blob("partial");
    let config_digest = upload(&store, "test", &config);
    let absent = sha256(b"this layer was never uploaded");
    let manifest = image_manifest((&config_digest, config.len()), &[(&absent, 7)]);

    let index_before = store.get_index_content("test").unwrap();
    let err = store
        .put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap_err();
    assert!(matches!(err, Error::BlobNotFound { .. }));

    assert_eq!(store.get_index_content("test").unwrap(), index_before);
    assert!(matches!(
        store.get_image_manifest("test", TAG),
        Err(Error::ManifestNotFound { .. })
    ));
}

#[test]
fn unsupported_media_type_and_garbage_bodies_rejected() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, DEFAULT_GC_DELAY, true);

    assert!(matches!(
        store.put_image_manifest("test", TAG, "application/json", b"{}"),
        Err(Error::BadManifest { .. })
    ));
    assert!(matches!(
        store.put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, b"not json"),
        Err(Error::BadManifest { .. })
    ));

    // a digest reference must match the body
    let wrong = sha256(b"something else").to_string();
    assert!(matches!(
        store.put_image_manifest("test", &wrong, MEDIA_TYPE_IMAGE_MANIFEST, b"{}"),
        Err(Error::BadManifest { .. })
    ));
}

#[test]
fn deleted_manifest_is_gone() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    push_image(&store, "test", TAG, b"test-data1", "delete-me");
    store.delete_image_manifest("test", TAG, false).unwrap();

    assert!(matches!(
        store.get_image_manifest("test", TAG),
        Err(Error::ManifestNotFound { .. })
    ));
    assert!(store.get_image_tags("test").unwrap().is_empty());
    assert!(matches!(
        store.delete_image_manifest("test", TAG, false),
        Err(Error::ManifestNotFound { .. })
    ));
}

#[test]
fn tag_moves_to_new_manifest_on_repush() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let first = push_image(&store, "test", TAG, b"layer one", "first");
    let second = push_image(&store, "test", TAG, b"layer two", "second");
    assert_ne!(first, second);

    let (_, digest, _) = store.get_image_manifest("test", TAG).unwrap();
    assert_eq!(digest, second);
    // one tag only; the old tagged entry was replaced
    assert_eq!(store.get_image_tags("test").unwrap(), vec![TAG]);
    // the first manifest is no longer reachable through the index
    assert!(matches!(
        store.get_image_manifest("test", &first.to_string()),
        Err(Error::ManifestNotFound { .. })
    ));
}

#[test]
fn digest_and_tag_descriptors_collide_on_guarded_delete() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    // same manifest pushed untagged (by digest) first, then tagged: two
    // descriptors end up sharing one digest
    let layer = b"shared layer";
    let layer_digest = upload(&store, "test", layer);
    let config = config_blob("collision");
    let config_digest = upload(&store, "test", &config);
    let manifest = image_manifest((&config_digest, config.len()), &[(&layer_digest, layer.len())]);
    let digest = sha256(&manifest);

    store
        .put_image_manifest("test", &digest.to_string(), MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();
    store
        .put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();

    assert!(matches!(
        store.delete_image_manifest("test", &digest.to_string(), true),
        Err(Error::ManifestConflict { .. })
    ));
    // without collision detection the first matching descriptor goes
    store
        .delete_image_manifest("test", &digest.to_string(), false)
        .unwrap();
    // the second descriptor still resolves it
    assert!(store.get_image_manifest("test", &digest.to_string()).is_ok());
}

#[test]
fn gc_keeps_shared_digest_alive_across_duplicate_descriptors() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, Duration::from_millis(100), true);

    let layer = b"conflict layer";
    let layer_digest = upload(&store, "gc-index", layer);
    let config = config_blob("conflict");
    let config_digest = upload(&store, "gc-index", &config);
    let manifest = image_manifest((&config_digest, config.len()), &[(&layer_digest, layer.len())]);
    let digest = sha256(&manifest);

    store
        .put_image_manifest(
            "gc-index",
            &digest.to_string(),
            MEDIA_TYPE_IMAGE_MANIFEST,
            &manifest,
        )
        .unwrap();
    store
        .put_image_manifest("gc-index", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();

    std::thread::sleep(Duration::from_millis(250));
    store.run_gc_repo("gc-index").unwrap();

    assert!(store.check_blob("gc-index", &digest).unwrap().0);
    assert!(store.get_image_manifest("gc-index", TAG).is_ok());
}

#[test]
fn dedupe_shares_inodes_across_repositories() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let content = b"test-data3";
    let session = store.new_blob_upload("dedupe1").unwrap();
    store
        .put_blob_chunk_streamed("dedupe1", &session, &content[..])
        .unwrap();
    let digest = sha256(content);
    store
        .finish_blob_upload("dedupe1", &session, std::io::empty(), &digest)
        .unwrap();

    let session = store.new_blob_upload("dedupe2").unwrap();
    store
        .put_blob_chunk_streamed("dedupe2", &session, &content[..])
        .unwrap();
    store
        .finish_blob_upload("dedupe2", &session, std::io::empty(), &digest)
        .unwrap();

    let p1 = store.blob_path("dedupe1", &digest);
    let p2 = store.blob_path("dedupe2", &digest);
    assert_eq!(inode(&p1), inode(&p2));
}

#[test]
fn no_dedupe_no_shared_inodes() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, false);

    let content = b"test-data3";
    let digest = upload(&store, "dedupe1", content);
    upload(&store, "dedupe2", content);

    assert_ne!(
        inode(&store.blob_path("dedupe1", &digest)),
        inode(&store.blob_path("dedupe2", &digest))
    );
}

#[test]
fn inline_gc_sweeps_orphans_and_keeps_referenced_blobs() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, Duration::from_millis(200), true);

    // orphan first
    let orphan = upload(&store, "gc-short", b"test-data1");
    std::thread::sleep(Duration::from_millis(500));

    // a full image afterwards; putting its manifest runs GC inline
    let manifest_digest = push_image(&store, "gc-short", TAG, b"test-data2", "gc-short");

    let referenced = sha256(b"test-data2");
    assert!(matches!(
        store.check_blob("gc-short", &orphan),
        Err(Error::BlobNotFound { .. })
    ));
    assert_eq!(store.check_blob("gc-short", &referenced).unwrap().0, true);

    // deleting the manifest makes its blobs sweepable once aged
    std::thread::sleep(Duration::from_millis(500));
    store
        .delete_image_manifest("gc-short", &manifest_digest.to_string(), false)
        .unwrap();
    assert!(matches!(
        store.check_blob("gc-short", &referenced),
        Err(Error::BlobNotFound { .. })
    ));
}

#[test]
fn gc_and_dedupe_do_not_fight_over_shared_blobs() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, Duration::from_millis(300), true);

    let shared = b"test-data";
    push_image(&store, "gc1", TAG, shared, "gc1");
    let shared_digest = sha256(shared);

    std::thread::sleep(Duration::from_millis(700));
    assert!(store.check_blob("gc1", &shared_digest).unwrap().0);

    // second repo picks the same layer bytes up through dedup
    push_image(&store, "gc2", TAG, shared, "gc2");
    assert!(store.check_blob("gc2", &shared_digest).unwrap().0);

    // another image into gc2 triggers inline GC there; the shared layer is
    // referenced by gc2's index and must survive in both repos
    push_image(&store, "gc2", "2.0", b"test-data-more", "gc2-more");

    assert!(store.check_blob("gc1", &shared_digest).unwrap().0);
    assert!(store.check_blob("gc2", &shared_digest).unwrap().0);
    assert_eq!(
        inode(&store.blob_path("gc1", &shared_digest)),
        inode(&store.blob_path("gc2", &shared_digest))
    );
}

#[test]
fn oci_referrers_index() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let subject_digest = push_image(&store, "test", TAG, b"subject layer", "subject");

    // referrer: an image manifest with a subject field and artifact type
    let config = config_blob("referrer");
    let config_digest = upload(&store, "test", &config);
    let referrer = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "artifactType": "application/example.signature",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": [],
        "subject": {
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "digest": subject_digest.to_string(),
            "size": 14,
        },
        "annotations": {"example": "yes"},
    }))
    .unwrap();
    let referrer_digest = sha256(&referrer);
    let (_, subject) = store
        .put_image_manifest(
            "test",
            &referrer_digest.to_string(),
            MEDIA_TYPE_IMAGE_MANIFEST,
            &referrer,
        )
        .unwrap();
    assert_eq!(subject, subject_digest.to_string());

    let index = store.get_referrers("test", &subject_digest, &[]).unwrap();
    assert_eq!(index.manifests().len(), 1);
    let desc = &index.manifests()[0];
    assert_eq!(desc.digest(), &referrer_digest.to_string());
    assert_eq!(
        desc.artifact_type().as_ref().map(|a| a.to_string()),
        Some("application/example.signature".to_string())
    );

    // filter matches
    let filtered = store
        .get_referrers(
            "test",
            &subject_digest,
            &["application/example.signature".to_string()],
        )
        .unwrap();
    assert_eq!(filtered.manifests().len(), 1);

    // filter excludes
    let excluded = store
        .get_referrers("test", &subject_digest, &["application/other".to_string()])
        .unwrap();
    assert!(excluded.manifests().is_empty());

    // unknown subject: empty index, not an error
    let none = store
        .get_referrers("test", &sha256(b"nobody references this"), &[])
        .unwrap();
    assert!(none.manifests().is_empty());
}

#[test]
fn oras_referrers_scan() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let body = b"this is a blob";
    let subject_digest = upload(&store, "test", body);

    let artifact = serde_json::to_vec(&serde_json::json!({
        "mediaType": MEDIA_TYPE_ORAS_ARTIFACT,
        "artifactType": "signature-example",
        "blobs": [],
        "subject": {
            "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
            "digest": subject_digest.to_string(),
            "size": body.len(),
        },
    }))
    .unwrap();
    let artifact_digest = sha256(&artifact);

    // bare hex reference is a (digest-shaped) tag, as clients send it
    store
        .put_image_manifest(
            "test",
            artifact_digest.encoded(),
            MEDIA_TYPE_ORAS_ARTIFACT,
            &artifact,
        )
        .unwrap();

    let descriptors = store
        .get_oras_referrers("test", &subject_digest, "signature-example")
        .unwrap();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].media_type, MEDIA_TYPE_ORAS_ARTIFACT);
    assert_eq!(descriptors[0].digest, artifact_digest.to_string());
    assert_eq!(descriptors[0].size, artifact.len() as i64);
    assert_eq!(
        descriptors[0].artifact_type.as_deref(),
        Some("signature-example")
    );

    // no referrer for an unrelated digest
    assert!(matches!(
        store.get_oras_referrers("test", &sha256(b"unrelated"), ""),
        Err(Error::ManifestNotFound { .. })
    ));
    // filter mismatch behaves the same
    assert!(matches!(
        store.get_oras_referrers("test", &subject_digest, "unrelated-type"),
        Err(Error::ManifestNotFound { .. })
    ));
}

#[test]
fn image_index_push_and_gc_traversal() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, Duration::from_millis(100), true);

    let m1 = push_image(&store, "multi", "amd64", b"layer amd64", "amd64");
    let m2 = push_image(&store, "multi", "arm64", b"layer arm64", "arm64");

    let (m1_body, _, _) = store.get_image_manifest("multi", "amd64").unwrap();
    let (m2_body, _, _) = store.get_image_manifest("multi", "arm64").unwrap();
    let index = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_INDEX,
        "manifests": [
            {"mediaType": MEDIA_TYPE_IMAGE_MANIFEST, "digest": m1.to_string(), "size": m1_body.len()},
            {"mediaType": MEDIA_TYPE_IMAGE_MANIFEST, "digest": m2.to_string(), "size": m2_body.len()},
        ],
    }))
    .unwrap();

    store
        .put_image_manifest("multi", "latest", MEDIA_TYPE_IMAGE_INDEX, &index)
        .unwrap();

    // age everything, then GC: the whole tree hangs off the tagged index
    std::thread::sleep(Duration::from_millis(250));
    store.run_gc_repo("multi").unwrap();

    assert!(store.get_image_manifest("multi", "latest").is_ok());
    assert!(store.check_blob("multi", &m1).unwrap().0);
    assert!(store.check_blob("multi", &m2).unwrap().0);
    assert!(store.check_blob("multi", &sha256(b"layer amd64")).unwrap().0);
    assert!(store.check_blob("multi", &sha256(b"layer arm64")).unwrap().0);
}

#[test]
fn rejects_invalid_repo_names_and_hides_root_layout() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), true, DEFAULT_GC_DELAY, true);

    assert!(matches!(
        store.init_repo("_trivy"),
        Err(Error::InvalidRepoName { .. })
    ));

    // a root that is itself a valid OCI layout lists no repositories
    fs::create_dir_all(dir.path().join("blobs/sha256")).unwrap();
    fs::create_dir_all(dir.path().join(".uploads")).unwrap();
    fs::write(
        dir.path().join("index.json"),
        b"{\"schemaVersion\":2,\"manifests\":[]}",
    )
    .unwrap();
    fs::write(
        dir.path().join("oci-layout"),
        b"{\"imageLayoutVersion\":\"1.0.0\"}",
    )
    .unwrap();

    assert!(store.get_repositories().unwrap().is_empty());
}

struct RequireOwnerAnnotation;

impl Linter for RequireOwnerAnnotation {
    fn lint(
        &self,
        _repo: &str,
        _digest: &Digest,
        manifest: &oci_spec::image::ImageManifest,
    ) -> berth_storage::Result<bool> {
        Ok(manifest
            .annotations()
            .as_ref()
            .map(|a| a.contains_key("owner"))
            .unwrap_or(false))
    }
}

#[test]
fn lint_rejects_unannotated_manifests() {
    let dir = TempDir::new().unwrap();
    let store = ImageStore::new(
        dir.path(),
        false,
        DEFAULT_GC_DELAY,
        false,
        true,
        Some(Arc::new(RequireOwnerAnnotation)),
        None,
    )
    .unwrap();

    let layer = b"linted layer";
    let layer_digest = upload(&store, "test", layer);
    let config = config_blob("lint");
    let config_digest = upload(&store, "test", &config);

    let bare = image_manifest((&config_digest, config.len()), &[(&layer_digest, layer.len())]);
    assert!(matches!(
        store.put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &bare),
        Err(Error::LintAnnotations)
    ));

    let annotated = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest.to_string(),
            "size": layer.len(),
        }],
        "annotations": {"owner": "platform-team"},
    }))
    .unwrap();
    store
        .put_image_manifest("test", TAG, MEDIA_TYPE_IMAGE_MANIFEST, &annotated)
        .unwrap();
}

#[test]
fn store_built_from_engine_config() {
    let dir = TempDir::new().unwrap();

    let mut config = berth_config::Config::default();
    config.storage.root_directory = dir.path().join("registry");
    config.storage.gc_delay_secs = 2;
    config.storage.dedupe = false;
    config.storage.commit = false;

    let store = ImageStore::new(
        &config.storage.root_directory,
        config.storage.gc,
        config.storage.gc_delay(),
        config.storage.dedupe,
        config.storage.commit,
        None,
        None,
    )
    .unwrap();
    assert_eq!(store.gc_delay(), Duration::from_secs(2));
    assert!(!store.dedupe_enabled());

    let digest = upload(&store, "smoke", b"configured bytes");
    assert!(store.check_blob("smoke", &digest).unwrap().0);
}

#[test]
fn idempotent_digest_repush_updates_in_place() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path(), false, DEFAULT_GC_DELAY, true);

    let digest = push_image(&store, "test", TAG, b"stable layer", "idempotent");
    let (manifest, _, _) = store.get_image_manifest("test", TAG).unwrap();

    // push the identical manifest by digest twice
    store
        .put_image_manifest("test", &digest.to_string(), MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();
    let index_once = store.get_index_content("test").unwrap();
    store
        .put_image_manifest("test", &digest.to_string(), MEDIA_TYPE_IMAGE_MANIFEST, &manifest)
        .unwrap();
    assert_eq!(store.get_index_content("test").unwrap(), index_once);
}
