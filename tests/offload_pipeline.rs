//! End-to-end tests for the offload pipeline: copy to one or two
//! destinations, read the manifests back, verify, corrupt and re-verify.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tandem::core::hasher::hash_file;
use tandem::core::manifest::{Manifest, is_manifest_file, read_manifest};
use tandem::core::{
    OffloadOptions, OffloadProgress, OffloadRequest, OffloadResult, Outcome, VerifyOptions,
    VerifyResult, generate_manifest, offload, verify,
};
use tandem::core::copy::CopyOptions;
use tandem::Error;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

/// Helper to create test files with specific content
fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Deterministic, file-specific filler so no two files hash alike
fn pattern(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed * 7) % 251) as u8).collect()
}

fn options(max_concurrent: usize) -> OffloadOptions {
    OffloadOptions {
        max_concurrent,
        copy: CopyOptions {
            buffer_size: 64 * 1024,
            sync_files: false,
        },
        ..Default::default()
    }
}

fn manifests_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| is_manifest_file(p))
        .collect()
}

fn triples(manifest: &Manifest) -> BTreeMap<String, (u64, String)> {
    manifest
        .entries()
        .map(|e| (e.relative_path.clone(), (e.size, e.hash.clone())))
        .collect()
}

/// Helper to run an offload and collect progress updates
async fn run_offload(
    req: &OffloadRequest,
    options: &OffloadOptions,
) -> (tandem::Result<OffloadResult>, Vec<OffloadProgress>) {
    let (tx, mut rx) = mpsc::channel(100);

    let handle = tokio::spawn({
        let req = req.clone();
        let options = options.clone();
        async move { offload(&req, &options, tx, CancellationToken::new()).await }
    });

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }

    (handle.await.unwrap(), updates)
}

async fn run_verify(target: &Path) -> tandem::Result<VerifyResult> {
    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let result = verify(
        target,
        &VerifyOptions::default(),
        tx,
        CancellationToken::new(),
    )
    .await;
    drain.await.unwrap();
    result
}

#[tokio::test]
async fn test_offload_verify_corrupt_scenario() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    let dest_a = temp.path().join("destA");

    // 10 files, 50 MiB in total
    for i in 0..10 {
        let dir = if i % 2 == 0 { "A001" } else { "A002" };
        create_file(
            &source.join(format!("CLIPS/{}/C{:04}.mov", dir, i)),
            &pattern(i, 5 * MIB),
        );
    }

    let req = OffloadRequest::new(&source, &dest_a, Some(PathBuf::new()));
    let (result, updates) = run_offload(&req, &options(4)).await;
    let result = result.unwrap();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_files, 10);
    assert_eq!(result.files_processed, 10);
    assert_eq!(result.bytes_copied, 52_428_800);
    assert!(result.error_message.is_none());
    assert_eq!(updates.len(), 10);

    let manifests = manifests_in(&dest_a);
    assert_eq!(manifests.len(), 1);
    assert_eq!(Some(manifests[0].as_path()), result.manifest_path("A"));

    let manifest = read_manifest(&manifests[0]).unwrap();
    assert_eq!(manifest.len(), 10);
    for entry in manifest.entries() {
        let copied = dest_a.join(&entry.relative_path);
        assert_eq!(hash_file(&copied, MIB, None).unwrap(), entry.hash);
        assert_eq!(std::fs::metadata(&copied).unwrap().len(), entry.size);
    }

    let verified = run_verify(&dest_a).await.unwrap();
    assert!(verified.success);
    assert_eq!(verified.files_verified, 10);
    assert_eq!(verified.mismatch_count, 0);

    let victim = "CLIPS/A002/C0003.mov";
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dest_a.join(victim))
        .unwrap();
    file.set_len(5 * MIB as u64 - 1).unwrap();
    drop(file);

    let verified = run_verify(&dest_a).await.unwrap();
    assert!(!verified.success);
    assert_eq!(verified.files_verified, 9);
    assert_eq!(verified.mismatch_count, 1);
    let reported: Vec<_> = verified
        .mismatched_files
        .iter()
        .map(|m| m.to_string())
        .collect();
    assert_eq!(reported, [format!("{} (hash mismatch)", victim)]);
}

#[tokio::test]
async fn test_single_byte_change_flags_only_that_file() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest = temp.path().join("raid");

    for i in 0..6 {
        create_file(&source.join(format!("T{:02}.wav", i)), &pattern(i, 20_000));
    }

    let req = OffloadRequest::new(&source, &dest, None);
    let (result, _) = run_offload(&req, &options(2)).await;
    assert!(result.unwrap().success);

    let path = dest.join("T04.wav");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[12_345] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    let verified = run_verify(&dest).await.unwrap();
    assert_eq!(verified.files_verified, 5);
    assert_eq!(verified.mismatch_count, 1);
    assert_eq!(verified.mismatched_files[0].relative_path, "T04.wav");
}

#[tokio::test]
async fn test_two_destinations_get_identical_manifests() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest_a = temp.path().join("raid");
    let dest_b = temp.path().join("shuttle");

    for i in 0..8 {
        create_file(&source.join(format!("DCIM/100/IMG_{:04}.CR3", i)), &pattern(i, 30_000 + i));
    }
    std::fs::create_dir_all(source.join("MISC/EMPTY")).unwrap();

    let req = OffloadRequest::new(&source, &dest_a, Some(dest_b.clone()));
    let (result, updates) = run_offload(&req, &options(3)).await;
    let result = result.unwrap();

    assert!(result.success);
    assert_eq!(result.files_processed, 8);
    assert_eq!(updates.len(), 16);
    assert!(dest_b.join("MISC/EMPTY").is_dir());

    let a = read_manifest(result.manifest_path("A").unwrap()).unwrap();
    let b = read_manifest(result.manifest_path("B").unwrap()).unwrap();
    assert_eq!(triples(&a), triples(&b));
    assert_eq!(a.len(), 8);

    for target in [&dest_a, &dest_b] {
        let verified = run_verify(target).await.unwrap();
        assert!(verified.success);
        assert_eq!(verified.files_verified, 8);
    }
}

#[tokio::test]
async fn test_empty_destination_b_is_skipped() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest = temp.path().join("raid");
    create_file(&source.join("A001.mov"), b"frames");

    let req = OffloadRequest::new(&source, &dest, Some(PathBuf::new()));
    let (result, _) = run_offload(&req, &options(4)).await;
    let result = result.unwrap();

    assert!(result.success);
    assert_eq!(result.destinations.len(), 1);
    assert!(result.manifest_path("B").is_none());
    assert_eq!(result.failures().count(), 0);
}

#[tokio::test]
async fn test_bounded_pool_processes_every_file() {
    for workers in [1, 3] {
        let temp = tempdir().unwrap();
        let source = temp.path().join("card");
        let dest = temp.path().join("raid");

        let mut expected_bytes = 0u64;
        for i in 0..25 {
            let content = pattern(i, 1000 + i * 97);
            expected_bytes += content.len() as u64;
            create_file(&source.join(format!("clip_{:02}.mov", i)), &content);
        }

        let req = OffloadRequest::new(&source, &dest, None);
        let (result, updates) = run_offload(&req, &options(workers)).await;
        let result = result.unwrap();

        assert!(result.success);
        assert_eq!(result.files_processed, 25);
        assert_eq!(result.bytes_copied, expected_bytes);

        let last = updates.iter().max_by_key(|u| u.files_processed).unwrap();
        assert_eq!(last.files_processed, 25);
        assert_eq!(last.bytes_copied, expected_bytes);
    }
}

#[tokio::test]
async fn test_cancel_mid_offload() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest = temp.path().join("raid");

    for i in 0..20 {
        create_file(&source.join(format!("C{:03}.mov", i)), &pattern(i, MIB));
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let handle = tokio::spawn({
        let req = OffloadRequest::new(&source, &dest, None);
        let cancel = cancel.clone();
        async move { offload(&req, &options(1), tx, cancel).await }
    });

    let mut updates = 0;
    while rx.recv().await.is_some() {
        updates += 1;
        cancel.cancel();
    }

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert!(!result.success);
    assert!(result.error_message.is_some());
    assert!(result.files_processed < 20);
    assert!(updates < 20);
    assert!(manifests_in(&dest).is_empty());
}

#[tokio::test]
async fn test_generate_manifest_is_idempotent() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("raid");
    for i in 0..5 {
        create_file(&dir.join(format!("sub{}/f{}.bin", i % 2, i)), &pattern(i, 4096 * i + 1));
    }

    let first = temp.path().join("first.mhl");
    let second = temp.path().join("second.mhl");
    let opts = options(2);

    let (_, a) = generate_manifest(&dir, Some(&first), &opts, CancellationToken::new())
        .await
        .unwrap();
    let (_, b) = generate_manifest(&dir, Some(&second), &opts, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(a.len(), 5);
    assert_eq!(triples(&a), triples(&b));
    assert_eq!(
        triples(&read_manifest(&first).unwrap()),
        triples(&read_manifest(&second).unwrap())
    );
}

#[tokio::test]
async fn test_fail_fast_errors() {
    let temp = tempdir().unwrap();

    let req = OffloadRequest::new(temp.path().join("no_card"), temp.path().join("raid"), None);
    let (result, updates) = run_offload(&req, &options(4)).await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(updates.is_empty());

    let empty = temp.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    assert!(matches!(
        run_verify(&empty).await,
        Err(Error::NotFound { what: "Manifest", .. })
    ));
    assert!(matches!(
        run_verify(Path::new("")).await,
        Err(Error::Configuration(_))
    ));
}

#[tokio::test]
async fn test_manifest_files_on_the_card_are_verified() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest = temp.path().join("raid");
    create_file(&source.join("A001.mov"), &pattern(1, 10_000));
    create_file(
        &source.join("SOUND/day1.mhl"),
        b"<hashlist version=\"1.1\"></hashlist>",
    );

    let req = OffloadRequest::new(&source, &dest, None);
    let (result, _) = run_offload(&req, &options(2)).await;
    let result = result.unwrap();
    assert!(result.success);

    let manifest = read_manifest(result.manifest_path("A").unwrap()).unwrap();
    assert!(manifest.get("SOUND/day1.mhl").is_some());
    assert_eq!(run_verify(&dest).await.unwrap().files_verified, 2);

    std::fs::write(dest.join("SOUND/day1.mhl"), b"CORRUPTED").unwrap();

    let verified = run_verify(&dest).await.unwrap();
    assert!(!verified.success);
    assert_eq!(verified.files_verified, 1);
    assert_eq!(verified.mismatch_count, 1);
    assert_eq!(verified.mismatched_files[0].relative_path, "SOUND/day1.mhl");
}

#[cfg(unix)]
#[tokio::test]
async fn test_colon_in_file_name_verifies() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let dest = temp.path().join("raid");
    create_file(&source.join("1:2.wav"), &pattern(2, 4_000));
    create_file(&source.join("SOUND/take:1.wav"), &pattern(3, 4_000));

    let req = OffloadRequest::new(&source, &dest, None);
    let (result, _) = run_offload(&req, &options(2)).await;
    assert!(result.unwrap().success);

    let verified = run_verify(&dest).await.unwrap();
    assert!(verified.success, "{:?}", verified.error_message);
    assert_eq!(verified.files_verified, 2);
}
