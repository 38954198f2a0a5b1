mod common;

use common::*;
use modelkeeper::error::{IntegrityError, KeeperError};
use modelkeeper::integrity::{IntegrityVerifier, DEFAULT_MIN_ARTIFACT_BYTES};
use modelkeeper::models::manager::{Action, InstallRequest, Stage};
use modelkeeper::models::registry::RECOMMENDED_TAG;
use modelkeeper::version::UpdateType;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn state_bytes(dir: &Path) -> Vec<u8> {
    fs::read(dir.join("local-state.json")).unwrap()
}

fn partial_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".partial"))
        .collect()
}

fn set_mtime(path: &Path, secs: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

#[tokio::test]
async fn test_install_places_artifact_and_records_state() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport.clone());

    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    assert_eq!(report.action, Action::Installed);
    assert_eq!(report.version, "1.0.0");
    assert_eq!(report.backup_created, None);
    assert!(!report.low_trust);
    assert_eq!(report.file_path, dir.path().join("phi-3-mini-q4.gguf"));
    assert_eq!(fs::read(&report.file_path).unwrap(), artifact(1));

    let state = manager.state().load().unwrap();
    let installed = state.get("phi-3-mini", "q4").unwrap();
    assert_eq!(installed.version, "1.0.0");
    assert_eq!(installed.checksum, checksum_of(&artifact(1)));
    assert!(partial_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_install_twice_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport.clone());

    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();
    let before = state_bytes(dir.path());
    transport.reset_calls();

    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    assert_eq!(report.action, Action::AlreadyInstalled);
    assert_eq!(transport.total_calls(), 0);
    assert_eq!(state_bytes(dir.path()), before);
}

#[tokio::test]
async fn test_force_reinstalls_same_version() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport.clone());

    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();
    let report = manager
        .install(InstallRequest::new("phi-3-mini").force(true))
        .await
        .unwrap();

    assert_eq!(report.action, Action::Reinstalled);
    assert_eq!(report.backup_created, Some(true));
    assert_eq!(transport.total_calls(), 2);
}

#[tokio::test]
async fn test_failed_download_leaves_prior_install_untouched() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.0.0",
        &[("1.0.0", 1)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    // 1.1.0 is in the registry but the server does not have it
    versions.push(version_entry("phi-3-mini", "1.1.0", &artifact(2)));
    write_registry(dir.path(), vec![model("phi-3-mini", "1.1.0", versions)]);
    let before = state_bytes(dir.path());

    let err = manager
        .install(InstallRequest::new("phi-3-mini").version("1.1.0"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Downloading);
    assert!(matches!(err.source, KeeperError::Network { .. }));
    assert_eq!(err.partial_artifact, None);
    assert_eq!(
        transport.calls_for(&url_for("phi-3-mini", "1.1.0")),
        MAX_RETRIES as usize
    );
    assert_eq!(state_bytes(dir.path()), before);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
    assert!(partial_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_checksum_mismatch_is_retried_then_rejected() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.0.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();
    let before = state_bytes(dir.path());

    transport.corrupt(true);
    let err = manager
        .install(InstallRequest::new("phi-3-mini").version("1.1.0"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Verifying);
    assert!(matches!(
        err.source,
        KeeperError::Integrity(IntegrityError::ChecksumMismatch { .. })
    ));
    assert_eq!(
        transport.calls_for(&url_for("phi-3-mini", "1.1.0")),
        MAX_RETRIES as usize
    );
    assert_eq!(state_bytes(dir.path()), before);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
    assert!(partial_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_minor_update_is_reported_as_non_breaking() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();

    let updates = manager.check_for_updates().await.unwrap();

    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.model_id, "phi-3-mini");
    assert_eq!(update.installed_version, "1.0.0");
    assert_eq!(update.available_version, "1.1.0");
    assert_eq!(update.update_type, UpdateType::Minor);
    assert!(!update.is_breaking);
    assert!(manager.state().load().unwrap().last_check.is_some());
}

#[tokio::test]
async fn test_incompatible_version_is_refused_before_network() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.0.0",
        &[("1.0.0", 1), ("2.0.0", 2)],
    );
    versions[1].compatibility = vec![">=2.0.0".to_string()];
    write_registry(dir.path(), vec![model("phi-3-mini", "2.0.0", versions)]);
    let manager = manager(dir.path(), transport.clone());

    let err = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Checking);
    assert!(matches!(err.source, KeeperError::Compatibility { .. }));
    assert_eq!(transport.total_calls(), 0);

    // Incompatible newer versions are not offered as updates either
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();
    assert!(manager.check_for_updates().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ram_gate() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(dir.path(), &transport, "llama", "1.0.0", &[("1.0.0", 3)]);
    versions[0].minimum_ram_gb = 128.0;
    write_registry(dir.path(), vec![model("llama", "1.0.0", versions)]);

    let err = manager(dir.path(), transport.clone())
        .install(InstallRequest::new("llama"))
        .await
        .unwrap_err();
    assert!(matches!(err.source, KeeperError::Compatibility { .. }));
    assert_eq!(transport.total_calls(), 0);

    let mut relaxed = options(dir.path());
    relaxed.enforce_ram = false;
    let manager = modelkeeper::models::ModelManager::new(relaxed, transport.clone()).unwrap();
    let report = manager.install(InstallRequest::new("llama")).await.unwrap();
    assert_eq!(report.action, Action::Installed);
}

#[tokio::test]
async fn test_unknown_model_suggests_close_match() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);

    let err = manager
        .install(InstallRequest::new("phi-3-mimi"))
        .await
        .unwrap_err();
    assert!(matches!(err.source, KeeperError::NotFound(_)));
    assert!(err.to_string().contains("Did you mean 'phi-3-mini'?"));
}

#[tokio::test]
async fn test_update_skips_breaking_without_force() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "2.0.0",
        &[("1.1.0", 1), ("2.0.0", 2)],
    );
    versions[1].compatibility = vec!["*".to_string()];
    write_registry(dir.path(), vec![model("phi-3-mini", "2.0.0", versions)]);
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.1.0"))
        .await
        .unwrap();

    let summary = manager.update(None, false).await.unwrap();
    assert!(summary.applied.is_empty());
    assert_eq!(summary.skipped.len(), 1);
    assert!(summary.skipped[0].is_breaking);

    let summary = manager.update(Some("phi-3-mini"), true).await.unwrap();
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(summary.applied[0].action, Action::Updated);
    assert_eq!(summary.applied[0].previous_version.as_deref(), Some("1.1.0"));
    assert_eq!(
        manager.state().load().unwrap().get("phi-3-mini", "q4").unwrap().version,
        "2.0.0"
    );
}

#[tokio::test]
async fn test_update_of_uninstalled_model_is_not_found() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);

    assert!(matches!(
        manager.update(Some("phi-3-mini"), false).await,
        Err(KeeperError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rollback_restores_backup_without_network() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());

    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();
    let summary = manager.update(None, false).await.unwrap();
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(summary.applied[0].backup_created, Some(true));
    transport.reset_calls();

    let report = manager.rollback("phi-3-mini", None, None).await.unwrap();

    assert_eq!(report.action, Action::RolledBack);
    assert_eq!(report.version, "1.0.0");
    assert!(report.restored_from_backup);
    assert_eq!(transport.total_calls(), 0);

    let path = dir.path().join("phi-3-mini-q4.gguf");
    assert_eq!(fs::read(&path).unwrap(), artifact(1));
    let state = manager.state().load().unwrap();
    let installed = state.get("phi-3-mini", "q4").unwrap();
    assert_eq!(installed.version, "1.0.0");
    assert_eq!(installed.checksum, checksum_of(&artifact(1)));

    // The version rolled back from is itself recoverable
    assert!(manager.backups().find("phi-3-mini", "1.1.0").is_some());
}

#[tokio::test]
async fn test_rollback_downloads_when_backup_is_missing() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    let report = manager
        .rollback("phi-3-mini", Some("1.0.0"), Some("q4"))
        .await
        .unwrap();

    assert!(!report.restored_from_backup);
    assert_eq!(transport.calls_for(&url_for("phi-3-mini", "1.0.0")), 1);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
}

#[tokio::test]
async fn test_rollback_without_earlier_version_fails() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);
    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    let err = manager.rollback("phi-3-mini", None, None).await.unwrap_err();
    assert!(matches!(err.source, KeeperError::NotFound(_)));
    assert_eq!(err.stage, Stage::Checking);
}

#[tokio::test]
async fn test_missing_checksum_installs_as_low_trust() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    versions[0].checksum = None;
    write_registry(dir.path(), vec![model("phi-3-mini", "1.0.0", versions)]);
    let manager = manager(dir.path(), transport);

    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();
    assert!(report.low_trust);
    assert!(
        manager
            .state()
            .load()
            .unwrap()
            .get("phi-3-mini", "q4")
            .unwrap()
            .low_trust
    );
}

#[tokio::test]
async fn test_cleanup_protects_rollback_target() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.2.0",
        &[("1.0.0", 1), ("1.1.0", 2), ("1.2.0", 3)],
    );
    let manager = manager(dir.path(), transport);
    for version in ["1.0.0", "1.1.0", "1.2.0"] {
        manager
            .install(InstallRequest::new("phi-3-mini").version(version))
            .await
            .unwrap();
    }

    let old = manager.backups().find("phi-3-mini", "1.0.0").unwrap().path;
    let predecessor = manager.backups().find("phi-3-mini", "1.1.0").unwrap().path;
    // Make the predecessor the oldest so age alone would prune it
    set_mtime(&predecessor, 1_000);
    set_mtime(&old, 2_000);

    let report = manager.cleanup(Some(1)).unwrap();
    assert!(report.pruned_backups.is_empty());
    assert!(predecessor.exists());
    assert!(old.exists());

    let report = manager.cleanup(Some(0)).unwrap();
    assert_eq!(report.pruned_backups.len(), 2);
    assert!(!predecessor.exists());
}

#[tokio::test]
async fn test_cleanup_removes_only_stale_partials() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path(), MockTransport::new());

    let stale = dir.path().join("phi-3-mini-q4.gguf.partial");
    let fresh = dir.path().join("llama-q8.gguf.partial");
    fs::write(&stale, "half").unwrap();
    fs::write(&fresh, "half").unwrap();
    set_mtime(&stale, 1_000);

    let report = manager.cleanup(None).unwrap();
    assert_eq!(report.removed_partials, vec![stale.clone()]);
    assert!(!stale.exists());
    assert!(fresh.exists());
}

#[tokio::test]
async fn test_remove_deletes_file_and_entry() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);
    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    let removed = manager.remove("phi-3-mini", None).await.unwrap();
    assert_eq!(removed.version, "1.0.0");
    assert!(!report.file_path.exists());
    assert!(manager.list().unwrap().installed.is_empty());

    let err = manager.remove("phi-3-mini", None).await.unwrap_err();
    assert!(matches!(err.source, KeeperError::NotFound(_)));
}

#[tokio::test]
async fn test_list_reports_untracked_artifacts() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);
    manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    let orphan = dir.path().join("mistral-q4.gguf");
    fs::write(&orphan, artifact(9)).unwrap();

    let inventory = manager.list().unwrap();
    assert_eq!(inventory.installed.len(), 1);
    assert_eq!(inventory.untracked, vec![orphan]);
}

#[tokio::test]
async fn test_verify_detects_modified_artifact() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport);
    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();

    let results = manager.verify_installed(None).await.unwrap();
    assert!(results.iter().all(|r| r.ok));

    let mut data = artifact(1);
    data[100] ^= 0xff;
    fs::write(&report.file_path, data).unwrap();

    let results = manager.verify_installed(Some("phi-3-mini")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].ok);
    assert!(results[0].error.is_some());
}

#[tokio::test]
async fn test_install_many_runs_models_independently() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let phi = artifact(1);
    let llama = artifact(2);
    transport.serve(&url_for("phi-3-mini", "1.0.0"), phi.clone());
    transport.serve(&url_for("llama", "3.0.0"), llama.clone());
    write_registry(
        dir.path(),
        vec![
            model(
                "phi-3-mini",
                "1.0.0",
                vec![version_entry("phi-3-mini", "1.0.0", &phi)],
            ),
            model("llama", "3.0.0", vec![version_entry("llama", "3.0.0", &llama)]),
        ],
    );
    let manager = manager(dir.path(), transport.clone());

    let results = manager
        .install_many(vec![
            InstallRequest::new("phi-3-mini"),
            InstallRequest::new("llama"),
            InstallRequest::new("missing-model"),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().model_id, "phi-3-mini");
    assert_eq!(results[1].as_ref().unwrap().model_id, "llama");
    assert!(results[2].is_err());
    assert_eq!(manager.state().load().unwrap().installed_models.len(), 2);
    assert_eq!(transport.total_calls(), 2);
}

#[tokio::test]
async fn test_concurrent_installs_of_same_model_download_once() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport.clone());

    let results = manager
        .install_many(vec![
            InstallRequest::new("phi-3-mini"),
            InstallRequest::new("phi-3-mini"),
        ])
        .await;

    assert!(results.iter().all(Result::is_ok));
    let actions: Vec<_> = results.into_iter().map(|r| r.unwrap().action).collect();
    assert!(actions.contains(&Action::Installed));
    assert!(actions.contains(&Action::AlreadyInstalled));
    assert_eq!(transport.total_calls(), 1);
}

#[tokio::test]
async fn test_registry_refresh_replaces_document() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let manager = manager(dir.path(), transport.clone());

    let feed = r#"{
        "models": {
            "phi-3-mini": {
                "id": "phi-3-mini",
                "name": "Phi-3 Mini",
                "current_version": "1.0.0",
                "versions": {
                    "1.0.0": {
                        "model_id": "phi-3-mini",
                        "version": "1.0.0",
                        "variant": "q4",
                        "download_url": "https://models.example.com/phi-3-mini/1.0.0/model.gguf",
                        "size_bytes": 4100,
                        "compatibility": ["*"]
                    }
                }
            }
        },
        "registry_version": "2.0.0",
        "last_updated": "2026-03-01T00:00:00Z"
    }"#;
    transport.serve("https://registry.example.com/registry.json", feed.as_bytes().to_vec());

    let count = manager
        .refresh_registry("https://registry.example.com/registry.json")
        .await
        .unwrap();
    assert_eq!(count, 1);
    let doc = manager.registry().load().unwrap();
    assert_eq!(doc.registry_version, "2.0.0");
    assert_eq!(doc.get("phi-3-mini").unwrap().current_version, "1.0.0");

    transport.serve("https://registry.example.com/bad.json", b"<html>".to_vec());
    assert!(manager
        .refresh_registry("https://registry.example.com/bad.json")
        .await
        .is_err());
    assert_eq!(manager.registry().load().unwrap().registry_version, "2.0.0");
}

#[tokio::test]
async fn test_checksum_policy_failures_happen_before_download() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    versions[0].checksum = None;
    write_registry(dir.path(), vec![model("phi-3-mini", "1.0.0", versions.clone())]);

    let mut strict = options(dir.path());
    strict.verifier = IntegrityVerifier::new(DEFAULT_MIN_ARTIFACT_BYTES, true);
    let err = manager_with(strict, transport.clone())
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Checking);
    assert!(matches!(
        err.source,
        KeeperError::Integrity(IntegrityError::MissingChecksum(_))
    ));
    assert_eq!(transport.total_calls(), 0);

    versions[0].checksum = Some("md5:0cc175b9c0f1b6a831c399e269772661".to_string());
    write_registry(dir.path(), vec![model("phi-3-mini", "1.0.0", versions)]);
    let err = manager(dir.path(), transport.clone())
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap_err();

    assert!(matches!(
        err.source,
        KeeperError::Integrity(IntegrityError::UnsupportedAlgorithm(_))
    ));
    assert_eq!(transport.total_calls(), 0);
    assert!(partial_files(dir.path()).is_empty());
    assert!(!dir.path().join("phi-3-mini-q4.gguf").exists());
}

#[tokio::test]
async fn test_prerelease_backup_restores_without_network() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0-rc1", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0-rc1"))
        .await
        .unwrap();

    let report = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap();
    assert_eq!(report.backup_created, Some(true));

    let inventory = manager.list().unwrap();
    assert_eq!(inventory.backups.len(), 1);
    assert_eq!(inventory.backups[0].model_id, "phi-3-mini");
    assert_eq!(inventory.backups[0].version, "1.0.0-rc1");
    transport.reset_calls();

    let report = manager.rollback("phi-3-mini", None, None).await.unwrap();

    assert_eq!(report.version, "1.0.0-rc1");
    assert!(report.restored_from_backup);
    assert_eq!(transport.total_calls(), 0);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
}

#[tokio::test]
async fn test_backup_failure_degrades_to_download_on_rollback() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();

    // A plain file where the backup directory belongs
    fs::write(dir.path().join("backups"), b"not a directory").unwrap();

    let summary = manager.update(None, false).await.unwrap();
    assert!(summary.failed.is_empty());
    assert_eq!(summary.applied.len(), 1);
    assert_eq!(summary.applied[0].version, "1.1.0");
    assert_eq!(summary.applied[0].backup_created, Some(false));
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(2)
    );
    transport.reset_calls();

    let report = manager.rollback("phi-3-mini", None, None).await.unwrap();

    assert_eq!(report.version, "1.0.0");
    assert!(!report.restored_from_backup);
    assert_eq!(transport.calls_for(&url_for("phi-3-mini", "1.0.0")), 1);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
}

#[tokio::test]
async fn test_state_write_failure_puts_previous_artifact_back() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let lock = FailingLock::new();
    let mut opts = options(dir.path());
    opts.lock = lock.clone();
    let manager = manager_with(opts, transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();
    let before = state_bytes(dir.path());

    lock.refuse("local-state.json");
    let err = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Committing);
    assert!(matches!(err.source, KeeperError::Io(_)));
    assert_eq!(err.partial_artifact, None);
    assert_eq!(transport.calls_for(&url_for("phi-3-mini", "1.1.0")), 1);
    assert_eq!(state_bytes(dir.path()), before);
    assert_eq!(
        fs::read(dir.path().join("phi-3-mini-q4.gguf")).unwrap(),
        artifact(1)
    );
    assert!(partial_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_state_write_failure_without_backup_reports_placed_artifact() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let lock = FailingLock::new();
    let mut opts = options(dir.path());
    opts.lock = lock.clone();
    let manager = manager_with(opts, transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();
    let before = state_bytes(dir.path());

    fs::write(dir.path().join("backups"), b"not a directory").unwrap();
    lock.refuse("local-state.json");
    let err = manager
        .install(InstallRequest::new("phi-3-mini"))
        .await
        .unwrap_err();

    let placed = dir.path().join("phi-3-mini-q4.gguf");
    assert_eq!(err.stage, Stage::Committing);
    assert_eq!(err.partial_artifact.as_deref(), Some(placed.as_path()));
    assert_eq!(fs::read(&placed).unwrap(), artifact(2));
    assert_eq!(state_bytes(dir.path()), before);
    assert_eq!(
        manager.state().load().unwrap().get("phi-3-mini", "q4").unwrap().version,
        "1.0.0"
    );
}

#[tokio::test]
async fn test_rollback_ignores_backup_of_another_variant() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = BTreeMap::new();
    for (key, version, variant, seed) in [
        ("1.0.0", "1.0.0", "q4", 1),
        ("1.0.0+f16", "1.0.0", "f16", 3),
        ("1.1.0", "1.1.0", "q4", 2),
        ("1.1.0+f16", "1.1.0", "f16", 4),
    ] {
        let data = artifact(seed);
        let mut entry = version_entry("phi", version, &data);
        entry.variant = variant.to_string();
        entry.download_url = format!("https://models.example.com/phi/{key}/model.gguf");
        transport.serve(&entry.download_url, data);
        versions.insert(key.to_string(), entry);
    }
    let mut phi = model("phi", "1.1.0", Vec::new());
    phi.versions = versions;
    write_registry(dir.path(), vec![phi]);
    let manager = manager(dir.path(), transport.clone());

    for variant in ["q4", "f16"] {
        manager
            .install(InstallRequest::new("phi").version("1.0.0").variant(variant))
            .await
            .unwrap();
    }
    // Both variants back up 1.0.0 to the same name; f16 goes last and wins
    for variant in ["q4", "f16"] {
        manager
            .install(InstallRequest::new("phi").version("1.1.0").variant(variant))
            .await
            .unwrap();
    }
    transport.reset_calls();

    let report = manager.rollback("phi", None, Some("q4")).await.unwrap();

    assert_eq!(report.version, "1.0.0");
    assert!(!report.restored_from_backup);
    assert_eq!(
        transport.calls_for("https://models.example.com/phi/1.0.0/model.gguf"),
        1
    );
    assert_eq!(fs::read(dir.path().join("phi-q4.gguf")).unwrap(), artifact(1));
}

#[tokio::test]
async fn test_backup_restore_tolerates_rounded_registry_size() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut versions = publish(
        dir.path(),
        &transport,
        "phi-3-mini",
        "1.1.0",
        &[("1.0.0", 1), ("1.1.0", 2)],
    );
    let manager = manager(dir.path(), transport.clone());
    manager
        .install(InstallRequest::new("phi-3-mini").version("1.0.0"))
        .await
        .unwrap();
    manager.update(None, false).await.unwrap();

    // The registry now lists 1.0.0 with a size rounded up by a few hundred bytes
    versions[0].size_bytes += 300;
    write_registry(dir.path(), vec![model("phi-3-mini", "1.1.0", versions)]);
    transport.reset_calls();

    let report = manager.rollback("phi-3-mini", None, None).await.unwrap();

    assert!(report.restored_from_backup);
    assert_eq!(transport.total_calls(), 0);
    assert_eq!(report.bytes_written, artifact(1).len() as u64);
}

#[tokio::test]
async fn test_install_recommended_installs_tagged_models_only() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let phi_data = artifact(1);
    let llama_data = artifact(2);
    transport.serve(&url_for("phi-3-mini", "1.0.0"), phi_data.clone());
    transport.serve(&url_for("llama", "3.0.0"), llama_data.clone());

    let mut phi = model(
        "phi-3-mini",
        "1.0.0",
        vec![version_entry("phi-3-mini", "1.0.0", &phi_data)],
    );
    phi.tags.insert(RECOMMENDED_TAG.to_string());
    let llama = model("llama", "3.0.0", vec![version_entry("llama", "3.0.0", &llama_data)]);
    write_registry(dir.path(), vec![phi, llama]);
    let manager = manager(dir.path(), transport.clone());

    let results = manager.install_recommended().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().model_id, "phi-3-mini");
    let state = manager.state().load().unwrap();
    assert!(state.get("phi-3-mini", "q4").is_some());
    assert!(state.get("llama", "q4").is_none());
    assert_eq!(transport.calls_for(&url_for("llama", "3.0.0")), 0);
}

#[tokio::test]
async fn test_unknown_version_lists_versions_and_variants() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    publish(dir.path(), &transport, "phi-3-mini", "1.0.0", &[("1.0.0", 1)]);
    let manager = manager(dir.path(), transport.clone());

    let err = manager
        .install(InstallRequest::new("phi-3-mini").version("9.9.9"))
        .await
        .unwrap_err();

    assert!(matches!(err.source, KeeperError::NotFound(_)));
    let message = err.to_string();
    assert!(message.contains("Available versions: 1.0.0"));
    assert!(message.contains("Available variants: q4"));
    assert_eq!(transport.total_calls(), 0);
}
