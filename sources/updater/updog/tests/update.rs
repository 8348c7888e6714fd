mod common;

use common::{
    artifact, version, DripTransport, Fixture, RecordingTransport, StallingTransport, APP,
};
use std::fs;
use std::num::NonZeroU64;
use std::time::{Duration, Instant};
use tuf_schema::{RoleKeys, RoleType, Root, TargetLayout};
use tuftool::config::RepoConfig;
use tuftool::key::{sign_role, sign_root_successor, KeyPair};
use updog::{bootstrap, FailureReason, Outcome, Update, Updater};

async fn expect_update(updater: &Updater, v: &str) -> Update {
    match updater.check().await {
        Outcome::UpdateAvailable(update) => {
            assert_eq!(update.version, version(v));
            update
        }
        other => panic!("expected update to {v}, got {other:?}"),
    }
}

fn expect_failure(outcome: Outcome, expected: FailureReason) {
    match outcome {
        Outcome::Failed { reason, message } => assert_eq!(reason, expected, "{message}"),
        other => panic!("expected {expected} failure, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_check_apply() {
    let fixture = Fixture::new();
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);

    fixture.publish("1.0.2");
    let update = expect_update(&updater, "1.0.2").await;
    assert_eq!(update.name, APP);
    assert_eq!(update.path, "demo-1.0.2.tar.gz");

    assert_eq!(
        updater.apply(&update).await,
        Outcome::Applied {
            version: version("1.0.2"),
            restart_required: true
        }
    );
    let installation = fixture.installation();
    assert_eq!(installation.active_version().unwrap(), Some(version("1.0.2")));
    let installed = fs::read(installation.current_link().join(APP)).unwrap();
    assert_eq!(installed, artifact("1.0.2"));
    assert_eq!(fixture.version_dirs(), vec!["1.0.2"]);
}

#[tokio::test]
async fn latest_version_needs_no_download() {
    let fixture = Fixture::new();
    fixture.publish("1.0.2");
    assert!(matches!(
        fixture.updater().check_and_apply().await,
        Outcome::Applied { .. }
    ));

    let transport = RecordingTransport::default();
    let updater = Updater::with_transport(fixture.config.clone(), Box::new(transport.clone()));
    for _ in 0..2 {
        assert_eq!(updater.check_and_apply().await, Outcome::NoUpdate);
    }
    let fetched = transport.fetched.lock().unwrap();
    assert!(!fetched.is_empty());
    assert!(
        fetched.iter().all(|url| !url.path().ends_with(".tar.gz")),
        "{fetched:?}"
    );
}

#[tokio::test]
async fn tampered_archive_keeps_previous_install() {
    let fixture = Fixture::new();
    fixture.publish("1.0.1");
    let updater = fixture.updater();
    assert!(matches!(
        updater.check_and_apply().await,
        Outcome::Applied { .. }
    ));

    fixture.publish("1.0.2");
    let path = fixture.archive("1.0.2");
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let update = expect_update(&updater, "1.0.2").await;
    expect_failure(updater.apply(&update).await, FailureReason::IntegrityMismatch);

    let installation = fixture.installation();
    assert_eq!(installation.active_version().unwrap(), Some(version("1.0.1")));
    assert_eq!(
        fs::read(installation.current_link().join(APP)).unwrap(),
        artifact("1.0.1")
    );
    assert_eq!(fixture.version_dirs(), vec!["1.0.1"]);
}

#[tokio::test]
async fn oversized_archive_is_rejected() {
    let fixture = Fixture::new();
    fixture.publish("1.0.2");
    let path = fixture.archive("1.0.2");
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(b"trailing");
    fs::write(&path, bytes).unwrap();

    expect_failure(
        fixture.updater().check_and_apply().await,
        FailureReason::IntegrityMismatch,
    );
    assert_eq!(fixture.installation().active_version().unwrap(), None);
}

#[tokio::test]
async fn replayed_timestamp_is_a_rollback() {
    let fixture = Fixture::new();
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);
    let old_timestamp = fs::read(fixture.metadata("timestamp.json")).unwrap();

    fixture.publish("1.0.2");
    expect_update(&updater, "1.0.2").await;

    fs::write(fixture.metadata("timestamp.json"), old_timestamp).unwrap();
    expect_failure(updater.check().await, FailureReason::VersionRollback);
}

#[tokio::test]
async fn replayed_snapshot_is_a_rollback() {
    let fixture = Fixture::new();
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);
    let old_snapshot = fs::read(fixture.metadata("snapshot.json")).unwrap();

    fixture.publish("1.0.2");
    expect_update(&updater, "1.0.2").await;

    // A new timestamp makes the client fetch the snapshot again.
    fixture.repo.refresh().unwrap();
    fs::write(fixture.metadata("snapshot.json"), old_snapshot).unwrap();
    expect_failure(updater.check().await, FailureReason::VersionRollback);
}

#[tokio::test]
async fn expired_timestamp_fails_closed() {
    let mut fixture = Fixture::new();
    fixture.publish("1.0.2");
    fixture.repo.config_mut().expiration_days.timestamp = -1;
    fixture.repo.refresh().unwrap();

    expect_failure(
        fixture.updater().check_and_apply().await,
        FailureReason::ExpiredMetadata,
    );
    assert_eq!(fixture.installation().active_version().unwrap(), None);
}

#[tokio::test]
async fn altered_timestamp_has_invalid_signature() {
    let fixture = Fixture::new();
    let path = fixture.metadata("timestamp.json");
    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    doc["signed"]["version"] = serde_json::json!(1000);
    fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

    expect_failure(
        fixture.updater().check().await,
        FailureReason::InvalidSignature,
    );
}

#[tokio::test]
async fn client_follows_key_rotation() {
    let fixture = Fixture::new();
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);

    fixture.repo.rotate_key(RoleType::Timestamp).unwrap();
    fixture.repo.rotate_key(RoleType::Root).unwrap();
    fixture.publish("1.0.2");

    let trusted_root = fs::read(&fixture.config.trusted_root).unwrap();
    expect_update(&updater, "1.0.2").await;

    let cache = fixture.config.cache_dir();
    assert!(cache.join("2.root.json").exists());
    assert!(cache.join("3.root.json").exists());
    assert_eq!(fs::read(&fixture.config.trusted_root).unwrap(), trusted_root);

    // The cached chain is reused; a fresh updater reaches the same root without refetching it.
    assert!(matches!(
        fixture.updater().check_and_apply().await,
        Outcome::Applied { .. }
    ));
}

#[tokio::test]
async fn unreachable_repository_is_a_network_failure() {
    let mut fixture = Fixture::new();
    fixture.config.metadata_base_url =
        url::Url::from_directory_path(fixture.dir.path().join("nowhere")).unwrap();
    expect_failure(fixture.updater().check().await, FailureReason::Network);
}

#[tokio::test]
async fn stalled_download_times_out() {
    let mut fixture = Fixture::new();
    fixture.publish("1.0.2");
    fixture.config.fetch_timeout_secs = 1;
    let updater = Updater::with_transport(fixture.config.clone(), Box::new(StallingTransport));

    expect_failure(updater.check_and_apply().await, FailureReason::Timeout);
    assert_eq!(fixture.installation().active_version().unwrap(), None);
    assert!(fixture.version_dirs().is_empty(), "{:?}", fixture.version_dirs());
}

#[tokio::test]
async fn cancelled_background_update_leaves_install_untouched() {
    let fixture = Fixture::new();
    fixture.publish("1.0.2");
    bootstrap::init(&fixture.config).unwrap();

    let updater = Updater::with_transport(fixture.config.clone(), Box::new(StallingTransport));
    let update = bootstrap::spawn_updater(updater, &tokio::runtime::Handle::current());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!update.is_finished());
    update.cancel();

    expect_failure(update.outcome().await, FailureReason::Cancelled);
    assert_eq!(fixture.installation().active_version().unwrap(), None);
    assert!(fixture.version_dirs().is_empty(), "{:?}", fixture.version_dirs());
}

#[test]
fn init_requires_a_valid_trusted_root() {
    let fixture = Fixture::new();
    bootstrap::init(&fixture.config).unwrap();
    assert!(fixture.installation().versions_dir().is_dir());
    assert!(fixture.config.cache_dir().is_dir());

    fs::write(&fixture.config.trusted_root, b"{}").unwrap();
    assert!(bootstrap::init(&fixture.config).is_err());
}

fn current_root(fixture: &Fixture) -> Root {
    fixture
        .repo
        .store()
        .load::<Root>()
        .unwrap()
        .unwrap()
        .signed
}

fn write_json<T: serde::Serialize>(path: std::path::PathBuf, doc: &T) {
    fs::write(path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
}

#[tokio::test]
async fn slow_repository_times_out() {
    let mut fixture = Fixture::new();
    fixture.config.fetch_timeout_secs = 1;
    let transport = DripTransport {
        interval: Duration::from_millis(300),
    };
    let updater = Updater::with_transport(fixture.config.clone(), Box::new(transport));

    let started = Instant::now();
    expect_failure(updater.check().await, FailureReason::Timeout);
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
}

#[tokio::test]
async fn unsigned_field_in_timestamp_is_rejected() {
    let fixture = Fixture::new();
    let path = fixture.metadata("timestamp.json");
    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    doc["signed"]["mirror"] = serde_json::json!("https://elsewhere.example/");
    write_json(path, &doc);

    expect_failure(
        fixture.updater().check().await,
        FailureReason::CorruptMetadata,
    );
}

#[tokio::test]
async fn release_layout_end_to_end() {
    let mut repo_config = RepoConfig::new(APP);
    repo_config.target_layout = TargetLayout::Release;
    let fixture = Fixture::with_repo_config(repo_config);
    assert_eq!(fixture.config.target_layout, TargetLayout::Release);

    fixture.publish("1.0.2");
    let archive = fixture.archive("1.0.2");
    assert!(archive.ends_with("v1.0.2/demo-1.0.2.tar.gz"), "{}", archive.display());
    assert!(archive.is_file());

    let updater = fixture.updater();
    let update = expect_update(&updater, "1.0.2").await;
    assert_eq!(update.path, "demo-1.0.2.tar.gz");
    assert!(matches!(
        updater.apply(&update).await,
        Outcome::Applied { .. }
    ));
    assert_eq!(
        fs::read(fixture.installation().current_link().join(APP)).unwrap(),
        artifact("1.0.2")
    );
}

#[tokio::test]
async fn missing_timestamp_signature_is_below_threshold() {
    let mut repo_config = RepoConfig::new(APP);
    repo_config.thresholds.timestamp = NonZeroU64::new(2).unwrap();
    let fixture = Fixture::with_repo_config(repo_config);
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);

    fixture.publish("1.0.2");
    let path = fixture.metadata("timestamp.json");
    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    let signatures = doc["signatures"].as_array_mut().unwrap();
    assert_eq!(signatures.len(), 2);
    signatures.pop();
    write_json(path, &doc);

    expect_failure(updater.check().await, FailureReason::ThresholdNotMet);
}

#[tokio::test]
async fn root_with_skipped_version_is_rejected() {
    let fixture = Fixture::new();
    let current = current_root(&fixture);
    let mut next = current.clone();
    next.version = NonZeroU64::new(3).unwrap();
    let signed = sign_root_successor(&current, &fixture.repo.keyring().unwrap(), next).unwrap();
    write_json(fixture.metadata("2.root.json"), &signed);

    expect_failure(
        fixture.updater().check().await,
        FailureReason::VersionRollback,
    );
    assert!(!fixture.config.cache_dir().join("2.root.json").exists());
}

#[tokio::test]
async fn root_signed_only_by_its_own_keys_is_rejected() {
    let fixture = Fixture::new();
    let current = current_root(&fixture);
    let mut keyring = fixture.repo.keyring().unwrap();
    let pair = KeyPair::generate().unwrap();
    let public = pair.public_key();
    let keyid = keyring.add(RoleType::Root, pair).unwrap();

    let mut next = current.clone();
    next.version = NonZeroU64::new(2).unwrap();
    next.keys.insert(keyid.clone(), public);
    next.roles.insert(
        RoleType::Root,
        RoleKeys {
            keyids: vec![keyid],
            threshold: NonZeroU64::MIN,
        },
    );
    let signed = sign_role(&next, &keyring, next.clone()).unwrap();
    write_json(fixture.metadata("2.root.json"), &signed);

    expect_failure(
        fixture.updater().check().await,
        FailureReason::InvalidSignature,
    );
}

#[tokio::test]
async fn root_chain_longer_than_limit_is_rejected() {
    let mut fixture = Fixture::new();
    fixture.repo.rotate_key(RoleType::Root).unwrap();
    fixture.config.max_root_updates = 0;

    expect_failure(
        fixture.updater().check().await,
        FailureReason::CorruptMetadata,
    );
}

#[tokio::test]
async fn expired_root_fails_closed() {
    let mut fixture = Fixture::new();
    fixture.repo.config_mut().expiration_days.root = -1;
    fixture.repo.rotate_key(RoleType::Root).unwrap();
    fixture.publish("1.0.2");

    expect_failure(
        fixture.updater().check_and_apply().await,
        FailureReason::ExpiredMetadata,
    );
    assert_eq!(fixture.installation().active_version().unwrap(), None);
}

#[tokio::test]
async fn targets_key_rotation_keeps_cached_targets() {
    let fixture = Fixture::new();
    let updater = fixture.updater();
    assert_eq!(updater.check().await, Outcome::NoUpdate);
    let cache = fixture.config.cache_dir();
    assert!(cache.join("targets.json").exists());

    fixture.repo.rotate_key(RoleType::Targets).unwrap();
    fixture.publish("1.0.2");
    expect_update(&updater, "1.0.2").await;
    assert!(cache.join("2.root.json").exists());
    assert!(cache.join("targets.json").exists());
}
