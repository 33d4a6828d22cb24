//! End-to-end exercise of the store across real on-disk SQLite files,
//! covering migration, account/key CRUD, and the backup/restore/migrate
//! round trip without any SSH transport involved.

use keymaster::config::PoolConfig;
use keymaster::rotation::RotationEngine;
use keymaster::store::Database;

async fn file_store(path: &std::path::Path) -> Database {
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    Database::connect(&dsn, &PoolConfig::default())
        .await
        .expect("connect to file-backed sqlite store")
}

#[tokio::test]
async fn migrations_apply_cleanly_to_a_fresh_file_and_are_idempotent_on_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("keymaster.db");

    let store = file_store(&db_path).await;
    store
        .create_account("deploy", "web01", Some("edge-1"), Some("prod,edge"))
        .await
        .expect("create account");
    drop(store);

    // Reopening the same file must re-run migrations without error and see
    // the previously written row.
    let reopened = file_store(&db_path).await;
    let accounts = reopened.list_accounts(false).await.expect("list accounts");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].username, "deploy");
    assert_eq!(accounts[0].tag_list(), vec!["prod", "edge"]);
}

#[tokio::test]
async fn backup_restore_and_cross_engine_migrate_preserve_fleet_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source_path = dir.path().join("source.db");
    let restored_path = dir.path().join("restored.db");
    let migrated_path = dir.path().join("migrated.db");
    let backup_path = dir.path().join("backup.zst");

    let source = file_store(&source_path).await;
    source
        .create_account("deploy", "web01", Some("edge-1"), None)
        .await
        .expect("create account");
    source
        .create_public_key("ssh-ed25519", "AAAAC3NzaC1lZDI1NTE5AAAA", "shared-key", true, None)
        .await
        .expect("create global key");
    source.rotate_system_key("sys-pub", "sys-priv").await.expect("rotate");

    let engine = RotationEngine::new(source.clone());
    {
        let file = std::fs::File::create(&backup_path).expect("create backup file");
        engine.backup(file).await.expect("backup");
    }

    let restored = file_store(&restored_path).await;
    let restore_engine = RotationEngine::new(restored.clone());
    {
        let file = std::fs::File::open(&backup_path).expect("open backup file");
        restore_engine.restore(file).await.expect("restore");
    }
    let restored_accounts = restored.list_accounts(false).await.expect("list restored accounts");
    assert_eq!(restored_accounts.len(), 1);
    assert_eq!(restored_accounts[0].hostname, "web01");

    let migrated_dsn = format!("sqlite://{}?mode=rwc", migrated_path.display());
    engine.migrate(&migrated_dsn).await.expect("migrate");
    let migrated = file_store(&migrated_path).await;
    let migrated_accounts = migrated.list_accounts(false).await.expect("list migrated accounts");
    assert_eq!(migrated_accounts.len(), 1);
    assert_eq!(migrated_accounts[0].username, "deploy");

    let audit = source.list_audit_log(10).await.expect("audit log");
    assert!(audit.iter().any(|entry| entry.action == "BACKUP"));
    assert!(audit.iter().any(|entry| entry.action == "MIGRATE"));
}
