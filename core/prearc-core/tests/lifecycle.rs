//! End-to-end lifecycle over the SQLite store and the bundled builder.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use prearc_core::{
    ArchiveRequest, BuildRequest, PrearcConfig, PrearcError, PrearcStatus, Prearchive,
    PrearchiveCode, ProjectConfig, RequestMetadata, Settle, SessionDocument, Triple, User,
};
use tempfile::tempdir;

fn config(root: &Path) -> PrearcConfig {
    let mut config = PrearcConfig::with_root(root);
    config.projects.insert(
        "ALPHA".to_string(),
        ProjectConfig {
            aliases: vec!["alpha".to_string()],
            prearchive_code: Some(PrearchiveCode::AutoArchive.code()),
            ..Default::default()
        },
    );
    config
}

/// Unassigned sessions sit directly under the staging root.
fn session_dir(root: &Path, triple: &Triple) -> PathBuf {
    let mut dir = root.join("prearchive");
    if let Some(project) = triple.project.as_deref() {
        dir.push(project);
    }
    dir.join(&triple.timestamp).join(&triple.folder)
}

fn receive_file(root: &Path, triple: &Triple, name: &str) {
    let dir = session_dir(root, triple).join("scans/1");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), b"DICM").unwrap();
}

fn triple() -> Triple {
    Triple::new(Some("ALPHA"), "20240102_030405123", "S1")
}

#[test]
fn test_full_session_lifecycle() {
    let temp = tempdir().unwrap();
    let prearchive = Prearchive::from_config(config(temp.path())).unwrap();
    let triple = triple();

    // Receiver holds a lock per file while writing.
    let lock = prearchive.locks().lock_file(&triple, "1.dcm").unwrap();
    receive_file(temp.path(), &triple, "1.dcm");
    let record = prearchive.add_session(&triple, None).unwrap();
    assert_eq!(record.status, PrearcStatus::Receiving);
    assert!(prearchive.locks().is_session_receiving(&triple));
    lock.release();
    prearchive.locks().clean_lock_dirs(&triple);
    assert!(!prearchive.locks().is_session_receiving(&triple));

    // Build the document.
    let request = BuildRequest {
        subject: Some("SUBJ01".to_string()),
        ..Default::default()
    };
    let record = prearchive.rebuild_session(&triple, &request).unwrap();
    assert_eq!(record.status, PrearcStatus::Ready);
    assert_eq!(record.subject.as_deref(), Some("SUBJ01"));
    assert!(prearchive.potentially_ready(&triple).unwrap());

    let document = prearchive
        .locator()
        .session_document(&User::system(), &triple, true)
        .unwrap();
    let doc = SessionDocument::load(&document).unwrap().unwrap();
    assert_eq!(doc.file_count, 1);
    assert_eq!(doc.label.as_deref(), Some("S1"));

    // Project policy says auto-archive.
    let mut meta = RequestMetadata::new();
    assert!(prearchive.is_auto_archive(&ArchiveRequest::for_record(&record), &mut meta));
    assert_eq!(meta.reason(), Some("auto-archive"));
    assert!(!prearchive.is_overwrite_files(&ArchiveRequest::for_record(&record)));

    // Delete, then the same triple arrives again.
    let mut record = prearchive.store().get(&triple).unwrap().unwrap();
    record.prevent_anon = true;
    prearchive.store().update(&record).unwrap();
    prearchive.delete_session(&User::system(), &triple).unwrap();
    assert_eq!(prearchive.get_status(&triple).unwrap(), None);
    assert!(!session_dir(temp.path(), &triple).exists());

    receive_file(temp.path(), &triple, "2.dcm");
    let again = prearchive.add_session(&triple, None).unwrap();
    assert!(again.prevent_anon);
    assert_eq!(prearchive.logs().list(&triple).unwrap().len(), 1);
}

#[test]
fn test_reset_carries_policy_through_sqlite() {
    let temp = tempdir().unwrap();
    let prearchive = Prearchive::from_config(config(temp.path())).unwrap();
    let triple = triple();
    receive_file(temp.path(), &triple, "1.dcm");

    let mut record = prearchive.add_session(&triple, None).unwrap();
    record.auto_archive = Some(PrearchiveCode::AutoArchiveOverwrite);
    record.prevent_anon = true;
    record.source = Some("DICOM-SCP-1".to_string());
    record.status = PrearcStatus::InProcessBuilding;
    prearchive.store().update(&record).unwrap();

    let rebuilt = prearchive.reset_status(&triple, None).unwrap();
    assert_eq!(rebuilt.status, PrearcStatus::Receiving);
    assert_eq!(rebuilt.auto_archive, Some(PrearchiveCode::AutoArchiveOverwrite));
    assert!(rebuilt.prevent_anon);
    assert_eq!(rebuilt.source.as_deref(), Some("DICOM-SCP-1"));

    // Reopening the database sees the same record.
    let reopened = Prearchive::from_config(config(temp.path())).unwrap();
    assert_eq!(reopened.store().get(&triple).unwrap().unwrap(), rebuilt);
}

#[test]
fn test_concurrent_transitions_never_overlap() {
    let temp = tempdir().unwrap();
    let prearchive = Arc::new(Prearchive::from_config(config(temp.path())).unwrap());
    let triple = triple();
    receive_file(temp.path(), &triple, "1.dcm");
    prearchive.add_session(&triple, None).unwrap();

    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let prearchive = prearchive.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            let barrier = barrier.clone();
            let triple = triple.clone();
            std::thread::spawn(move || {
                barrier.wait();
                prearchive.run_transition(&triple, PrearcStatus::Archiving, |_| {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(Settle::Ready)
                })
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert!(err.is_retryable(), "{err}"),
        }
    }
    assert!(succeeded >= 1);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(
        prearchive.get_status(&triple).unwrap(),
        Some(PrearcStatus::Ready)
    );
}

#[test]
fn test_unassigned_sessions_need_an_admin_or_background_caller() {
    let temp = tempdir().unwrap();
    let prearchive = Prearchive::from_config(config(temp.path())).unwrap();
    let triple = Triple::new(None, "20240102_030405", "S1");
    receive_file(temp.path(), &triple, "1.dcm");

    // Background registration is allowed for unassigned sessions.
    prearchive.add_session(&triple, None).unwrap();

    let err = prearchive
        .list_sessions(&User::new("jdoe").with_edit("ALPHA"), None)
        .unwrap_err();
    assert!(matches!(err, PrearcError::Unauthorized { .. }));

    let admin = User::new("curator").with_data_admin();
    assert_eq!(prearchive.list_sessions(&admin, None).unwrap().len(), 1);
}

#[test]
fn test_alias_resolves_to_project_directory() {
    let temp = tempdir().unwrap();
    let prearchive = Prearchive::from_config(config(temp.path())).unwrap();
    let dir = prearchive
        .locator()
        .prearc_dir(&User::system(), Some("alpha"), false)
        .unwrap();
    assert_eq!(dir, temp.path().join("prearchive/ALPHA"));

    let err = prearchive
        .locator()
        .prearc_dir(&User::system(), Some("GAMMA"), false)
        .unwrap_err();
    assert!(err.is_not_found());
}
