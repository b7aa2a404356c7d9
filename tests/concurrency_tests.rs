//! Refcount atomicity under concurrent backup runs: threads sharing one
//! handle, and separate handles (connections) on the same database file.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use backup_journal::store::db::JournalDb;

use common::{file, open_db, shadow_copy};

const THREADS: usize = 8;
const ROUNDS: usize = 50;

#[test]
fn shared_handle_refcount_is_exact() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(open_db(tmp.path()));
    let id = db.shadowcopies().add_shadowcopy(&shadow_copy(1, 1)).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    db.shadowcopies().mod_shadowcopy_ref_count(id, 1).unwrap();
                    db.shadowcopies().mod_shadowcopy_ref_count(id, -1).unwrap();
                }
                db.shadowcopies().mod_shadowcopy_ref_count(id, 1).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let refs = db.shadowcopies().get_shadowcopy(id).unwrap().unwrap().refs;
    assert_eq!(refs, 1 + THREADS as i64);
}

#[test]
fn separate_connections_never_lose_updates() {
    let tmp = tempfile::tempdir().unwrap();
    let id = {
        let db = open_db(tmp.path());
        db.shadowcopies().add_shadowcopy(&shadow_copy(2, 0)).unwrap()
    };
    let root = Arc::new(tmp.path().to_path_buf());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let root = Arc::clone(&root);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = open_db(&root);
                barrier.wait();
                for _ in 0..ROUNDS {
                    db.shadowcopies().mod_shadowcopy_ref_count(id, 1).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let db = open_db(tmp.path());
    let refs = db.shadowcopies().get_shadowcopy(id).unwrap().unwrap().refs;
    assert_eq!(refs, (THREADS * ROUNDS) as i64);
}

#[test]
fn releases_never_drive_refcount_negative() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(open_db(tmp.path()));
    let start = 3;
    let id = db
        .shadowcopies()
        .add_shadowcopy(&shadow_copy(3, start))
        .unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // Exactly one release observes the transition to zero.
                match db.shadowcopies().mod_shadowcopy_ref_count(id, -1) {
                    Ok(0) => 1,
                    _ => 0,
                }
            })
        })
        .collect();
    let zero_observers: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(zero_observers, 1);
    assert_eq!(db.shadowcopies().get_shadowcopy(id).unwrap().unwrap().refs, 0);
}

#[test]
fn readers_see_whole_generations_during_replacement() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(open_db(tmp.path()));
    let small = vec![file("a", 1, b"1")];
    let large: Vec<_> = (0..20).map(|i| file(&format!("f{i:02}"), i, b"x")).collect();
    db.files().modify_files("/data", &small).unwrap();

    let writer = {
        let db = Arc::clone(&db);
        let (small, large) = (small.clone(), large.clone());
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let next = if round % 2 == 0 { &large } else { &small };
                db.files().modify_files("/data", next).unwrap();
            }
        })
    };
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let len = db.files().get_files("/data").unwrap().unwrap().len();
                assert!(len == 1 || len == 20, "observed a mixed generation: {len}");
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn reset_on_other_connection_never_yields_recorded_but_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let listing = vec![file("a", 1, b"1")];
    open_db(tmp.path()).files().modify_files("/data", &listing).unwrap();
    let root = Arc::new(tmp.path().to_path_buf());

    let writer = {
        let root = Arc::clone(&root);
        thread::spawn(move || {
            let db = open_db(&root);
            for _ in 0..ROUNDS {
                db.files().remove_all_files().unwrap();
                db.files().modify_files("/data", &listing).unwrap();
            }
        })
    };
    let reader = {
        let root = Arc::clone(&root);
        thread::spawn(move || {
            let db = open_db(&root);
            for _ in 0..ROUNDS * 4 {
                // Either unrecorded or the full one-entry list, never in between.
                match db.files().get_files("/data").unwrap() {
                    None => {}
                    Some(rows) => assert_eq!(rows.len(), 1, "marker read without its rows"),
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
}

fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<JournalDb>();
}
