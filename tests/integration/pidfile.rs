use std::fs;
use std::path::PathBuf;

use tempfile::tempdir;
use vigil::pidfile::PidFile;

fn store_at(path: PathBuf) -> PidFile {
    let mut store = PidFile::new("svc");
    store.set_path(path).unwrap();
    store
}

#[test]
fn full_lifecycle_write_read_overwrite_remove() {
    let temp = tempdir().unwrap();
    let store = store_at(temp.path().join("svc.pid"));

    assert_eq!(store.read(), None);

    store.write(1234).unwrap();
    assert_eq!(store.read(), Some(1234));

    // Overwrite replaces the value in one step.
    store.write(4321).unwrap();
    assert_eq!(store.read(), Some(4321));

    store.remove();
    assert_eq!(store.read(), None);
    // Removing again is still fine.
    store.remove();
}

#[test]
fn no_temporary_sibling_survives_a_successful_write() {
    let temp = tempdir().unwrap();
    let store = store_at(temp.path().join("svc.pid"));
    store.write(77).unwrap();

    let names: Vec<String> = fs::read_dir(temp.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["svc.pid"]);
}

#[test]
fn interrupted_write_never_exposes_a_partial_value() {
    let temp = tempdir().unwrap();
    let store = store_at(temp.path().join("svc.pid"));
    store.write(1234).unwrap();

    // Occupying the temporary path with a directory makes the next write
    // fail before the rename, simulating a crash mid-replacement.
    fs::create_dir(temp.path().join(".svc.pid.tmp")).unwrap();
    assert!(store.write(5678).is_err());

    // A reader at any point sees the complete prior file.
    assert_eq!(store.read(), Some(1234));
}

#[test]
fn write_into_missing_directory_fails_cleanly() {
    let temp = tempdir().unwrap();
    let store = store_at(temp.path().join("no-such-dir").join("svc.pid"));
    assert!(store.write(99).is_err());
    assert_eq!(store.read(), None);
}

#[test]
fn stored_file_is_a_single_numeric_line() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("svc.pid");
    let store = store_at(path.clone());
    store.write(424242).unwrap();
    assert_eq!(fs::read_to_string(path).unwrap(), "424242\n");
}
