// ops.rs
//
// Store operations as callers run them: each holds the directory lock for its
// whole duration, including the final renames.

use crate::config::{CompareOptions, LockOptions};
use crate::distance::{self, MatchRecord};
use crate::error::{ProfileStoreError, Result};
use crate::lock::StoreLock;
use crate::matrix::ElementWidth;
use crate::source::{collect_inputs, InMemorySource, ProfileSource, RawProfile, TsvProfileSource};
use crate::store::ProfileStore;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Reads every table into memory so an empty input is caught before the lock
/// is taken and before anything in `out_dir` is replaced.
fn load_tables(table_paths: &[PathBuf]) -> Result<Vec<InMemorySource>> {
    let loaded = table_paths
        .iter()
        .map(|table_path| InMemorySource::drain_from(&mut TsvProfileSource::open(table_path)?))
        .collect::<Result<Vec<_>>>()?;
    if loaded.iter().all(InMemorySource::is_empty) {
        let described: Vec<String> = table_paths.iter().map(|path| path.display().to_string()).collect();
        return Err(ProfileStoreError::empty_input(described.join(", ")));
    }
    Ok(loaded)
}

/// Builds a new store at `out_dir` from a single profile table.
pub fn convert(table_path: &Path, out_dir: &Path, width: ElementWidth, lock_options: &LockOptions) -> Result<ProfileStore> {
    let sources = load_tables(&[table_path.to_path_buf()])?;
    fs::create_dir_all(out_dir)?;
    let _store_lock = StoreLock::acquire(out_dir, lock_options)?;
    info!("Converting {} into {}.", table_path.display(), out_dir.display());
    ProfileStore::rebuild(out_dir, sources, width)
}

/// Appends the profiles of `table_path` to the store at `store_dir`.
pub fn append(store_dir: &Path, table_path: &Path, lock_options: &LockOptions) -> Result<ProfileStore> {
    let new_profiles = TsvProfileSource::open(table_path)?.read_all()?;
    append_profiles(store_dir, &new_profiles, lock_options)
}

pub fn append_profiles(store_dir: &Path, new_profiles: &[RawProfile], lock_options: &LockOptions) -> Result<ProfileStore> {
    let _store_lock = StoreLock::acquire(store_dir, lock_options)?;
    let mut store = ProfileStore::open(store_dir)?;
    store.append(new_profiles)?;
    Ok(store)
}

/// Rebuilds the store at `out_dir` from every table reachable from `inputs`.
pub fn rebuild(inputs: &[PathBuf], out_dir: &Path, width: ElementWidth, lock_options: &LockOptions) -> Result<ProfileStore> {
    let input_tables = collect_inputs(inputs)?;
    if input_tables.is_empty() {
        let described: Vec<String> = inputs.iter().map(|path| path.display().to_string()).collect();
        return Err(ProfileStoreError::empty_input(described.join(", ")));
    }
    let sources = load_tables(&input_tables)?;
    fs::create_dir_all(out_dir)?;
    let _store_lock = StoreLock::acquire(out_dir, lock_options)?;
    ProfileStore::rebuild(out_dir, sources, width)
}

/// Scans `queries` against the store at `store_dir`, passing each match to `sink`
/// and calling `on_query_done` after every query. Returns the number of matches.
pub fn compare<S, F, P>(
    store_dir: &Path,
    queries: &mut S,
    compare_options: &CompareOptions,
    lock_options: &LockOptions,
    mut sink: F,
    mut on_query_done: P,
) -> Result<usize>
where
    S: ProfileSource + ?Sized,
    F: FnMut(MatchRecord) -> Result<()>,
    P: FnMut(&RawProfile),
{
    let query_profiles = queries.read_all()?;
    if query_profiles.is_empty() {
        return Err(ProfileStoreError::empty_input(queries.describe()));
    }
    let _store_lock = StoreLock::acquire(store_dir, lock_options)?;
    let store = ProfileStore::open(store_dir)?;
    distance::check_scan_inputs(store.samples(), &store, compare_options)?;

    let mut emitted_records = 0usize;
    for query in &query_profiles {
        emitted_records += distance::compare_query(
            query,
            store.mappings(),
            store.samples(),
            &store,
            compare_options,
            &mut sink,
        )?;
        on_query_done(query);
    }
    info!(
        "Compared {} queries against {} ({} profiles); {} match(es) within {} differences.",
        query_profiles.len(),
        store_dir.display(),
        store.samples().len(),
        emitted_records,
        compare_options.threshold
    );
    Ok(emitted_records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_lock() -> LockOptions {
        LockOptions::default()
            .with_timeout(Duration::from_millis(300))
            .with_retry_interval(Duration::from_millis(20))
    }

    #[test]
    fn convert_append_compare_through_tables() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let base_table = scratch_dir.path().join("base.tsv");
        let new_table = scratch_dir.path().join("new.tsv");
        fs::write(&base_table, "FILE\tl1\tl2\nA\t1\t2\nB\t1\t3\n").unwrap();
        fs::write(&new_table, "FILE\tl1\tl2\nC\t1\t3\n").unwrap();
        let store_dir = scratch_dir.path().join("store");

        convert(&base_table, &store_dir, ElementWidth::U16, &quick_lock()).unwrap();
        let store = append(&store_dir, &new_table, &quick_lock()).unwrap();
        assert_eq!(store.samples(), &["A", "B", "C"]);

        let mut queries = TsvProfileSource::open(&new_table).unwrap();
        let mut matched = Vec::new();
        let mut queries_done = 0;
        compare(
            &store_dir,
            &mut queries,
            &CompareOptions::new(0, 2),
            &quick_lock(),
            |record| {
                matched.push(record.ref_id);
                Ok(())
            },
            |_| queries_done += 1,
        )
        .unwrap();
        assert_eq!(matched, vec!["B", "C"]);
        assert_eq!(queries_done, 1);
        assert!(!crate::lock::lock_dir_for(&store_dir).exists());
    }

    #[test]
    fn empty_inputs_leave_existing_store_alone() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let table = scratch_dir.path().join("base.tsv");
        let header_only = scratch_dir.path().join("header_only.tsv");
        let empty_dir = scratch_dir.path().join("incoming");
        fs::write(&table, "FILE\tl1\tl2\nA\t1\t2\n").unwrap();
        fs::write(&header_only, "FILE\tl1\tl2\n").unwrap();
        fs::create_dir(&empty_dir).unwrap();
        let store_dir = scratch_dir.path().join("store");
        convert(&table, &store_dir, ElementWidth::U16, &quick_lock()).unwrap();
        let snapshot = |name: &str| fs::read(store_dir.join(name)).unwrap();
        let (matrix_before, index_before) = (snapshot("profiles.npy"), snapshot("profiles_index.json"));

        let result = rebuild(&[empty_dir], &store_dir, ElementWidth::U16, &quick_lock());
        assert!(matches!(result, Err(ProfileStoreError::EmptyInput { .. })));
        let result = rebuild(&[header_only.clone()], &store_dir, ElementWidth::U16, &quick_lock());
        assert!(matches!(result, Err(ProfileStoreError::EmptyInput { .. })));
        let result = convert(&header_only, &store_dir, ElementWidth::U16, &quick_lock());
        assert!(matches!(result, Err(ProfileStoreError::EmptyInput { .. })));

        assert_eq!(snapshot("profiles.npy"), matrix_before);
        assert_eq!(snapshot("profiles_index.json"), index_before);
        assert!(!crate::lock::lock_dir_for(&store_dir).exists());
    }

    #[test]
    fn compare_without_queries_is_an_error() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let table = scratch_dir.path().join("base.tsv");
        let no_queries = scratch_dir.path().join("queries.tsv");
        fs::write(&table, "FILE\tl1\nA\t1\n").unwrap();
        fs::write(&no_queries, "FILE\tl1\n").unwrap();
        let store_dir = scratch_dir.path().join("store");
        convert(&table, &store_dir, ElementWidth::U16, &quick_lock()).unwrap();

        let mut queries = TsvProfileSource::open(&no_queries).unwrap();
        let result = compare(
            &store_dir,
            &mut queries,
            &CompareOptions::new(0, 2),
            &quick_lock(),
            |_| Ok(()),
            |_| {},
        );
        match result {
            Err(err @ ProfileStoreError::EmptyInput { .. }) => assert_eq!(err.exit_code(), 2),
            other => panic!("expected EmptyInput, got {:?}", other),
        }
    }

    #[test]
    fn mutation_waits_for_lock_then_times_out() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let table = scratch_dir.path().join("base.tsv");
        fs::write(&table, "FILE\tl1\nA\t1\n").unwrap();
        let store_dir = scratch_dir.path().join("store");
        convert(&table, &store_dir, ElementWidth::U16, &quick_lock()).unwrap();

        let held = StoreLock::acquire(&store_dir, &quick_lock()).unwrap();
        let result = append_profiles(&store_dir, &[RawProfile::new("B", &["1"])], &quick_lock());
        assert!(matches!(result, Err(ProfileStoreError::LockTimeout { .. })));
        held.release();
        let store = append_profiles(&store_dir, &[RawProfile::new("B", &["1"])], &quick_lock()).unwrap();
        assert_eq!(store.samples().len(), 2);
    }
}
