// lock.rs
//
// Directory-scoped advisory lock. The claim is an atomic `mkdir` of
// `<store>/.lock`; the owner record inside it is informational and used for
// staleness checks.

use crate::config::LockOptions;
use crate::error::{ProfileStoreError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const LOCK_DIR_NAME: &str = ".lock";
const OWNER_FILE_NAME: &str = "owner.json";
/// Held while a stale claim is being torn down, so only one contender at a
/// time can remove `.lock`.
const RECLAIM_DIR_NAME: &str = ".lock.reclaim";

/// Who holds a store lock and since when (seconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: u32,
    pub timestamp: f64,
}

impl LockRecord {
    fn for_current_process() -> Self {
        Self {
            holder: std::process::id(),
            timestamp: seconds_since_epoch(SystemTime::now()),
        }
    }

    // timestamps pass through JSON, so compare them with a tolerance
    fn same_claim(&self, other: &LockRecord) -> bool {
        self.holder == other.holder && (self.timestamp - other.timestamp).abs() < 1e-3
    }

    fn age(&self) -> Duration {
        let age_secs = seconds_since_epoch(SystemTime::now()) - self.timestamp;
        Duration::from_secs_f64(age_secs.max(0.0))
    }
}

fn seconds_since_epoch(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH).map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

pub fn lock_dir_for(store_dir: &Path) -> PathBuf {
    store_dir.join(LOCK_DIR_NAME)
}

/// Reads the owner record of an existing claim, if there is a readable one.
pub fn read_lock_record(store_dir: &Path) -> Option<LockRecord> {
    read_record_in(&lock_dir_for(store_dir))
}

fn read_record_in(claim_dir: &Path) -> Option<LockRecord> {
    let owner_bytes = fs::read(claim_dir.join(OWNER_FILE_NAME)).ok()?;
    serde_json::from_slice(&owner_bytes).ok()
}

fn dir_age(dir: &Path) -> Option<Duration> {
    let modified = fs::metadata(dir).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO))
}

/// A claim as one contender observed it.
#[derive(Debug, Clone)]
struct ObservedClaim {
    /// `None` while the holder has not written its owner record yet.
    record: Option<LockRecord>,
    age: Duration,
}

impl ObservedClaim {
    /// Whether `current` is still the claim judged stale earlier, and still stale.
    fn unchanged_in(&self, current: &ObservedClaim, ttl: Duration) -> bool {
        match (&self.record, &current.record) {
            (Some(seen), Some(now)) => seen.same_claim(now),
            (None, None) => current.age > ttl,
            _ => false,
        }
    }
}

/// Age of the current claim. Falls back to the lock directory's mtime while the
/// owner record is not yet written. `None` if the claim vanished meanwhile.
fn observe_claim(store_dir: &Path) -> Option<ObservedClaim> {
    if let Some(record) = read_lock_record(store_dir) {
        let age = record.age();
        return Some(ObservedClaim { record: Some(record), age });
    }
    let age = dir_age(&lock_dir_for(store_dir))?;
    Some(ObservedClaim { record: None, age })
}

/// Exclusive right to tear down a stale claim. Removed on drop.
struct ReclaimGuard {
    guard_dir: PathBuf,
}

impl ReclaimGuard {
    fn try_take(store_dir: &Path, ttl: Duration) -> io::Result<Option<Self>> {
        let guard_dir = store_dir.join(RECLAIM_DIR_NAME);
        match fs::create_dir(&guard_dir) {
            Ok(()) => Ok(Some(Self { guard_dir })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // a reclaimer that died mid-way leaves its guard behind
                if dir_age(&guard_dir).map_or(false, |age| age > ttl) {
                    warn!("Removing abandoned reclaim guard {}.", guard_dir.display());
                    let _ = fs::remove_dir(&guard_dir);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.guard_dir) {
            warn!("Could not remove reclaim guard {}: {}", self.guard_dir.display(), e);
        }
    }
}

/// Tears down the claim described by `stale` if it is still in place. Returns
/// whether it was removed; `false` means someone else got there first or the
/// holder moved on, and the caller should simply retry its `mkdir`.
fn reclaim_stale_claim(store_dir: &Path, stale: &ObservedClaim, ttl: Duration) -> io::Result<bool> {
    let _guard = match ReclaimGuard::try_take(store_dir, ttl)? {
        Some(guard) => guard,
        None => return Ok(false),
    };
    match observe_claim(store_dir) {
        Some(current) if stale.unchanged_in(&current, ttl) => {}
        _ => {
            debug!("Stale claim on {} changed hands before it could be reclaimed.", store_dir.display());
            return Ok(false);
        }
    }

    // Move the claim aside first; only the renamed copy is deleted, and only
    // after confirming it is the claim that was judged stale.
    let lock_dir = lock_dir_for(store_dir);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_nanos());
    let tombstone = store_dir.join(format!("{}.stale.{}.{}", LOCK_DIR_NAME, std::process::id(), nanos));
    match fs::rename(&lock_dir, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    let moved_aside = ObservedClaim {
        record: read_record_in(&tombstone),
        age: dir_age(&tombstone).unwrap_or(Duration::ZERO),
    };
    if !stale.unchanged_in(&moved_aside, ttl) {
        warn!(
            "Claim on {} was renewed while being reclaimed; putting it back.",
            store_dir.display()
        );
        if lock_dir.exists() || fs::rename(&tombstone, &lock_dir).is_err() {
            warn!("Could not restore claim from {}.", tombstone.display());
        }
        return Ok(false);
    }
    if let Err(e) = fs::remove_dir_all(&tombstone) {
        warn!("Could not remove reclaimed claim {}: {}", tombstone.display(), e);
    }
    Ok(true)
}

#[cfg(unix)]
fn holder_appears_alive(pid: u32) -> Option<bool> {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return Some(true);
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Some(false),
        Some(libc::EPERM) => Some(true),
        _ => None,
    }
}

#[cfg(not(unix))]
fn holder_appears_alive(_pid: u32) -> Option<bool> {
    None
}

/// Removes a claim regardless of who holds it. Never fails.
pub fn release_lock(store_dir: &Path) {
    let lock_dir = lock_dir_for(store_dir);
    match fs::remove_dir_all(&lock_dir) {
        Ok(()) => debug!("Released lock {}.", lock_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove lock {}: {}", lock_dir.display(), e),
    }
}

/// An exclusive claim on a store directory, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    store_dir: PathBuf,
    record: LockRecord,
    released: bool,
}

impl StoreLock {
    /// Tries to claim `store_dir` until `options.timeout` elapses. `Ok(None)` means
    /// the lock stayed busy; other I/O failures are returned as errors.
    pub fn try_acquire(store_dir: &Path, options: &LockOptions) -> Result<Option<Self>> {
        let lock_dir = lock_dir_for(store_dir);
        let started = Instant::now();
        let mut reported_holder = false;

        loop {
            match fs::create_dir(&lock_dir) {
                Ok(()) => {
                    let record = LockRecord::for_current_process();
                    if let Err(e) = write_owner_record(&lock_dir, &record) {
                        let _ = fs::remove_dir_all(&lock_dir);
                        return Err(ProfileStoreError::Io(e));
                    }
                    debug!(
                        "Acquired lock {} after {:.2?}.",
                        lock_dir.display(),
                        started.elapsed()
                    );
                    return Ok(Some(Self {
                        store_dir: store_dir.to_path_buf(),
                        record,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let observed = match observe_claim(store_dir) {
                        Some(observed) => observed,
                        // the holder released between our mkdir and stat
                        None if started.elapsed() < options.timeout => continue,
                        None => return Ok(None),
                    };
                    if observed.age > options.ttl && options.force {
                        warn!(
                            "Lock {} is {:.0?} old (ttl {:.0?}); force requested, reclaiming it.",
                            lock_dir.display(),
                            observed.age,
                            options.ttl
                        );
                        if reclaim_stale_claim(store_dir, &observed, options.ttl)? {
                            continue;
                        }
                    } else if !reported_holder {
                        report_contention(store_dir, observed.age, options);
                        reported_holder = true;
                    }
                }
                Err(e) => return Err(ProfileStoreError::Io(e)),
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Ok(None);
            }
            thread::sleep(options.retry_interval.min(options.timeout - waited));
        }
    }

    /// Like [`StoreLock::try_acquire`] but a busy lock is a `LockTimeout` error.
    pub fn acquire(store_dir: &Path, options: &LockOptions) -> Result<Self> {
        Self::try_acquire(store_dir, options)?.ok_or_else(|| ProfileStoreError::LockTimeout {
            dir: store_dir.to_path_buf(),
            timeout: options.timeout,
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    // A claim that was force-reclaimed by another process is left alone.
    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match read_lock_record(&self.store_dir) {
            Some(current) if !current.same_claim(&self.record) => warn!(
                "Lock on {} now belongs to pid {}; not removing it.",
                self.store_dir.display(),
                current.holder
            ),
            _ => release_lock(&self.store_dir),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn write_owner_record(lock_dir: &Path, record: &LockRecord) -> io::Result<()> {
    let owner_json = serde_json::to_vec(record)?;
    fs::write(lock_dir.join(OWNER_FILE_NAME), owner_json)
}

fn report_contention(store_dir: &Path, claim_age: Duration, options: &LockOptions) {
    match read_lock_record(store_dir) {
        Some(record) => {
            let liveness = match holder_appears_alive(record.holder) {
                Some(true) => "running",
                Some(false) => "no longer running",
                None => "unknown state",
            };
            info!(
                "Store {} is locked by pid {} ({}) for {:.0?}; waiting up to {:.0?}{}.",
                store_dir.display(),
                record.holder,
                liveness,
                claim_age,
                options.timeout,
                if claim_age > options.ttl && !options.force {
                    " (claim exceeds ttl; pass force to reclaim it)"
                } else {
                    ""
                }
            );
        }
        None => info!(
            "Store {} is locked (owner unknown) for {:.0?}; waiting up to {:.0?}.",
            store_dir.display(),
            claim_age,
            options.timeout
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};

    fn quick_options(timeout_ms: u64) -> LockOptions {
        LockOptions::default()
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_retry_interval(Duration::from_millis(10))
    }

    fn plant_claim(store_dir: &Path, timestamp: f64) {
        let lock_dir = lock_dir_for(store_dir);
        fs::create_dir(&lock_dir).unwrap();
        write_owner_record(&lock_dir, &LockRecord { holder: 1, timestamp }).unwrap();
    }

    #[test]
    fn acquire_writes_owner_record_and_release_clears_it() {
        let store_dir = tempfile::tempdir().unwrap();
        let lock = StoreLock::acquire(store_dir.path(), &quick_options(100)).unwrap();
        let record = read_lock_record(store_dir.path()).unwrap();
        assert_eq!(record.holder, std::process::id());
        assert!(record.same_claim(lock.record()));
        lock.release();
        assert!(!lock_dir_for(store_dir.path()).exists());
    }

    #[test]
    fn second_claim_times_out_while_first_is_held() {
        let store_dir = tempfile::tempdir().unwrap();
        let _held = StoreLock::acquire(store_dir.path(), &quick_options(100)).unwrap();
        let started = Instant::now();
        let contender = StoreLock::try_acquire(store_dir.path(), &quick_options(80)).unwrap();
        assert!(contender.is_none());
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(matches!(
            StoreLock::acquire(store_dir.path(), &quick_options(20)),
            Err(ProfileStoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn waiter_succeeds_once_holder_releases() {
        let store_dir = tempfile::tempdir().unwrap();
        let store_path = store_dir.path().to_path_buf();
        let (held_tx, held_rx) = mpsc::channel();
        let holder_path = store_path.clone();
        let holder = thread::spawn(move || {
            let lock = StoreLock::acquire(&holder_path, &quick_options(1000)).unwrap();
            held_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
            drop(lock);
        });
        held_rx.recv().unwrap();
        let waiter = StoreLock::acquire(&store_path, &quick_options(5000)).unwrap();
        assert_eq!(waiter.record().holder, std::process::id());
        holder.join().unwrap();
    }

    #[test]
    fn stale_claim_is_reclaimed_only_with_force() {
        let store_dir = tempfile::tempdir().unwrap();
        let an_hour_ago = seconds_since_epoch(SystemTime::now()) - 7200.0;
        plant_claim(store_dir.path(), an_hour_ago);

        let polite = quick_options(50).with_ttl(Duration::from_secs(3600));
        assert!(StoreLock::try_acquire(store_dir.path(), &polite).unwrap().is_none());
        assert_eq!(read_lock_record(store_dir.path()).unwrap().holder, 1);

        let forceful = polite.with_force(true);
        let lock = StoreLock::acquire(store_dir.path(), &forceful).unwrap();
        assert_eq!(lock.record().holder, std::process::id());
    }

    #[test]
    fn forced_contenders_reclaim_a_stale_claim_exactly_once() {
        let num_contenders = 4;
        for round in 0..10 {
            let store_dir = tempfile::tempdir().unwrap();
            plant_claim(store_dir.path(), seconds_since_epoch(SystemTime::now()) - 7200.0);
            let forceful = quick_options(300).with_ttl(Duration::from_secs(3600)).with_force(true);
            let start_line = Barrier::new(num_contenders);
            let finish_line = Barrier::new(num_contenders);
            let winners = AtomicUsize::new(0);

            thread::scope(|scope| {
                for _ in 0..num_contenders {
                    scope.spawn(|| {
                        start_line.wait();
                        let claim = StoreLock::try_acquire(store_dir.path(), &forceful).unwrap();
                        if claim.is_some() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                        // winners keep holding until every contender has given up
                        finish_line.wait();
                        drop(claim);
                    });
                }
            });

            assert_eq!(winners.load(Ordering::SeqCst), 1, "round {}", round);
            assert!(!lock_dir_for(store_dir.path()).exists());
            assert!(!store_dir.path().join(RECLAIM_DIR_NAME).exists());
            let leftovers: Vec<_> = fs::read_dir(store_dir.path()).unwrap().collect();
            assert!(leftovers.is_empty(), "round {}: {:?}", round, leftovers);
        }
    }

    #[test]
    fn reclaim_backs_off_when_claim_changed_hands() {
        let store_dir = tempfile::tempdir().unwrap();
        let two_hours_ago = seconds_since_epoch(SystemTime::now()) - 7200.0;
        plant_claim(store_dir.path(), two_hours_ago);
        let stale = observe_claim(store_dir.path()).unwrap();

        // someone else reclaims and takes a fresh claim before we act
        release_lock(store_dir.path());
        plant_claim(store_dir.path(), seconds_since_epoch(SystemTime::now()));

        let ttl = Duration::from_secs(3600);
        assert!(!reclaim_stale_claim(store_dir.path(), &stale, ttl).unwrap());
        let survivor = read_lock_record(store_dir.path()).unwrap();
        assert!(survivor.age() < ttl);
    }

    #[test]
    fn fresh_claim_survives_force() {
        let store_dir = tempfile::tempdir().unwrap();
        plant_claim(store_dir.path(), seconds_since_epoch(SystemTime::now()));
        let forceful = quick_options(50).with_force(true);
        assert!(StoreLock::try_acquire(store_dir.path(), &forceful).unwrap().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let store_dir = tempfile::tempdir().unwrap();
        release_lock(store_dir.path());
        let lock = StoreLock::acquire(store_dir.path(), &quick_options(100)).unwrap();
        release_lock(store_dir.path());
        release_lock(store_dir.path());
        drop(lock);
        assert!(!lock_dir_for(store_dir.path()).exists());
    }

    #[test]
    fn reclaimed_lock_is_not_removed_by_previous_holder() {
        let store_dir = tempfile::tempdir().unwrap();
        let first_holder = StoreLock::acquire(store_dir.path(), &quick_options(100)).unwrap();
        // another process tears the claim down and takes it over
        release_lock(store_dir.path());
        plant_claim(store_dir.path(), seconds_since_epoch(SystemTime::now()));
        drop(first_holder);
        assert_eq!(read_lock_record(store_dir.path()).unwrap().holder, 1);
    }

    #[test]
    fn missing_store_directory_is_an_io_error() {
        let store_dir = tempfile::tempdir().unwrap();
        let absent = store_dir.path().join("not-there");
        assert!(matches!(
            StoreLock::try_acquire(&absent, &quick_options(50)),
            Err(ProfileStoreError::Io(_))
        ));
    }
}
