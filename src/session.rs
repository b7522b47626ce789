//! GraphiVault - Session Controller
//!
//! Owns the master key and the lock state machine:
//!
//! ```text
//! Uninitialized --initialize--> Locked
//! Locked --unlock ok--> Unlocked
//! Locked --unlock fail--> Locked (failed_attempts + 1)
//! Locked --failed_attempts >= max--> LockedOut (until now + lockout)
//! LockedOut --lockout elapsed--> Locked
//! Unlocked --unlock ok--> Unlocked (password checked again)
//! Unlocked --unlock fail--> Unlocked (failed_attempts + 1), LockedOut at max
//! Unlocked --lock | idle timeout--> Locked (key zeroized first)
//! ```
//!
//! The key sits behind a `parking_lot::RwLock`. Record operations hold a read
//! guard for their whole duration; unlock, lock and rekey take the write
//! guard, so the key is only wiped after the last in-flight reader is done.
//! Bookkeeping lives in a separate mutex (always taken after the key lock)
//! so status queries never wait behind a long record operation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::crypto::kdf::KeyDeriver;
use crate::crypto::keys::{MasterKey, SecretPassword};
use crate::error::{VaultError, VaultResult};
use crate::manifest::VaultManifest;

// ═══════════════════════════════════════════════════════════════════════════
// CLOCK
// ═══════════════════════════════════════════════════════════════════════════

/// Wall-clock source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Locked,
    Unlocked,
    LockedOut,
}

#[derive(Debug, Clone)]
struct SessionState {
    phase: SessionPhase,
    failed_attempts: u32,
    last_activity: Option<DateTime<Utc>>,
    lockout_until: Option<DateTime<Utc>>,
    key_epoch: Option<u32>,
    /// Idle-timeout locks not yet collected by the facade
    idle_locks: Vec<DateTime<Utc>>,
}

/// Snapshot for callers. Contains no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionPhase,
    pub failed_attempts: u32,
    pub remaining_attempts: u32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
    pub idle_remaining_secs: Option<u64>,
    pub key_epoch: Option<u32>,
}

/// Why the session went from Unlocked to Locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Explicit,
    IdleTimeout,
}

/// Read access to the unlocked key for one operation
pub type KeyGuard<'a> = MappedRwLockReadGuard<'a, MasterKey>;

/// Exclusive access to the key slot (rekey)
pub struct ExclusiveKey<'a> {
    session: &'a SessionController,
    slot: RwLockWriteGuard<'a, Option<MasterKey>>,
}

impl<'a> ExclusiveKey<'a> {
    pub fn key(&self) -> VaultResult<&MasterKey> {
        self.slot.as_ref().ok_or(VaultError::NotUnlocked)
    }

    /// Install a new key; the previous one is zeroized before this returns
    pub fn replace(&mut self, key: MasterKey) {
        let epoch = key.epoch();
        self.session.wipe(&mut self.slot);
        *self.slot = Some(key);

        let mut state = self.session.state.lock();
        state.key_epoch = Some(epoch);
        state.last_activity = Some(self.session.clock.now());
    }

    /// Record activity without releasing exclusivity
    pub fn touch(&self) {
        self.session.touch();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════

/// Session Controller - sole owner of the master key
pub struct SessionController {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    deriver: Arc<dyn KeyDeriver>,
    key: RwLock<Option<MasterKey>>,
    state: Mutex<SessionState>,
    #[cfg(test)]
    last_wiped: Mutex<Option<[u8; crate::crypto::KEY_LEN]>>,
}

impl SessionController {
    /// Start Locked if the vault exists, Uninitialized otherwise
    pub fn new(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        deriver: Arc<dyn KeyDeriver>,
        initialized: bool,
    ) -> Self {
        let phase = if initialized {
            SessionPhase::Locked
        } else {
            SessionPhase::Uninitialized
        };

        Self {
            config,
            clock,
            deriver,
            key: RwLock::new(None),
            state: Mutex::new(SessionState {
                phase,
                failed_attempts: 0,
                last_activity: None,
                lockout_until: None,
                key_epoch: None,
                idle_locks: Vec::new(),
            }),
            #[cfg(test)]
            last_wiped: Mutex::new(None),
        }
    }

    pub fn deriver(&self) -> &dyn KeyDeriver {
        self.deriver.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Uninitialized -> Locked
    pub fn mark_initialized(&self) {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Uninitialized {
            state.phase = SessionPhase::Locked;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNLOCK / LOCK
    // ═══════════════════════════════════════════════════════════════════════

    /// Unlock with a password against `manifest`.
    ///
    /// While locked out this returns immediately without deriving a key.
    /// On an unlocked session the password is verified again and a mismatch
    /// counts as a failed attempt.
    pub fn unlock(&self, password: &SecretPassword, manifest: &VaultManifest) -> VaultResult<()> {
        let mut slot = self.key.write();
        let now = self.clock.now();

        let reverify = {
            let mut state = self.state.lock();
            self.refresh(&mut slot, &mut state, now);

            match state.phase {
                SessionPhase::Uninitialized => {
                    return Err(VaultError::NotFound("vault is not initialized".into()));
                }
                SessionPhase::LockedOut => return Err(locked_out(&state, now)),
                SessionPhase::Unlocked => true,
                SessionPhase::Locked => false,
            }
        };

        // Exclusive region held across the KDF run
        let derived = manifest.unlock_with(password, self.deriver.as_ref());
        let now = self.clock.now();
        let mut state = self.state.lock();

        match derived {
            Ok(key) => {
                self.wipe(&mut slot);
                state.phase = SessionPhase::Unlocked;
                state.failed_attempts = 0;
                state.lockout_until = None;
                state.last_activity = Some(now);
                state.key_epoch = Some(key.epoch());
                *slot = Some(key);
                if reverify {
                    log::info!("Session password re-verified");
                } else {
                    log::info!("Session unlocked");
                }
                Ok(())
            }
            Err(VaultError::WrongPasswordOrCorrupt) => {
                state.failed_attempts += 1;
                if state.failed_attempts >= self.config.max_failed_attempts {
                    self.wipe(&mut slot);
                    state.key_epoch = None;
                    state.last_activity = None;
                    state.phase = SessionPhase::LockedOut;
                    state.lockout_until = Some(now + self.config.lockout_duration());
                    log::warn!(
                        "Locked out after {} failed unlock attempts",
                        state.failed_attempts
                    );
                    return Err(locked_out(&state, now));
                }
                log::warn!(
                    "Unlock failed ({}/{})",
                    state.failed_attempts,
                    self.config.max_failed_attempts
                );
                Err(VaultError::WrongPasswordOrCorrupt)
            }
            Err(other) => Err(other),
        }
    }

    /// Zeroize the key and lock. Always succeeds; idempotent.
    pub fn lock(&self) -> bool {
        let mut slot = self.key.write();
        let mut state = self.state.lock();
        self.lock_with(&mut slot, &mut state, LockReason::Explicit)
    }

    /// Lock if the idle timeout has passed. Never waits on in-flight operations.
    pub fn check_timeout(&self) -> bool {
        if !self.idle_expired(self.clock.now()) {
            return false;
        }
        match self.key.try_write() {
            Some(mut slot) => self.expire_locked(&mut slot),
            // Somebody is mid-operation, which is activity in itself
            None => false,
        }
    }

    /// Times of idle-timeout locks since the last call
    pub fn take_idle_locks(&self) -> Vec<DateTime<Utc>> {
        std::mem::take(&mut self.state.lock().idle_locks)
    }

    /// Update last activity
    pub fn touch(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Unlocked {
            state.last_activity = Some(now);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // KEY ACCESS
    // ═══════════════════════════════════════════════════════════════════════

    /// Shared key access for one record operation
    pub fn read_key(&self) -> VaultResult<KeyGuard<'_>> {
        if self.idle_expired(self.clock.now()) {
            let mut slot = self.key.write();
            if self.expire_locked(&mut slot) {
                return Err(VaultError::NotUnlocked);
            }
        }

        RwLockReadGuard::try_map(self.key.read(), |slot| slot.as_ref())
            .map_err(|_| VaultError::NotUnlocked)
    }

    /// Exclusive key access, waiting for in-flight operations to drain
    pub fn exclusive(&self) -> VaultResult<ExclusiveKey<'_>> {
        let mut slot = self.key.write();
        self.expire_locked(&mut slot);

        if slot.is_none() {
            return Err(VaultError::NotUnlocked);
        }

        Ok(ExclusiveKey {
            session: self,
            slot,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATUS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> SessionStatus {
        self.check_timeout();

        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.phase == SessionPhase::LockedOut && lockout_elapsed(&state, now) {
            end_lockout(&mut state);
        }

        let retry_after_secs = match (state.phase, state.lockout_until) {
            (SessionPhase::LockedOut, Some(until)) => Some(seconds_until(now, until)),
            _ => None,
        };

        let idle_remaining_secs = match (state.phase, state.last_activity) {
            (SessionPhase::Unlocked, Some(last)) => {
                Some(seconds_until(now, last + self.config.idle_timeout()))
            }
            _ => None,
        };

        SessionStatus {
            state: state.phase,
            failed_attempts: state.failed_attempts,
            remaining_attempts: self
                .config
                .max_failed_attempts
                .saturating_sub(state.failed_attempts),
            lockout_until: state.lockout_until,
            retry_after_secs,
            idle_remaining_secs,
            key_epoch: state.key_epoch,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.status().state
    }

    pub fn is_unlocked(&self) -> bool {
        self.phase() == SessionPhase::Unlocked
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    fn idle_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        idle_expired(&state, now, self.config.idle_timeout())
    }

    /// Re-check under the write guard and lock if still idle
    fn expire_locked(&self, slot: &mut Option<MasterKey>) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if idle_expired(&state, now, self.config.idle_timeout()) {
            self.lock_with(slot, &mut state, LockReason::IdleTimeout)
        } else {
            false
        }
    }

    /// Apply time-driven transitions while holding both locks
    fn refresh(&self, slot: &mut Option<MasterKey>, state: &mut SessionState, now: DateTime<Utc>) {
        if state.phase == SessionPhase::LockedOut && lockout_elapsed(state, now) {
            end_lockout(state);
        }
        if idle_expired(state, now, self.config.idle_timeout()) {
            self.lock_with(slot, state, LockReason::IdleTimeout);
        }
    }

    fn lock_with(
        &self,
        slot: &mut Option<MasterKey>,
        state: &mut SessionState,
        reason: LockReason,
    ) -> bool {
        let wiped = self.wipe(slot);
        state.key_epoch = None;
        state.last_activity = None;

        if state.phase == SessionPhase::Unlocked {
            state.phase = SessionPhase::Locked;
            match reason {
                LockReason::Explicit => log::info!("Session locked"),
                LockReason::IdleTimeout => {
                    state.idle_locks.push(self.clock.now());
                    log::info!("Session locked after idle timeout");
                }
            }
            return true;
        }

        wiped
    }

    /// Zeroize and drop the held key
    fn wipe(&self, slot: &mut Option<MasterKey>) -> bool {
        match slot.take() {
            Some(key) => {
                #[cfg(test)]
                {
                    *self.last_wiped.lock() = Some(key.wipe_and_inspect());
                }
                #[cfg(not(test))]
                {
                    use zeroize::Zeroize;
                    let mut key = key;
                    key.zeroize();
                }
                true
            }
            None => false,
        }
    }

    /// Contents of the most recently wiped key buffer
    #[cfg(test)]
    pub(crate) fn last_wiped(&self) -> Option<[u8; crate::crypto::KEY_LEN]> {
        *self.last_wiped.lock()
    }
}

fn idle_expired(state: &SessionState, now: DateTime<Utc>, timeout: Duration) -> bool {
    match (state.phase, state.last_activity) {
        (SessionPhase::Unlocked, Some(last)) => now - last > timeout,
        _ => false,
    }
}

fn lockout_elapsed(state: &SessionState, now: DateTime<Utc>) -> bool {
    state.lockout_until.map_or(true, |until| now >= until)
}

fn end_lockout(state: &mut SessionState) {
    state.phase = SessionPhase::Locked;
    state.failed_attempts = 0;
    state.lockout_until = None;
    log::info!("Lockout elapsed");
}

fn locked_out(state: &SessionState, now: DateTime<Utc>) -> VaultError {
    let until = state.lockout_until.unwrap_or(now);
    VaultError::LockedOut {
        until,
        retry_after_secs: seconds_until(now, until),
    }
}

/// Whole seconds from `now` to `until`, rounded up, never negative
fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::kdf::{KdfParams, StandardKdf};
    use crate::crypto::keys::RootKey;
    use crate::secure_fs::SecureFs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Deriver that counts invocations
    #[derive(Default)]
    pub(crate) struct CountingKdf {
        pub calls: AtomicUsize,
    }

    impl KeyDeriver for CountingKdf {
        fn derive(
            &self,
            password: &SecretPassword,
            salt: &[u8],
            params: &KdfParams,
        ) -> VaultResult<RootKey> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StandardKdf.derive(password, salt, params)
        }
    }

    struct Fixture {
        _dir: TempDir,
        manifest: VaultManifest,
        clock: Arc<ManualClock>,
        kdf: Arc<CountingKdf>,
        session: SessionController,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());
        let manifest = VaultManifest::create(
            &fs,
            &"correct-horse".into(),
            &KdfParams::pbkdf2_sha512(1_000),
            &StandardKdf,
        )
        .unwrap();

        let clock = Arc::new(ManualClock::default());
        let kdf = Arc::new(CountingKdf::default());
        let config = SessionConfig {
            idle_timeout_secs: 60,
            max_failed_attempts: 3,
            lockout_duration_secs: 300,
        };
        let session = SessionController::new(config, clock.clone(), kdf.clone(), true);

        Fixture {
            _dir: dir,
            manifest,
            clock,
            kdf,
            session,
        }
    }

    fn calls(f: &Fixture) -> usize {
        f.kdf.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_unlock_success() {
        let f = fixture();
        assert_eq!(f.session.phase(), SessionPhase::Locked);

        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        let status = f.session.status();
        assert_eq!(status.state, SessionPhase::Unlocked);
        assert_eq!(status.failed_attempts, 0);
        assert_eq!(status.key_epoch, Some(f.manifest.key_epoch));
        assert!(f.session.read_key().is_ok());
    }

    #[test]
    fn test_wrong_password_increments_by_one() {
        let f = fixture();

        for expected in 1..3 {
            let result = f.session.unlock(&"wrong-pw".into(), &f.manifest);
            assert!(matches!(result, Err(VaultError::WrongPasswordOrCorrupt)));

            let status = f.session.status();
            assert_eq!(status.state, SessionPhase::Locked);
            assert_eq!(status.failed_attempts, expected);
        }
    }

    #[test]
    fn test_lockout_skips_derivation() {
        let f = fixture();

        for _ in 0..2 {
            let _ = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        }
        let third = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        assert!(matches!(third, Err(VaultError::LockedOut { retry_after_secs: 300, .. })));
        assert_eq!(f.session.phase(), SessionPhase::LockedOut);

        let before = calls(&f);
        let blocked = f.session.unlock(&"correct-horse".into(), &f.manifest);
        assert!(matches!(blocked, Err(VaultError::LockedOut { .. })));
        assert_eq!(calls(&f), before);
    }

    #[test]
    fn test_lockout_expires() {
        let f = fixture();
        for _ in 0..3 {
            let _ = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        }

        f.clock.advance(Duration::seconds(299));
        assert_eq!(f.session.status().retry_after_secs, Some(1));

        f.clock.advance(Duration::seconds(1));
        let status = f.session.status();
        assert_eq!(status.state, SessionPhase::Locked);
        assert_eq!(status.failed_attempts, 0);

        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();
        assert!(f.session.is_unlocked());
    }

    #[test]
    fn test_lock_wipes_key() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        assert!(f.session.lock());
        assert_eq!(f.session.last_wiped(), Some([0u8; crate::crypto::KEY_LEN]));
        assert!(matches!(f.session.read_key(), Err(VaultError::NotUnlocked)));

        // Idempotent
        assert!(!f.session.lock());
        assert_eq!(f.session.phase(), SessionPhase::Locked);
    }

    #[test]
    fn test_idle_timeout_locks_on_access() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        f.clock.advance(Duration::seconds(45));
        f.session.touch();
        f.clock.advance(Duration::seconds(45));
        assert!(f.session.read_key().is_ok());

        f.clock.advance(Duration::seconds(61));
        assert!(matches!(f.session.read_key(), Err(VaultError::NotUnlocked)));
        assert_eq!(f.session.phase(), SessionPhase::Locked);
        assert_eq!(f.session.last_wiped(), Some([0u8; crate::crypto::KEY_LEN]));
    }

    #[test]
    fn test_check_timeout_does_not_wait_on_readers() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();
        f.clock.advance(Duration::seconds(120));

        let guard = RwLockReadGuard::try_map(f.session.key.read(), |s| s.as_ref()).ok();
        assert!(guard.is_some());
        assert!(!f.session.check_timeout());
        drop(guard);

        assert!(f.session.check_timeout());
        assert_eq!(f.session.phase(), SessionPhase::Locked);
    }

    #[test]
    fn test_unlock_while_unlocked_reverifies() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        let before = calls(&f);
        let result = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        assert!(matches!(result, Err(VaultError::WrongPasswordOrCorrupt)));
        assert_eq!(calls(&f), before + 1);

        let status = f.session.status();
        assert_eq!(status.state, SessionPhase::Unlocked);
        assert_eq!(status.failed_attempts, 1);

        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();
        assert_eq!(f.session.status().failed_attempts, 0);
        assert!(f.session.read_key().is_ok());
    }

    #[test]
    fn test_wrong_reverify_can_lock_out() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        for _ in 0..2 {
            let _ = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        }
        let third = f.session.unlock(&"wrong-pw".into(), &f.manifest);
        assert!(matches!(third, Err(VaultError::LockedOut { .. })));

        assert_eq!(f.session.phase(), SessionPhase::LockedOut);
        assert_eq!(f.session.last_wiped(), Some([0u8; crate::crypto::KEY_LEN]));
        assert!(matches!(f.session.read_key(), Err(VaultError::NotUnlocked)));
    }

    #[test]
    fn test_idle_locks_are_reported_once() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();
        f.session.lock();
        assert!(f.session.take_idle_locks().is_empty());

        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();
        f.clock.advance(Duration::seconds(61));
        assert!(f.session.read_key().is_err());

        assert_eq!(f.session.take_idle_locks(), vec![f.clock.now()]);
        assert!(f.session.take_idle_locks().is_empty());
    }

    #[test]
    fn test_uninitialized_rejects_unlock() {
        let f = fixture();
        let session = SessionController::new(
            SessionConfig::default(),
            f.clock.clone(),
            f.kdf.clone(),
            false,
        );
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert!(matches!(
            session.unlock(&"correct-horse".into(), &f.manifest),
            Err(VaultError::NotFound(_))
        ));

        session.mark_initialized();
        assert_eq!(session.phase(), SessionPhase::Locked);
    }

    #[test]
    fn test_exclusive_replace_wipes_previous() {
        let f = fixture();
        f.session.unlock(&"correct-horse".into(), &f.manifest).unwrap();

        {
            let mut exclusive = f.session.exclusive().unwrap();
            exclusive.replace(MasterKey::from_bytes([9u8; 32], 2));
        }

        assert_eq!(f.session.last_wiped(), Some([0u8; 32]));
        assert_eq!(f.session.read_key().unwrap().epoch(), 2);
        assert_eq!(f.session.status().key_epoch, Some(2));
    }
}
