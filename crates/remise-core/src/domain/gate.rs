//! Device exclusivity gate.
//!
//! The command station drives one physical device.  A firmware flash cannot be
//! interleaved with anything else, and a native control bus cannot fan out to
//! an unbounded number of network clients.  The [`ExclusivityManager`] is the
//! only place that knows who currently holds the device:
//!
//! - one **flashing lock** ([`OtaLock`]), single holder;
//! - per relay kind, up to `max_sessions` **relay slots** ([`RelaySlot`]).
//!
//! # Tokens, not flags
//!
//! Acquisition hands out a token.  The token releases itself on `Drop`, so a
//! session task that returns early, panics, or is cancelled by a disconnect
//! can never leak the device.  [`ExclusivityManager::release_ota`] and
//! [`ExclusivityManager::release_relay`] exist for call sites that want the
//! release to be visible in the code; they simply consume the token.
//!
//! # Never waits
//!
//! A caller that cannot get a token receives [`GateError`] immediately.  An
//! in-progress flash has no meaningful queue: the client must come back later.
//!
//! # OTA vs. exclusive relays
//!
//! Some relay kinds put the device into a mode that is incompatible with
//! flashing (Zusi drives the same output stage the firmware update stops).
//! A kind with `exclusive_with_ota = true` cannot be opened while the
//! flashing lock is held, and the flashing lock cannot be taken while such a
//! relay is active.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::channel::RelayKind;

// ── Policy ────────────────────────────────────────────────────────────────────

/// Concurrency policy for one relay kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Maximum number of simultaneous tunnels of this kind.  Zero disables
    /// the kind entirely.
    pub max_sessions: usize,
    /// Whether this kind and an OTA session exclude each other.
    pub exclusive_with_ota: bool,
}

/// Complete gate policy, one [`RelayPolicy`] per relay kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub z21: RelayPolicy,
    pub zusi: RelayPolicy,
}

impl GatePolicy {
    /// Returns the policy for `kind`.
    pub fn relay(&self, kind: RelayKind) -> RelayPolicy {
        match kind {
            RelayKind::Z21 => self.z21,
            RelayKind::Zusi => self.zusi,
        }
    }
}

impl Default for GatePolicy {
    /// | Kind | max_sessions | exclusive_with_ota |
    /// |------|--------------|--------------------|
    /// | Z21  | 4            | false              |
    /// | Zusi | 1            | true               |
    fn default() -> Self {
        Self {
            z21: RelayPolicy {
                max_sessions: 4,
                exclusive_with_ota: false,
            },
            zusi: RelayPolicy {
                max_sessions: 1,
                exclusive_with_ota: true,
            },
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why the flashing lock is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyCause {
    /// Another OTA session holds the lock.
    OtaActive,
    /// A relay that excludes flashing is active.
    RelayActive(RelayKind),
}

/// Why a relay slot was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusedCause {
    /// All `max` slots of the kind are taken.
    BudgetExhausted { max: usize },
    /// The kind excludes flashing and an OTA session is active.
    FlashingInProgress,
}

/// Failure to obtain a token from the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// The flashing lock is unavailable.
    #[error("device busy: {}", describe_busy(.0))]
    Busy(BusyCause),

    /// A relay slot of `kind` is unavailable.
    #[error("{kind} relay refused: {}", describe_refused(.cause))]
    Refused { kind: RelayKind, cause: RefusedCause },
}

fn describe_busy(cause: &BusyCause) -> String {
    match cause {
        BusyCause::OtaActive => "a firmware update is already in progress".to_string(),
        BusyCause::RelayActive(kind) => format!("a {kind} relay session is active"),
    }
}

fn describe_refused(cause: &RefusedCause) -> String {
    match cause {
        RefusedCause::BudgetExhausted { max } => {
            format!("all {max} session slot(s) are in use")
        }
        RefusedCause::FlashingInProgress => "a firmware update is in progress".to_string(),
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    ota_held: bool,
    relay_active: [usize; RelayKind::COUNT],
}

#[derive(Debug)]
struct GateInner {
    policy: GatePolicy,
    state: Mutex<GateState>,
}

impl GateInner {
    /// Locks the state, recovering it if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of gate occupancy, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub ota_active: bool,
    relay_active: [usize; RelayKind::COUNT],
}

impl GateSnapshot {
    /// Number of active tunnels of `kind`.
    pub fn relay_sessions(&self, kind: RelayKind) -> usize {
        self.relay_active[kind.index()]
    }

    /// `true` when no token of any kind is outstanding.
    pub fn is_idle(&self) -> bool {
        !self.ota_active && self.relay_active.iter().all(|n| *n == 0)
    }
}

/// Process-wide gate over the physical device.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct ExclusivityManager {
    inner: Arc<GateInner>,
}

impl ExclusivityManager {
    /// Creates a gate with the given policy and nothing held.
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            inner: Arc::new(GateInner {
                policy,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// The policy this gate enforces.
    pub fn policy(&self) -> GatePolicy {
        self.inner.policy
    }

    /// Takes the single flashing lock.
    ///
    /// # Errors
    ///
    /// [`GateError::Busy`] if another OTA session holds the lock, or a relay
    /// kind that excludes flashing has active sessions.
    pub fn acquire_ota(&self) -> Result<OtaLock, GateError> {
        let mut state = self.inner.lock();

        if state.ota_held {
            return Err(GateError::Busy(BusyCause::OtaActive));
        }
        if let Some(kind) = RelayKind::ALL.into_iter().find(|kind| {
            self.inner.policy.relay(*kind).exclusive_with_ota
                && state.relay_active[kind.index()] > 0
        }) {
            return Err(GateError::Busy(BusyCause::RelayActive(kind)));
        }

        state.ota_held = true;
        debug!("gate: flashing lock acquired");
        Ok(OtaLock {
            gate: Arc::clone(&self.inner),
            acquired_at: Instant::now(),
        })
    }

    /// Returns the flashing lock.  Equivalent to dropping it.
    pub fn release_ota(&self, lock: OtaLock) {
        drop(lock);
    }

    /// Takes one relay slot of `kind`.
    ///
    /// # Errors
    ///
    /// [`GateError::Refused`] if the kind's budget is exhausted, or the kind
    /// excludes flashing and the flashing lock is held.
    pub fn acquire_relay(&self, kind: RelayKind) -> Result<RelaySlot, GateError> {
        let policy = self.inner.policy.relay(kind);
        let mut state = self.inner.lock();

        if policy.exclusive_with_ota && state.ota_held {
            return Err(GateError::Refused {
                kind,
                cause: RefusedCause::FlashingInProgress,
            });
        }
        let active = &mut state.relay_active[kind.index()];
        if *active >= policy.max_sessions {
            return Err(GateError::Refused {
                kind,
                cause: RefusedCause::BudgetExhausted {
                    max: policy.max_sessions,
                },
            });
        }

        *active += 1;
        debug!("gate: {kind} relay slot acquired ({}/{})", *active, policy.max_sessions);
        Ok(RelaySlot {
            kind,
            gate: Arc::clone(&self.inner),
        })
    }

    /// Returns a relay slot.  Equivalent to dropping it.
    pub fn release_relay(&self, slot: RelaySlot) {
        drop(slot);
    }

    /// Current occupancy.
    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.lock();
        GateSnapshot {
            ota_active: state.ota_held,
            relay_active: state.relay_active,
        }
    }
}

impl Default for ExclusivityManager {
    fn default() -> Self {
        Self::new(GatePolicy::default())
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────────

/// Proof of holding the single flashing lock.  Released on drop.
#[derive(Debug)]
pub struct OtaLock {
    gate: Arc<GateInner>,
    acquired_at: Instant,
}

impl OtaLock {
    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for OtaLock {
    fn drop(&mut self) {
        self.gate.lock().ota_held = false;
        debug!("gate: flashing lock released after {:?}", self.held_for());
    }
}

/// Proof of holding one relay slot.  Released on drop.
#[derive(Debug)]
pub struct RelaySlot {
    kind: RelayKind,
    gate: Arc<GateInner>,
}

impl RelaySlot {
    /// The relay kind this slot belongs to.
    pub fn kind(&self) -> RelayKind {
        self.kind
    }
}

impl Drop for RelaySlot {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        let active = &mut state.relay_active[self.kind.index()];
        *active = active.saturating_sub(1);
        debug!("gate: {} relay slot released ({} active)", self.kind, *active);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(z21_max: usize, zusi_max: usize) -> ExclusivityManager {
        ExclusivityManager::new(GatePolicy {
            z21: RelayPolicy {
                max_sessions: z21_max,
                exclusive_with_ota: false,
            },
            zusi: RelayPolicy {
                max_sessions: zusi_max,
                exclusive_with_ota: true,
            },
        })
    }

    #[test]
    fn test_second_ota_acquire_is_busy() {
        // Arrange
        let gate = ExclusivityManager::default();
        let _lock = gate.acquire_ota().unwrap();

        // Act
        let second = gate.acquire_ota();

        // Assert
        assert_eq!(second.unwrap_err(), GateError::Busy(BusyCause::OtaActive));
    }

    #[test]
    fn test_ota_acquire_succeeds_after_release() {
        let gate = ExclusivityManager::default();
        let lock = gate.acquire_ota().unwrap();
        gate.release_ota(lock);
        assert!(gate.acquire_ota().is_ok());
    }

    #[test]
    fn test_dropping_lock_releases_it() {
        let gate = ExclusivityManager::default();
        {
            let _lock = gate.acquire_ota().unwrap();
            assert!(gate.snapshot().ota_active);
        }
        assert!(!gate.snapshot().ota_active);
    }

    #[test]
    fn test_relay_budget_is_enforced_per_kind() {
        // Arrange: two Z21 slots, one Zusi slot
        let gate = gate_with(2, 1);
        let _a = gate.acquire_relay(RelayKind::Z21).unwrap();
        let _b = gate.acquire_relay(RelayKind::Z21).unwrap();

        // Act
        let third = gate.acquire_relay(RelayKind::Z21);
        let zusi = gate.acquire_relay(RelayKind::Zusi);

        // Assert: Z21 budget exhausted, Zusi budget untouched
        assert_eq!(
            third.unwrap_err(),
            GateError::Refused {
                kind: RelayKind::Z21,
                cause: RefusedCause::BudgetExhausted { max: 2 },
            }
        );
        assert!(zusi.is_ok());
    }

    #[test]
    fn test_relay_slot_reusable_after_release() {
        let gate = gate_with(1, 1);
        let slot = gate.acquire_relay(RelayKind::Z21).unwrap();
        assert!(gate.acquire_relay(RelayKind::Z21).is_err());
        gate.release_relay(slot);
        assert!(gate.acquire_relay(RelayKind::Z21).is_ok());
    }

    #[test]
    fn test_zero_budget_disables_kind() {
        let gate = gate_with(0, 1);
        assert!(matches!(
            gate.acquire_relay(RelayKind::Z21),
            Err(GateError::Refused {
                cause: RefusedCause::BudgetExhausted { max: 0 },
                ..
            })
        ));
    }

    #[test]
    fn test_exclusive_relay_refused_while_flashing() {
        let gate = gate_with(4, 1);
        let _lock = gate.acquire_ota().unwrap();

        assert_eq!(
            gate.acquire_relay(RelayKind::Zusi).unwrap_err(),
            GateError::Refused {
                kind: RelayKind::Zusi,
                cause: RefusedCause::FlashingInProgress,
            }
        );
        // Z21 does not exclude flashing.
        assert!(gate.acquire_relay(RelayKind::Z21).is_ok());
    }

    #[test]
    fn test_ota_busy_while_exclusive_relay_active() {
        let gate = gate_with(4, 1);
        let slot = gate.acquire_relay(RelayKind::Zusi).unwrap();

        assert_eq!(
            gate.acquire_ota().unwrap_err(),
            GateError::Busy(BusyCause::RelayActive(RelayKind::Zusi))
        );

        drop(slot);
        assert!(gate.acquire_ota().is_ok());
    }

    #[test]
    fn test_non_exclusive_relay_does_not_block_ota() {
        let gate = gate_with(4, 1);
        let _slot = gate.acquire_relay(RelayKind::Z21).unwrap();
        assert!(gate.acquire_ota().is_ok());
    }

    #[test]
    fn test_snapshot_counts_sessions() {
        let gate = gate_with(4, 1);
        let _a = gate.acquire_relay(RelayKind::Z21).unwrap();
        let _b = gate.acquire_relay(RelayKind::Z21).unwrap();

        let snap = gate.snapshot();
        assert_eq!(snap.relay_sessions(RelayKind::Z21), 2);
        assert_eq!(snap.relay_sessions(RelayKind::Zusi), 0);
        assert!(!snap.is_idle());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = ExclusivityManager::default();
        let other = gate.clone();
        let _lock = gate.acquire_ota().unwrap();
        assert!(other.acquire_ota().is_err());
    }

    #[test]
    fn test_error_messages_distinguish_causes() {
        let busy = GateError::Busy(BusyCause::OtaActive).to_string();
        let refused = GateError::Refused {
            kind: RelayKind::Z21,
            cause: RefusedCause::BudgetExhausted { max: 4 },
        }
        .to_string();

        assert!(busy.contains("firmware update"), "got: {busy}");
        assert!(refused.contains("z21"), "got: {refused}");
        assert!(refused.contains('4'), "got: {refused}");
    }

    #[test]
    fn test_concurrent_acquires_hand_out_one_lock() {
        // Arrange: many threads race for the flashing lock
        let gate = ExclusivityManager::default();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.acquire_ota().ok())
            })
            .collect();

        // Act: keep the winning locks alive until all threads are joined
        let winners: Vec<OtaLock> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        // Assert
        assert_eq!(winners.len(), 1);
    }
}
