//! Receive side message counter of a peer.
//!
//! Every secure message carries a 32 bit counter which the sender increases
//! by one for each message. [PeerMessageCounter] remembers the highest counter
//! accepted so far plus a bitmap of the `N` counters just below it, which is
//! enough to reject replayed and duplicated messages without keeping the full
//! history.
//!
//! Checking and recording are separate steps: [PeerMessageCounter::verify] is
//! called before the message is authenticated and must not change any state,
//! [PeerMessageCounter::commit] is called only once the message passed
//! authentication. Forged messages therefore can not move the window.
//!
//! Before counters can be checked the state has to be synchronized, either by
//! the challenge/response exchange ([PeerMessageCounter::start_sync] followed by
//! [PeerMessageCounter::verify_challenge]) or directly by
//! [PeerMessageCounter::set_counter] when the starting value is already known.

use crate::config::{MESSAGE_COUNTER_SYNC_CHALLENGE_SIZE, MESSAGE_COUNTER_WINDOW_SIZE};
use crate::error::CounterError;

pub type Challenge = [u8; MESSAGE_COUNTER_SYNC_CHALLENGE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotSync,
    SyncInProcess,
    Synced,
}

/// Bitmap of the last `N` counters. Bit `k` stands for `max_counter - k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterWindow<const N: usize> {
    bits: u128,
}

impl<const N: usize> CounterWindow<N> {
    const SIZE_CHECK: () = assert!(
        N >= 1 && N <= 128,
        "message counter window size must be between 1 and 128"
    );
    const MASK: u128 = if N >= 128 { u128::MAX } else { (1u128 << N) - 1 };

    fn empty() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::SIZE_CHECK;
        Self { bits: 0 }
    }

    /// Only the newest slot marked as seen.
    fn newest_seen() -> Self {
        let mut window = Self::empty();
        window.set(0);
        window
    }

    fn is_set(&self, offset: u32) -> bool {
        (self.bits >> offset) & 1 != 0
    }

    fn set(&mut self, offset: u32) {
        self.bits |= 1u128 << offset;
    }

    /// Slide by `offset` counters. Oldest bits fall off, new slots start clear.
    fn advance(&mut self, offset: u32) {
        if offset as usize >= N {
            self.bits = 0;
        } else {
            self.bits = (self.bits << offset) & Self::MASK;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterState<const N: usize> {
    NotSync,
    SyncInProcess {
        challenge: Challenge,
    },
    Synced {
        max_counter: u32,
        window: CounterWindow<N>,
    },
}

/// Replay protection state for messages received from one peer on one session.
///
/// `N` is the number of counters remembered behind the highest accepted one
/// and must be in range 1..=128.
#[derive(Debug, Clone)]
pub struct PeerMessageCounter<const N: usize = { MESSAGE_COUNTER_WINDOW_SIZE }> {
    state: CounterState<N>,
}

impl<const N: usize> PeerMessageCounter<N> {
    pub const WINDOW_SIZE: usize = N;

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = CounterWindow::<N>::SIZE_CHECK;
        Self {
            state: CounterState::NotSync,
        }
    }

    pub fn reset(&mut self) {
        self.state = CounterState::NotSync;
    }

    pub fn status(&self) -> SyncStatus {
        match self.state {
            CounterState::NotSync => SyncStatus::NotSync,
            CounterState::SyncInProcess { .. } => SyncStatus::SyncInProcess,
            CounterState::Synced { .. } => SyncStatus::Synced,
        }
    }

    pub fn is_sync_started(&self) -> bool {
        self.status() != SyncStatus::NotSync
    }

    pub fn is_synchronizing(&self) -> bool {
        self.status() == SyncStatus::SyncInProcess
    }

    pub fn is_sync_completed(&self) -> bool {
        self.status() == SyncStatus::Synced
    }

    /// Begin synchronization. Any previous state is discarded.
    ///
    /// The challenge must be unpredictable, it is the only thing tying the
    /// later response to this request.
    pub fn start_sync(&mut self, challenge: Challenge) {
        log::trace!("peer counter sync started");
        self.state = CounterState::SyncInProcess { challenge };
    }

    /// Synchronization failed or timed out.
    pub fn sync_fail(&mut self) {
        log::trace!("peer counter sync failed");
        self.reset();
    }

    /// Complete synchronization with the counter reported by the peer.
    ///
    /// `counter` is the counter the peer stamped on its sync response, so it
    /// is recorded as already seen. Only counters after it are accepted until
    /// the window moves on.
    pub fn verify_challenge(&mut self, counter: u32, challenge: &Challenge) -> Result<(), CounterError> {
        match &self.state {
            CounterState::SyncInProcess { challenge: expected } => {
                if expected != challenge {
                    return Err(CounterError::InvalidArgument);
                }
            }
            _ => return Err(CounterError::IncorrectState),
        }
        log::trace!("peer counter synced at {}", counter);
        self.state = CounterState::Synced {
            max_counter: counter,
            window: CounterWindow::newest_seen(),
        };
        Ok(())
    }

    /// Mark the counter as synchronized to a value learned out of band.
    ///
    /// Unlike [Self::verify_challenge] the window starts empty, so a message
    /// carrying `value` itself is still accepted once.
    pub fn set_counter(&mut self, value: u32) {
        self.state = CounterState::Synced {
            max_counter: value,
            window: CounterWindow::empty(),
        };
    }

    /// Check whether a message with `counter` may be accepted. Does not record it.
    pub fn verify(&self, counter: u32) -> Result<(), CounterError> {
        let CounterState::Synced { max_counter, window } = &self.state else {
            return Err(CounterError::IncorrectState);
        };
        if counter > *max_counter {
            return Ok(());
        }
        let offset = max_counter - counter;
        if offset as usize >= N {
            log::trace!("counter {} too old, max {}", counter, max_counter);
            return Err(CounterError::InvalidArgument);
        }
        if window.is_set(offset) {
            log::trace!("counter {} already seen", counter);
            return Err(CounterError::InvalidArgument);
        }
        Ok(())
    }

    /// Record `counter` as seen.
    ///
    /// Call only after [Self::verify] accepted the same counter and the message
    /// was authenticated. A counter outside of the window is refused without
    /// touching the state.
    pub fn commit(&mut self, counter: u32) -> Result<(), CounterError> {
        let CounterState::Synced { max_counter, window } = &mut self.state else {
            return Err(CounterError::IncorrectState);
        };
        if counter <= *max_counter {
            let offset = *max_counter - counter;
            if offset as usize >= N {
                return Err(CounterError::InvalidArgument);
            }
            window.set(offset);
        } else {
            window.advance(counter - *max_counter);
            *max_counter = counter;
            window.set(0);
        }
        Ok(())
    }

    /// Highest accepted counter, if synchronized.
    pub fn max_counter(&self) -> Option<u32> {
        match self.state {
            CounterState::Synced { max_counter, .. } => Some(max_counter),
            _ => None,
        }
    }

    /// Challenge of the running synchronization.
    pub fn challenge(&self) -> Option<&Challenge> {
        match &self.state {
            CounterState::SyncInProcess { challenge } => Some(challenge),
            _ => None,
        }
    }
}

impl<const N: usize> Default for PeerMessageCounter<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: Challenge = [1, 2, 3, 4, 5, 6, 7, 8];

    fn synced(counter: u32) -> PeerMessageCounter {
        let mut c = PeerMessageCounter::new();
        c.start_sync(CHALLENGE);
        c.verify_challenge(counter, &CHALLENGE).unwrap();
        c
    }

    fn accept<const N: usize>(c: &mut PeerMessageCounter<N>, counter: u32) {
        c.verify(counter).unwrap();
        c.commit(counter).unwrap();
    }

    #[test]
    fn test_scenario() {
        let mut c = PeerMessageCounter::<32>::new();
        assert_eq!(c.status(), SyncStatus::NotSync);
        c.start_sync(CHALLENGE);
        assert!(c.is_synchronizing());
        assert_eq!(c.challenge(), Some(&CHALLENGE));
        c.verify_challenge(100, &CHALLENGE).unwrap();
        assert!(c.is_sync_completed());
        assert_eq!(c.max_counter(), Some(100));
        assert_eq!(c.challenge(), None);

        assert_eq!(c.verify(100), Err(CounterError::InvalidArgument));
        accept(&mut c, 101);
        assert_eq!(c.max_counter(), Some(101));
        assert_eq!(c.verify(101), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(69), Err(CounterError::InvalidArgument));
        accept(&mut c, 70);
        assert_eq!(c.verify(70), Err(CounterError::InvalidArgument));
    }

    #[test]
    fn test_no_replay_after_sync() {
        let c = synced(1000);
        assert_eq!(c.verify(1000), Err(CounterError::InvalidArgument));
        c.verify(999).unwrap();
        c.verify(1000 - 31).unwrap();
        assert_eq!(c.verify(1000 - 32), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(0), Err(CounterError::InvalidArgument));
        c.verify(1001).unwrap();
        c.verify(u32::MAX).unwrap();
    }

    #[test]
    fn test_monotonic() {
        let mut c = synced(10);
        for counter in 11..200 {
            c.verify(counter + 1).unwrap();
            c.verify(counter + 1000).unwrap();
            accept(&mut c, counter);
            assert_eq!(c.verify(counter), Err(CounterError::InvalidArgument));
            assert_eq!(c.verify(counter - 1), Err(CounterError::InvalidArgument));
        }
    }

    #[test]
    fn test_window_boundary() {
        let start = 500;
        let mut c = synced(start);
        let k = 40;
        for counter in start + 1..=start + k {
            accept(&mut c, counter);
        }
        assert_eq!(c.verify(start + k - 32), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(start + k), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(start + k - 31), Err(CounterError::InvalidArgument));
    }

    #[test]
    fn test_out_of_order() {
        let mut c = synced(0);
        accept(&mut c, 10);
        for counter in [3, 9, 1, 5] {
            accept(&mut c, counter);
            assert_eq!(c.verify(counter), Err(CounterError::InvalidArgument));
        }
        c.verify(2).unwrap();
        c.verify(4).unwrap();
        // slide so that 3 and below fall out of the window
        accept(&mut c, 35);
        assert_eq!(c.verify(4), Ok(()));
        assert_eq!(c.verify(5), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(3), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(10), Err(CounterError::InvalidArgument));
        c.verify(11).unwrap();
    }

    #[test]
    fn test_large_jump_clears_window() {
        let mut c = synced(100);
        accept(&mut c, 100 + 32);
        // 101..131 never seen and still inside the window
        c.verify(101).unwrap();
        assert_eq!(c.verify(100), Err(CounterError::InvalidArgument));
        accept(&mut c, 5000);
        c.verify(4999).unwrap();
        c.verify(5000 - 31).unwrap();
        assert_eq!(c.verify(5000 - 32), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(5000), Err(CounterError::InvalidArgument));
    }

    #[test]
    fn test_challenge_mismatch() {
        let mut c = PeerMessageCounter::<32>::new();
        c.start_sync(CHALLENGE);
        let other = [8, 7, 6, 5, 4, 3, 2, 1];
        assert_eq!(c.verify_challenge(5, &other), Err(CounterError::InvalidArgument));
        assert!(c.is_synchronizing());
        assert_eq!(c.challenge(), Some(&CHALLENGE));
        c.verify_challenge(5, &CHALLENGE).unwrap();
        assert_eq!(c.verify_challenge(5, &CHALLENGE), Err(CounterError::IncorrectState));
    }

    #[test]
    fn test_state_gating() {
        let mut c = PeerMessageCounter::<32>::new();
        assert_eq!(c.verify(1), Err(CounterError::IncorrectState));
        assert_eq!(c.commit(1), Err(CounterError::IncorrectState));
        assert_eq!(c.verify_challenge(1, &CHALLENGE), Err(CounterError::IncorrectState));
        c.start_sync(CHALLENGE);
        assert_eq!(c.verify(1), Err(CounterError::IncorrectState));
        assert_eq!(c.commit(1), Err(CounterError::IncorrectState));
        assert_eq!(c.max_counter(), None);
    }

    #[test]
    fn test_reset() {
        let mut c = synced(7);
        c.reset();
        assert!(!c.is_sync_started());
        assert_eq!(c.verify_challenge(7, &CHALLENGE), Err(CounterError::IncorrectState));
        c.reset();
        assert_eq!(c.status(), SyncStatus::NotSync);

        c.start_sync(CHALLENGE);
        c.sync_fail();
        assert!(!c.is_sync_started());
        assert_eq!(c.verify_challenge(7, &CHALLENGE), Err(CounterError::IncorrectState));

        c.start_sync(CHALLENGE);
        c.verify_challenge(7, &CHALLENGE).unwrap();
        c.verify(8).unwrap();
    }

    #[test]
    fn test_restart_sync_replaces_challenge() {
        let mut c = synced(7);
        let second = [9u8; 8];
        c.start_sync(second);
        assert_eq!(c.verify(8), Err(CounterError::IncorrectState));
        assert_eq!(c.verify_challenge(20, &CHALLENGE), Err(CounterError::InvalidArgument));
        c.verify_challenge(20, &second).unwrap();
        assert_eq!(c.max_counter(), Some(20));
    }

    #[test]
    fn test_set_counter() {
        let mut c = PeerMessageCounter::<32>::new();
        c.set_counter(0);
        assert!(c.is_sync_completed());
        accept(&mut c, 0);
        assert_eq!(c.verify(0), Err(CounterError::InvalidArgument));
        accept(&mut c, 1);
    }

    #[test]
    fn test_commit_out_of_window() {
        let mut c = synced(100);
        assert_eq!(c.commit(50), Err(CounterError::InvalidArgument));
        assert_eq!(c.max_counter(), Some(100));
        c.verify(101).unwrap();
    }

    #[test]
    fn test_small_window() {
        let mut c = PeerMessageCounter::<1>::new();
        c.set_counter(10);
        accept(&mut c, 10);
        assert_eq!(c.verify(10), Err(CounterError::InvalidArgument));
        assert_eq!(c.verify(9), Err(CounterError::InvalidArgument));
        accept(&mut c, 11);
        assert_eq!(c.verify(10), Err(CounterError::InvalidArgument));
    }

    #[test]
    fn test_full_width_window() {
        let mut c = PeerMessageCounter::<128>::new();
        c.start_sync(CHALLENGE);
        c.verify_challenge(1000, &CHALLENGE).unwrap();
        c.verify(1000 - 127).unwrap();
        assert_eq!(c.verify(1000 - 128), Err(CounterError::InvalidArgument));
        accept(&mut c, 1000 + 127);
        // 1000 is bit 127 now, still marked as seen from the sync
        assert_eq!(c.verify(1000), Err(CounterError::InvalidArgument));
        c.verify(1001).unwrap();
        accept(&mut c, 1000 + 128);
        assert_eq!(c.verify(1000), Err(CounterError::InvalidArgument));
        c.verify(1001).unwrap();
        assert_eq!(PeerMessageCounter::<128>::WINDOW_SIZE, 128);
    }
}
