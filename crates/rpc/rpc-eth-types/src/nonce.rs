//! Per-sender nonce reservation.
//!
//! Concurrent transaction submissions from the same sender race for the next
//! nonce. A reservation holds the sender's slot until the caller commits
//! (transaction accepted) or rolls back (validation failed); only then can
//! the next submission for that sender proceed. Dropping a reservation
//! without committing behaves as a rollback, so a panicking caller can never
//! leak the sender's lock.

use alloy_primitives::Address;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Arbitrates nonce allocation for concurrent transaction submission,
/// serialized per sender address.
#[derive(Debug, Default)]
pub struct NonceManager {
    accounts: parking_lot::Mutex<HashMap<Address, Arc<AccountNonces>>>,
}

/// Nonce bookkeeping for a single sender.
#[derive(Debug, Default)]
struct AccountNonces {
    /// Serializes reservations for the account.
    reservation_lock: Arc<Mutex<()>>,
    /// The allocation state.
    state: parking_lot::Mutex<AccountState>,
}

#[derive(Debug, Default)]
struct AccountState {
    /// The next nonce to hand out.
    current_nonce: u64,
    /// Committed nonces that `current_nonce` has not advanced past yet, e.g.
    /// nonces observed from transactions submitted elsewhere.
    used_nonces: BTreeSet<u64>,
}

impl NonceManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, address: Address) -> Arc<AccountNonces> {
        Arc::clone(self.accounts.lock().entry(address).or_default())
    }

    /// Reserves the next nonce of the sender.
    ///
    /// Suspends while another reservation for the same address is
    /// outstanding.
    pub async fn reserve(&self, address: Address) -> NonceReservation {
        let account = self.account(address);
        let guard = Arc::clone(&account.reservation_lock).lock_owned().await;
        let nonce = account.state.lock().current_nonce;
        trace!(target: "rpc::eth", %address, nonce, "reserved nonce");
        NonceReservation { address, nonce, account, _guard: guard }
    }

    /// Records a transaction with an externally chosen nonce, e.g. observed
    /// from a raw transaction submission.
    ///
    /// The returned reservation promotes the nonce into the used set on
    /// commit.
    pub async fn tx_with_nonce_received(&self, address: Address, nonce: u64) -> NonceReservation {
        let account = self.account(address);
        let guard = Arc::clone(&account.reservation_lock).lock_owned().await;
        trace!(target: "rpc::eth", %address, nonce, "reserved received nonce");
        NonceReservation { address, nonce, account, _guard: guard }
    }

    /// The next nonce that would currently be handed out for the address.
    pub fn next_nonce(&self, address: Address) -> u64 {
        self.account(address).state.lock().current_nonce
    }
}

/// An outstanding reservation of a sender's nonce slot.
///
/// While this exists, all other [`NonceManager::reserve`] calls for the same
/// address are suspended. Dropping the reservation without a commit releases
/// the slot without advancing the nonce.
#[derive(Debug)]
#[must_use = "a reservation that is immediately dropped is a no-op"]
pub struct NonceReservation {
    address: Address,
    nonce: u64,
    account: Arc<AccountNonces>,
    _guard: OwnedMutexGuard<()>,
}

impl NonceReservation {
    /// The sender this reservation belongs to.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The reserved nonce.
    pub const fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Marks the nonce as used and advances the account past the contiguous
    /// prefix of used nonces, then releases the slot.
    pub fn commit(self) {
        let state = &mut *self.account.state.lock();
        state.used_nonces.insert(self.nonce);
        while state.used_nonces.remove(&state.current_nonce) {
            state.current_nonce += 1;
        }
        trace!(
            target: "rpc::eth",
            address = %self.address,
            nonce = self.nonce,
            next = state.current_nonce,
            "committed nonce"
        );
        // the guard is dropped here, releasing the slot
    }

    /// Releases the slot without advancing the nonce.
    pub fn rollback(self) {
        trace!(target: "rpc::eth", address = %self.address, nonce = self.nonce, "rolled back nonce");
        // dropping releases the lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn nonces_advance_on_commit() {
        let manager = NonceManager::new();
        let address = Address::with_last_byte(1);

        let reservation = manager.reserve(address).await;
        assert_eq!(reservation.nonce(), 0);
        reservation.commit();

        let reservation = manager.reserve(address).await;
        assert_eq!(reservation.nonce(), 1);
        reservation.commit();

        assert_eq!(manager.next_nonce(address), 2);
    }

    #[tokio::test]
    async fn rollback_does_not_advance() {
        let manager = NonceManager::new();
        let address = Address::with_last_byte(1);

        manager.reserve(address).await.rollback();
        assert_eq!(manager.reserve(address).await.nonce(), 0);
    }

    #[tokio::test]
    async fn dropped_reservation_behaves_as_rollback() {
        let manager = NonceManager::new();
        let address = Address::with_last_byte(1);

        drop(manager.reserve(address).await);
        assert_eq!(manager.reserve(address).await.nonce(), 0);
    }

    #[tokio::test]
    async fn received_nonces_skip_the_used_prefix() {
        let manager = NonceManager::new();
        let address = Address::with_last_byte(1);

        // nonces 1 and 2 were observed from elsewhere, 0 is still free
        manager.tx_with_nonce_received(address, 1).await.commit();
        manager.tx_with_nonce_received(address, 2).await.commit();
        assert_eq!(manager.next_nonce(address), 0);

        // committing 0 skips the whole contiguous used prefix
        let reservation = manager.reserve(address).await;
        assert_eq!(reservation.nonce(), 0);
        reservation.commit();
        assert_eq!(manager.next_nonce(address), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_reservations_are_serialized() {
        let manager = Arc::new(NonceManager::new());
        let address = Address::with_last_byte(1);

        let first = manager.reserve(address).await;

        // the second reservation suspends until the first commits
        let second = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                let reservation = manager.reserve(address).await;
                let nonce = reservation.nonce();
                reservation.commit();
                nonce
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        assert_eq!(first.nonce(), 0);
        first.commit();

        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn addresses_are_independent() {
        let manager = Arc::new(NonceManager::new());

        let first = manager.reserve(Address::with_last_byte(1)).await;
        // a different address does not block on the outstanding reservation
        let other =
            tokio::time::timeout(Duration::from_secs(1), manager.reserve(Address::with_last_byte(2)))
                .await
                .expect("other address must not block");
        assert_eq!(other.nonce(), 0);
        first.rollback();
    }
}
