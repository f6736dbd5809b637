//! Balance Ledger
//!
//! Player balances. Deduction is a single conditional operation so two
//! racing bets can never drive a balance below zero.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::game::state::PlayerId;
use crate::store::StoreError;

/// Persistence of player balances.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Current balance. Accounts that were never opened hold nothing.
    async fn balance(&self, player: PlayerId) -> Result<u64, StoreError>;

    /// Deduct `amount` only if the balance covers it.
    ///
    /// Returns `false` (and changes nothing) when funds are short or the
    /// account does not exist.
    async fn try_deduct(&self, player: PlayerId, amount: u64) -> Result<bool, StoreError>;

    /// Add `amount`, returning the new balance.
    async fn credit(&self, player: PlayerId, amount: u64) -> Result<u64, StoreError>;

    /// Create the account with `starting_balance` if it does not exist.
    /// Returns the balance the account holds afterwards.
    async fn open_account(&self, player: PlayerId, starting_balance: u64) -> Result<u64, StoreError>;

    /// Overwrite a balance (admin).
    async fn set_balance(&self, player: PlayerId, amount: u64) -> Result<(), StoreError>;

    /// Richest accounts, highest first.
    async fn top_balances(&self, limit: usize) -> Result<Vec<(PlayerId, u64)>, StoreError>;
}

/// In-memory ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: RwLock<BTreeMap<PlayerId, u64>>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger holding the given accounts.
    pub fn with_accounts(accounts: impl IntoIterator<Item = (PlayerId, u64)>) -> Self {
        Self {
            accounts: RwLock::new(accounts.into_iter().collect()),
        }
    }

    /// Copy of every account, ordered by player id.
    pub async fn accounts(&self) -> Vec<(PlayerId, u64)> {
        self.accounts
            .read()
            .await
            .iter()
            .map(|(id, coins)| (*id, *coins))
            .collect()
    }

    /// Replace all accounts.
    pub async fn replace_accounts(&self, accounts: impl IntoIterator<Item = (PlayerId, u64)>) {
        *self.accounts.write().await = accounts.into_iter().collect();
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn balance(&self, player: PlayerId) -> Result<u64, StoreError> {
        Ok(self.accounts.read().await.get(&player).copied().unwrap_or(0))
    }

    async fn try_deduct(&self, player: PlayerId, amount: u64) -> Result<bool, StoreError> {
        let mut accounts = self.accounts.write().await;
        match accounts.get_mut(&player) {
            Some(coins) if *coins >= amount => {
                *coins -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credit(&self, player: PlayerId, amount: u64) -> Result<u64, StoreError> {
        let mut accounts = self.accounts.write().await;
        let coins = accounts
            .get_mut(&player)
            .ok_or_else(|| StoreError::AccountNotFound(player.to_uuid_string()))?;
        *coins = coins
            .checked_add(amount)
            .ok_or_else(|| StoreError::Overflow(player.to_uuid_string()))?;
        Ok(*coins)
    }

    async fn open_account(&self, player: PlayerId, starting_balance: u64) -> Result<u64, StoreError> {
        let mut accounts = self.accounts.write().await;
        Ok(*accounts.entry(player).or_insert(starting_balance))
    }

    async fn set_balance(&self, player: PlayerId, amount: u64) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().await;
        let coins = accounts
            .get_mut(&player)
            .ok_or_else(|| StoreError::AccountNotFound(player.to_uuid_string()))?;
        *coins = amount;
        Ok(())
    }

    async fn top_balances(&self, limit: usize) -> Result<Vec<(PlayerId, u64)>, StoreError> {
        let mut all: Vec<(PlayerId, u64)> = self.accounts().await;
        // Highest first; ties by id for stable output
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn player(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    #[tokio::test]
    async fn test_unknown_account_is_empty() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 0);
        assert!(!ledger.try_deduct(player(1), 1).await.unwrap());
        assert!(matches!(
            ledger.credit(player(1), 5).await,
            Err(StoreError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conditional_deduct() {
        let ledger = MemoryLedger::with_accounts([(player(1), 100)]);

        assert!(ledger.try_deduct(player(1), 60).await.unwrap());
        assert!(!ledger.try_deduct(player(1), 60).await.unwrap());
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 40);

        assert!(ledger.try_deduct(player(1), 40).await.unwrap());
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_deducts_never_overdraw() {
        let ledger = Arc::new(MemoryLedger::with_accounts([(player(1), 100)]));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.try_deduct(player(1), 30).await.unwrap() })
            })
            .collect();

        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 3);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.open_account(player(2), 1000).await.unwrap(), 1000);
        ledger.try_deduct(player(2), 300).await.unwrap();
        assert_eq!(ledger.open_account(player(2), 1000).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn test_credit_and_set_balance() {
        let ledger = MemoryLedger::with_accounts([(player(1), 10)]);
        assert_eq!(ledger.credit(player(1), 400).await.unwrap(), 410);

        ledger.set_balance(player(1), 5).await.unwrap();
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 5);

        let ledger = MemoryLedger::with_accounts([(player(1), u64::MAX)]);
        assert!(matches!(ledger.credit(player(1), 1).await, Err(StoreError::Overflow(_))));
    }

    #[tokio::test]
    async fn test_top_balances() {
        let ledger = MemoryLedger::with_accounts([
            (player(1), 50),
            (player(2), 900),
            (player(3), 300),
        ]);

        let top = ledger.top_balances(2).await.unwrap();
        assert_eq!(top, vec![(player(2), 900), (player(3), 300)]);
    }
}
