use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::now_ms;
use super::{apply_wallet_entry, Engine, EngineError};

impl Engine {
    /// Administrative credit. Debits never enter through here; they are
    /// issued only by the settlement paths.
    pub async fn credit_wallet(
        &self,
        id: Ulid,
        user_id: Ulid,
        kind: LedgerKind,
        amount_minor: i64,
        currency: String,
        reference: String,
    ) -> Result<WalletEntry, EngineError> {
        if !kind.is_credit() {
            return Err(EngineError::InvalidAmount("ledger kind must be a credit"));
        }
        if amount_minor <= 0 {
            return Err(EngineError::InvalidAmount("amount must be positive"));
        }
        if amount_minor > MAX_AMOUNT_MINOR {
            return Err(EngineError::InvalidAmount("amount too large"));
        }
        if currency.is_empty() || currency.len() > MAX_CURRENCY_LEN {
            return Err(EngineError::InvalidAmount("bad currency code"));
        }
        if reference.len() > MAX_REFERENCE_LEN {
            return Err(EngineError::LimitExceeded("reference too long"));
        }

        let wallet = self.wallet(&user_id);
        let mut guard = wallet.write().await;
        if guard.entries.len() >= MAX_ENTRIES_PER_WALLET {
            return Err(EngineError::LimitExceeded("too many ledger entries"));
        }
        if guard.entries.iter().any(|e| e.id == id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let entry = WalletEntry {
            id,
            user_id,
            kind,
            amount_minor,
            currency,
            reference,
            created_at: now_ms(),
        };
        let record = Record::LedgerAppended { entry: entry.clone() };
        self.wal_append(&record).await?;
        apply_wallet_entry(&mut guard, &entry);
        self.notify.publish(&record);
        Ok(entry)
    }

    /// Per-currency balances, in order of first appearance in the ledger.
    pub async fn wallet_balances(&self, user_id: Ulid) -> Vec<BalanceInfo> {
        let wallet = self.wallet(&user_id);
        let guard = wallet.read().await;
        guard
            .balances()
            .into_iter()
            .map(|(currency, balance)| BalanceInfo { user_id, currency, balance })
            .collect()
    }

    /// Full ledger for one user, oldest first.
    pub async fn ledger_history(&self, user_id: Ulid) -> Vec<WalletEntry> {
        let wallet = self.wallet(&user_id);
        let guard = wallet.read().await;
        guard.entries.clone()
    }
}
