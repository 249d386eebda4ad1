use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AccountId, EntryKind, Error, Money, WagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
}

/// The immutable part of an operation record, as assembled by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDraft {
    pub account: AccountId,
    pub wager: Option<WagerId>,
    pub kind: EntryKind,
    pub amount: Money,
    pub pre_balance: Money,
    pub post_balance: Money,
    pub metadata: BTreeMap<String, String>,
}

impl OperationDraft {
    /// Draft for applying `amount` on top of `pre_balance`.
    pub fn new(
        account: AccountId,
        wager: Option<WagerId>,
        kind: EntryKind,
        amount: Money,
        pre_balance: Money,
    ) -> Result<Self, Error> {
        let post_balance = pre_balance.checked_add(amount).ok_or_else(|| {
            Error::Integrity(format!(
                "{} of {} overflows the balance {} of account {}",
                kind, amount, pre_balance, account
            ))
        })?;
        Ok(Self {
            account,
            wager,
            kind,
            amount,
            pre_balance,
            post_balance,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub id: String,
    /// Recording order; ties in `timestamp` are broken by this.
    pub seq: u64,
    pub kind: EntryKind,
    pub account: AccountId,
    pub wager: Option<WagerId>,
    pub amount: Money,
    pub pre_balance: Money,
    pub post_balance: Money,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
    pub status: OperationStatus,
    /// Sequence of the ledger entry this operation became, set on completion.
    /// Completed operations chain in this order.
    pub committed_seq: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackInfo {
    pub operation: String,
    pub reason: String,
    pub rolled_back_at: DateTime<Utc>,
}
