use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AccountId, Money, WagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Stake,
    Win,
    /// Kept for house-side bookkeeping. Settlements record commission on the
    /// wager row and in the house balance instead.
    Commission,
    Refund,
    Deposit,
    Withdraw,
}

impl core::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            EntryKind::Stake => "stake",
            EntryKind::Win => "win",
            EntryKind::Commission => "commission",
            EntryKind::Refund => "refund",
            EntryKind::Deposit => "deposit",
            EntryKind::Withdraw => "withdraw",
        };
        f.write_str(s)
    }
}

/// A balance change the engine asks the store to apply. The store fills in
/// the resulting balance from the row it reads inside its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRequest {
    pub account: AccountId,
    pub wager: Option<WagerId>,
    pub kind: EntryKind,
    pub amount: Money,
    /// Balance the audited operation was computed from.
    pub expected_balance: Money,
    pub context: String,
}

/// Append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub seq: u64,
    pub account: AccountId,
    pub wager: Option<WagerId>,
    pub kind: EntryKind,
    pub amount: Money,
    pub balance_after: Money,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn balance_before(&self) -> Money {
        self.balance_after - self.amount
    }
}

impl core::fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.wager {
            Some(wager) => write!(
                f,
                "{},account={},wager={},amount={},balance={}",
                self.kind, self.account, wager, self.amount, self.balance_after
            ),
            None => write!(
                f,
                "{},account={},amount={},balance={}",
                self.kind, self.account, self.amount, self.balance_after
            ),
        }
    }
}
