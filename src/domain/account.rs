use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Money;

pub type AccountId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Money, // never negative
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, balance: Money) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn covers(&self, amount: Money) -> bool {
        self.balance >= amount
    }
}
