use serde::Serialize;

use crate::domain::{AccountId, ChatId, DiceFaces, Money, WagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    Win {
        winner: AccountId,
        loser: AccountId,
        payout: Money,
    },
    /// Equal totals: both stakes go back, no commission.
    Draw,
}

/// What a successful join hands back to the chat layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementResult {
    pub wager: WagerId,
    pub chat: ChatId,
    pub creator: AccountId,
    pub joiner: AccountId,
    pub stake: Money,
    pub dice: DiceFaces,
    pub creator_total: u32,
    pub joiner_total: u32,
    pub outcome: Outcome,
    pub commission: Money,
}

impl SettlementResult {
    pub fn winner(&self) -> Option<AccountId> {
        match self.outcome {
            Outcome::Win { winner, .. } => Some(winner),
            Outcome::Draw => None,
        }
    }

    pub fn is_draw(&self) -> bool {
        self.outcome == Outcome::Draw
    }
}
