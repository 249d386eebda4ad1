use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AccountId, Money};

pub type ChatId = i64;

/// Opaque wager identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WagerId(String);

impl WagerId {
    pub fn generate() -> Self {
        Self(format!("G{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WagerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WagerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for WagerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WagerStatus {
    Open,
    Matched,
    Settled,
    Expired,
}

impl WagerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WagerStatus::Settled | WagerStatus::Expired)
    }
}

impl core::fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            WagerStatus::Open => "open",
            WagerStatus::Matched => "matched",
            WagerStatus::Settled => "settled",
            WagerStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Three faces per side, creator first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiceFaces {
    pub creator: [u8; 3],
    pub joiner: [u8; 3],
}

impl DiceFaces {
    pub const COUNT: usize = 6;

    /// Splits six rolled faces into the two sides. Every face must lie in `1..=6`.
    pub fn from_rolls(rolls: &[u8]) -> Option<Self> {
        if rolls.len() != Self::COUNT || rolls.iter().any(|face| !(1..=6).contains(face)) {
            return None;
        }
        Some(Self {
            creator: [rolls[0], rolls[1], rolls[2]],
            joiner: [rolls[3], rolls[4], rolls[5]],
        })
    }

    pub fn creator_total(&self) -> u32 {
        self.creator.iter().map(|face| u32::from(*face)).sum()
    }

    pub fn joiner_total(&self) -> u32 {
        self.joiner.iter().map(|face| u32::from(*face)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wager {
    pub id: WagerId,
    pub creator: AccountId,
    pub joiner: Option<AccountId>,
    pub stake: Money,
    pub status: WagerStatus,
    pub dice: Option<DiceFaces>,
    pub winner: Option<AccountId>,
    pub commission: Money,
    pub chat: ChatId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wager {
    pub fn open(id: WagerId, creator: AccountId, chat: ChatId, stake: Money) -> Self {
        let now = Utc::now();
        Self {
            id,
            creator,
            joiner: None,
            stake,
            status: WagerStatus::Open,
            dice: None,
            winner: None,
            commission: Money::ZERO,
            chat,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deadline(&self, window: Duration) -> DateTime<Utc> {
        match chrono::Duration::from_std(window) {
            Ok(window) => self.created_at + window,
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn is_draw(&self) -> bool {
        self.status == WagerStatus::Settled && self.winner.is_none()
    }

    /// Checks the per-status shape of the row.
    pub fn check_shape(&self) -> Result<(), String> {
        match self.status {
            WagerStatus::Open | WagerStatus::Expired => {
                if self.joiner.is_some() || self.dice.is_some() || self.winner.is_some() {
                    return Err(format!("{} wager {} carries match data", self.status, self.id));
                }
            }
            WagerStatus::Matched => {
                if self.joiner.is_none() {
                    return Err(format!("matched wager {} has no joiner", self.id));
                }
                if self.dice.is_some() {
                    return Err(format!("matched wager {} already has dice", self.id));
                }
            }
            WagerStatus::Settled => {
                let (Some(joiner), Some(dice)) = (self.joiner, self.dice) else {
                    return Err(format!("settled wager {} is missing joiner or dice", self.id));
                };
                let expected = match dice.creator_total().cmp(&dice.joiner_total()) {
                    std::cmp::Ordering::Greater => Some(self.creator),
                    std::cmp::Ordering::Less => Some(joiner),
                    std::cmp::Ordering::Equal => None,
                };
                if expected != self.winner {
                    return Err(format!("settled wager {} winner disagrees with dice", self.id));
                }
                if self.winner.is_none() && self.commission != Money::ZERO {
                    return Err(format!("drawn wager {} carries commission", self.id));
                }
            }
        }
        Ok(())
    }
}
