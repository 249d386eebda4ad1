use crate::config::ConfigError;
use crate::domain::{AccountId, Money, WagerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Ingestion failed with: {0}")]
    Ingestion(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("account {0} already exists")]
    AccountExists(AccountId),

    #[error("unknown wager {0}")]
    UnknownWager(WagerId),

    #[error("insufficient balance for account {account}: current {current}, required {required}")]
    InsufficientBalance {
        account: AccountId,
        current: Money,
        required: Money,
    },

    #[error("too many requests from account {account}, retry in {retry_after_ms} ms")]
    RateLimited { account: AccountId, retry_after_ms: u64 },

    #[error("wager {wager} is no longer available")]
    StateConflict { wager: WagerId },

    /// The balance an operation was audited against changed before the store
    /// transaction ran.
    #[error("balance of account {account} moved from {expected} to {current}")]
    BalanceMoved {
        account: AccountId,
        expected: Money,
        current: Money,
    },

    #[error("unknown operation {0}")]
    UnknownOperation(String),

    #[error("operation {0} is already rolled back")]
    AlreadyRolledBack(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl Error {
    /// Whether the error text may be shown to a player as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownAccount(_)
                | Error::UnknownWager(_)
                | Error::InsufficientBalance { .. }
                | Error::RateLimited { .. }
                | Error::StateConflict { .. }
        )
    }

    /// Message for the chat layer. Integrity and store details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::StateConflict { .. } => "this wager is no longer available".to_string(),
            e if e.is_user_facing() => e.to_string(),
            Error::Store(_) | Error::BalanceMoved { .. } | Error::IO(_) => {
                "temporary failure, please try again".to_string()
            }
            _ => "the request could not be completed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_messages_hide_internal_failures() {
        let conflict = Error::StateConflict {
            wager: WagerId::from("G1"),
        };
        assert_eq!(conflict.public_message(), "this wager is no longer available");

        let short = Error::InsufficientBalance {
            account: 7,
            current: Money(50),
            required: Money(100),
        };
        assert!(short.public_message().contains("current 50, required 100"));

        let integrity = Error::Integrity("checksum mismatch on op 1".into());
        assert!(!integrity.is_user_facing());
        assert!(!integrity.public_message().contains("checksum"));

        let store = Error::Store("lock poisoned".into());
        assert_eq!(store.public_message(), "temporary failure, please try again");
    }
}
