use crate::domain::{AccountId, ChatId, Money};

/// One replayed chat-layer request. Wagers are referred to by a label bound
/// when the `create` row runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open {
        account: AccountId,
    },
    Deposit {
        account: AccountId,
        amount: Money,
    },
    Withdraw {
        account: AccountId,
        amount: Money,
    },
    Create {
        account: AccountId,
        chat: ChatId,
        label: String,
        stake: Money,
    },
    Join {
        account: AccountId,
        label: String,
        dice: Option<[u8; 6]>,
    },
    Expire {
        label: String,
    },
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Open { account } => write!(f, "open,account={}", account),
            Command::Deposit { account, amount } => {
                write!(f, "deposit,account={},amount={}", account, amount)
            }
            Command::Withdraw { account, amount } => {
                write!(f, "withdraw,account={},amount={}", account, amount)
            }
            Command::Create {
                account,
                chat,
                label,
                stake,
            } => write!(
                f,
                "create,account={},chat={},label={},stake={}",
                account, chat, label, stake
            ),
            Command::Join { account, label, .. } => {
                write!(f, "join,account={},label={}", account, label)
            }
            Command::Expire { label } => write!(f, "expire,label={}", label),
        }
    }
}
