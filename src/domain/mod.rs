pub mod account;
pub mod command;
pub mod error;
pub mod money;
pub mod operation;
pub mod settlement;
pub mod traits;
pub mod transaction;
pub mod wager;

pub use account::{Account, AccountId};
pub use command::Command;
pub use error::Error;
pub use money::Money;
pub use operation::{OperationDraft, OperationRecord, OperationStatus, RollbackInfo};
pub use settlement::{Outcome, SettlementResult};
pub use traits::{CommandStream, DeadLetterQueue, DiceSource, ExpiryNotifier, LedgerStore};
pub use transaction::{EntryKind, EntryRequest, LedgerEntry};
pub use wager::{ChatId, DiceFaces, Wager, WagerId, WagerStatus};
