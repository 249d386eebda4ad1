use std::sync::Arc;

use futures::Stream;

use crate::domain::{
    Account, AccountId, ChatId, Command, DiceFaces, EntryRequest, Error, LedgerEntry, Money,
    Wager, WagerId, WagerStatus,
};

/// Persistent accounts, wagers and ledger entries.
///
/// Every mutating method is one all-or-nothing transaction. Deductions re-read
/// the balance inside the transaction and fail with
/// [`Error::InsufficientBalance`] when it no longer covers the amount, whatever
/// an earlier read said. A request whose `expected_balance` no longer matches
/// the row fails with [`Error::BalanceMoved`]. Status transitions are
/// conditional and fail with [`Error::StateConflict`] when the row is not in
/// the required state.
///
/// Mutations hand back the entries they applied. Entry `seq` values are
/// assigned inside the transaction and so follow commit order.
pub trait LedgerStore: Send + Sync {
    fn get_account(&self, id: AccountId) -> Result<Option<Account>, Error>;

    fn get_wager(&self, id: &WagerId) -> Result<Option<Wager>, Error>;

    fn accounts(&self) -> Result<Vec<Account>, Error>;

    fn wagers_with_status(&self, status: WagerStatus) -> Result<Vec<Wager>, Error>;

    /// Open wagers of one chat, oldest first.
    fn open_wagers(&self, chat: ChatId) -> Result<Vec<Wager>, Error>;

    /// Wagers the account took part in, newest first.
    fn wager_history(&self, account: AccountId, limit: usize) -> Result<Vec<Wager>, Error>;

    fn entries_for_account(&self, account: AccountId) -> Result<Vec<LedgerEntry>, Error>;

    fn entries_for_wager(&self, wager: &WagerId) -> Result<Vec<LedgerEntry>, Error>;

    /// Commission retained so far.
    fn house_balance(&self) -> Result<Money, Error>;

    /// Inserts the account with its starting grant. Fails with
    /// [`Error::AccountExists`] when the row is already there.
    fn create_account(&self, grant: EntryRequest) -> Result<(Account, LedgerEntry), Error>;

    /// Plain deposit or withdrawal.
    fn apply_entry(&self, entry: EntryRequest) -> Result<LedgerEntry, Error>;

    fn create_wager_with_deduction(
        &self,
        wager: Wager,
        stake: EntryRequest,
    ) -> Result<LedgerEntry, Error>;

    /// `Open -> Matched`, deducting the joiner's stake.
    fn join_wager_with_deduction(
        &self,
        wager: &WagerId,
        joiner: AccountId,
        stake: EntryRequest,
    ) -> Result<(Wager, LedgerEntry), Error>;

    /// `Matched -> Settled`, recording dice, winner and commission and
    /// applying every payout.
    fn settle_wager_with_payouts(
        &self,
        wager: &WagerId,
        dice: DiceFaces,
        winner: Option<AccountId>,
        commission: Money,
        payouts: Vec<EntryRequest>,
    ) -> Result<(Wager, Vec<LedgerEntry>), Error>;

    /// `Open -> Expired`, refunding the creator.
    fn expire_wager_with_refund(
        &self,
        wager: &WagerId,
        refund: EntryRequest,
    ) -> Result<(Wager, LedgerEntry), Error>;
}

/// Source of die faces in `1..=6`.
pub trait DiceSource: Send + Sync {
    fn roll(&self, count: usize) -> Result<Vec<u8>, Error>;
}

impl<T: DiceSource + ?Sized> DiceSource for Arc<T> {
    fn roll(&self, count: usize) -> Result<Vec<u8>, Error> {
        (**self).roll(count)
    }
}

/// Told about every wager that expired without an opponent.
pub trait ExpiryNotifier: Send + Sync {
    fn wager_expired(&self, wager: &WagerId, chat: ChatId);
}

impl<F> ExpiryNotifier for F
where
    F: Fn(&WagerId, ChatId) + Send + Sync,
{
    fn wager_expired(&self, wager: &WagerId, chat: ChatId) {
        self(wager, chat)
    }
}

pub trait CommandStream {
    type CmdStream: Stream<Item = Result<Command, Error>> + Send + Unpin + 'static;
    fn stream(&mut self) -> Self::CmdStream;
}

pub trait DeadLetterQueue {
    fn report(&self, error: &Error);
}
