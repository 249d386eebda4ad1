use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use chrono::Utc;

use crate::domain::{
    Account, AccountId, ChatId, DiceFaces, EntryRequest, Error, LedgerEntry, LedgerStore, Money,
    Wager, WagerId, WagerStatus,
};

/// Process-local ledger. A single mutex stands in for the database
/// transaction: every mutating call stages its changes against a snapshot of
/// the rows it touches and only writes them back when the whole body
/// succeeded.
#[derive(Default, Debug)]
pub struct InMemoryLedger {
    tables: Mutex<Tables>,
}

#[derive(Default, Debug)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    wagers: HashMap<WagerId, Wager>,
    entries: Vec<LedgerEntry>,
    house: Money,
    next_seq: u64,
}

#[derive(Default)]
struct Changes {
    accounts: HashMap<AccountId, Account>,
    wagers: HashMap<WagerId, Wager>,
    entries: Vec<LedgerEntry>,
    house: Money,
}

impl Tables {
    fn commit(&mut self, changes: Changes) -> Result<(), Error> {
        let house = self
            .house
            .checked_add(changes.house)
            .ok_or_else(|| Error::Integrity("house balance overflow".to_string()))?;
        self.house = house;
        self.next_seq += changes.entries.len() as u64;
        self.accounts.extend(changes.accounts);
        self.wagers.extend(changes.wagers);
        self.entries.extend(changes.entries);
        Ok(())
    }
}

struct Tx<'a> {
    tables: &'a Tables,
    staged: Changes,
}

impl<'a> Tx<'a> {
    fn begin(tables: &'a Tables) -> Self {
        Self {
            tables,
            staged: Changes::default(),
        }
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, Error> {
        match self.staged.accounts.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let account = self
                    .tables
                    .accounts
                    .get(&id)
                    .cloned()
                    .ok_or(Error::UnknownAccount(id))?;
                Ok(e.insert(account))
            }
        }
    }

    fn wager_mut(&mut self, id: &WagerId) -> Result<&mut Wager, Error> {
        match self.staged.wagers.entry(id.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let wager = self
                    .tables
                    .wagers
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::UnknownWager(id.clone()))?;
                Ok(e.insert(wager))
            }
        }
    }

    /// Applies one balance change against the balance read inside this
    /// transaction.
    fn apply(&mut self, req: EntryRequest) -> Result<LedgerEntry, Error> {
        let seq = self.tables.next_seq + self.staged.entries.len() as u64;
        let account = self.account_mut(req.account)?;
        let current = account.balance;

        if req.amount.is_negative() && current < -req.amount {
            return Err(Error::InsufficientBalance {
                account: req.account,
                current,
                required: -req.amount,
            });
        }
        if current != req.expected_balance {
            return Err(Error::BalanceMoved {
                account: req.account,
                expected: req.expected_balance,
                current,
            });
        }

        let balance_after = current
            .checked_add(req.amount)
            .ok_or_else(|| Error::Validation(format!("balance overflow on account {}", req.account)))?;
        if balance_after.is_negative() {
            return Err(Error::InsufficientBalance {
                account: req.account,
                current,
                required: -req.amount,
            });
        }

        let now = Utc::now();
        account.balance = balance_after;
        account.updated_at = now;

        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            account: req.account,
            wager: req.wager,
            kind: req.kind,
            amount: req.amount,
            balance_after,
            context: req.context,
            created_at: now,
        };
        self.staged.entries.push(entry.clone());
        Ok(entry)
    }

    fn into_changes(self) -> Changes {
        self.staged
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, Error> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("ledger lock poisoned".to_string()))?;
        Ok(f(&tables))
    }

    fn transaction<T>(&self, body: impl FnOnce(&mut Tx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("ledger lock poisoned".to_string()))?;

        let (value, changes) = {
            let mut tx = Tx::begin(&tables);
            let value = body(&mut tx)?;
            (value, tx.into_changes())
        };

        tables.commit(changes)?;
        Ok(value)
    }
}

fn expect_stake_of(wager: &Wager, req: &EntryRequest, account: AccountId) -> Result<(), Error> {
    if req.account != account || req.amount != -wager.stake {
        return Err(Error::Integrity(format!(
            "stake entry for wager {} does not match the wager row",
            wager.id
        )));
    }
    Ok(())
}

impl LedgerStore for InMemoryLedger {
    fn get_account(&self, id: AccountId) -> Result<Option<Account>, Error> {
        self.read(|t| t.accounts.get(&id).cloned())
    }

    fn get_wager(&self, id: &WagerId) -> Result<Option<Wager>, Error> {
        self.read(|t| t.wagers.get(id).cloned())
    }

    fn accounts(&self) -> Result<Vec<Account>, Error> {
        self.read(|t| {
            let mut accounts: Vec<Account> = t.accounts.values().cloned().collect();
            accounts.sort_by_key(|a| a.id);
            accounts
        })
    }

    fn wagers_with_status(&self, status: WagerStatus) -> Result<Vec<Wager>, Error> {
        self.read(|t| {
            let mut wagers: Vec<Wager> = t
                .wagers
                .values()
                .filter(|w| w.status == status)
                .cloned()
                .collect();
            wagers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            wagers
        })
    }

    fn open_wagers(&self, chat: ChatId) -> Result<Vec<Wager>, Error> {
        Ok(self
            .wagers_with_status(WagerStatus::Open)?
            .into_iter()
            .filter(|w| w.chat == chat)
            .collect())
    }

    fn wager_history(&self, account: AccountId, limit: usize) -> Result<Vec<Wager>, Error> {
        self.read(|t| {
            let mut wagers: Vec<Wager> = t
                .wagers
                .values()
                .filter(|w| w.creator == account || w.joiner == Some(account))
                .cloned()
                .collect();
            wagers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            wagers.truncate(limit);
            wagers
        })
    }

    fn entries_for_account(&self, account: AccountId) -> Result<Vec<LedgerEntry>, Error> {
        self.read(|t| {
            t.entries
                .iter()
                .filter(|e| e.account == account)
                .cloned()
                .collect()
        })
    }

    fn entries_for_wager(&self, wager: &WagerId) -> Result<Vec<LedgerEntry>, Error> {
        self.read(|t| {
            t.entries
                .iter()
                .filter(|e| e.wager.as_ref() == Some(wager))
                .cloned()
                .collect()
        })
    }

    fn house_balance(&self) -> Result<Money, Error> {
        self.read(|t| t.house)
    }

    fn create_account(&self, grant: EntryRequest) -> Result<(Account, LedgerEntry), Error> {
        self.transaction(|tx| {
            if tx.tables.accounts.contains_key(&grant.account) {
                return Err(Error::AccountExists(grant.account));
            }
            if grant.expected_balance != Money::ZERO || grant.amount.is_negative() {
                return Err(Error::Integrity(format!(
                    "starting grant for account {} is malformed",
                    grant.account
                )));
            }

            let id = grant.account;
            tx.staged.accounts.insert(id, Account::new(id, Money::ZERO));
            let entry = tx.apply(grant)?;
            let account = tx.account_mut(id)?.clone();
            Ok((account, entry))
        })
    }

    fn apply_entry(&self, entry: EntryRequest) -> Result<LedgerEntry, Error> {
        self.transaction(|tx| tx.apply(entry))
    }

    fn create_wager_with_deduction(
        &self,
        wager: Wager,
        stake: EntryRequest,
    ) -> Result<LedgerEntry, Error> {
        self.transaction(|tx| {
            if tx.tables.wagers.contains_key(&wager.id) {
                return Err(Error::Store(format!("wager {} already exists", wager.id)));
            }
            if wager.status != WagerStatus::Open {
                return Err(Error::Integrity(format!(
                    "new wager {} must start open",
                    wager.id
                )));
            }
            expect_stake_of(&wager, &stake, wager.creator)?;

            let entry = tx.apply(stake)?;
            tx.staged.wagers.insert(wager.id.clone(), wager);
            Ok(entry)
        })
    }

    fn join_wager_with_deduction(
        &self,
        wager: &WagerId,
        joiner: AccountId,
        stake: EntryRequest,
    ) -> Result<(Wager, LedgerEntry), Error> {
        self.transaction(|tx| {
            let row = tx.wager_mut(wager)?.clone();
            if row.status != WagerStatus::Open {
                return Err(Error::StateConflict {
                    wager: wager.clone(),
                });
            }
            if row.creator == joiner {
                return Err(Error::Validation(
                    "cannot join a wager you created".to_string(),
                ));
            }
            expect_stake_of(&row, &stake, joiner)?;

            let entry = tx.apply(stake)?;

            let row = tx.wager_mut(wager)?;
            row.joiner = Some(joiner);
            row.status = WagerStatus::Matched;
            row.updated_at = Utc::now();
            Ok((row.clone(), entry))
        })
    }

    fn settle_wager_with_payouts(
        &self,
        wager: &WagerId,
        dice: DiceFaces,
        winner: Option<AccountId>,
        commission: Money,
        payouts: Vec<EntryRequest>,
    ) -> Result<(Wager, Vec<LedgerEntry>), Error> {
        self.transaction(|tx| {
            let row = tx.wager_mut(wager)?;
            if row.status != WagerStatus::Matched {
                return Err(Error::StateConflict {
                    wager: wager.clone(),
                });
            }

            let pot = row
                .stake
                .checked_mul(2)
                .ok_or_else(|| Error::Integrity(format!("pot overflow on wager {}", wager)))?;
            let paid = payouts
                .iter()
                .try_fold(Money::ZERO, |acc, p| acc.checked_add(p.amount))
                .ok_or_else(|| Error::Integrity(format!("payout overflow on wager {}", wager)))?;
            if paid + commission != pot {
                return Err(Error::Integrity(format!(
                    "wager {} pays out {} plus commission {} from a pot of {}",
                    wager, paid, commission, pot
                )));
            }

            row.dice = Some(dice);
            row.winner = winner;
            row.commission = commission;
            row.status = WagerStatus::Settled;
            row.updated_at = Utc::now();
            row.check_shape().map_err(Error::Integrity)?;
            let settled = row.clone();

            let entries = payouts
                .into_iter()
                .map(|payout| tx.apply(payout))
                .collect::<Result<Vec<_>, _>>()?;
            tx.staged.house = commission;
            Ok((settled, entries))
        })
    }

    fn expire_wager_with_refund(
        &self,
        wager: &WagerId,
        refund: EntryRequest,
    ) -> Result<(Wager, LedgerEntry), Error> {
        self.transaction(|tx| {
            let row = tx.wager_mut(wager)?;
            if row.status != WagerStatus::Open {
                return Err(Error::StateConflict {
                    wager: wager.clone(),
                });
            }
            if refund.account != row.creator || refund.amount != row.stake {
                return Err(Error::Integrity(format!(
                    "refund for wager {} does not match the wager row",
                    wager
                )));
            }
            row.status = WagerStatus::Expired;
            row.updated_at = Utc::now();
            let expired = row.clone();

            let entry = tx.apply(refund)?;
            Ok((expired, entry))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntryKind;

    fn grant(account: AccountId, amount: i64) -> EntryRequest {
        EntryRequest {
            account,
            wager: None,
            kind: EntryKind::Deposit,
            amount: Money(amount),
            expected_balance: Money::ZERO,
            context: "starting grant".to_string(),
        }
    }

    fn stake(account: AccountId, wager: &Wager, expected: i64) -> EntryRequest {
        EntryRequest {
            account,
            wager: Some(wager.id.clone()),
            kind: EntryKind::Stake,
            amount: -wager.stake,
            expected_balance: Money(expected),
            context: "stake".to_string(),
        }
    }

    fn ledger_with(accounts: &[(AccountId, i64)]) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for (id, amount) in accounts {
            ledger.create_account(grant(*id, *amount)).unwrap();
        }
        ledger
    }

    #[test]
    fn create_account_refuses_existing_rows() {
        let ledger = ledger_with(&[(1, 1000)]);
        assert!(matches!(
            ledger.create_account(grant(1, 1000)),
            Err(Error::AccountExists(1))
        ));
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(1000));
        assert_eq!(ledger.entries_for_account(1).unwrap().len(), 1);
    }

    #[test]
    fn deduction_rechecks_balance_inside_transaction() {
        let ledger = ledger_with(&[(1, 50)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        let req = stake(1, &wager, 50);

        let err = ledger.create_wager_with_deduction(wager, req).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBalance { current: Money(50), required: Money(100), .. }
        ));
        assert!(ledger.get_wager(&WagerId::from("G1")).unwrap().is_none());
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(50));
    }

    #[test]
    fn stale_expected_balance_is_rejected() {
        let ledger = ledger_with(&[(1, 1000)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        let req = stake(1, &wager, 900);

        let err = ledger.create_wager_with_deduction(wager, req).unwrap_err();
        assert!(matches!(err, Error::BalanceMoved { current: Money(1000), .. }));
        assert!(ledger.entries_for_account(1).unwrap().len() == 1);
    }

    #[test]
    fn join_only_transitions_open_wagers() {
        let ledger = ledger_with(&[(1, 1000), (2, 1000)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        ledger
            .create_wager_with_deduction(wager.clone(), stake(1, &wager, 1000))
            .unwrap();

        let refund = EntryRequest {
            account: 1,
            wager: Some(wager.id.clone()),
            kind: EntryKind::Refund,
            amount: Money(100),
            expected_balance: Money(900),
            context: "expired".to_string(),
        };
        ledger.expire_wager_with_refund(&wager.id, refund).unwrap();

        let err = ledger
            .join_wager_with_deduction(&wager.id, 2, stake(2, &wager, 1000))
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
        assert_eq!(ledger.get_account(2).unwrap().unwrap().balance, Money(1000));
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(1000));
    }

    #[test]
    fn settlement_is_all_or_nothing() {
        let ledger = ledger_with(&[(1, 1000), (2, 1000)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        ledger
            .create_wager_with_deduction(wager.clone(), stake(1, &wager, 1000))
            .unwrap();
        ledger
            .join_wager_with_deduction(&wager.id, 2, stake(2, &wager, 1000))
            .unwrap();

        let dice = DiceFaces::from_rolls(&[3, 3, 4, 5, 4, 1]).unwrap();
        let refund = |account, expected| EntryRequest {
            account,
            wager: Some(wager.id.clone()),
            kind: EntryKind::Refund,
            amount: Money(100),
            expected_balance: Money(expected),
            context: "draw".to_string(),
        };
        // Second refund is computed from a stale balance.
        let err = ledger
            .settle_wager_with_payouts(
                &wager.id,
                dice,
                None,
                Money::ZERO,
                vec![refund(1, 900), refund(2, 950)],
            )
            .unwrap_err();
        assert!(matches!(err, Error::BalanceMoved { account: 2, .. }));

        let row = ledger.get_wager(&wager.id).unwrap().unwrap();
        assert_eq!(row.status, WagerStatus::Matched);
        assert!(row.dice.is_none());
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(900));

        let (settled, entries) = ledger
            .settle_wager_with_payouts(
                &wager.id,
                dice,
                None,
                Money::ZERO,
                vec![refund(1, 900), refund(2, 900)],
            )
            .unwrap();
        assert!(settled.is_draw());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].seq < entries[1].seq);
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(1000));
        assert_eq!(ledger.get_account(2).unwrap().unwrap().balance, Money(1000));
    }

    #[test]
    fn settlement_rejects_payouts_that_do_not_balance() {
        let ledger = ledger_with(&[(1, 1000), (2, 1000)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        ledger
            .create_wager_with_deduction(wager.clone(), stake(1, &wager, 1000))
            .unwrap();
        ledger
            .join_wager_with_deduction(&wager.id, 2, stake(2, &wager, 1000))
            .unwrap();

        let dice = DiceFaces::from_rolls(&[6, 6, 6, 1, 1, 1]).unwrap();
        let win = EntryRequest {
            account: 1,
            wager: Some(wager.id.clone()),
            kind: EntryKind::Win,
            amount: Money(200),
            expected_balance: Money(900),
            context: "win".to_string(),
        };
        let err = ledger
            .settle_wager_with_payouts(&wager.id, dice, Some(1), Money(20), vec![win])
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(ledger.house_balance().unwrap(), Money::ZERO);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let ledger = ledger_with(&[(1, 1000)]);
        for i in 0..3 {
            let wager = Wager::open(WagerId::from(format!("G{i}")), 1, -10, Money(10));
            let expected = 1000 - 10 * i;
            ledger
                .create_wager_with_deduction(wager.clone(), stake(1, &wager, expected))
                .unwrap();
        }
        let history = ledger.wager_history(1, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at >= history[1].created_at);
        assert_eq!(ledger.open_wagers(-10).unwrap().len(), 3);
        assert!(ledger.open_wagers(-11).unwrap().is_empty());
    }

    #[test]
    fn house_overflow_aborts_the_settlement() {
        let ledger = ledger_with(&[(1, 1000), (2, 1000)]);
        let wager = Wager::open(WagerId::from("G1"), 1, -10, Money(100));
        ledger
            .create_wager_with_deduction(wager.clone(), stake(1, &wager, 1000))
            .unwrap();
        ledger
            .join_wager_with_deduction(&wager.id, 2, stake(2, &wager, 1000))
            .unwrap();
        ledger.tables.lock().unwrap().house = Money(i64::MAX - 5);

        let win = EntryRequest {
            account: 1,
            wager: Some(wager.id.clone()),
            kind: EntryKind::Win,
            amount: Money(180),
            expected_balance: Money(900),
            context: "win".to_string(),
        };
        let dice = DiceFaces::from_rolls(&[6, 6, 6, 1, 1, 1]).unwrap();
        let err = ledger
            .settle_wager_with_payouts(&wager.id, dice, Some(1), Money(20), vec![win])
            .unwrap_err();

        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(ledger.get_account(1).unwrap().unwrap().balance, Money(900));
        assert_eq!(
            ledger.get_wager(&wager.id).unwrap().unwrap().status,
            WagerStatus::Matched
        );
        assert_eq!(ledger.house_balance().unwrap(), Money(i64::MAX - 5));
    }
}
