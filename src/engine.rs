use std::cmp::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditLayer, AuditReport};
use crate::config::ValidatedConfig;
use crate::domain::{
    Account, AccountId, ChatId, DiceFaces, DiceSource, EntryKind, EntryRequest, Error,
    ExpiryNotifier, LedgerEntry, LedgerStore, Money, OperationDraft, OperationRecord,
    Outcome, SettlementResult, Wager, WagerId, WagerStatus,
};
use crate::timers::{Expiry, ExpiryTimers, TimerInfo};

/// How often an audited operation is recomputed when the balance it was
/// recorded against moved before the store transaction ran.
const MAX_ATTEMPTS: usize = 3;

/// Outcome of a startup (or on-demand) pass over unfinished wagers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired: usize,
    pub rearmed: usize,
    pub settled: usize,
    pub failed: usize,
}

/// Drives wagers through `Open -> Matched -> Settled` and `Open -> Expired`.
///
/// Every balance change is recorded in the [`AuditLayer`] before the store is
/// touched and resolved right after the store answers.
pub struct Engine<S, R, N> {
    config: ValidatedConfig,
    store: S,
    dice: R,
    notifier: N,
    audit: AuditLayer,
    timers: ExpiryTimers,
    /// When each account last passed the deduction throttle.
    last_deduction: DashMap<AccountId, Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn entry_for(record: &OperationRecord, context: &str) -> EntryRequest {
    EntryRequest {
        account: record.account,
        wager: record.wager.clone(),
        kind: record.kind,
        amount: record.amount,
        expected_balance: record.pre_balance,
        context: context.to_string(),
    }
}

fn ensure_covers(account: &Account, required: Money) -> Result<(), Error> {
    if !account.covers(required) {
        return Err(Error::InsufficientBalance {
            account: account.id,
            current: account.balance,
            required,
        });
    }
    Ok(())
}

/// Rejections the store answers without having touched anything.
fn is_rejection(error: &Error) -> bool {
    matches!(
        error,
        Error::Validation(_)
            | Error::UnknownAccount(_)
            | Error::UnknownWager(_)
            | Error::AccountExists(_)
            | Error::InsufficientBalance { .. }
            | Error::StateConflict { .. }
            | Error::BalanceMoved { .. }
    )
}

impl<S, R, N> Engine<S, R, N>
where
    S: LedgerStore + 'static,
    R: DiceSource + 'static,
    N: ExpiryNotifier + 'static,
{
    /// Builds the engine on the current runtime, starts the expiry worker and
    /// the periodic timer sweep, then reconciles wagers left over from a
    /// previous run.
    pub async fn start(
        config: ValidatedConfig,
        store: S,
        dice: R,
        notifier: N,
    ) -> Result<Arc<Self>, Error> {
        let (timers, expiries) = ExpiryTimers::new(Handle::current());
        let engine = Arc::new(Self {
            audit: AuditLayer::new(config.strict_consistency),
            config,
            store,
            dice,
            notifier,
            timers,
            last_deduction: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let worker = tokio::spawn(Self::run_expiries(Arc::downgrade(&engine), expiries));
        let sweeper = tokio::spawn(Self::run_sweeps(
            Arc::downgrade(&engine),
            engine.config.sweep_interval,
        ));
        engine
            .tasks
            .lock()
            .map_err(|_| Error::Store("engine task list poisoned".to_string()))?
            .extend([worker, sweeper]);

        let report = engine.reconcile_overdue(Utc::now())?;
        info!(
            expired = report.expired,
            rearmed = report.rearmed,
            settled = report.settled,
            failed = report.failed,
            "engine started"
        );
        Ok(engine)
    }

    async fn run_expiries(weak: Weak<Self>, mut expiries: UnboundedReceiver<Expiry>) {
        while let Some(expiry) = expiries.recv().await {
            let Some(engine) = weak.upgrade() else {
                break;
            };
            engine.on_timer_fired(expiry);
        }
        debug!("expiry worker stopped");
    }

    async fn run_sweeps(weak: Weak<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(engine) = weak.upgrade() else {
                break;
            };
            if let Err(e) = engine.sweep_timers() {
                warn!(error = %e, "timer sweep failed");
            }
        }
    }

    fn on_timer_fired(&self, expiry: Expiry) {
        match self.expire_wager(&expiry.wager) {
            Ok(_) => {}
            Err(Error::StateConflict { .. }) => {
                debug!(wager = %expiry.wager, "wager left the open state before its timer fired");
            }
            Err(e) => {
                error!(wager = %expiry.wager, chat = expiry.chat, error = %e, "timed expiry failed");
            }
        }
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn audit(&self) -> &AuditLayer {
        &self.audit
    }

    fn require_account(&self, id: AccountId) -> Result<Account, Error> {
        self.store.get_account(id)?.ok_or(Error::UnknownAccount(id))
    }

    fn require_wager(&self, id: &WagerId) -> Result<Wager, Error> {
        self.store
            .get_wager(id)?
            .ok_or_else(|| Error::UnknownWager(id.clone()))
    }

    fn check_stake(&self, stake: Money) -> Result<(), Error> {
        if stake < self.config.min_stake || stake > self.config.max_stake {
            return Err(Error::Validation(format!(
                "stake must be between {} and {}",
                self.config.min_stake, self.config.max_stake
            )));
        }
        Ok(())
    }

    /// Rejects a deduction that follows the account's previous one within
    /// the configured operation interval.
    fn throttle(&self, account: AccountId) -> Result<(), Error> {
        let Some(interval) = self.config.operation_interval else {
            return Ok(());
        };
        let now = Instant::now();
        match self.last_deduction.entry(account) {
            Entry::Occupied(mut last) => {
                let elapsed = now.duration_since(*last.get());
                if elapsed < interval {
                    let retry_after_ms =
                        u64::try_from((interval - elapsed).as_millis()).unwrap_or(u64::MAX);
                    debug!(account, retry_after_ms, "deduction throttled");
                    return Err(Error::RateLimited {
                        account,
                        retry_after_ms,
                    });
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        Ok(())
    }

    /// `floor(pot * fee_rate)`.
    fn commission_on(&self, pot: Money) -> Result<Money, Error> {
        Decimal::from(pot.as_units())
            .checked_mul(self.config.fee_rate)
            .map(|fee| fee.floor())
            .and_then(|fee| fee.to_i64())
            .map(Money)
            .ok_or_else(|| Error::Integrity(format!("commission on a pot of {} overflows", pot)))
    }

    /// Runs `attempt` again while it fails because a balance moved between
    /// the read it was audited against and the store transaction.
    fn with_fresh_balances<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Err(Error::BalanceMoved {
                    account,
                    expected,
                    current,
                }) if tries < MAX_ATTEMPTS => {
                    debug!(account, %expected, %current, attempt = tries, "balance moved, recomputing operation");
                }
                other => return other,
            }
        }
    }

    /// Records every draft, validates them, hands the records to `apply` and
    /// resolves each record from its answer.
    ///
    /// `apply` returns the ledger entries it wrote, one per record and in
    /// record order; each record is completed with its entry's sequence.
    /// A failed validation rolls the whole batch back before the store is
    /// touched. A store rejection marks the batch failed; any other store
    /// error rolls it back.
    fn audited<T>(
        &self,
        drafts: Vec<OperationDraft>,
        apply: impl FnOnce(&[OperationRecord]) -> Result<(T, Vec<LedgerEntry>), Error>,
    ) -> Result<T, Error> {
        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match self.audit.record(draft) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.roll_back_all(&records, "recording a sibling operation failed");
                    return Err(e);
                }
            }
        }

        if let Err(e) = records.iter().try_for_each(|r| self.audit.validate(&r.id)) {
            error!(error = %e, "operation failed validation; nothing applied");
            self.roll_back_all(&records, &e.to_string());
            return Err(match e {
                Error::Integrity(_) => e,
                other => Error::Integrity(other.to_string()),
            });
        }

        match apply(&records) {
            Ok((value, entries)) => {
                if entries.len() != records.len() {
                    error!(
                        operations = records.len(),
                        entries = entries.len(),
                        "store wrote a different number of entries than operations"
                    );
                }
                for (record, entry) in records.iter().zip(&entries) {
                    if let Err(e) = self.audit.complete(&record.id, entry.seq) {
                        error!(operation = %record.id, error = %e, "applied operation could not be completed");
                    }
                }
                for record in records.iter().skip(entries.len()) {
                    if let Err(e) = self.audit.fail(&record.id, "store wrote no entry") {
                        error!(operation = %record.id, error = %e, "could not mark operation failed");
                    }
                }
                Ok(value)
            }
            Err(e) if is_rejection(&e) => {
                let reason = e.to_string();
                for record in &records {
                    if let Err(fail) = self.audit.fail(&record.id, &reason) {
                        error!(operation = %record.id, error = %fail, "could not mark operation failed");
                    }
                }
                Err(e)
            }
            Err(e) => {
                self.roll_back_all(&records, &e.to_string());
                Err(e)
            }
        }
    }

    fn roll_back_all(&self, records: &[OperationRecord], reason: &str) {
        for record in records {
            if let Err(e) = self.audit.rollback(&record.id, reason) {
                error!(operation = %record.id, error = %e, "rollback failed");
            }
        }
    }

    /// Opens an account with the configured starting grant. An existing
    /// account is returned unchanged.
    #[instrument(skip(self))]
    pub fn open_account(&self, id: AccountId) -> Result<Account, Error> {
        if let Some(account) = self.store.get_account(id)? {
            return Ok(account);
        }

        let grant = self.config.starting_balance;
        let draft = OperationDraft::new(id, None, EntryKind::Deposit, grant, Money::ZERO)?
            .with_meta("operation", "starting_grant");
        match self.audited(vec![draft], |ops| {
            let (account, entry) = self
                .store
                .create_account(entry_for(&ops[0], "starting grant"))?;
            Ok((account, vec![entry]))
        }) {
            Ok(account) => {
                info!(account = id, grant = %grant, "account opened");
                Ok(account)
            }
            Err(Error::AccountExists(_)) => self.require_account(id),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(amount = %amount))]
    pub fn deposit(&self, account: AccountId, amount: Money) -> Result<LedgerEntry, Error> {
        if !amount.is_positive() {
            return Err(Error::Validation("deposit must be positive".to_string()));
        }
        if amount > self.config.max_single_credit {
            return Err(Error::Validation(format!(
                "deposit exceeds the single credit limit of {}",
                self.config.max_single_credit
            )));
        }

        let entry = self.with_fresh_balances(|| {
            let current = self.require_account(account)?;
            let draft = OperationDraft::new(
                account,
                None,
                EntryKind::Deposit,
                amount,
                current.balance,
            )?
            .with_meta("operation", "deposit");
            self.audited(vec![draft], |ops| {
                let entry = self.store.apply_entry(entry_for(&ops[0], "deposit"))?;
                Ok((entry.clone(), vec![entry]))
            })
        })?;
        info!(account, amount = %amount, balance = %entry.balance_after, "deposit applied");
        Ok(entry)
    }

    #[instrument(skip(self), fields(amount = %amount))]
    pub fn withdraw(&self, account: AccountId, amount: Money) -> Result<LedgerEntry, Error> {
        if !amount.is_positive() {
            return Err(Error::Validation("withdrawal must be positive".to_string()));
        }
        self.throttle(account)?;

        let entry = self.with_fresh_balances(|| {
            let current = self.require_account(account)?;
            ensure_covers(&current, amount)?;
            let draft = OperationDraft::new(
                account,
                None,
                EntryKind::Withdraw,
                -amount,
                current.balance,
            )?
            .with_meta("operation", "withdraw");
            self.audited(vec![draft], |ops| {
                let entry = self.store.apply_entry(entry_for(&ops[0], "withdrawal"))?;
                Ok((entry.clone(), vec![entry]))
            })
        })?;
        info!(account, amount = %amount, balance = %entry.balance_after, "withdrawal applied");
        Ok(entry)
    }

    /// Opens a wager for `account` in `chat`, deducting the stake and arming
    /// its expiry countdown.
    #[instrument(skip(self), fields(stake = %stake))]
    pub fn create_wager(
        &self,
        account: AccountId,
        chat: ChatId,
        stake: Money,
    ) -> Result<WagerId, Error> {
        self.check_stake(stake)?;
        self.throttle(account)?;
        let id = WagerId::generate();

        self.with_fresh_balances(|| {
            let creator = self.require_account(account)?;
            ensure_covers(&creator, stake)?;

            let wager = Wager::open(id.clone(), account, chat, stake);
            let draft = OperationDraft::new(
                account,
                Some(id.clone()),
                EntryKind::Stake,
                -stake,
                creator.balance,
            )?
            .with_meta("operation", "create_wager")
            .with_meta("chat", chat);
            self.audited(vec![draft], |ops| {
                let entry = self
                    .store
                    .create_wager_with_deduction(wager, entry_for(&ops[0], "wager stake"))?;
                Ok(((), vec![entry]))
            })
        })?;

        self.timers
            .arm(id.clone(), chat, self.config.expiry_window);
        info!(wager = %id, account, chat, stake = %stake, "wager created");
        Ok(id)
    }

    /// Joins an open wager, deducting the joiner's stake, and settles it on
    /// the spot.
    #[instrument(skip(self, wager_id), fields(wager = %wager_id))]
    pub fn join_wager(
        &self,
        wager_id: &WagerId,
        account: AccountId,
    ) -> Result<SettlementResult, Error> {
        if wager_id.as_str().trim().is_empty() {
            return Err(Error::Validation("wager id must not be empty".to_string()));
        }
        self.throttle(account)?;

        let matched = self.with_fresh_balances(|| {
            let wager = self.require_wager(wager_id)?;
            if wager.status != WagerStatus::Open {
                return Err(Error::StateConflict {
                    wager: wager_id.clone(),
                });
            }
            if wager.creator == account {
                return Err(Error::Validation(
                    "cannot join a wager you created".to_string(),
                ));
            }
            let joiner = self.require_account(account)?;
            ensure_covers(&joiner, wager.stake)?;

            let draft = OperationDraft::new(
                account,
                Some(wager_id.clone()),
                EntryKind::Stake,
                -wager.stake,
                joiner.balance,
            )?
            .with_meta("operation", "join_wager");
            self.audited(vec![draft], |ops| {
                let (wager, entry) = self.store.join_wager_with_deduction(
                    wager_id,
                    account,
                    entry_for(&ops[0], "wager stake"),
                )?;
                Ok((wager, vec![entry]))
            })
        })?;

        self.timers.disarm(wager_id);
        info!(wager = %wager_id, joiner = account, "wager matched");
        self.resolve(matched)
    }

    /// Settles a wager that is matched but was never resolved, as after a
    /// crash between the join and the settlement.
    #[instrument(skip(self, wager_id), fields(wager = %wager_id))]
    pub fn resolve_matched(&self, wager_id: &WagerId) -> Result<SettlementResult, Error> {
        let wager = self.require_wager(wager_id)?;
        if wager.status != WagerStatus::Matched {
            return Err(Error::StateConflict {
                wager: wager_id.clone(),
            });
        }
        self.resolve(wager)
    }

    fn resolve(&self, wager: Wager) -> Result<SettlementResult, Error> {
        let joiner = wager.joiner.ok_or_else(|| {
            Error::Integrity(format!("matched wager {} has no joiner", wager.id))
        })?;

        let rolls = self.dice.roll(DiceFaces::COUNT)?;
        let dice = DiceFaces::from_rolls(&rolls).ok_or_else(|| {
            error!(wager = %wager.id, ?rolls, "dice source returned invalid faces");
            Error::Integrity(format!("dice source returned invalid faces {:?}", rolls))
        })?;
        let creator_total = dice.creator_total();
        let joiner_total = dice.joiner_total();

        let pot = wager
            .stake
            .checked_mul(2)
            .ok_or_else(|| Error::Integrity(format!("pot overflow on wager {}", wager.id)))?;
        let (outcome, commission) = match creator_total.cmp(&joiner_total) {
            Ordering::Equal => (Outcome::Draw, Money::ZERO),
            ord => {
                let (winner, loser) = if ord == Ordering::Greater {
                    (wager.creator, joiner)
                } else {
                    (joiner, wager.creator)
                };
                let commission = self.commission_on(pot)?;
                let payout = Outcome::Win {
                    winner,
                    loser,
                    payout: pot - commission,
                };
                (payout, commission)
            }
        };

        self.with_fresh_balances(|| {
            let drafts = match outcome {
                Outcome::Draw => [wager.creator, joiner]
                    .into_iter()
                    .map(|id| {
                        let account = self.require_account(id)?;
                        Ok(OperationDraft::new(
                            id,
                            Some(wager.id.clone()),
                            EntryKind::Refund,
                            wager.stake,
                            account.balance,
                        )?
                        .with_meta("operation", "draw_refund"))
                    })
                    .collect::<Result<Vec<_>, Error>>()?,
                Outcome::Win { winner, payout, .. } => {
                    let account = self.require_account(winner)?;
                    vec![
                        OperationDraft::new(
                            winner,
                            Some(wager.id.clone()),
                            EntryKind::Win,
                            payout,
                            account.balance,
                        )?
                        .with_meta("operation", "win_payout")
                        .with_meta("pot", pot)
                        .with_meta("commission", commission),
                    ]
                }
            };
            let context = match outcome {
                Outcome::Draw => "draw refund",
                Outcome::Win { .. } => "wager won",
            };
            self.audited(drafts, |ops| {
                self.store
                    .settle_wager_with_payouts(
                        &wager.id,
                        dice,
                        outcome_winner(&outcome),
                        commission,
                        ops.iter().map(|op| entry_for(op, context)).collect(),
                    )
                    .map(|(_, entries)| ((), entries))
            })
        })?;

        info!(
            wager = %wager.id,
            creator_total,
            joiner_total,
            winner = ?outcome_winner(&outcome),
            commission = %commission,
            "wager settled"
        );
        Ok(SettlementResult {
            wager: wager.id,
            chat: wager.chat,
            creator: wager.creator,
            joiner,
            stake: wager.stake,
            dice,
            creator_total,
            joiner_total,
            outcome,
            commission,
        })
    }

    /// Expires an open wager and refunds its creator. Fails with
    /// [`Error::StateConflict`] once the wager has left the open state.
    #[instrument(skip(self, wager_id), fields(wager = %wager_id))]
    pub fn expire_wager(&self, wager_id: &WagerId) -> Result<Wager, Error> {
        let expired = self.with_fresh_balances(|| {
            let wager = self.require_wager(wager_id)?;
            if wager.status != WagerStatus::Open {
                return Err(Error::StateConflict {
                    wager: wager_id.clone(),
                });
            }
            let creator = self.require_account(wager.creator)?;
            let draft = OperationDraft::new(
                creator.id,
                Some(wager_id.clone()),
                EntryKind::Refund,
                wager.stake,
                creator.balance,
            )?
            .with_meta("operation", "timeout_refund");
            self.audited(vec![draft], |ops| {
                let (wager, entry) = self
                    .store
                    .expire_wager_with_refund(wager_id, entry_for(&ops[0], "wager expired"))?;
                Ok((wager, vec![entry]))
            })
        })?;

        self.timers.disarm(wager_id);
        info!(wager = %wager_id, creator = expired.creator, stake = %expired.stake, "wager expired");
        self.notifier.wager_expired(&expired.id, expired.chat);
        Ok(expired)
    }

    /// Expires open wagers whose deadline passed before `now`, re-arms the
    /// countdown of the others and settles wagers left matched.
    pub fn reconcile_overdue(&self, now: DateTime<Utc>) -> Result<ReconcileReport, Error> {
        let mut report = ReconcileReport::default();

        for wager in self.store.wagers_with_status(WagerStatus::Open)? {
            let deadline = wager.deadline(self.config.expiry_window);
            if deadline <= now {
                match self.expire_wager(&wager.id) {
                    Ok(_) => report.expired += 1,
                    Err(Error::StateConflict { .. }) => {}
                    Err(e) => {
                        warn!(wager = %wager.id, error = %e, "overdue wager could not be expired");
                        report.failed += 1;
                    }
                }
            } else if !self.timers.is_armed(&wager.id) {
                let remaining = (deadline - now).to_std().unwrap_or_default();
                self.timers.arm(wager.id.clone(), wager.chat, remaining);
                report.rearmed += 1;
            }
        }

        for wager in self.store.wagers_with_status(WagerStatus::Matched)? {
            let id = wager.id.clone();
            match self.resolve(wager) {
                Ok(_) => report.settled += 1,
                Err(Error::StateConflict { .. }) => {}
                Err(e) => {
                    warn!(wager = %id, error = %e, "matched wager could not be settled");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Drops countdowns whose wager is no longer open. Returns how many were
    /// removed.
    pub fn sweep_timers(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for id in self.timers.armed_wagers() {
            let open = matches!(
                self.store.get_wager(&id)?,
                Some(w) if w.status == WagerStatus::Open
            );
            if !open && self.timers.disarm(&id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale expiry timers");
        }
        Ok(removed)
    }

    pub fn open_wagers(&self, chat: ChatId) -> Result<Vec<Wager>, Error> {
        self.store.open_wagers(chat)
    }

    pub fn wager(&self, id: &WagerId) -> Result<Option<Wager>, Error> {
        self.store.get_wager(id)
    }

    pub fn account(&self, id: AccountId) -> Result<Option<Account>, Error> {
        self.store.get_account(id)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, Error> {
        self.store.accounts()
    }

    pub fn entries_for_account(&self, id: AccountId) -> Result<Vec<LedgerEntry>, Error> {
        self.store.entries_for_account(id)
    }

    pub fn wager_history(&self, account: AccountId, limit: usize) -> Result<Vec<Wager>, Error> {
        self.store.wager_history(account, limit)
    }

    /// Checks the account's audited operation chain against its balance.
    pub fn verify_account(&self, id: AccountId) -> Result<(), Error> {
        let account = self.require_account(id)?;
        self.audit.validate_balance_consistency(id, account.balance)
    }

    pub fn audit_report(&self) -> Result<AuditReport, Error> {
        self.audit.report()
    }

    pub fn active_timers(&self) -> Vec<TimerInfo> {
        self.timers.active()
    }
}

fn outcome_winner(outcome: &Outcome) -> Option<AccountId> {
    match outcome {
        Outcome::Win { winner, .. } => Some(*winner),
        Outcome::Draw => None,
    }
}

impl<S, R, N> Engine<S, R, N> {
    /// Cancels every countdown and stops the background tasks.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl<S, R, N> Drop for Engine<S, R, N> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::QueuedDice;
    use crate::ledger::InMemoryLedger;

    fn quiet(_: &WagerId, _: ChatId) {}

    type TestEngine = Engine<InMemoryLedger, Arc<QueuedDice>, fn(&WagerId, ChatId)>;

    async fn start_engine(fee_rate: Decimal) -> (Arc<TestEngine>, Arc<QueuedDice>) {
        let dice = Arc::new(QueuedDice::new());
        let config = ValidatedConfig {
            fee_rate,
            ..ValidatedConfig::default()
        };
        let engine = Engine::start(
            config,
            InMemoryLedger::new(),
            dice.clone(),
            quiet as fn(&WagerId, ChatId),
        )
        .await
        .unwrap();
        (engine, dice)
    }

    #[tokio::test]
    async fn commission_rounds_down() {
        let (engine, _) = start_engine(Decimal::new(1, 1)).await;
        assert_eq!(engine.commission_on(Money(200)).unwrap(), Money(20));
        assert_eq!(engine.commission_on(Money(18)).unwrap(), Money(1));
        assert_eq!(engine.commission_on(Money(2)).unwrap(), Money(0));

        let (engine, _) = start_engine(Decimal::new(75, 3)).await;
        assert_eq!(engine.commission_on(Money(150)).unwrap(), Money(11));
    }

    #[tokio::test]
    async fn odd_pot_winner_gets_the_rounding() {
        let (engine, dice) = start_engine(Decimal::new(1, 1)).await;
        engine.open_account(1).unwrap();
        engine.open_account(2).unwrap();
        let id = engine.create_wager(1, -5, Money(9)).unwrap();

        dice.push(&[1, 1, 1, 2, 2, 2]).unwrap();
        let result = engine.join_wager(&id, 2).unwrap();

        assert_eq!(
            result.outcome,
            Outcome::Win {
                winner: 2,
                loser: 1,
                payout: Money(17),
            }
        );
        assert_eq!(result.commission, Money(1));
        assert_eq!(engine.account(2).unwrap().unwrap().balance, Money(1008));
    }

    #[tokio::test]
    async fn rejected_store_calls_mark_operations_failed() {
        let (engine, _) = start_engine(Decimal::new(1, 1)).await;
        engine.open_account(1).unwrap();
        engine.open_account(2).unwrap();
        let id = engine.create_wager(1, -5, Money(10)).unwrap();
        engine.expire_wager(&id).unwrap();

        // Records a stake against the stale open row, then loses in the store.
        let draft =
            OperationDraft::new(2, Some(id.clone()), EntryKind::Stake, Money(-10), Money(1000))
                .unwrap();
        let err = engine
            .audited(vec![draft], |ops| {
                engine
                    .store
                    .join_wager_with_deduction(&id, 2, entry_for(&ops[0], "stake"))
                    .map(|(wager, entry)| (wager, vec![entry]))
            })
            .unwrap_err();

        assert!(matches!(err, Error::StateConflict { .. }));
        let report = engine.audit_report().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.rolled_back, 0);
        assert_eq!(report.pending, 0);
        engine.verify_account(2).unwrap();
    }

    #[tokio::test]
    async fn malformed_operation_is_rolled_back_before_the_store() {
        let (engine, _) = start_engine(Decimal::new(1, 1)).await;
        engine.open_account(1).unwrap();

        let mut draft =
            OperationDraft::new(1, None, EntryKind::Deposit, Money(50), Money(1000)).unwrap();
        draft.post_balance = Money(1100);
        let err = engine
            .audited(vec![draft], |ops| {
                let entry = engine.store.apply_entry(entry_for(&ops[0], "deposit"))?;
                Ok(((), vec![entry]))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(engine.account(1).unwrap().unwrap().balance, Money(1000));
        assert_eq!(engine.audit_report().unwrap().rolled_back, 1);
    }

    #[tokio::test]
    async fn late_commit_after_a_balance_round_trip_keeps_the_chain() {
        let (engine, _) = start_engine(Decimal::new(1, 1)).await;
        engine.open_account(1).unwrap();

        // Recorded against 1000. A withdraw and a deposit commit before it
        // does, leaving the row at 1000 again, so its stale pre-balance still
        // matches when it lands.
        let draft =
            OperationDraft::new(1, None, EntryKind::Withdraw, Money(-100), Money(1000)).unwrap();
        let stale = engine
            .audited(vec![draft], |ops| {
                engine.withdraw(1, Money(100))?;
                engine.deposit(1, Money(100))?;
                let entry = engine.store.apply_entry(entry_for(&ops[0], "withdrawal"))?;
                Ok((entry.clone(), vec![entry]))
            })
            .unwrap();

        assert_eq!(stale.balance_after, Money(900));
        assert_eq!(engine.account(1).unwrap().unwrap().balance, Money(900));
        assert_eq!(engine.audit_report().unwrap().completed, 4);
        engine.verify_account(1).unwrap();
    }

    struct LoadedDice;

    impl DiceSource for LoadedDice {
        fn roll(&self, count: usize) -> Result<Vec<u8>, Error> {
            Ok(vec![7; count])
        }
    }

    #[tokio::test]
    async fn impossible_dice_faces_are_an_internal_failure() {
        let engine = Engine::start(
            ValidatedConfig::default(),
            InMemoryLedger::new(),
            LoadedDice,
            quiet as fn(&WagerId, ChatId),
        )
        .await
        .unwrap();
        engine.open_account(1).unwrap();
        engine.open_account(2).unwrap();
        let id = engine.create_wager(1, -5, Money(10)).unwrap();

        let err = engine.join_wager(&id, 2).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(!err.is_user_facing());
        assert_eq!(err.public_message(), "the request could not be completed");

        // The stakes stay in the matched wager for the next reconciliation.
        let wager = engine.wager(&id).unwrap().unwrap();
        assert_eq!(wager.status, WagerStatus::Matched);
        assert_eq!(engine.account(2).unwrap().unwrap().balance, Money(990));
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn deductions_inside_the_interval_are_rate_limited() {
        let dice = Arc::new(QueuedDice::new());
        let config = ValidatedConfig {
            operation_interval: Some(Duration::from_secs(1)),
            ..ValidatedConfig::default()
        };
        let engine = Engine::start(
            config,
            InMemoryLedger::new(),
            dice,
            quiet as fn(&WagerId, ChatId),
        )
        .await
        .unwrap();
        engine.open_account(1).unwrap();
        engine.open_account(2).unwrap();

        engine.create_wager(1, -5, Money(10)).unwrap();
        let err = engine.create_wager(1, -5, Money(10)).unwrap_err();
        match &err {
            Error::RateLimited {
                account,
                retry_after_ms,
            } => {
                assert_eq!(*account, 1);
                assert!(*retry_after_ms > 0 && *retry_after_ms <= 1000);
            }
            other => panic!("expected a rate limit, got {:?}", other),
        }
        assert!(err.is_user_facing());
        assert!(matches!(engine.withdraw(1, Money(5)), Err(Error::RateLimited { .. })));

        // Other accounts and credits are not throttled.
        engine.withdraw(2, Money(5)).unwrap();
        engine.deposit(1, Money(5)).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        engine.create_wager(1, -5, Money(10)).unwrap();
        assert_eq!(engine.account(1).unwrap().unwrap().balance, Money(985));
        assert_eq!(engine.open_wagers(-5).unwrap().len(), 2);
        engine.shutdown();
    }
}
