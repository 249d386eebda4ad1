use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::domain::{
    AccountId, Error, Money, OperationDraft, OperationRecord, OperationStatus, RollbackInfo,
};

/// In-memory record of every intended balance mutation. Records are written
/// before the store is touched and resolved right after it answers.
#[derive(Debug)]
pub struct AuditLayer {
    book: RwLock<AuditBook>,
    strict: bool,
}

#[derive(Debug, Default)]
struct AuditBook {
    operations: HashMap<String, OperationRecord>,
    checksums: HashMap<String, String>,
    rollbacks: HashMap<String, RollbackInfo>,
    next_seq: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub rollbacks: usize,
    pub checksum_errors: usize,
}

/// SHA-256 over the immutable fields of a record.
pub fn checksum(record: &OperationRecord) -> String {
    let wager = record.wager.as_ref().map(|w| w.as_str()).unwrap_or("-");
    let data = format!(
        "{}:{}:{}:{}:{}:{}:{}:{}",
        record.id,
        record.account,
        wager,
        record.kind,
        record.amount,
        record.pre_balance,
        record.post_balance,
        record.timestamp.timestamp_micros(),
    );
    hex::encode(Sha256::digest(data.as_bytes()))
}

impl AuditLayer {
    /// `strict` turns a final-balance mismatch in
    /// [`AuditLayer::validate_balance_consistency`] into an error instead of
    /// a warning.
    pub fn new(strict: bool) -> Self {
        Self {
            book: RwLock::new(AuditBook::default()),
            strict,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, AuditBook>, Error> {
        self.book
            .read()
            .map_err(|_| Error::Store("audit book lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, AuditBook>, Error> {
        self.book
            .write()
            .map_err(|_| Error::Store("audit book lock poisoned".to_string()))
    }

    pub fn record(&self, draft: OperationDraft) -> Result<OperationRecord, Error> {
        let mut book = self.write()?;

        let seq = book.next_seq;
        book.next_seq += 1;

        let mut record = OperationRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            seq,
            kind: draft.kind,
            account: draft.account,
            wager: draft.wager,
            amount: draft.amount,
            pre_balance: draft.pre_balance,
            post_balance: draft.post_balance,
            timestamp: Utc::now(),
            checksum: String::new(),
            status: OperationStatus::Pending,
            committed_seq: None,
            metadata: draft.metadata,
        };
        record.checksum = checksum(&record);

        book.checksums
            .insert(record.id.clone(), record.checksum.clone());
        book.operations.insert(record.id.clone(), record.clone());

        info!(
            operation = %record.id,
            account = record.account,
            kind = %record.kind,
            amount = %record.amount,
            pre = %record.pre_balance,
            post = %record.post_balance,
            "balance operation recorded"
        );
        Ok(record)
    }

    /// Recomputes the checksum and re-checks `pre + amount == post`.
    pub fn validate(&self, id: &str) -> Result<(), Error> {
        let book = self.read()?;
        let record = book
            .operations
            .get(id)
            .ok_or_else(|| Error::UnknownOperation(id.to_string()))?;
        let stored = book
            .checksums
            .get(id)
            .ok_or_else(|| Error::Integrity(format!("no checksum stored for operation {}", id)))?;

        let calculated = checksum(record);
        if &calculated != stored {
            error!(operation = id, %calculated, %stored, "operation checksum mismatch");
            return Err(Error::Integrity(format!("checksum mismatch on operation {}", id)));
        }

        if record.pre_balance.checked_add(record.amount) != Some(record.post_balance) {
            return Err(Error::Integrity(format!(
                "operation {} computes {} + {} as {}",
                id, record.pre_balance, record.amount, record.post_balance
            )));
        }
        Ok(())
    }

    /// Marks the operation completed. `committed_seq` is the sequence of
    /// the ledger entry the store wrote for it.
    pub fn complete(&self, id: &str, committed_seq: u64) -> Result<(), Error> {
        self.resolve_pending(id, OperationStatus::Completed, None, Some(committed_seq))?;
        info!(operation = id, committed_seq, "balance operation completed");
        Ok(())
    }

    pub fn fail(&self, id: &str, reason: &str) -> Result<(), Error> {
        self.resolve_pending(
            id,
            OperationStatus::Failed,
            Some(("failure_reason", reason)),
            None,
        )?;
        warn!(operation = id, reason, "balance operation failed");
        Ok(())
    }

    fn resolve_pending(
        &self,
        id: &str,
        status: OperationStatus,
        note: Option<(&str, &str)>,
        committed_seq: Option<u64>,
    ) -> Result<(), Error> {
        let mut book = self.write()?;
        let record = book
            .operations
            .get_mut(id)
            .ok_or_else(|| Error::UnknownOperation(id.to_string()))?;
        if record.status != OperationStatus::Pending {
            return Err(Error::Integrity(format!(
                "operation {} is {:?}, not pending",
                id, record.status
            )));
        }
        record.status = status;
        record.committed_seq = committed_seq;
        if let Some((key, value)) = note {
            record.metadata.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Marks the operation rolled back. A second rollback of the same id is
    /// rejected and changes nothing.
    pub fn rollback(&self, id: &str, reason: &str) -> Result<RollbackInfo, Error> {
        let mut book = self.write()?;
        let record = book
            .operations
            .get_mut(id)
            .ok_or_else(|| Error::UnknownOperation(id.to_string()))?;
        if record.status == OperationStatus::RolledBack {
            return Err(Error::AlreadyRolledBack(id.to_string()));
        }

        let info = RollbackInfo {
            operation: id.to_string(),
            reason: reason.to_string(),
            rolled_back_at: Utc::now(),
        };
        record.status = OperationStatus::RolledBack;
        record
            .metadata
            .insert("rollback_reason".to_string(), reason.to_string());
        book.rollbacks.insert(id.to_string(), info.clone());

        error!(operation = id, reason, "balance operation rolled back");
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Result<Option<OperationRecord>, Error> {
        Ok(self.read()?.operations.get(id).cloned())
    }

    /// Newest first.
    pub fn history(&self, account: AccountId, limit: usize) -> Result<Vec<OperationRecord>, Error> {
        let book = self.read()?;
        let mut history: Vec<OperationRecord> = book
            .operations
            .values()
            .filter(|op| op.account == account)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.seq.cmp(&a.seq));
        history.truncate(limit);
        Ok(history)
    }

    /// Walks the account's completed operations in commit order, checking
    /// that each one starts where the previous one ended and that the chain
    /// ends at `current`.
    ///
    /// A final mismatch is tolerated while another operation for the account
    /// is still pending. Otherwise it is an error in strict mode and a
    /// warning in lenient mode.
    pub fn validate_balance_consistency(
        &self,
        account: AccountId,
        current: Money,
    ) -> Result<(), Error> {
        let book = self.read()?;
        let mut chain: Vec<&OperationRecord> = book
            .operations
            .values()
            .filter(|op| op.account == account && op.status == OperationStatus::Completed)
            .collect();
        chain.sort_by_key(|op| (op.committed_seq, op.seq));

        for pair in chain.windows(2) {
            if pair[1].pre_balance != pair[0].post_balance {
                error!(
                    account,
                    operation = %pair[1].id,
                    previous = %pair[0].id,
                    "balance chain broken"
                );
                return Err(Error::Integrity(format!(
                    "operation {} starts at {} but operation {} ended at {}",
                    pair[1].id, pair[1].pre_balance, pair[0].id, pair[0].post_balance
                )));
            }
        }

        let Some(last) = chain.last() else {
            return Ok(());
        };
        if last.post_balance == current {
            return Ok(());
        }

        let in_flight = book
            .operations
            .values()
            .any(|op| op.account == account && op.status == OperationStatus::Pending);
        if in_flight {
            warn!(account, recorded = %last.post_balance, %current, "balance differs while an operation is in flight");
            return Ok(());
        }

        if self.strict {
            error!(account, recorded = %last.post_balance, %current, "final balance mismatch");
            Err(Error::Integrity(format!(
                "account {} ends its operation chain at {} but holds {}",
                account, last.post_balance, current
            )))
        } else {
            warn!(account, recorded = %last.post_balance, %current, "final balance mismatch tolerated");
            Ok(())
        }
    }

    pub fn report(&self) -> Result<AuditReport, Error> {
        let book = self.read()?;
        let mut report = AuditReport {
            total: book.operations.len(),
            rollbacks: book.rollbacks.len(),
            ..AuditReport::default()
        };
        for op in book.operations.values() {
            match op.status {
                OperationStatus::Pending => report.pending += 1,
                OperationStatus::Completed => report.completed += 1,
                OperationStatus::Failed => report.failed += 1,
                OperationStatus::RolledBack => report.rolled_back += 1,
            }
            if book.checksums.get(&op.id) != Some(&checksum(op)) {
                report.checksum_errors += 1;
            }
        }
        Ok(report)
    }
}
