use std::io::Write;

use serde::Serialize;

use crate::domain::{Account, AccountId, Error, Money, Wager};

#[derive(Debug, Serialize)]
struct BalanceRow {
    account: AccountId,
    balance: Money,
}

#[derive(Debug, Serialize)]
struct WagerRow<'a> {
    label: &'a str,
    wager: &'a str,
    status: String,
    creator: AccountId,
    joiner: Option<AccountId>,
    stake: Money,
    winner: Option<AccountId>,
    commission: Money,
}

/// Writes final balances and wagers as two CSV tables separated by a blank
/// line.
pub struct CsvOutput<W: Write> {
    out: W,
}

impl<W: Write> CsvOutput<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_accounts(&mut self, accounts: &[Account]) -> Result<(), Error> {
        let mut writer = csv::Writer::from_writer(&mut self.out);
        for account in accounts {
            writer
                .serialize(BalanceRow {
                    account: account.id,
                    balance: account.balance,
                })
                .map_err(std::io::Error::from)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// `wagers` pairs each wager with the label it was created under.
    pub fn write_wagers(&mut self, wagers: &[(String, Wager)]) -> Result<(), Error> {
        if wagers.is_empty() {
            return Ok(());
        }
        writeln!(self.out)?;
        let mut writer = csv::Writer::from_writer(&mut self.out);
        for (label, wager) in wagers {
            writer
                .serialize(WagerRow {
                    label,
                    wager: wager.id.as_str(),
                    status: wager.status.to_string(),
                    creator: wager.creator,
                    joiner: wager.joiner,
                    stake: wager.stake,
                    winner: wager.winner,
                    commission: wager.commission,
                })
                .map_err(std::io::Error::from)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
