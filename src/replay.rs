use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info};

use crate::dice::QueuedDice;
use crate::domain::{
    Command, CommandStream, DeadLetterQueue, Error, ExpiryNotifier, LedgerStore, Wager, WagerId,
};
use crate::engine::Engine;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: usize,
    pub rejected: usize,
}

/// Feeds recorded chat requests through an [`Engine`]. Wagers are addressed
/// by the label their `create` row gave them; dice attached to a `join` row
/// are queued so the settlement rolls exactly those faces.
pub struct Replayer<S, N, D> {
    engine: Arc<Engine<S, Arc<QueuedDice>, N>>,
    dice: Arc<QueuedDice>,
    dlq: D,
    labels: HashMap<String, WagerId>,
    order: Vec<String>,
}

impl<S, N, D> Replayer<S, N, D>
where
    S: LedgerStore + 'static,
    N: ExpiryNotifier + 'static,
    D: DeadLetterQueue,
{
    pub fn new(engine: Arc<Engine<S, Arc<QueuedDice>, N>>, dice: Arc<QueuedDice>, dlq: D) -> Self {
        Self {
            engine,
            dice,
            dlq,
            labels: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub async fn process<I: CommandStream>(&mut self, ingestion: &mut I) -> Result<ReplaySummary, Error> {
        let mut summary = ReplaySummary::default();
        let mut commands = ingestion.stream();

        while let Some(command) = commands.next().await {
            match command.and_then(|c| self.apply(c)) {
                Ok(()) => summary.applied += 1,
                Err(e) => {
                    summary.rejected += 1;
                    self.dlq.report(&e);
                }
            }
        }

        info!(applied = summary.applied, rejected = summary.rejected, "replay finished");
        Ok(summary)
    }

    pub fn apply(&mut self, command: Command) -> Result<(), Error> {
        debug!(%command, "applying command");
        match command {
            Command::Open { account } => self.engine.open_account(account).map(|_| ()),
            Command::Deposit { account, amount } => {
                self.engine.deposit(account, amount).map(|_| ())
            }
            Command::Withdraw { account, amount } => {
                self.engine.withdraw(account, amount).map(|_| ())
            }
            Command::Create {
                account,
                chat,
                label,
                stake,
            } => {
                if self.labels.contains_key(&label) {
                    return Err(Error::Validation(format!("label {} is already in use", label)));
                }
                let id = self.engine.create_wager(account, chat, stake)?;
                self.labels.insert(label.clone(), id);
                self.order.push(label);
                Ok(())
            }
            Command::Join {
                account,
                label,
                dice,
            } => {
                let id = self.resolve_label(&label)?;
                if let Some(faces) = dice {
                    self.dice.push(&faces)?;
                }
                let result = self.engine.join_wager(&id, account);
                self.dice.clear();
                let settlement = result?;
                info!(
                    label = %label,
                    winner = ?settlement.winner(),
                    commission = %settlement.commission,
                    "replayed join settled"
                );
                Ok(())
            }
            Command::Expire { label } => {
                let id = self.resolve_label(&label)?;
                self.engine.expire_wager(&id).map(|_| ())
            }
        }
    }

    fn resolve_label(&self, label: &str) -> Result<WagerId, Error> {
        self.labels
            .get(label)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown wager label {}", label)))
    }

    /// Every wager created during the replay, in creation order.
    pub fn labelled_wagers(&self) -> Result<Vec<(String, Wager)>, Error> {
        let mut wagers = Vec::with_capacity(self.order.len());
        for label in &self.order {
            let id = self.resolve_label(label)?;
            let wager = self
                .engine
                .wager(&id)?
                .ok_or_else(|| Error::UnknownWager(id.clone()))?;
            wagers.push((label.clone(), wager));
        }
        Ok(wagers)
    }

    pub fn dlq(&self) -> &D {
        &self.dlq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatedConfig;
    use crate::dlq::CollectingDLQ;
    use crate::domain::{ChatId, Money, WagerStatus};
    use crate::ingestion::CsvReader;
    use crate::ledger::InMemoryLedger;

    fn quiet(_: &WagerId, _: ChatId) {}

    #[tokio::test]
    async fn replays_a_full_session() {
        let dice = Arc::new(QueuedDice::new());
        let engine = Engine::start(
            ValidatedConfig::default(),
            InMemoryLedger::new(),
            dice.clone(),
            quiet as fn(&WagerId, ChatId),
        )
        .await
        .unwrap();

        let mut input = CsvReader::new(
            "type,account,chat,label,amount,dice\n\
             open,1,,,,\n\
             open,2,,,,\n\
             create,1,-100,g1,100,\n\
             join,2,,g1,,6 6 6 1 1 1\n\
             create,2,-100,g2,50,\n\
             expire,,,g2,,\n\
             join,1,,g2,,1 1 1 6 6 6\n\
             join,1,,missing,,\n"
                .as_bytes(),
        )
        .unwrap();

        let mut replay = Replayer::new(engine.clone(), dice.clone(), CollectingDLQ::default());
        let summary = replay.process(&mut input).await.unwrap();
        assert_eq!(summary, ReplaySummary { applied: 6, rejected: 2 });
        assert_eq!(dice.queued(), 0);

        assert_eq!(engine.account(1).unwrap().unwrap().balance, Money(1080));
        assert_eq!(engine.account(2).unwrap().unwrap().balance, Money(900));

        let wagers = replay.labelled_wagers().unwrap();
        assert_eq!(wagers.len(), 2);
        assert_eq!(wagers[0].1.status, WagerStatus::Settled);
        assert_eq!(wagers[0].1.winner, Some(1));
        assert_eq!(wagers[1].1.status, WagerStatus::Expired);

        let reports = replay.dlq().reports();
        assert!(reports[0].contains("no longer available"));
        assert!(reports[1].contains("unknown wager label missing"));
        engine.shutdown();
    }
}
