use std::io::Read;
use std::pin::Pin;

use futures::stream::{self, Stream};
use serde::Deserialize;

use crate::domain::{AccountId, ChatId, Command, CommandStream, DiceFaces, Error, Money};

pub struct CsvReader<R: Read> {
    reader: Option<csv::Reader<R>>,
}

impl<R: Read> CsvReader<R> {
    pub fn new(reader: R) -> Result<Self, Error> {
        let rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        Ok(Self { reader: Some(rdr) })
    }
}

/// Internal shape used only for CSV deserialization.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    account: Option<AccountId>,
    #[serde(default)]
    chat: Option<ChatId>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    amount: Option<Money>,
    #[serde(default)]
    dice: Option<String>,
}

fn required<T>(value: Option<T>, column: &str, kind: &str) -> Result<T, Error> {
    value.ok_or_else(|| Error::Ingestion(format!("{} row is missing its {} column", kind, column)))
}

/// Six whitespace separated faces: creator's three, then joiner's three.
fn parse_dice(raw: &str) -> Result<[u8; 6], Error> {
    let faces = raw
        .split_whitespace()
        .map(|f| f.parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| Error::Ingestion(format!("invalid dice '{}': {}", raw, e)))?;
    if DiceFaces::from_rolls(&faces).is_none() {
        return Err(Error::Ingestion(format!(
            "dice '{}' must be six faces between 1 and 6",
            raw
        )));
    }
    let mut out = [0u8; 6];
    out.copy_from_slice(&faces);
    Ok(out)
}

impl TryFrom<CsvRow> for Command {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        let kind = row.kind.trim().to_ascii_lowercase();
        let command = match kind.as_str() {
            "open" => Command::Open {
                account: required(row.account, "account", &kind)?,
            },
            "deposit" => Command::Deposit {
                account: required(row.account, "account", &kind)?,
                amount: required(row.amount, "amount", &kind)?,
            },
            "withdraw" => Command::Withdraw {
                account: required(row.account, "account", &kind)?,
                amount: required(row.amount, "amount", &kind)?,
            },
            "create" => Command::Create {
                account: required(row.account, "account", &kind)?,
                chat: required(row.chat, "chat", &kind)?,
                label: required(row.label, "label", &kind)?,
                stake: required(row.amount, "amount", &kind)?,
            },
            "join" => Command::Join {
                account: required(row.account, "account", &kind)?,
                label: required(row.label, "label", &kind)?,
                dice: row.dice.as_deref().map(parse_dice).transpose()?,
            },
            "expire" => Command::Expire {
                label: required(row.label, "label", &kind)?,
            },
            other => {
                return Err(Error::Ingestion(format!("Invalid command type: {}", other)));
            }
        };
        Ok(command)
    }
}

impl<R: Read + Send + 'static> CommandStream for CsvReader<R> {
    type CmdStream = Pin<Box<dyn Stream<Item = Result<Command, Error>> + Send>>;

    fn stream(&mut self) -> Self::CmdStream {
        let reader = match self.reader.take() {
            Some(r) => r,
            None => {
                return Box::pin(stream::iter(Vec::<Result<Command, Error>>::new()));
            }
        };

        let iter = reader
            .into_deserialize::<CsvRow>()
            .map(|row_res| match row_res {
                Ok(row) => Command::try_from(row),
                Err(e) => Err(Error::Ingestion(format!("CSV deserialization error: {}", e))),
            });

        Box::pin(stream::iter(iter))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    async fn commands(csv: &'static str) -> Vec<Result<Command, Error>> {
        let mut reader = CsvReader::new(csv.as_bytes()).unwrap();
        reader.stream().collect().await
    }

    #[tokio::test]
    async fn parses_every_command_kind() {
        let parsed = commands(
            "type,account,chat,label,amount,dice\n\
             open,1,,,,\n\
             deposit,1,,,250,\n\
             withdraw,1,,,50,\n\
             create,1,-100,g1,100,\n\
             join,2,,g1,,6 6 6 1 1 1\n\
             expire,,,g1,,\n",
        )
        .await;

        let parsed: Vec<Command> = parsed.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            parsed,
            vec![
                Command::Open { account: 1 },
                Command::Deposit { account: 1, amount: Money(250) },
                Command::Withdraw { account: 1, amount: Money(50) },
                Command::Create {
                    account: 1,
                    chat: -100,
                    label: "g1".to_string(),
                    stake: Money(100),
                },
                Command::Join {
                    account: 2,
                    label: "g1".to_string(),
                    dice: Some([6, 6, 6, 1, 1, 1]),
                },
                Command::Expire { label: "g1".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn bad_rows_become_errors_without_stopping_the_stream() {
        let parsed = commands(
            "type,account,chat,label,amount,dice\n\
             bet,1,,,,\n\
             create,1,-100,,100,\n\
             join,2,,g1,,6 6 9 1 1 1\n\
             deposit,1,,,1.5,\n\
             open,3,,,,\n",
        )
        .await;

        assert_eq!(parsed.len(), 5);
        assert!(parsed[..4].iter().all(|r| matches!(r, Err(Error::Ingestion(_)))));
        assert_eq!(parsed[4].as_ref().unwrap(), &Command::Open { account: 3 });
    }
}
