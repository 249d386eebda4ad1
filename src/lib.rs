pub mod audit;
pub mod config;
pub mod dice;
pub mod dlq;
pub mod domain;
pub mod engine;
pub mod ingestion;
pub mod ledger;
pub mod output;
pub mod replay;
pub mod telemetry;
pub mod timers;

pub use engine::{Engine, ReconcileReport};
