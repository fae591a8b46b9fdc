pub mod client;

pub use client::{compute_checksum, BrokerApi, BrokerError, KiteClient, LoginSession, TradingGate};
