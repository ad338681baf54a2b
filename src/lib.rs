pub mod admin;
pub mod config;
pub mod error;
pub mod ledger;
pub mod runner;
pub mod selector;
pub mod shutdown;
pub mod transport;
