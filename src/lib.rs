pub mod account;
pub mod client;
pub mod config;
pub mod display;
pub mod ledger;
pub mod program;
pub mod relay;
pub mod rpc;
pub mod submission;
pub mod sync;
pub mod ui;
pub mod wallet;

pub mod test_helpers;
