pub mod config;
pub mod consumer;
pub mod deposit;
pub mod errors;
pub mod gateway;
pub mod guard;
pub mod handlers;
pub mod kafka;
pub mod ledger;
pub mod models;
pub mod payout;
pub mod service;
pub mod signature;
pub mod store;
pub mod withdrawal;
