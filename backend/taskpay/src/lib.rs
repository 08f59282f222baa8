//! TaskPay core: timed reward tasks, account activation and mobile-money
//! withdrawals reconciled against a payment gateway.

pub mod accounts;
pub mod api;
pub mod catalog;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod issuer;
pub mod ledger;
pub mod models;
pub mod phone;
pub mod reconciler;
pub mod session;
pub mod timer;

#[cfg(test)]
mod testutil;
