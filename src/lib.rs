//! Mech worker: polls a ledger for tool requests, runs them on isolated
//! worker slots and publishes the results.

pub mod config;
pub mod delivery;
pub mod error;
pub mod fixture;
pub mod health;
pub mod keychain;
pub mod ledger;
pub mod storage;
pub mod tools;
pub mod worker;
