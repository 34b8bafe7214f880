//! Dairy WMS
//!
//! Inventory core for a dairy distribution warehouse: FEFO pallet
//! allocation, disposal and stocktaking workflows, and the running-balance
//! inventory ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;
