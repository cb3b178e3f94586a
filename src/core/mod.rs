// Core modules: errors, column values, rows, filters, accounts, and request signing.
pub mod account;
pub mod auth;
pub mod error;
pub mod filter;
pub mod row;
pub mod value;
