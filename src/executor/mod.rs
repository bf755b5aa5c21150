//! Executor Module
//!
//! Administrative access to the managed MySQL instance.

mod mysql;

pub use mysql::MySqlAdmin;
