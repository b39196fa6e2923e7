//! Durable persistence adapters.

mod postgres;

pub use postgres::PostgresStore;
