//! Durable checkpoint adapters.
//!
//! The port and the in-memory implementation live in
//! `eventflow-subscriptions`; this module adds the Postgres adapter.

pub mod postgres;

pub use postgres::PostgresCheckpointStore;
