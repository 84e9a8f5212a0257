//! Concrete database providers.

pub mod postgres;

pub use postgres::{PostgresProvider, PostgresProviderFactory};
