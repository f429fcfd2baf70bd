//! # Warden Database Crate
//!
//! The durable store behind the control plane: executors, their command
//! queues, mirrored trades and the audit trail.
//!
//! ## Architectural Principles
//!
//! - **Traits at the seam:** the engine only sees `ExecutorStore`,
//!   `CommandStore`, `PositionStore` and `AuditLog` (combined as `Store`).
//! - **Two backends:** `DbRepository` runs on PostgreSQL through `sqlx`;
//!   `MemoryStore` keeps everything in process for tests and `--in-memory` runs.
//! - **Conditional writes:** command claims and status transitions are single
//!   guarded updates in both backends, never read-modify-write sequences.
//!
//! ## Public API
//!
//! - `connect`: The async function to establish the database connection pool.
//! - `run_migrations`: Applies the embedded schema migrations.
//! - `DbRepository` / `MemoryStore`: the two `Store` implementations.
//! - `DbError`: The specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod memory;
pub mod repository;
pub mod store;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use memory::MemoryStore;
pub use repository::DbRepository;
pub use store::{AuditLog, CommandStore, ExecutorStore, PositionStore, Store};
