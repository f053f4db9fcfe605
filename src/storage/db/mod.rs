//! Database abstraction layer.
//!
//! Currently supports SQLite only. The wrapper keeps connection tuning
//! (journal mode, durability, busy timeout) in one place.
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/routerwatch.db?mode=rwc", 5, Duration::from_secs(5)).await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::{DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_CONNECTIONS, SqlitePool};
