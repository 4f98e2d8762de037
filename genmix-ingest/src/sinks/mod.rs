pub mod sqlite;

pub use sqlite::{SqliteRepository, WriteConfig};
