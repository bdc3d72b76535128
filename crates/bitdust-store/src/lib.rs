// Local persistence: message database, key registry rows, group state
// files and supplier-side customer directories.

pub mod customers;
pub mod database;
pub mod error;
pub mod groups;
pub mod history;
pub mod keys;
pub mod migrations;
pub mod models;

pub use customers::CustomerDirs;
pub use database::Database;
pub use error::{Result, StoreError};
pub use groups::GroupInfoStore;
pub use models::{ConversationRow, GroupInfo, HistoryRow, KeyRow, MessageDirection, MessageType};
