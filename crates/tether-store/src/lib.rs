pub mod bookmarks;
pub mod database;
pub mod error;
pub mod history;
pub mod messages;
pub mod schema;
pub mod sessions;
pub mod tabs;

pub use database::Database;
pub use error::StoreError;
