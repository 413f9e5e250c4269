pub mod chats;
pub mod contacts;
pub mod database;
pub mod groups;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod search;

mod error;

pub use database::Store;
pub use error::StoreError;
pub use models::*;
