mod feeds;
mod folders;
mod items;
mod repository;
mod schema;
mod types;

pub use repository::FeedRepository;
pub use schema::Database;
pub use types::{FeedRecord, FetchStatus, FolderRecord, NewFeed, StoreError};
