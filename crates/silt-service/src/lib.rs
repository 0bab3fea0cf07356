//! Client-facing layer of Silt: connections, collections and the
//! insert / delete / flush / compact / query / search operations.

mod collection;
mod connection;
mod server;
mod types;

pub use collection::Collection;
pub use connection::{ConnectionManager, DEFAULT_ALIAS};
pub use server::SiltServer;
pub use types::{DeleteResult, Entity, InsertResult, QuerySegmentInfo};
