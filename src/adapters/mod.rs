pub mod memory;
pub mod postgres;
pub mod wiki_client;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use wiki_client::{WikiPriceClient, DEFAULT_HTTP_TIMEOUT, DEFAULT_WIKI_API_BASE};
