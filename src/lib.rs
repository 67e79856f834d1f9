pub mod chat;
pub mod config;
pub mod content;
pub mod db;
pub mod embedding;
pub mod guide;
pub mod license;
pub mod llm;
pub mod retrieval;
pub mod routes;
pub mod vector_store;

#[cfg(test)]
mod testing;

pub use config::Args;
pub use routes::{router, AppState};
