//! inmo-sync - client-side data synchronization for a real-estate listings site
//!
//! Listings live in a hosted PostgREST/Supabase-style backend. This crate
//! keeps a local, stale-while-revalidate view of them and funnels every
//! request through shared admission control.
//!
//! # Architecture
//!
//! - **cache**: TTL-stamped store with change notifications
//! - **admission**: rate limiter, request queue, debouncer, retry
//! - **backend**: row/storage/auth traits and the HTTP client
//! - **properties**: typed data access for listings
//! - **query**: query client, hooks and infinite pagination
//! - **realtime**: change feeds and the merge layer
//! - **mutation**: optimistic writes with rollback
//! - **submissions**: locally stored owner leads
//! - **media** / **migrate**: image uploads and inline-image migration

// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod logging;

// Sync layer
pub mod admission;
pub mod backend;
pub mod cache;
pub mod properties;
pub mod query;

// Features built on the sync layer
pub mod media;
pub mod migrate;
pub mod mutation;
pub mod realtime;
pub mod submissions;

// Re-exports
pub use cache::CacheStore;
pub use config::Config;
pub use error::{Result, SyncError};
pub use properties::PropertyApi;
pub use query::{QueryClient, QueryKey};
