//! Read path and offline support.
//!
//! This module holds everything that lets the client answer requests
//! without the network:
//! - Records for cached restaurants, reviews, and queued mutations
//! - The static asset cache, hydrated from the build manifest
//! - The interceptor that decides between store and network per request

pub mod assets;
pub mod interceptor;
pub mod manifest;
pub mod records;

pub use assets::{AssetCache, InstallReport};
pub use interceptor::{InterceptSettings, Interceptor};
pub use manifest::Manifest;
