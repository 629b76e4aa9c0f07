//! Restaurant directory: API types and the offline-capable client.

pub mod client;
pub mod lookups;
pub mod types;

pub use client::{url_for_restaurant, RestaurantClient, ANY};
pub use types::NewReview;
