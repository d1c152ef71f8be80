//! Metadata and helper caches.

pub mod attr;
pub mod helpers;
pub mod location;

pub use attr::{AttrCache, FileAttr};
pub use helpers::{AccessMode, HelpersCache};
pub use location::{LocationCache, LocationInfo, StorageInfo};
