//! Origin adapter: authentication, REST client, and document upload.
//!
//! The origin is consumed through a narrow surface: resolve a project
//! name to an id, ask for a project refresh, list folders and documents,
//! mint download links, and push a single file.

pub mod auth;
pub mod client;
pub mod upload;

pub use auth::OriginCredentials;
pub use client::{native_id, OriginClient, OriginDocument};
pub use upload::upload_file;
