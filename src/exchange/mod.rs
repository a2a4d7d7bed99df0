//! Content exchange - publishing payloads and resolving them by identifier

mod publisher;
mod resolver;

pub use publisher::{publish, publish_and_announce, publish_detached, Announcement, PublishError};
pub use resolver::{resolve, resolve_with, ContentHandle, ResolveError, ResolveOptions};
