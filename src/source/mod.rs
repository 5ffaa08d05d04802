mod resolver;
mod types;

pub use resolver::{Resolver, YtDlpResolver};
pub use types::{MediaDuration, SourceDescriptor, SourceMetadata, SourceRequest};
