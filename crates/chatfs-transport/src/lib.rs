//! Adaptive throttling and remote chunk storage against a chat service's
//! message-attachment API.

pub mod obfuscate;
pub mod remote_store;
pub mod throttler;
pub mod transport;

pub use obfuscate::{hash_file_name, obfuscated_filename};
pub use remote_store::{RemoteObjectStore, RemoteStoreError};
pub use throttler::{Throttler, ThrottlerConfig};
pub use transport::{AttachmentRef, ChatTransport, HttpChatTransport, TransportError};
