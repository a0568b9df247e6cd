pub mod error;
pub mod frames;
pub mod metadata;
pub mod method;
pub mod status;


pub use error::{MuxrpcError, Result};
pub use frames::{CallId, Frame, FrameType, OpenHeader};
pub use metadata::Metadata;
pub use method::{CallKind, MethodDescriptor};
pub use status::{Status, StatusCode};
