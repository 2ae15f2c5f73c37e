mod message;
mod tool;
mod transport;

pub use message::Codec;
pub use tool::{CancelSource, CancelToken, TaskContext, ToolHandler};
pub use transport::{FramedTransport, Listener, TransportFactory};
