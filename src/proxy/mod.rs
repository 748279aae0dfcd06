pub mod listener;
pub mod session;
pub mod stats;
pub mod transform;
pub mod upstream;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream: plain TCP or TLS in either direction.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Size of the buffer used for each read, in either direction.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;
