use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) use self::prebuffered::Prebuffered;

mod prebuffered;

/// A bidirectional byte stream to the proxy.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can move between
/// tasks, so plain TCP, TLS and custom transports share one boxed form.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Type-erased transport connection to the proxy.
pub type BoxedIo = Box<dyn AsyncIo>;
