//! Handler outputs and the replies handed back to callers.

use crate::error::CoalesceError;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// What the underlying handler produces.
pub enum HandlerOutput<T, E> {
    /// A complete response value.
    Value(T),
    /// A response head followed by a lazily produced body.
    Stream {
        /// Status, headers or any other response metadata.
        head: T,
        /// Body chunks in production order.
        body: BoxStream<'static, Result<Bytes, E>>,
    },
}

impl<T, E> HandlerOutput<T, E> {
    /// Builds a streaming output from any `Send` stream.
    pub fn stream<S>(head: T, body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    {
        HandlerOutput::Stream {
            head,
            body: body.boxed(),
        }
    }
}

impl<T: fmt::Debug, E> fmt::Debug for HandlerOutput<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutput::Value(value) => f.debug_tuple("Value").field(value).finish(),
            HandlerOutput::Stream { head, .. } => f
                .debug_struct("Stream")
                .field("head", head)
                .finish_non_exhaustive(),
        }
    }
}

/// The result handed to a caller of the engine.
///
/// Leader, followers and bypassed callers all receive this same shape.
pub enum Reply<T, E> {
    /// A complete response value.
    Value(T),
    /// A response head and its body chunks.
    Stream {
        /// Response metadata.
        head: T,
        /// Body chunks, from the first one, in production order.
        chunks: ChunkStream<E>,
    },
}

impl<T, E> Reply<T, E> {
    /// Returns the value, or the head of a streamed reply.
    pub fn head(&self) -> &T {
        match self {
            Reply::Value(value) => value,
            Reply::Stream { head, .. } => head,
        }
    }

    /// Returns true for streamed replies.
    pub fn is_stream(&self) -> bool {
        matches!(self, Reply::Stream { .. })
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Reply<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Stream { head, .. } => f
                .debug_struct("Stream")
                .field("head", head)
                .finish_non_exhaustive(),
        }
    }
}

/// Ordered body chunks of a streamed reply.
///
/// Dropping the stream detaches the caller; the producer and other
/// consumers are unaffected.
pub struct ChunkStream<E> {
    inner: BoxStream<'static, Result<Bytes, CoalesceError<E>>>,
}

impl<E> ChunkStream<E> {
    pub(crate) fn from_boxed(inner: BoxStream<'static, Result<Bytes, CoalesceError<E>>>) -> Self {
        Self { inner }
    }

    /// Wraps a handler body that is consumed by a single caller.
    pub fn passthrough<S>(body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: 'static,
    {
        Self {
            inner: body.map(|chunk| chunk.map_err(CoalesceError::Handler)).boxed(),
        }
    }

    /// Drains the stream into one contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by the stream.
    pub async fn collect_bytes(mut self) -> Result<Bytes, CoalesceError<E>> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl<E> Stream for ChunkStream<E> {
    type Item = Result<Bytes, CoalesceError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<E> fmt::Debug for ChunkStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_passthrough_maps_errors() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err("boom".to_string()),
        ]);
        let mut chunks = ChunkStream::passthrough(body);

        assert_eq!(chunks.next().await, Some(Ok(Bytes::from_static(b"a"))));
        assert_eq!(
            chunks.next().await,
            Some(Err(CoalesceError::Handler("boom".to_string())))
        );
        assert_eq!(chunks.next().await, None);
    }

    #[tokio::test]
    async fn test_collect_bytes() {
        let body = stream::iter(vec![
            Ok::<_, String>(Bytes::from_static(b"chunk 0\n")),
            Ok(Bytes::from_static(b"chunk 1\n")),
        ]);
        let collected = ChunkStream::passthrough(body).collect_bytes().await.unwrap();
        assert_eq!(&collected[..], b"chunk 0\nchunk 1\n");
    }

    #[test]
    fn test_reply_head() {
        let reply: Reply<u16, String> = Reply::Value(200);
        assert_eq!(*reply.head(), 200);
        assert!(!reply.is_stream());
    }
}
