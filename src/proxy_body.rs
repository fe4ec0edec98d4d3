//! Body type shared by the forwarding path and the interception pipeline.

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http::HeaderMap;
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};

/// Type-erased error carried by every body in the pipeline.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed body flowing from the upstream client to the downstream connection.
///
/// `UnsyncBoxBody` only requires `Send`, which both hyper's client and
/// server accept.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Erase any compatible body into a [`ProxyBody`].
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// A fresh reader over already-buffered bytes, with trailers re-attached.
///
/// Every call yields an independent body over the same allocation.
pub fn replay(data: Bytes, trailers: Option<HeaderMap>) -> ProxyBody {
    if trailers.is_none() {
        return full(data);
    }
    let mut frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![Ok(Frame::data(data))];
    if let Some(t) = trailers {
        frames.push(Ok(Frame::trailers(t)));
    }
    StreamBody::new(stream::iter(frames)).boxed_unsync()
}

/// Re-assemble a partially consumed body: `prefix` first, then whatever the
/// original stream still has to yield.
pub fn prepend(prefix: Bytes, rest: ProxyBody) -> ProxyBody {
    let head = stream::once(async move { Ok::<_, BoxError>(Frame::data(prefix)) });
    StreamBody::new(head.chain(BodyStream::new(rest))).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_is_independent_per_call() {
        let data = Bytes::from_static(b"{\"id\":1}");

        let first = replay(data.clone(), None).collect().await.unwrap().to_bytes();
        let second = replay(data.clone(), None).collect().await.unwrap().to_bytes();

        assert_eq!(first, data);
        assert_eq!(second, data);
    }

    #[tokio::test]
    async fn test_replay_preserves_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());

        let collected = replay(Bytes::from_static(b"data"), Some(trailers))
            .collect()
            .await
            .unwrap();
        let trailers = collected.trailers().cloned();

        assert_eq!(collected.to_bytes(), Bytes::from_static(b"data"));
        assert_eq!(trailers.unwrap().get("x-checksum").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_prepend_restores_original_stream() {
        let rest = full(Bytes::from_static(b" world"));
        let body = prepend(Bytes::from_static(b"hello"), rest);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }
}
