//! Definitions for the Request and Response bodies.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;

/// Body is returned by the webdav handler, and implements `http_body::Body`.
///
/// Responses of this handler are always generated in memory, so a body is
/// either empty or one chunk of bytes.
#[derive(Debug, Default)]
pub struct Body {
    inner: Option<Bytes>,
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body { inner: None }
    }

    /// Return the remaining data (empty if already consumed).
    pub fn into_bytes(self) -> Bytes {
        self.inner.unwrap_or_default()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.inner.take().map(|b| Ok(Frame::data(b))))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_none()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::SizeHint::with_exact(self.inner.as_ref().map(|b| b.len() as u64).unwrap_or(0))
    }
}

impl From<String> for Body {
    fn from(t: String) -> Body {
        Body::from(Bytes::from(t))
    }
}

impl From<&str> for Body {
    fn from(t: &str) -> Body {
        Body::from(Bytes::from(t.to_string()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(t: Vec<u8>) -> Body {
        Body::from(Bytes::from(t))
    }
}

impl From<Bytes> for Body {
    fn from(t: Bytes) -> Body {
        let inner = if t.is_empty() { None } else { Some(t) };
        Body { inner }
    }
}

/// Read a request body into memory, up to `max_size` bytes.
pub(crate) async fn read_body<ReqBody, ReqData, ReqError>(body: ReqBody, max_size: usize) -> io::Result<Bytes>
where
    ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    ReqData: Buf,
    ReqError: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut data = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        if let Ok(mut chunk) = frame.into_data() {
            if data.len() + chunk.remaining() > max_size {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "body too large"));
            }
            while chunk.has_remaining() {
                let c = chunk.chunk();
                let n = c.len();
                data.extend_from_slice(c);
                chunk.advance(n);
            }
        }
    }
    Ok(data.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    #[tokio::test]
    async fn read_limits() {
        let b = read_body(Full::new(Bytes::from("hello")), 10).await.unwrap();
        assert_eq!(b, Bytes::from("hello"));
        assert!(read_body(Full::new(Bytes::from("hello")), 4).await.is_err());
    }

    #[tokio::test]
    async fn body_frames() {
        let body = Body::from("abc");
        assert!(!body.is_end_stream());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("abc"));
        assert!(Body::empty().is_end_stream());
    }
}
