// SPDX-License-Identifier: AGPL-3.0-only
//! Connection limits for the WebDAV listener: header read timeout, header
//! size cap and an idle bound on the socket.

use axum_server::accept::Accept;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::future::{Future, Ready, ready};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Smallest read buffer hyper accepts.
pub const MIN_HEADER_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerLimits {
    /// Also bounds how long a keep-alive HTTP/1 connection may wait for its
    /// next request.
    pub read_header_timeout: Duration,
    /// No bytes read or written for this long closes the connection.
    pub idle_timeout: Option<Duration>,
    pub max_header_bytes: usize,
}

impl Default for ListenerLimits {
    fn default() -> Self {
        Self {
            read_header_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(120)),
            max_header_bytes: 64 * 1024,
        }
    }
}

impl ListenerLimits {
    /// hyper only arms its header timer when a timer is installed.
    pub fn apply(&self, builder: &mut Builder<TokioExecutor>) {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_header_timeout)
            .max_buf_size(self.max_header_bytes.max(MIN_HEADER_BYTES));
        builder.http2().timer(TokioTimer::new());
    }

    pub fn acceptor(&self) -> IdleTimeoutAcceptor {
        IdleTimeoutAcceptor {
            timeout: self.idle_timeout,
        }
    }
}

/// Wraps every accepted socket in an [`IdleTimeoutStream`]. Sits under the
/// rustls acceptor so the TLS handshake counts as activity.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeoutAcceptor {
    timeout: Option<Duration>,
}

impl<I, S> Accept<I, S> for IdleTimeoutAcceptor {
    type Stream = IdleTimeoutStream<I>;
    type Service = S;
    type Future = Ready<io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        ready(Ok((IdleTimeoutStream::new(stream, self.timeout), service)))
    }
}

pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
        }
    }

    fn touch(&mut self) {
        if let (Some(timeout), Some(deadline)) = (self.timeout, self.deadline.as_mut()) {
            deadline.as_mut().reset(Instant::now() + timeout);
        }
    }

    fn expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.deadline
            .as_mut()
            .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready())
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if buf.filled().len() > before {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending if this.expired(cx) => Poll::Ready(Err(idle_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.touch();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending if this.expired(cx) => Poll::Ready(Err(idle_error())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
