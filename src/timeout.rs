//! Deadline wrapper for upstream bodies read by the response guard.
//!
//! The byte ceiling bounds how much the guard reads; this wrapper bounds how
//! long it waits. An upstream that stalls mid-body surfaces as a
//! `TimedOut` I/O error instead of pinning the interception hook.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

use crate::proxy_body::BoxError;

/// Idle and total limits for reading one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyDeadline {
    /// Longest gap allowed between two frames
    pub idle: Duration,
    /// Longest time allowed for the whole body
    pub total: Duration,
}

impl BodyDeadline {
    pub fn new(idle: Duration, total: Duration) -> Self {
        Self { idle, total }
    }
}

impl Default for BodyDeadline {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }
}

/// Body wrapper enforcing a [`BodyDeadline`].
///
/// Both clocks start on the first poll. The idle clock restarts whenever the
/// inner body yields a frame.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: BodyDeadline,
    idle_timer: Pin<Box<Sleep>>,
    total_timer: Pin<Box<Sleep>>,
    started: bool,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: BodyDeadline) -> Self {
        Self {
            inner,
            deadline,
            idle_timer: Box::pin(sleep(deadline.idle)),
            total_timer: Box::pin(sleep(deadline.total)),
            started: false,
        }
    }

    /// Drop the deadline and hand back the wrapped body.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

fn timed_out(which: &str, limit: Duration) -> BoxError {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("body {which} timeout exceeded ({limit:?})"),
    )
    .into()
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if !this.started {
            this.started = true;
            let now = Instant::now();
            this.total_timer.as_mut().reset(now + this.deadline.total);
            this.idle_timer.as_mut().reset(now + this.deadline.idle);
        }

        if this.total_timer.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(timed_out("total", this.deadline.total))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.idle_timer
                    .as_mut()
                    .reset(Instant::now() + this.deadline.idle);
                Poll::Ready(frame.map(|r| r.map_err(Into::into)))
            }
            Poll::Pending => {
                if this.idle_timer.as_mut().poll(cx).is_ready() {
                    Poll::Ready(Some(Err(timed_out("idle", this.deadline.idle))))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
