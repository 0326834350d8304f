//! In-memory socket double for session and relay tests

use axum::extract::ws::Message;
use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[error("mock socket closed")]
pub(crate) struct MockError;

/// Server side of an in-memory socket; a stalled socket never accepts
/// writes
pub(crate) struct MockSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, MockError>>,
    outgoing: mpsc::UnboundedSender<Message>,
    stalled: bool,
}

/// Client side of an in-memory socket
pub(crate) struct MockClient {
    pub to_server: mpsc::UnboundedSender<Result<Message, MockError>>,
    pub from_server: mpsc::UnboundedReceiver<Message>,
}

pub(crate) fn socket_pair(stalled: bool) -> (MockSocket, MockClient) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    (
        MockSocket {
            incoming,
            outgoing,
            stalled,
        },
        MockClient {
            to_server,
            from_server,
        },
    )
}

impl Stream for MockSocket {
    type Item = Result<Message, MockError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().incoming.poll_recv(cx)
    }
}

impl Sink<Message> for MockSocket {
    type Error = MockError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
        if self.stalled {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), MockError> {
        self.outgoing.send(item).map_err(|_| MockError)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
        Poll::Ready(Ok(()))
    }
}
