use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::client::Command;
use crate::error::ClientError;
use crate::packet::Packet;
use crate::session::{Completion, SessionEvent};

/// Application-facing stream of response messages for one request token.
///
/// Yields every non-swallowed message the session forwards, in transport
/// arrival order with duplicates coalesced.  The stream ends when the
/// request finishes or is cancelled; a failure is yielded as the final
/// `Err` item.  Dropping the stream cancels the request.
pub struct ResponseStream {
    token: u64,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    command_tx: mpsc::UnboundedSender<Command>,
    done: bool,
    assembled: Option<Vec<u8>>,
}

enum EventOutcome {
    Item(Result<Packet, ClientError>),
    Ended,
}

impl ResponseStream {
    pub(crate) fn new(
        token: u64,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        command_tx: mpsc::UnboundedSender<Command>,
    ) -> ResponseStream {
        ResponseStream {
            token,
            events,
            command_tx,
            done: false,
            assembled: None,
        }
    }

    /// The token this request runs under.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Cancel the request now instead of on drop.  For an observed resource
    /// this emits the deregister message.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self.command_tx.send(Command::Cancel { token: self.token });
        }
    }

    /// Await completion and return the response body with block2 fragments
    /// concatenated in ascending NUM order.  `None` means the exchange ended
    /// without a complete body (a block was missing, or the peer reset the
    /// exchange) — partial bodies are never returned.
    ///
    /// Not meaningful for observed resources, which never complete on their
    /// own.
    pub async fn assemble(mut self) -> Result<Option<Vec<u8>>, ClientError> {
        while let Some(event) = self.events.recv().await {
            match self.consume(event) {
                EventOutcome::Item(Ok(_)) => continue,
                EventOutcome::Item(Err(error)) => return Err(error),
                EventOutcome::Ended => return Ok(self.assembled.take()),
            }
        }
        // driver went away without a completion event
        Err(ClientError::Cancelled)
    }

    fn consume(&mut self, event: SessionEvent) -> EventOutcome {
        match event {
            SessionEvent::Message(packet) => EventOutcome::Item(Ok(packet)),
            SessionEvent::Completed(Completion::Finished { payload }) => {
                self.done = true;
                self.assembled = payload;
                EventOutcome::Ended
            }
            SessionEvent::Completed(Completion::Cancelled) => {
                self.done = true;
                EventOutcome::Ended
            }
            SessionEvent::Completed(Completion::Failed(error)) => {
                self.done = true;
                EventOutcome::Item(Err(error))
            }
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<Packet, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(event)) => match this.consume(event) {
                EventOutcome::Item(item) => Poll::Ready(Some(item)),
                EventOutcome::Ended => Poll::Ready(None),
            },
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.command_tx.send(Command::Cancel { token: self.token });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn stream() -> (
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::UnboundedReceiver<Command>,
        ResponseStream,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (event_tx, command_rx, ResponseStream::new(5, event_rx, command_tx))
    }

    fn message(payload: &[u8]) -> SessionEvent {
        let mut packet = Packet::new();
        packet.code = crate::packet::MessageClass::from_u8(0x45);
        packet.payload = payload.to_vec();
        SessionEvent::Message(packet)
    }

    #[tokio::test]
    async fn yields_messages_then_ends_on_completion() {
        let (event_tx, _commands, mut stream) = stream();
        event_tx.send(message(b"a")).unwrap();
        event_tx
            .send(SessionEvent::Completed(Completion::Finished {
                payload: Some(b"a".to_vec()),
            }))
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().payload, b"a");
        assert!(stream.next().await.is_none());
        // exhausted streams stay exhausted
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_is_the_final_item() {
        let (event_tx, _commands, mut stream) = stream();
        event_tx
            .send(SessionEvent::Completed(Completion::Failed(
                ClientError::TimedOut,
            )))
            .unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::TimedOut))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn assemble_returns_reassembled_payload() {
        let (event_tx, _commands, stream) = stream();
        event_tx.send(message(b"aaaa")).unwrap();
        event_tx.send(message(b"bb")).unwrap();
        event_tx
            .send(SessionEvent::Completed(Completion::Finished {
                payload: Some(b"aaaabb".to_vec()),
            }))
            .unwrap();

        assert_eq!(stream.assemble().await.unwrap(), Some(b"aaaabb".to_vec()));
    }

    #[tokio::test]
    async fn assemble_propagates_failure() {
        let (event_tx, _commands, stream) = stream();
        event_tx
            .send(SessionEvent::Completed(Completion::Failed(
                ClientError::TimedOut,
            )))
            .unwrap();
        assert!(matches!(stream.assemble().await, Err(ClientError::TimedOut)));
    }

    #[tokio::test]
    async fn drop_sends_cancel_once() {
        let (_event_tx, mut commands, stream) = stream();
        drop(stream);
        assert!(matches!(
            commands.recv().await,
            Some(Command::Cancel { token: 5 })
        ));
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn completed_stream_does_not_cancel_on_drop() {
        let (event_tx, mut commands, mut stream) = stream();
        event_tx
            .send(SessionEvent::Completed(Completion::Finished { payload: None }))
            .unwrap();
        assert!(stream.next().await.is_none());
        drop(stream);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn explicit_cancel_marks_done() {
        let (_event_tx, mut commands, mut stream) = stream();
        stream.cancel();
        assert!(matches!(
            commands.recv().await,
            Some(Command::Cancel { token: 5 })
        ));
        assert!(stream.next().await.is_none());
        drop(stream);
        // no second cancel from drop
        assert!(commands.try_recv().is_err());
    }
}
