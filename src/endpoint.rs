//! Owns the socket, the [`Receiver`] and [`Sender`], and the open/closing/
//! closed lifecycle: translates receiver events into user-facing [`Event`]s,
//! autoreplies to pings, reciprocates the closing handshake, and enforces the
//! 30-second close timeout.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Sleep};

use crate::close;
use crate::config::{Role, WebSocketConfig};
use crate::deflate::build_codecs;
use crate::error::Error;
use crate::event::{Event, RecvEvent};
use crate::message::Message;
use crate::receiver::Receiver;
use crate::sender::{is_valid_outbound_code, SendOptions, Sender};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

enum QueuedSend {
    Message(Vec<u8>, SendOptions),
}

/// An established, post-upgrade WebSocket connection over `socket`.
pub struct Endpoint<S> {
    socket: S,
    role: Role,
    ready_state: ReadyState,
    receiver: Receiver,
    sender: Sender,

    bytes_received: u64,
    bytes_buffered: usize,

    open_emitted: bool,
    close_emitted: bool,
    close_code_sent: Option<u16>,
    close_code_received: Option<u16>,
    close_reason_received: String,
    abnormal: bool,

    paused: bool,
    streaming: bool,
    send_queue: VecDeque<QueuedSend>,
    close_timer: Option<Pin<Box<Sleep>>>,

    /// Events that don't come from the receiver (currently just protocol/IO
    /// errors) and must be delivered before `next_event` loops back to
    /// `drive_io`.
    pending_events: VecDeque<Event>,
}

impl<S> Endpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Builds an endpoint around an already-upgraded socket. `config.deflate`,
    /// if set, is the already-negotiated permessage-deflate session (the
    /// upgrade handshake is outside this crate's scope).
    pub fn new(socket: S, role: Role, config: WebSocketConfig) -> Self {
        let (deflator, inflator) = match &config.deflate {
            Some(session) => {
                let (deflator, inflator) = build_codecs(role, session);
                (Some(deflator), Some(inflator))
            }
            None => (None, None),
        };

        Endpoint {
            socket,
            role,
            ready_state: ReadyState::Open,
            receiver: Receiver::new(role, config.max_message_size, inflator),
            sender: Sender::new(role, deflator),
            bytes_received: 0,
            bytes_buffered: 0,
            open_emitted: false,
            close_emitted: false,
            close_code_sent: None,
            close_code_received: None,
            close_reason_received: String::new(),
            abnormal: false,
            paused: false,
            streaming: false,
            send_queue: VecDeque::new(),
            close_timer: None,
            pending_events: VecDeque::new(),
        }
    }

    /// Feeds bytes that were already read off the socket during the upgrade
    /// (e.g. pipelined frames arriving in the same TCP segment as the HTTP
    /// upgrade response) through the receiver before any further socket
    /// reads happen.
    pub fn feed_initial(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.bytes_received += bytes.len() as u64;
        self.receiver.add(bytes)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Drives the connection and returns the next event, or `None` once the
    /// endpoint has emitted its terminal `Close` event and nothing further
    /// will ever be produced.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if !self.open_emitted {
                self.open_emitted = true;
                return Some(Event::Open);
            }

            if let Some(event) = self.pending_events.pop_front() {
                return Some(event);
            }

            if let Some(event) = self.poll_receiver_event().await {
                return Some(event);
            }

            if self.ready_state == ReadyState::Closed {
                if self.close_emitted {
                    return None;
                }
                self.close_emitted = true;
                return Some(self.build_close_event());
            }

            self.drive_io().await;
        }
    }

    fn build_close_event(&self) -> Event {
        let code = if self.abnormal {
            close::ABNORMAL_CLOSURE
        } else {
            self.close_code_received
                .or(self.close_code_sent)
                .unwrap_or(close::NORMAL)
        };
        Event::Close { code, reason: self.close_reason_received.clone() }
    }

    /// Pops and translates one pending receiver event, performing whatever
    /// endpoint-level side effect it implies (autoreply, close reciprocation).
    async fn poll_receiver_event(&mut self) -> Option<Event> {
        let event = self.receiver.poll_event()?;
        match event {
            // Once the closing handshake has begun, any data frame the peer
            // sends before its close frame arrives is discarded rather than
            // surfaced.
            RecvEvent::Message(_) if self.ready_state != ReadyState::Open => None,
            RecvEvent::Message(message) => Some(Event::Message(message)),
            RecvEvent::Ping(payload) => {
                let frame = self.sender.frame_pong(&payload);
                if let Err(e) = self.write_raw(&frame).await {
                    warn!("failed to autoreply pong: {e}");
                }
                Some(Event::Ping(payload))
            }
            RecvEvent::Pong(payload) => Some(Event::Pong(payload)),
            RecvEvent::Close { code, reason } => {
                self.on_peer_close(code, reason).await;
                None
            }
        }
    }

    async fn on_peer_close(&mut self, code: Option<u16>, reason: String) {
        self.close_code_received = Some(code.unwrap_or(close::NORMAL));
        self.close_reason_received = reason;

        if self.ready_state == ReadyState::Open {
            // Peer-initiated close: reciprocate immediately.
            let frame = self.sender.frame_close(code, &self.close_reason_received.clone());
            let _ = self.write_raw(&frame).await;
            self.close_code_sent = self.close_code_sent.or(code);
        }

        // The server is the side that ends the connection once both close
        // frames have crossed, whether it reciprocated just now or the peer's
        // frame is the reciprocation of a close the server itself initiated.
        // The client instead waits for the server to end the socket and
        // observes EOF through the normal read path.
        if self.role == Role::Server {
            let _ = self.socket.shutdown().await;
            self.force_closed(false);
        } else {
            self.ready_state = ReadyState::Closing;
        }
    }

    /// Reads more bytes from the socket (unless paused), racing the close
    /// timer if one is armed. Moves `ready_state` to `Closed` on EOF, I/O
    /// error, or timer expiry.
    async fn drive_io(&mut self) {
        if self.ready_state == ReadyState::Closed {
            return;
        }

        let mut buf = [0u8; READ_CHUNK_SIZE];
        let socket = &mut self.socket;
        let close_timer = &mut self.close_timer;

        if self.paused {
            // Don't read while paused; only the close timer can fire.
            if let Some(timer) = close_timer.as_mut() {
                timer.as_mut().await;
                self.force_closed(true);
            } else {
                std::future::pending::<()>().await;
            }
            return;
        }

        tokio::select! {
            biased;
            result = socket.read(&mut buf) => {
                match result {
                    Ok(0) => self.on_socket_ended(),
                    Ok(n) => {
                        self.bytes_received += n as u64;
                        if let Err(e) = self.receiver.add(&buf[..n]) {
                            self.on_protocol_error(e).await;
                        }
                    }
                    Err(e) => {
                        error!("socket read error: {e}");
                        self.force_closed(true);
                    }
                }
            }
            _ = maybe_timer(close_timer) => {
                warn!("close handshake timed out after {CLOSE_TIMEOUT:?}");
                self.force_closed(true);
            }
        }
    }

    fn on_socket_ended(&mut self) {
        debug!("socket ended, finalizing close");
        let abnormal = self.ready_state != ReadyState::Closing || self.close_code_received.is_none();
        self.force_closed(abnormal);
    }

    async fn on_protocol_error(&mut self, e: Error) {
        warn!("protocol error, closing: {e}");
        let close_code = e.close_code();
        let code = close_code.unwrap_or(close::PROTOCOL_ERROR);
        let frame = self.sender.frame_close(Some(code), "");
        let _ = self.write_raw(&frame).await;
        self.close_code_sent = Some(code);
        self.ready_state = ReadyState::Closing;
        self.arm_close_timer();
        self.pending_events.push_back(Event::Error { source: e, close_code });
    }

    fn force_closed(&mut self, abnormal: bool) {
        if self.ready_state == ReadyState::Closed {
            return;
        }
        self.abnormal = abnormal && self.close_code_received.is_none();
        self.ready_state = ReadyState::Closed;
        self.receiver.cleanup();
    }

    fn arm_close_timer(&mut self) {
        self.close_timer = Some(Box::pin(sleep(CLOSE_TIMEOUT)));
    }

    async fn write_raw(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.bytes_buffered += frame.len();
        let result = self.socket.write_all(frame).await;
        self.bytes_buffered -= frame.len();
        result.map_err(Error::from)
    }

    /// Sends a complete, non-fragmented message. Queued and replayed in call
    /// order if a streamed message is currently in progress.
    pub async fn send(&mut self, message: Message, opts: SendOptions) -> Result<(), Error> {
        self.require_open()?;
        let opts = SendOptions { binary: message.is_binary(), ..opts };
        let payload = message.into_bytes();
        if self.streaming {
            self.send_queue.push_back(QueuedSend::Message(payload, opts));
            return Ok(());
        }
        self.write_message(payload, opts).await
    }

    /// Sends one fragment of a streamed message. `fin = true` marks the last
    /// fragment and triggers replay of anything queued while streaming.
    /// Streamed messages are always sent uncompressed: the deflate codec
    /// only ever sees the chunk in front of it, not the whole message, so it
    /// cannot produce a payload the peer could inflate back correctly.
    pub async fn send_fragment(&mut self, chunk: &[u8], fin: bool, opts: SendOptions) -> Result<(), Error> {
        self.require_open()?;
        self.streaming = !fin;
        let opts = SendOptions { compress: false, ..opts };
        let frame = self.sender.frame_message(chunk, fin, opts)?;
        self.write_raw(&frame).await?;
        if fin {
            self.drain_send_queue().await?;
        }
        Ok(())
    }

    async fn write_message(&mut self, payload: Vec<u8>, opts: SendOptions) -> Result<(), Error> {
        let frame = self.sender.frame_message(&payload, true, opts)?;
        self.write_raw(&frame).await
    }

    async fn drain_send_queue(&mut self) -> Result<(), Error> {
        while let Some(queued) = self.send_queue.pop_front() {
            match queued {
                QueuedSend::Message(payload, opts) => self.write_message(payload, opts).await?,
            }
        }
        Ok(())
    }

    pub async fn ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.require_open()?;
        let frame = self.sender.frame_ping(&payload);
        self.write_raw(&frame).await
    }

    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.require_open()?;
        let frame = self.sender.frame_pong(&payload);
        self.write_raw(&frame).await
    }

    /// Begins the closing handshake: sends a close frame, arms the 30-second
    /// timeout, and transitions to CLOSING. The terminal `Close` event is
    /// delivered later from `next_event` once the handshake (or the timer)
    /// completes.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        self.require_open()?;
        if !is_valid_outbound_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        let frame = self.sender.frame_close(Some(code), reason);
        self.close_code_sent = Some(code);
        self.ready_state = ReadyState::Closing;
        self.arm_close_timer();
        self.write_raw(&frame).await
    }

    /// Closes the socket immediately without attempting a clean handshake.
    pub async fn terminate(&mut self) {
        let _ = self.socket.shutdown().await;
        self.force_closed(true);
    }

    fn require_open(&self) -> Result<(), Error> {
        if self.ready_state == ReadyState::Open {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }
}

async fn maybe_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::SendOptions as SO;
    use tokio::io::duplex;

    async fn open_pair() -> (Endpoint<tokio::io::DuplexStream>, Endpoint<tokio::io::DuplexStream>) {
        let (client_io, server_io) = duplex(4096);
        let client = Endpoint::new(client_io, Role::Client, WebSocketConfig::default());
        let server = Endpoint::new(server_io, Role::Server, WebSocketConfig::default());
        (client, server)
    }

    async fn open_pair_with_deflate() -> (Endpoint<tokio::io::DuplexStream>, Endpoint<tokio::io::DuplexStream>) {
        let (client_io, server_io) = duplex(4096);
        let config = WebSocketConfig {
            deflate: Some(crate::config::DeflateConfig::default()),
            ..Default::default()
        };
        let client = Endpoint::new(client_io, Role::Client, config.clone());
        let server = Endpoint::new(server_io, Role::Server, config);
        (client, server)
    }

    #[tokio::test]
    async fn open_event_is_emitted_first() {
        let (mut client, _server) = open_pair().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
    }

    #[tokio::test]
    async fn send_and_receive_text_message() {
        let (mut client, mut server) = open_pair().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
        assert!(matches!(server.next_event().await, Some(Event::Open)));

        client
            .send(Message::Text("hello".into()), SO { binary: false, compress: false })
            .await
            .unwrap();

        match server.next_event().await {
            Some(Event::Message(Message::Text(s))) => assert_eq!(s, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_triggers_autoreply_pong() {
        let (mut client, mut server) = open_pair().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
        assert!(matches!(server.next_event().await, Some(Event::Open)));

        client.ping(b"Hello".to_vec()).await.unwrap();

        match server.next_event().await {
            Some(Event::Ping(payload)) => assert_eq!(payload, b"Hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        match client.next_event().await {
            Some(Event::Pong(payload)) => assert_eq!(payload, b"Hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streamed_message_with_deflate_negotiated_is_sent_uncompressed() {
        let (mut client, mut server) = open_pair_with_deflate().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
        assert!(matches!(server.next_event().await, Some(Event::Open)));

        client.send_fragment(b"hel", false, SO::default()).await.unwrap();
        client.send_fragment(b"lo", true, SO::default()).await.unwrap();

        match server.next_event().await {
            Some(Event::Message(Message::Text(s))) => assert_eq!(s, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn protocol_violation_surfaces_error_before_close() {
        let (mut client, mut server) = open_pair().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
        assert!(matches!(server.next_event().await, Some(Event::Open)));

        // FIN=1, RSV=0, opcode=3 (reserved), MASK=1, len=0, mask key all zero,
        // written directly onto the wire as if sent by the remote client.
        let bogus = [0x83u8, 0x80, 0, 0, 0, 0];
        client.socket.write_all(&bogus).await.unwrap();

        match server.next_event().await {
            Some(Event::Error { close_code, .. }) => assert_eq!(close_code, Some(1002)),
            other => panic!("unexpected event: {other:?}"),
        }

        // A malformed frame desynchronizes the byte stream, so there's no
        // salvaging a reciprocal close frame from the peer; the remote side
        // drops the connection and the server should notice the EOF rather
        // than sit out the full close timeout.
        client.terminate().await;

        match server.next_event().await {
            Some(Event::Close { code, .. }) => assert_eq!(code, 1006),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_handshake_reaches_both_endpoints() {
        let (mut client, mut server) = open_pair().await;
        assert!(matches!(client.next_event().await, Some(Event::Open)));
        assert!(matches!(server.next_event().await, Some(Event::Open)));

        client.close(1000, "bye").await.unwrap();

        match server.next_event().await {
            Some(Event::Close { code, reason }) => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match client.next_event().await {
            Some(Event::Close { code, .. }) => assert_eq!(code, 1000),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
