//! One client's read transfer: send a block, wait for its ack, retry on
//! timeout, give up when the budget runs out.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::packet::{DataStream, ErrorPacket, Reply};
use crate::protocol::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Transmissions allowed per block before the session gives up.
    pub retries: u8,
    /// How long one transmission waits for its ack.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retries: TFTP_DEFAULT_RETRIES,
            timeout: TFTP_DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("exhausted retries waiting for ack of block {block}")]
    ExhaustedRetries { block: u16 },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("waiting for ack: {0}")]
    Receive(#[source] io::Error),
    #[error("reading payload: {0}")]
    Read(#[source] io::Error),
    #[error("peer reported error {0}")]
    Peer(ErrorPacket),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Distinct blocks sent, not the wrapped 16-bit block number.
    pub blocks: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Sending,
    AwaitingAck { retries_left: u8 },
    Done,
}

enum Wait {
    Acked,
    TimedOut,
}

pub struct Session<C, R> {
    peer: SocketAddr,
    channel: C,
    data: DataStream<R>,
    config: SessionConfig,
    summary: TransferSummary,
}

impl<C, R> Session<C, R>
where
    C: Channel,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(peer: SocketAddr, channel: C, payload: R, config: SessionConfig) -> Session<C, R> {
        Session {
            peer,
            channel,
            data: DataStream::new(payload),
            config,
            summary: TransferSummary::default(),
        }
    }

    /// Drives the transfer to completion and logs how it ended. The channel is
    /// dropped on every exit path.
    pub async fn run(mut self) -> Result<TransferSummary, SessionError> {
        let result = self.transfer().await;
        let peer = self.peer;
        match &result {
            Ok(summary) => info!(
                peer = %peer,
                blocks = summary.blocks,
                bytes = summary.bytes,
                "sent {} blocks",
                summary.blocks
            ),
            Err(e @ (SessionError::Send(_) | SessionError::Receive(_) | SessionError::Read(_))) => {
                error!(peer = %peer, error = %e, "transfer aborted")
            }
            Err(SessionError::Peer(packet)) => {
                warn!(peer = %peer, code = ?packet.code, "received error: {}", packet.message)
            }
            Err(e) => warn!(peer = %peer, error = %e, "transfer aborted"),
        }
        result
    }

    async fn transfer(&mut self) -> Result<TransferSummary, SessionError> {
        let mut buf = [0u8; TFTP_DATAGRAM_SIZE];
        let mut state = State::Idle;

        loop {
            state = match state {
                State::Idle | State::Sending => {
                    let frame = self.data.next_block().await.map_err(SessionError::Read)?;
                    self.summary.blocks += 1;
                    self.summary.bytes += self.data.payload_len() as u64;
                    trace!(peer = %self.peer, block = self.data.block(), len = self.data.payload_len(), "sending block");
                    self.channel.send(&frame).await.map_err(SessionError::Send)?;
                    State::AwaitingAck {
                        retries_left: self.config.retries.max(1),
                    }
                }
                State::AwaitingAck { retries_left } => match self.await_ack(&mut buf).await? {
                    Wait::Acked if self.data.is_final() => State::Done,
                    Wait::Acked => State::Sending,
                    Wait::TimedOut => {
                        let retries_left = retries_left - 1;
                        if retries_left == 0 {
                            return Err(SessionError::ExhaustedRetries {
                                block: self.data.block(),
                            });
                        }
                        warn!(peer = %self.peer, block = self.data.block(), retries_left, "timed out, resending");
                        self.channel
                            .send(&self.data.resend())
                            .await
                            .map_err(SessionError::Send)?;
                        State::AwaitingAck { retries_left }
                    }
                },
                State::Done => return Ok(self.summary),
            };
        }
    }

    // Stray acks and garbage keep the current deadline.
    async fn await_ack(&self, buf: &mut [u8]) -> Result<Wait, SessionError> {
        let deadline = Instant::now() + self.config.timeout;
        let expected = self.data.block();

        loop {
            let len = match timeout_at(deadline, self.channel.recv(buf)).await {
                Err(_) => return Ok(Wait::TimedOut),
                Ok(received) => received.map_err(SessionError::Receive)?,
            };

            match Reply::parse(&buf[..len]) {
                Reply::Ack(block) if block == expected => return Ok(Wait::Acked),
                Reply::Ack(block) => {
                    debug!(peer = %self.peer, block, expected, "ignoring stray ack")
                }
                Reply::Error(packet) => return Err(SessionError::Peer(packet)),
                Reply::Unrecognized(e) => warn!(peer = %self.peer, error = %e, "bad packet"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_ack, DataPacket};
    use crate::protocol::ErrorCode;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::sync::{mpsc, Mutex};
    use tokio::task::JoinHandle;

    struct MockChannel {
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
        fail_send: bool,
    }

    impl Channel for MockChannel {
        async fn send(&self, datagram: &[u8]) -> io::Result<()> {
            if self.fail_send {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
            }
            let _ = self.outbound.send(Bytes::copy_from_slice(datagram));
            Ok(())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(len)
                }
                None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone")),
            }
        }
    }

    struct Peer {
        received: mpsc::UnboundedReceiver<Bytes>,
        reply: mpsc::UnboundedSender<Bytes>,
    }

    impl Peer {
        async fn next_data(&mut self) -> DataPacket {
            let frame = self.received.recv().await.expect("session stopped sending");
            DataPacket::decode(&frame).expect("not a data packet")
        }

        fn send(&self, datagram: Bytes) {
            self.reply.send(datagram).unwrap();
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk")))
        }
    }

    fn start(
        payload: Vec<u8>,
        config: SessionConfig,
        fail_send: bool,
    ) -> (JoinHandle<Result<TransferSummary, SessionError>>, Peer) {
        start_with(Cursor::new(payload), config, fail_send)
    }

    fn start_with<R>(
        payload: R,
        config: SessionConfig,
        fail_send: bool,
    ) -> (JoinHandle<Result<TransferSummary, SessionError>>, Peer)
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = MockChannel {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            fail_send,
        };
        let peer_addr = "127.0.0.1:4000".parse().unwrap();
        let session = Session::new(peer_addr, channel, payload, config);
        let handle = tokio::spawn(session.run());
        (
            handle,
            Peer {
                received: out_rx,
                reply: in_tx,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn thousand_bytes_takes_two_blocks() {
        let (handle, mut peer) = start(vec![0xAB; 1000], SessionConfig::default(), false);

        let first = peer.next_data().await;
        assert_eq!(first.block, 1);
        assert_eq!(first.payload.len(), 512);
        peer.send(encode_ack(1));

        let second = peer.next_data().await;
        assert_eq!(second.block, 2);
        assert_eq!(second.payload.len(), 488);
        peer.send(encode_ack(2));

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, TransferSummary { blocks: 2, bytes: 1000 });
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn block_count_follows_payload_length() {
        for len in [0usize, 1, 511, 512, 513, 1024, 1500] {
            let (handle, mut peer) = start(vec![1; len], SessionConfig::default(), false);
            let expected_blocks = len / TFTP_BLOCK_SIZE + 1;

            for block in 1..=expected_blocks {
                let data = peer.next_data().await;
                assert_eq!(data.block as usize, block);
                assert_eq!(data.is_final(), block == expected_blocks, "len {len} block {block}");
                peer.send(encode_ack(data.block));
            }

            let summary = handle.await.unwrap().unwrap();
            assert_eq!(summary.blocks as usize, expected_blocks);
            assert_eq!(summary.bytes as usize, len);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_sees_exactly_retries_transmissions() {
        let (handle, mut peer) = start(vec![5; 700], SessionConfig::default(), false);

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::ExhaustedRetries { block: 1 })
        ));

        let mut transmissions = Vec::new();
        while let Ok(frame) = peer.received.try_recv() {
            transmissions.push(frame);
        }
        assert_eq!(transmissions.len(), 10);
        assert!(transmissions.iter().all(|f| f == &transmissions[0]));
        assert_eq!(&transmissions[0][..4], b"\x00\x03\x00\x01");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resends_same_block() {
        let (handle, mut peer) = start(vec![9; 600], SessionConfig::default(), false);

        let first = peer.next_data().await;
        let again = peer.next_data().await;
        assert_eq!(first, again);
        peer.send(encode_ack(1));

        let second = peer.next_data().await;
        assert_eq!(second.block, 2);
        peer.send(encode_ack(2));

        assert_eq!(handle.await.unwrap().unwrap().blocks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stray_acks_do_not_spend_budget() {
        let config = SessionConfig {
            retries: 1,
            ..SessionConfig::default()
        };
        let (handle, mut peer) = start(vec![3; 100], config, false);

        let data = peer.next_data().await;
        assert_eq!(data.block, 1);
        for stray in [0u16, 2, 7, 1000] {
            peer.send(encode_ack(stray));
        }
        peer.send(encode_ack(1));

        assert_eq!(handle.await.unwrap().unwrap().blocks, 1);
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_packets_are_ignored() {
        let config = SessionConfig {
            retries: 1,
            ..SessionConfig::default()
        };
        let (handle, mut peer) = start(vec![3; 10], config, false);

        peer.next_data().await;
        peer.send(Bytes::from_static(b"\x00"));
        peer.send(Bytes::from_static(b"\x00\x09junk"));
        peer.send(Bytes::from_static(b"\x00\x03\x00\x01data"));
        peer.send(encode_ack(1));

        assert_eq!(handle.await.unwrap().unwrap().bytes, 10);
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_error_aborts_immediately() {
        let (handle, mut peer) = start(vec![0; 4096], SessionConfig::default(), false);

        peer.next_data().await;
        peer.send(ErrorPacket::new(ErrorCode::DiskFull, "no room").encode());

        match handle.await.unwrap() {
            Err(SessionError::Peer(packet)) => {
                assert_eq!(packet.code, ErrorCode::DiskFull);
                assert_eq!(packet.message, "no room");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_fatal() {
        let (handle, _peer) = start(vec![0; 10], SessionConfig::default(), true);
        assert!(matches!(handle.await.unwrap(), Err(SessionError::Send(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_fault_aborts() {
        let (handle, mut peer) = start(vec![0; 10], SessionConfig::default(), false);
        peer.next_data().await;
        drop(peer.reply);
        assert!(matches!(handle.await.unwrap(), Err(SessionError::Receive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn read_fault_aborts_before_sending() {
        let (handle, mut peer) = start_with(FailingReader, SessionConfig::default(), false);

        match handle.await.unwrap() {
            Err(SessionError::Read(e)) => assert_eq!(e.to_string(), "disk"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stray_ack_keeps_window_deadline() {
        let began = Instant::now();
        let (handle, mut peer) = start(vec![4; 10], SessionConfig::default(), false);

        let first = peer.next_data().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        peer.send(encode_ack(9));

        let again = peer.next_data().await;
        assert_eq!(again, first);
        // Resent when the first window closes, not 6s after the stray ack.
        let waited = began.elapsed();
        assert!(waited >= Duration::from_secs(6), "resent early: {waited:?}");
        assert!(waited < Duration::from_secs(10), "deadline was extended: {waited:?}");

        peer.send(encode_ack(1));
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, TransferSummary { blocks: 1, bytes: 10 });
    }
}
