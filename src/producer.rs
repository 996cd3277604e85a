//! Producer side of the transport channel.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::StreamExt as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::capture::{CaptureLoop, FrameSink};
use crate::error::{RelayError, Result};
use crate::logging::Logger;
use crate::pose::{NormalizedVector, PoseEstimator};
use crate::protocol::{self, ClientMessage, MessageStream, ServerMessage};
use crate::{log, vlog};

/// One connection to the relay. Sends fail once the relay has gone away;
/// nothing is buffered for a later connection.
pub struct ProducerSession {
    sink: SplitSink<MessageStream, Bytes>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    greeting: String,
}

impl ProducerSession {
    /// Connect and wait for the relay's greeting.
    pub async fn connect(addr: &str, logger: Logger) -> Result<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::Channel(format!("connect {addr}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| RelayError::Channel(format!("set_nodelay: {e}")))?;
        let mut stream = protocol::message_stream(tcp);

        let greeting = match protocol::recv_message::<_, ServerMessage>(&mut stream).await? {
            ServerMessage::Greeting { hello } => hello,
        };

        let (sink, mut reader) = stream.split();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(bytes)) => match protocol::decode_message::<ServerMessage>(&bytes) {
                        Ok(msg) => vlog!(logger, "[tcp] unexpected server message: {:?}", msg),
                        Err(e) => log!(logger, "[tcp] {}", e),
                    },
                    Some(Err(e)) => {
                        log!(logger, "[tcp] reader error: {}", e);
                        break;
                    }
                    None => {
                        log!(logger, "[tcp] relay closed the connection");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
        });

        Ok(Self {
            sink,
            closed,
            reader,
            greeting,
        })
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::Channel("relay connection closed".into()));
        }
        protocol::send_to_sink(&mut self.sink, msg).await
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl FrameSink for ProducerSession {
    async fn send_frame(&mut self, frame: NormalizedVector) -> Result<()> {
        self.send(&ClientMessage::PoseUpdate { values: frame.into_values() })
            .await
    }
}

/// Connect, stream until the channel fails, wait, reconnect. Returns only
/// on a keypoint contract violation, which no reconnect can fix.
pub async fn run_with_reconnect<E: PoseEstimator>(
    capture: &mut CaptureLoop<E>,
    server_addr: &str,
    reconnect_delay: Duration,
    logger: &Logger,
) -> Result<()> {
    loop {
        log!(logger, "[tcp] connecting to {}...", server_addr);
        match ProducerSession::connect(server_addr, logger.clone()).await {
            Ok(mut session) => {
                log!(logger, "[tcp] relay says hello: {}, streaming", session.greeting());
                match capture.run(&mut session).await {
                    Err(e) if e.is_contract_violation() => return Err(e),
                    Err(e) => log!(logger, "[tcp] session ended: {}", e),
                    Ok(()) => {}
                }
            }
            Err(e) => log!(logger, "[tcp] connection failed: {}", e),
        }
        log!(logger, "[tcp] reconnecting in {}ms...", reconnect_delay.as_millis());
        tokio::time::sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Trigger;
    use crate::config::Config;
    use crate::pose::{Keypoint, KeypointIndex, Normalizer, ReplayEstimator};
    use futures::StreamExt;
    use tokio::net::TcpListener;

    fn frame() -> NormalizedVector {
        Normalizer::new(1280, 720)
            .normalize_keypoints(&[Keypoint::new(640.0, 360.0, 1.0); KeypointIndex::COUNT])
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_delivers_pose_updates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = protocol::message_stream(tcp);
            protocol::send_message(&mut stream, &ServerMessage::Greeting { hello: "world".into() })
                .await
                .unwrap();
            let mut received = Vec::new();
            for _ in 0..2 {
                let msg: ClientMessage = protocol::recv_message(&mut stream).await.unwrap();
                received.push(msg);
            }
            received
        });

        let mut session = ProducerSession::connect(&addr, Logger::stderr(false)).await.unwrap();
        assert_eq!(session.greeting(), "world");
        session.send_frame(frame()).await.unwrap();
        session.send_frame(frame()).await.unwrap();

        for msg in relay.await.unwrap() {
            match msg {
                ClientMessage::PoseUpdate { values } => {
                    assert_eq!(values.len(), 51);
                    assert_eq!(&values[0..3], &[0.5, 0.5, 1.0]);
                }
                other => panic!("expected PoseUpdate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_restart_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = protocol::message_stream(tcp);
            protocol::send_message(&mut stream, &ServerMessage::Greeting { hello: "world".into() })
                .await
                .unwrap();
            // relay goes away with nothing read
        });

        let mut session = ProducerSession::connect(&addr, Logger::stderr(false)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut result = Ok(());
        while tokio::time::Instant::now() < deadline {
            result = session.send_frame(frame()).await;
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(result, Err(RelayError::Channel(_))));

        while !session.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_closed());
        assert!(session.send_frame(frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_contract_violation_ends_reconnect_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut stream = protocol::message_stream(tcp);
                protocol::send_message(&mut stream, &ServerMessage::Greeting { hello: "world".into() })
                    .await
                    .unwrap();
                tokio::spawn(async move { while stream.next().await.is_some() {} });
            }
        });

        let mut config = Config::default();
        config.timing.warmup_ms = 1;
        config.timing.period_ms = 1;
        let line = r#"{"keypoints":[{"score":1.0,"part":"nose","position":{"x":1.0,"y":2.0}}]}"#;
        let replay = ReplayEstimator::from_lines([line], true);
        let logger = Logger::stderr(false);
        let mut capture = CaptureLoop::new(&config, replay, Trigger::Periodic, logger.clone());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            run_with_reconnect(&mut capture, &addr, Duration::from_millis(10), &logger),
        )
        .await
        .expect("reconnect loop did not stop")
        .unwrap_err();
        assert!(matches!(err, RelayError::ContractViolation { actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_connect_without_greeting_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            drop(tcp);
        });

        let err = ProducerSession::connect(&addr, Logger::stderr(false)).await.err().unwrap();
        assert!(matches!(err, RelayError::Channel(_)));
    }
}
