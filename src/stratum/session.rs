use {
    super::{
        error::{IoSnafu, SerializationSnafu, SocksSnafu},
        *,
    },
    crate::template::TemplateSink,
    snafu::ResultExt,
    tokio::{
        io::AsyncReadExt,
        net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    tokio_socks::tcp::Socks5Stream,
};

const READ_TIMEOUT: Duration = Duration::from_secs(600);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(480);
const RECV_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) keep_alive: bool,
    pub(crate) retry_delay: Duration,
    pub(crate) max_retries: u32,
}

/// Runs one endpoint forever. Inner attempts are bounded by `max_retries`;
/// on exhaustion the endpoint is reported unavailable and the outer loop
/// starts another round of attempts.
pub(crate) async fn watch_endpoint(
    endpoint: Arc<Endpoint>,
    listener: Option<TcpListener>,
    config: SessionConfig,
    sink: Arc<TemplateSink>,
    cancel: CancellationToken,
) {
    loop {
        for attempt in 1..=config.max_retries {
            if cancel.is_cancelled() {
                return;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = run_session(&endpoint, listener.as_ref(), &config, &sink) => outcome,
            };

            if let Err(err) = outcome {
                warn!(
                    "Session with {} failed (attempt {attempt}/{}): {err}",
                    endpoint.pool_name, config.max_retries
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(config.retry_delay) => {}
            }
        }

        warn!(
            "Endpoint {} unavailable after {} attempts, continuing to retry",
            endpoint.pool_name, config.max_retries
        );
    }
}

async fn run_session(
    endpoint: &Arc<Endpoint>,
    listener: Option<&TcpListener>,
    config: &SessionConfig,
    sink: &TemplateSink,
) -> Result<(), SessionError> {
    match listener {
        Some(listener) => proxy_session(endpoint, listener, sink).await,
        None => client_session(endpoint, config, sink).await,
    }
}

async fn connect(endpoint: &Endpoint) -> Result<TcpStream, SessionError> {
    let host = endpoint.url.host.as_str();
    let port = endpoint.url.port;

    let stream = if let Some(socks5) = &endpoint.socks5 {
        info!(
            "Connecting to {} via SOCKS5 proxy {}:{}",
            endpoint.url, socks5.host, socks5.port
        );

        let stream = timeout(
            READ_TIMEOUT,
            Socks5Stream::connect((socks5.host.as_str(), socks5.port), (host, port)),
        )
        .await
        .map_err(|_| SessionError::Timeout)?;
        ResultExt::context(stream, SocksSnafu)?.into_inner()
    } else {
        let stream = timeout(READ_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SessionError::Timeout)?;
        ResultExt::context(stream, IoSnafu)?
    };

    Ok(stream)
}

/// Accumulates raw bytes from the socket and splits out newline-delimited
/// frames. Partial frames survive across reads, and the only await point is
/// a plain `read`, so a timeout wrapping `read_frame` never loses buffered
/// bytes.
struct FrameBuffer<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameBuffer<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, SessionError> {
        loop {
            if let Some(position) = self.buffer.iter().position(|&byte| byte == b'\n') {
                let mut frame: Vec<u8> = self.buffer.drain(..=position).collect();
                frame.pop();
                return Ok(frame);
            }

            let mut chunk = [0u8; RECV_BUFFER_SIZE];
            let n = ResultExt::context(self.reader.read(&mut chunk).await, IoSnafu)?;

            if n == 0 {
                return Err(SessionError::ConnectionLost);
            }

            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

struct Session {
    endpoint: Arc<Endpoint>,
    frames: FrameBuffer<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    extranonce1: Option<String>,
    extranonce2_length: Option<i64>,
}

impl Session {
    fn new(endpoint: Arc<Endpoint>, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            endpoint,
            frames: FrameBuffer::new(reader),
            writer,
            next_id: 1,
            extranonce1: None,
            extranonce2_length: None,
        }
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<(), SessionError> {
        let message = Message::Request {
            id: Id::Number(self.next_id),
            method: method.into(),
            params,
        };

        self.next_id += 1;

        let mut frame = ResultExt::context(serde_json::to_string(&message), SerializationSnafu)?;
        frame.push('\n');

        debug!("Sending: {}", frame.trim_end());

        ResultExt::context(self.writer.write_all(frame.as_bytes()).await, IoSnafu)?;
        ResultExt::context(self.writer.flush().await, IoSnafu)?;

        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message, SessionError> {
        loop {
            let frame = self.frames.read_frame().await?;
            let line = String::from_utf8_lossy(&frame);

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    debug!("Received: {line}");
                    return Ok(message);
                }
                Err(err) => {
                    warn!("Invalid JSON message: {line:?} - {err}");
                }
            }
        }
    }

    /// Reads until a response arrives, handling any notifications that show
    /// up in between.
    async fn read_response(
        &mut self,
        sink: &TemplateSink,
    ) -> Result<(Option<Value>, Option<JsonRpcError>), SessionError> {
        loop {
            let message = timeout(READ_TIMEOUT, self.read_message())
                .await
                .map_err(|_| SessionError::ConnectionLost)??;

            match message {
                Message::Response { result, error, .. } => return Ok((result, error)),
                Message::Notification { method, params } => {
                    self.handle_notification(&method, params, sink).await;
                }
                Message::Request { .. } => {}
            }
        }
    }

    async fn subscribe(&mut self, sink: &TemplateSink) -> Result<(), SessionError> {
        self.send_request("mining.subscribe", json!([])).await?;

        let (result, error) = self.read_response(sink).await?;

        if let Some(error) = error {
            return Err(SessionError::Handshake {
                message: format!("mining.subscribe error: {error}"),
            });
        }

        let subscribed = result
            .as_ref()
            .and_then(SubscribeResult::from_result)
            .ok_or_else(|| SessionError::Handshake {
                message: "malformed mining.subscribe result".into(),
            })?;

        self.extranonce1 = Some(subscribed.extranonce1);
        self.extranonce2_length = Some(subscribed.extranonce2_length);

        Ok(())
    }

    async fn authorize(&mut self, sink: &TemplateSink) -> Result<(), SessionError> {
        let (username, password) = self.endpoint.credentials();
        let params = json!([username, password]);

        self.send_request("mining.authorize", params).await?;

        let (result, error) = self.read_response(sink).await?;

        if let Some(error) = error {
            return Err(SessionError::Handshake {
                message: format!("mining.authorize error: {error}"),
            });
        }

        if result == Some(Value::Bool(false)) {
            return Err(SessionError::Handshake {
                message: "unauthorized".into(),
            });
        }

        Ok(())
    }

    async fn handle_notification(&self, method: &str, params: Value, sink: &TemplateSink) {
        match method {
            "mining.notify" => match serde_json::from_value::<Notify>(params) {
                Ok(notify) => {
                    let template = NotifyTemplate::record(
                        notify,
                        &self.endpoint.pool_name,
                        self.extranonce1.as_deref(),
                        self.extranonce2_length,
                    );

                    sink.emit(template).await;
                }
                Err(err) => warn!("Failed to parse mining.notify: {err}"),
            },
            _ => debug!("Unhandled notification: {method}"),
        }
    }
}

async fn client_session(
    endpoint: &Arc<Endpoint>,
    config: &SessionConfig,
    sink: &TemplateSink,
) -> Result<(), SessionError> {
    let stream = connect(endpoint).await?;

    info!("Connected to {} ({})", endpoint.pool_name, endpoint.url);

    let mut session = Session::new(endpoint.clone(), stream);

    session.subscribe(sink).await?;
    info!("Subscribed to pool notifications from {}", endpoint.pool_name);

    session.authorize(sink).await?;
    info!("Authorized with {}", endpoint.pool_name);

    let mut last_read = Instant::now();
    let mut last_subscribe = Instant::now();

    loop {
        if config.keep_alive && last_subscribe.elapsed() >= KEEP_ALIVE_INTERVAL {
            info!(
                "Keep-alive interval reached, re-subscribing to {}",
                endpoint.pool_name
            );
            session.send_request("mining.subscribe", json!([])).await?;
            last_subscribe = Instant::now();
        }

        let read_remaining = READ_TIMEOUT.saturating_sub(last_read.elapsed());

        if read_remaining.is_zero() {
            return Err(SessionError::ConnectionLost);
        }

        let wait = if config.keep_alive {
            read_remaining.min(KEEP_ALIVE_INTERVAL.saturating_sub(last_subscribe.elapsed()))
        } else {
            read_remaining
        };

        match timeout(wait, session.read_message()).await {
            Err(_) => {
                if last_read.elapsed() >= READ_TIMEOUT {
                    return Err(SessionError::ConnectionLost);
                }
                // keep-alive due; handled at the top of the loop
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(message)) => {
                last_read = Instant::now();

                match message {
                    Message::Notification { method, params } => {
                        session.handle_notification(&method, params, sink).await;
                    }
                    Message::Response {
                        result: Some(result),
                        ..
                    } => {
                        // responses to keep-alive re-subscribes
                        if let Some(subscribed) = SubscribeResult::from_result(&result) {
                            session.extranonce1 = Some(subscribed.extranonce1);
                            session.extranonce2_length = Some(subscribed.extranonce2_length);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Transparent proxy between one attached miner and the upstream pool. We
/// never speak on the miner's behalf; every line is relayed unmodified while
/// being inspected for jobs and extranonce grants.
async fn proxy_session(
    endpoint: &Arc<Endpoint>,
    listener: &TcpListener,
    sink: &TemplateSink,
) -> Result<(), SessionError> {
    let local = ResultExt::context(listener.local_addr(), IoSnafu)?;

    info!(
        "Waiting for a downstream miner on {local} for {}",
        endpoint.pool_name
    );

    let (downstream, peer) = ResultExt::context(listener.accept().await, IoSnafu)?;

    info!("Accepted downstream miner from {peer}");

    let upstream = connect(endpoint).await?;

    info!(
        "Relaying between {peer} and {} ({})",
        endpoint.pool_name, endpoint.url
    );

    let (upstream_read, mut upstream_write) = upstream.into_split();
    let (downstream_read, mut downstream_write) = downstream.into_split();

    let mut upstream_frames = FrameBuffer::new(upstream_read);
    let mut downstream_frames = FrameBuffer::new(downstream_read);

    let mut extranonce1: Option<String> = None;
    let mut extranonce2_length: Option<i64> = None;

    loop {
        tokio::select! {
            frame = upstream_frames.read_frame() => {
                let frame = frame?;

                ResultExt::context(downstream_write.write_all(&frame).await, IoSnafu)?;
                ResultExt::context(downstream_write.write_all(b"\n").await, IoSnafu)?;
                ResultExt::context(downstream_write.flush().await, IoSnafu)?;

                match serde_json::from_slice::<Message>(&frame) {
                    Ok(Message::Notification { method, params }) if method == "mining.notify" => {
                        match serde_json::from_value::<Notify>(params) {
                            Ok(notify) => {
                                let template = NotifyTemplate::record(
                                    notify,
                                    &endpoint.pool_name,
                                    extranonce1.as_deref(),
                                    extranonce2_length,
                                );

                                sink.emit(template).await;
                            }
                            Err(err) => warn!("Failed to parse relayed mining.notify: {err}"),
                        }
                    }
                    Ok(Message::Response { result: Some(result), .. }) => {
                        if let Some(subscribed) = SubscribeResult::from_result(&result) {
                            extranonce1 = Some(subscribed.extranonce1);
                            extranonce2_length = Some(subscribed.extranonce2_length);
                        }
                    }
                    _ => {}
                }
            }

            frame = downstream_frames.read_frame() => {
                let frame = frame?;

                ResultExt::context(upstream_write.write_all(&frame).await, IoSnafu)?;
                ResultExt::context(upstream_write.write_all(b"\n").await, IoSnafu)?;
                ResultExt::context(upstream_write.flush().await, IoSnafu)?;
            }

            _ = sleep(READ_TIMEOUT) => {
                return Err(SessionError::ConnectionLost);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_frames_accumulate_into_one_message() {
        let (mut sender, receiver) = tokio::io::duplex(64);
        let mut frames = FrameBuffer::new(receiver);

        sender.write_all(b"{\"method\":\"mining.not").await.unwrap();

        let pending = timeout(Duration::from_millis(50), frames.read_frame()).await;
        assert!(pending.is_err(), "no frame before the newline arrives");

        sender.write_all(b"ify\",\"params\":[]}\n").await.unwrap();

        let frame = frames.read_frame().await.unwrap();
        assert_eq!(frame, b"{\"method\":\"mining.notify\",\"params\":[]}");
    }

    #[tokio::test]
    async fn multiple_frames_in_one_read() {
        let (mut sender, receiver) = tokio::io::duplex(256);
        let mut frames = FrameBuffer::new(receiver);

        sender.write_all(b"first\nsecond\n").await.unwrap();

        assert_eq!(frames.read_frame().await.unwrap(), b"first");
        assert_eq!(frames.read_frame().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn zero_byte_read_is_connection_lost() {
        let (sender, receiver) = tokio::io::duplex(64);
        drop(sender);

        let mut frames = FrameBuffer::new(receiver);

        assert!(matches!(
            frames.read_frame().await,
            Err(SessionError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn carriage_returns_are_preserved() {
        let (mut sender, receiver) = tokio::io::duplex(64);
        let mut frames = FrameBuffer::new(receiver);

        sender.write_all(b"line\r\n").await.unwrap();

        assert_eq!(frames.read_frame().await.unwrap(), b"line\r");
    }
}
