use {
    super::*,
    zeromq::{Socket, SocketRecv, SubSocket},
};

pub(crate) struct Zmq {
    socket: SubSocket,
}

impl Zmq {
    pub(crate) async fn connect(endpoint: &str) -> Result<Self> {
        info!("Subscribing to rawblock on ZMQ endpoint {endpoint}");

        let socket = match timeout(Duration::from_secs(5), async {
            let mut socket = SubSocket::new();

            socket
                .connect(endpoint)
                .await
                .with_context(|| format!("failed to connect to ZMQ endpoint `{endpoint}`"))?;

            socket
                .subscribe("rawblock")
                .await
                .with_context(|| format!("failed to subscribe to rawblock on `{endpoint}`"))?;

            Ok::<_, Error>(socket)
        })
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return Err(err),
            Err(_) => bail!(
                "timed out connecting to ZMQ endpoint `{endpoint}` - ensure bitcoind is running with `-zmqpubrawblock={endpoint}`"
            ),
        };

        Ok(Self { socket })
    }

    /// Receives one raw block frame and returns its display hash. Socket
    /// faults surface as [`zeromq::ZmqError`] so the listener can tell a
    /// dead socket from a malformed frame.
    pub(crate) async fn recv_block_hash(&mut self) -> Result<String> {
        let message = self.socket.recv().await?;

        ensure!(
            message.len() >= 2,
            "rawblock: expected at least 2 frames, got {}",
            message.len()
        );

        let topic = message.get(0).context("rawblock: missing topic")?;

        ensure!(topic.as_ref() == b"rawblock", "rawblock: wrong topic");

        let body = message.get(1).context("rawblock: missing body")?;

        block_hash_from_raw(body.as_ref())
    }
}

/// Display hash of a serialized block: double-SHA256 over the 80-byte
/// header, hex-encoded after byte reversal. The `bitcoin` crate's `Display`
/// already prints block hashes reversed.
pub(crate) fn block_hash_from_raw(raw: &[u8]) -> Result<String> {
    ensure!(raw.len() >= 80, "rawblock: body len {}", raw.len());

    let header: Header =
        consensus::encode::deserialize(&raw[..80]).context("rawblock: header decode")?;

    Ok(header.block_hash().to_string())
}
