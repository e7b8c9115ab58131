use super::*;

#[derive(Debug, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub error_code: i32,
    pub message: String,
    pub traceback: Option<Value>,
}

impl Serialize for JsonRpcError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.error_code, &self.message, &self.traceback).serialize(serializer)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.traceback {
            Some(traceback) => write!(
                f,
                "Stratum error {}: {} (traceback: {})",
                self.error_code,
                self.message,
                serde_json::to_string(traceback).unwrap_or_else(|_| "<invalid traceback>".into())
            ),
            None => write!(f, "Stratum error {}: {}", self.error_code, self.message),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("connection timed out"))]
    Timeout,

    #[snafu(display("connection lost"))]
    ConnectionLost,

    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("SOCKS5 error: {source}"))]
    Socks { source: tokio_socks::Error },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("{message}"))]
    Handshake { message: String },
}
