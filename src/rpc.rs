use {
    super::*,
    crate::options::NodeOptions,
    bitcoincore_rpc::{Client, RpcApi, jsonrpc},
};

/// Error substrings that mean the node-side connection state is suspect and
/// the next attempt should start from a forced reset.
const RESET_ERRORS: [&str; 6] = [
    "connection",
    "timeout",
    "refused",
    "reset",
    "broken pipe",
    "eof",
];

const RPC_ATTEMPTS: u32 = 5;
const RPC_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RESET_COOLDOWN: Duration = Duration::from_secs(5);

/// Node RPC access. Connections are created fresh for every call and
/// disposed afterwards; long-lived keep-alive connections to bitcoind have
/// proven to go stale under us.
pub(crate) struct RpcPool {
    url: String,
    username: String,
    password: String,
    timeout: Duration,
    last_reset: std::sync::Mutex<Option<Instant>>,
}

impl RpcPool {
    pub(crate) fn new(options: &NodeOptions) -> Self {
        Self {
            url: format!(
                "http://{}:{}",
                options.bitcoin_rpc_host, options.bitcoin_rpc_port
            ),
            username: options.bitcoin_rpc_username.clone(),
            password: options.bitcoin_rpc_password.clone(),
            timeout: Duration::from_secs(options.bitcoin_rpc_timeout),
            last_reset: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    fn client(
        url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> bitcoincore_rpc::Result<Client> {
        let transport = jsonrpc::simple_http::Builder::new()
            .url(url)
            .map_err(|err| bitcoincore_rpc::Error::JsonRpc(err.into()))?
            .timeout(timeout)
            .auth(username, Some(password))
            .build();

        Ok(Client::from_jsonrpc(jsonrpc::Client::with_transport(
            transport,
        )))
    }

    /// Runs one RPC call with up to five attempts, doubling delay and ±20%
    /// jitter. Connection-class failures force a cooldown-gated reset
    /// between attempts.
    async fn call<T, F>(&self, description: &str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Client) -> bitcoincore_rpc::Result<T> + Clone + Send + 'static,
    {
        let mut delay = RPC_INITIAL_DELAY;
        let mut last_error = None;

        for attempt in 1..=RPC_ATTEMPTS {
            let url = self.url.clone();
            let username = self.username.clone();
            let password = self.password.clone();
            let timeout = self.timeout;
            let call = call.clone();

            let outcome = task::spawn_blocking(move || {
                let client = Self::client(&url, &username, &password, timeout)?;
                call(&client)
            })
            .await
            .context("RPC worker panicked")?;

            match outcome {
                Ok(value) => {
                    debug!("RPC call {description} succeeded on attempt {attempt}");
                    return Ok(value);
                }
                Err(err) => {
                    let message = err.to_string();
                    error!("RPC error during {description} (attempt {attempt}): {message}");

                    let lowered = message.to_lowercase();
                    if message.contains("generator didn't yield")
                        || RESET_ERRORS
                            .iter()
                            .any(|fragment| lowered.contains(fragment))
                    {
                        self.reset();
                    }

                    last_error = Some(err);

                    if attempt < RPC_ATTEMPTS {
                        let jitter = rand::rng().random_range(0.8..1.2);
                        let adjusted = delay.mul_f64(jitter);
                        info!("Retrying {description} in {:.2} seconds", adjusted.as_secs_f64());
                        sleep(adjusted).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(Error::from(last_error.expect("attempts exhausted with no error"))
            .context(format!("RPC call {description} failed after {RPC_ATTEMPTS} attempts")))
    }

    /// With fresh-per-call connections a reset only marks the event, but it
    /// stays cooldown-gated so error storms cannot log-spam.
    pub(crate) fn reset(&self) {
        let mut last = self.last_reset.lock().unwrap();

        if let Some(at) = *last
            && at.elapsed() < RESET_COOLDOWN
        {
            debug!("RPC pool reset in cooldown period, skipping");
            return;
        }

        *last = Some(Instant::now());
        warn!("Resetting RPC connection pool");
    }

    pub(crate) async fn best_block_hash(&self) -> Result<String> {
        self.call("getbestblockhash", |client| client.get_best_block_hash())
            .await
            .map(|hash| hash.to_string())
    }

    pub(crate) async fn block_hash(&self, height: u64) -> Result<String> {
        self.call("getblockhash", move |client| client.get_block_hash(height))
            .await
            .map(|hash| hash.to_string())
    }

    pub(crate) async fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", |client| client.get_block_count())
            .await
    }

    /// `getblock <hash> 2`: full block JSON with decoded transactions.
    pub(crate) async fn block_verbose(&self, hash: &str) -> Result<Value> {
        let hash = hash.to_string();

        self.call("getblock", move |client| {
            client.call("getblock", &[json!(hash), json!(2)])
        })
        .await
    }
}
