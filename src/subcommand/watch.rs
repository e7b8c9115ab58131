use {
    super::*,
    crate::{
        options::{BusOptions, StoreOptions},
        publisher::BusConfig,
        stratum::{SessionConfig, watch_endpoint},
        template::TemplateSink,
    },
};

#[derive(Debug, Parser)]
pub(crate) struct Watch {
    #[arg(
        long,
        env = "VIGIL_ENDPOINTS_FILE",
        help = "Load watched pool endpoints from <ENDPOINTS>."
    )]
    pub(crate) endpoints: PathBuf,

    #[arg(
        long,
        env = "VIGIL_KEEP_ALIVE",
        help = "Re-issue mining.subscribe every 480 seconds to keep idle sessions alive."
    )]
    pub(crate) keep_alive: bool,

    #[arg(
        long,
        env = "VIGIL_RETRY_DELAY",
        default_value = "5",
        help = "Wait <RETRY_DELAY> seconds between session reconnect attempts."
    )]
    pub(crate) retry_delay: u64,

    #[arg(
        long,
        env = "VIGIL_MAX_RETRIES",
        default_value = "5",
        help = "Report an endpoint unavailable after <MAX_RETRIES> consecutive failures."
    )]
    pub(crate) max_retries: u32,

    #[command(flatten)]
    pub(crate) store: StoreOptions,

    #[command(flatten)]
    pub(crate) bus: BusOptions,
}

impl Watch {
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result {
        let raw = std::fs::read_to_string(&self.endpoints)
            .with_context(|| format!("failed to read {}", self.endpoints.display()))?;

        let endpoints: Vec<Endpoint> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid endpoints in {}", self.endpoints.display()))?;

        ensure!(
            !endpoints.is_empty(),
            "no endpoints configured in {}",
            self.endpoints.display()
        );

        info!("Watching {} pool endpoints", endpoints.len());

        let store = if self.store.enable_historical_data {
            Some(Store::connect(&self.store).await?)
        } else {
            info!("Historical data disabled, skipping MongoDB connection");
            None
        };

        let publisher = Publisher::new(BusConfig::from(&self.bus));

        if let Err(err) = publisher.connect().await {
            error!("Message bus unavailable at boot, publishes will retry: {err:#}");
        }

        let sink = Arc::new(TemplateSink {
            store,
            publisher: publisher.clone(),
        });

        let config = SessionConfig {
            keep_alive: self.keep_alive,
            retry_delay: Duration::from_secs(self.retry_delay),
            max_retries: self.max_retries,
        };

        let mut tasks = JoinSet::new();

        tasks.spawn(publisher.clone().heartbeat(cancel.clone()));

        for endpoint in endpoints {
            let endpoint = Arc::new(endpoint);

            // a proxy endpoint that cannot bind its listen port is a
            // misconfiguration worth dying for
            let listener = match endpoint.listen_port {
                Some(port) => Some(
                    TcpListener::bind(("0.0.0.0", port))
                        .await
                        .with_context(|| {
                            format!(
                                "failed to bind proxy listen port {port} for {}",
                                endpoint.pool_name
                            )
                        })?,
                ),
                None => None,
            };

            info!(
                "Starting {} session for {} ({})",
                if listener.is_some() { "proxy" } else { "client" },
                endpoint.pool_name,
                endpoint.url
            );

            tasks.spawn(watch_endpoint(
                endpoint,
                listener,
                config.clone(),
                sink.clone(),
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;

        info!("Shutting down watcher, waiting for {} tasks", tasks.len());

        while tasks.join_next().await.is_some() {}

        publisher.close().await;

        info!("All watcher tasks stopped");

        Ok(())
    }
}
