use {
    super::*,
    crate::{
        options::{BusOptions, NodeOptions, RuleSetOptions, StoreOptions},
        pools::RuleSetManager,
        publisher::BusConfig,
        reconciler::Reconciler,
        zmq::Zmq,
    },
};

const BLOCK_WORKERS: usize = 2;
const ZMQ_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const ZMQ_MESSAGE_ERROR_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
pub(crate) struct Index {
    #[command(flatten)]
    pub(crate) node: NodeOptions,

    #[command(flatten)]
    pub(crate) store: StoreOptions,

    #[command(flatten)]
    pub(crate) bus: BusOptions,

    #[command(flatten)]
    pub(crate) rules: RuleSetOptions,

    #[arg(
        long,
        help = "Reindex pool attribution for all stored blocks in the background on boot."
    )]
    pub(crate) reindex_blocks: bool,
}

impl Index {
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result {
        let store = Store::connect(&self.store)
            .await
            .context("the indexer requires the document store")?;

        let publisher = Publisher::new(BusConfig::from(&self.bus));

        if let Err(err) = publisher.connect().await {
            error!("Message bus unavailable at boot, publishes will retry: {err:#}");
        }

        let rpc = Arc::new(RpcPool::new(&self.node));

        info!("Connecting to bitcoin RPC at {}", rpc.url());

        rpc.block_count()
            .await
            .context("unable to reach bitcoin RPC")?;

        let (manager, rules_rx) = RuleSetManager::new(&self.rules, store.clone())?;

        match manager.load().await {
            Ok(snapshot) => info!("Loaded rule set with {} pools", snapshot.len()),
            Err(err) => error!("Initial rule-set load failed, starting without rules: {err:#}"),
        }

        let reconciler = Reconciler::new(
            rpc,
            store.clone(),
            publisher.clone(),
            rules_rx.clone(),
            self.node.min_block_height,
        );

        let mut tasks = JoinSet::new();

        tasks.spawn(publisher.clone().heartbeat(cancel.clone()));

        tasks.spawn(manager.run(cancel.clone()));

        tasks.spawn(reindex_watcher(
            reconciler.clone(),
            rules_rx,
            store,
            cancel.clone(),
        ));

        tasks.spawn({
            let reconciler = reconciler.clone();
            let cancel = cancel.clone();

            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = reconciler.backfill() => {
                        if let Err(err) = result {
                            error!("Error during block sync: {err:#}");
                        }
                    }
                }
            }
        });

        tasks.spawn(zmq_listener(
            reconciler.clone(),
            self.node.zmq_block_notifications.clone(),
            cancel.clone(),
        ));

        if self.reindex_blocks {
            info!("Manual reindexing of blocks requested via command line");

            tasks.spawn({
                let reconciler = reconciler.clone();
                async move { reconciler.reindex().await }
            });
        }

        cancel.cancelled().await;

        info!("Shutting down indexer, waiting for {} tasks", tasks.len());

        while tasks.join_next().await.is_some() {}

        publisher.close().await;

        info!("All indexer tasks stopped");

        Ok(())
    }
}

/// Reacts to rule-set snapshot changes: any hash change after boot, with
/// blocks on record, schedules a background reindex.
async fn reindex_watcher(
    reconciler: Arc<Reconciler>,
    mut rules_rx: tokio::sync::watch::Receiver<Arc<RuleSet>>,
    store: Store,
    cancel: CancellationToken,
) {
    let mut last_hash = rules_rx.borrow_and_update().hash().to_string();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rules_rx.changed() => {
                if changed.is_err() {
                    break;
                }

                let snapshot = rules_rx.borrow_and_update().clone();

                if snapshot.hash() == last_hash {
                    continue;
                }

                last_hash = snapshot.hash().to_string();

                match store.count_blocks().await {
                    Ok(0) => debug!("Rule set changed but no blocks are stored yet"),
                    Ok(_) => {
                        info!("Pool definitions changed, scheduling reindexing of blocks");

                        let reconciler = reconciler.clone();
                        tokio::spawn(async move { reconciler.reindex().await });
                    }
                    Err(err) => error!("Could not count stored blocks: {err:#}"),
                }
            }
        }
    }
}

/// Tails the node's rawblock feed and hands each block to a bounded worker
/// pool. Socket faults reconnect after a pause; malformed frames are logged
/// and skipped.
async fn zmq_listener(reconciler: Arc<Reconciler>, endpoint: String, cancel: CancellationToken) {
    let workers = Arc::new(Semaphore::new(BLOCK_WORKERS));

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match Zmq::connect(&endpoint).await {
            Ok(mut zmq) => {
                info!("ZMQ listener connected to {endpoint}");

                loop {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = zmq.recv_block_hash() => result,
                    };

                    match result {
                        Ok(hash) => {
                            info!("ZMQ received new block: {hash}");

                            let Ok(permit) = workers.clone().acquire_owned().await else {
                                return;
                            };

                            let reconciler = reconciler.clone();

                            tokio::spawn(async move {
                                if let Err(err) = reconciler.process_block(&hash, true).await {
                                    error!("Error processing block {hash}: {err:#}");
                                }
                                drop(permit);
                            });
                        }
                        Err(err) => {
                            if err.downcast_ref::<zeromq::ZmqError>().is_some() {
                                error!("ZMQ connection error: {err:#}");
                                break;
                            }

                            error!("Error processing ZMQ message: {err:#}");

                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = sleep(ZMQ_MESSAGE_ERROR_DELAY) => {}
                            }
                        }
                    }
                }
            }
            Err(err) => error!("ZMQ connection error: {err:#}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(ZMQ_RECONNECT_DELAY) => {}
        }
    }
}
