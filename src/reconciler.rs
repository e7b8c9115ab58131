use {
    super::*,
    crate::{analysis::PoolIdentification, coinbase::CoinbaseData},
};

const BACKFILL_BATCH_SIZE: u64 = 5;
const BLOCK_DELAY: Duration = Duration::from_millis(500);
const BATCH_DELAY: Duration = Duration::from_secs(5);
const RANGE_COALESCE_THRESHOLD: usize = 100;
const REINDEX_PROGRESS_INTERVAL: u64 = 100;

/// Rebuilds a monotone chain view from the configured minimum height to tip
/// and keeps it attributed. Owns the reindex flag so at most one reindex
/// runs at a time.
pub(crate) struct Reconciler {
    rpc: Arc<RpcPool>,
    store: Store,
    publisher: Arc<Publisher>,
    rules: watch::Receiver<Arc<RuleSet>>,
    reindexing: AtomicBool,
    min_block_height: u64,
}

impl Reconciler {
    pub(crate) fn new(
        rpc: Arc<RpcPool>,
        store: Store,
        publisher: Arc<Publisher>,
        rules: watch::Receiver<Arc<RuleSet>>,
        min_block_height: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            store,
            publisher,
            rules,
            reindexing: AtomicBool::new(false),
            min_block_height,
        })
    }

    fn rules_snapshot(&self) -> Arc<RuleSet> {
        self.rules.borrow().clone()
    }

    /// Brings the store up to the node's tip, then fills any holes between
    /// the minimum height and the lowest persisted block.
    pub(crate) async fn backfill(&self) -> Result {
        let best_block_hash = self.rpc.best_block_hash().await?;
        let best_height = self.rpc.block_count().await?;

        debug!("Node tip is {best_block_hash} at height {best_height}");

        let highest = self.store.max_height().await?;
        let lowest = self.store.min_height().await?;

        match plan_tip_sync(best_height, highest, self.min_block_height) {
            Some((from, to)) => {
                info!("Syncing from tip ({from}) down to height {to}");
                self.sync_range(from, to).await;
            }
            None => info!("Already synced to tip at height {best_height}"),
        }

        if let Some(lowest) = lowest
            && lowest > self.min_block_height
        {
            info!(
                "Checking for missing blocks between {} and lowest processed block ({lowest})",
                self.min_block_height
            );

            let persisted = self
                .store
                .heights_in_range(self.min_block_height, lowest)
                .await?;

            let missing: Vec<u64> = (self.min_block_height..lowest)
                .filter(|height| !persisted.contains(height))
                .collect();

            if missing.is_empty() {
                info!("No missing blocks below the lowest processed block");
            } else if missing.len() > RANGE_COALESCE_THRESHOLD {
                let ranges = coalesce_ranges(&missing);

                info!(
                    "Found {} missing blocks, coalesced into {} consecutive ranges",
                    missing.len(),
                    ranges.len()
                );

                for (high, low) in ranges {
                    info!("Processing range from height {high} down to {low}");
                    self.sync_range(high, low).await;
                }
            } else {
                info!("Found {} missing blocks", missing.len());

                for batch in missing.chunks(BACKFILL_BATCH_SIZE as usize) {
                    for &height in batch {
                        if let Err(err) = self.sync_height(height).await {
                            error!("Error processing missing block at height {height}: {err:#}");
                        }
                        sleep(BLOCK_DELAY).await;
                    }

                    sleep(BATCH_DELAY).await;
                    self.rpc.reset();
                }
            }
        }

        info!("Block backfill completed successfully");

        Ok(())
    }

    /// Processes `[low, high]` top-down in batches of five, pacing between
    /// blocks and batches so the node gets room to breathe.
    async fn sync_range(&self, high: u64, low: u64) {
        let mut batch_start = high;

        loop {
            let batch_end = batch_start
                .saturating_sub(BACKFILL_BATCH_SIZE - 1)
                .max(low);

            info!("Processing batch of blocks from {batch_start} to {batch_end}");

            for height in (batch_end..=batch_start).rev() {
                if let Err(err) = self.sync_height(height).await {
                    error!("Error processing block at height {height}: {err:#}");
                }
                sleep(BLOCK_DELAY).await;
            }

            self.rpc.reset();

            if batch_end == low {
                break;
            }

            sleep(BATCH_DELAY).await;
            batch_start = batch_end - 1;
        }
    }

    async fn sync_height(&self, height: u64) -> Result {
        if self.store.block_exists_at_height(height).await? {
            debug!("Block at height {height} already processed, skipping");
            return Ok(());
        }

        let hash = self.rpc.block_hash(height).await?;

        info!("Syncing block at height {height} (hash: {hash})");

        self.process_block(&hash, false).await
    }

    /// Fetches, decodes, attributes, analyzes, persists, and publishes one
    /// block. A failing analysis never aborts persistence.
    pub(crate) async fn process_block(&self, hash: &str, live: bool) -> Result {
        let block = self.rpc.block_verbose(hash).await?;

        let height = block
            .get("height")
            .and_then(Value::as_u64)
            .context("block missing height")?;

        let timestamp = block.get("time").and_then(Value::as_i64).unwrap_or_default();

        let coinbase = coinbase::extract_coinbase(&block)?;

        let rules = self.rules_snapshot();
        let mining_pool = rules.identify(&coinbase.script_sig, &coinbase.addresses);
        let analyses = self.analyze(height, &rules, &coinbase).await;

        let record = BlockRecord {
            block_hash: hash.into(),
            height,
            timestamp,
            coinbase_script_sig: coinbase.script_sig,
            coinbase_addresses: coinbase.addresses,
            mining_pool,
            analyses,
        };

        if live {
            self.store.upsert_block(&record).await?;
        } else {
            self.store.insert_block(&record).await?;
        }

        info!(
            "{} block {height} ({hash}) mined by {}",
            if live { "Processed new" } else { "Synced" },
            record.mining_pool.name
        );

        self.publish_block(&record).await;

        Ok(())
    }

    async fn analyze(&self, height: u64, rules: &RuleSet, coinbase: &CoinbaseData) -> AnalysisBundle {
        let mut flags = Vec::new();

        match self.store.templates_at_height(height).await {
            Ok(templates) => {
                if let Some(flag) = analysis::prev_hash_fork(&templates) {
                    flags.push(flag);
                }

                if let Some(flag) = analysis::invalid_coinbase_no_merkle(&templates, height) {
                    flags.push(flag);
                }
            }
            Err(err) => {
                error!("Failed to load templates for height {height}: {err:#}");
            }
        }

        AnalysisBundle {
            flags,
            pool_identification: Some(analysis::pool_identification(
                rules,
                &coinbase.script_sig,
                &coinbase.addresses,
            )),
        }
    }

    async fn publish_block(&self, record: &BlockRecord) {
        match Envelope::block(record) {
            Ok(envelope) => {
                if let Err(err) = self.publisher.publish(&envelope).await {
                    error!("Failed to publish block {}: {err:#}", record.block_hash);
                }
            }
            Err(err) => error!("Failed to encode block {}: {err:#}", record.block_hash),
        }
    }

    /// Re-attributes every persisted block against the current rule-set
    /// snapshot, descending by height. Idempotent and at-most-once: a
    /// second call while one runs returns immediately.
    pub(crate) async fn reindex(&self) {
        if self.reindexing.swap(true, Ordering::SeqCst) {
            info!("Reindexing already in progress, skipping");
            return;
        }

        let result = self.reindex_inner().await;

        self.reindexing.store(false, Ordering::SeqCst);

        if let Err(err) = result {
            error!("Error during block reindexing: {err:#}");
        }
    }

    async fn reindex_inner(&self) -> Result {
        let rules = self.rules_snapshot();

        info!("Starting to reindex pool information for blocks");

        let mut cursor = self.store.blocks_descending().await?;
        let mut count = 0u64;

        while let Some(block) = cursor.try_next().await? {
            let mining_pool = rules.identify(&block.coinbase_script_sig, &block.coinbase_addresses);

            if mining_pool != block.mining_pool {
                info!(
                    "Updating pool for block {} from '{}' to '{}'",
                    block.block_hash, block.mining_pool.name, mining_pool.name
                );

                let mut updated = block;
                updated.analyses.pool_identification = Some(PoolIdentification::from_pool(
                    mining_pool.clone(),
                    updated.coinbase_addresses.clone(),
                ));
                updated.mining_pool = mining_pool;

                self.store.upsert_block(&updated).await?;
                self.publish_block(&updated).await;
            }

            count += 1;

            if count % REINDEX_PROGRESS_INTERVAL == 0 {
                info!("Reindexed pool info for {count} blocks");
            }
        }

        info!("Completed reindexing pool information for {count} blocks");

        Ok(())
    }
}

/// Decides the tip-down sync range: from the tip to just above the highest
/// persisted block, or all the way to the minimum height on a cold start.
pub(crate) fn plan_tip_sync(
    best_height: u64,
    max_persisted: Option<u64>,
    min_block_height: u64,
) -> Option<(u64, u64)> {
    match max_persisted {
        Some(highest) if highest < best_height => Some((best_height, highest + 1)),
        Some(_) => None,
        None => Some((best_height, min_block_height)),
    }
}

/// Coalesces an ascending list of missing heights into maximal consecutive
/// ranges, each returned as `(high, low)` ready for top-down processing.
pub(crate) fn coalesce_ranges(missing: &[u64]) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();

    let Some(&first) = missing.first() else {
        return ranges;
    };

    let mut low = first;
    let mut previous = first;

    for &height in &missing[1..] {
        if height != previous + 1 {
            ranges.push((previous, low));
            low = height;
        }
        previous = height;
    }

    ranges.push((previous, low));

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_sync_from_highest_persisted() {
        assert_eq!(plan_tip_sync(900_000, Some(899_990), 882_000), Some((900_000, 899_991)));
    }

    #[test]
    fn tip_sync_cold_start_goes_to_minimum_height() {
        assert_eq!(plan_tip_sync(900_000, None, 882_000), Some((900_000, 882_000)));
    }

    #[test]
    fn tip_sync_noop_when_caught_up() {
        assert_eq!(plan_tip_sync(900_000, Some(900_000), 882_000), None);
        assert_eq!(plan_tip_sync(900_000, Some(900_002), 882_000), None);
    }

    #[test]
    fn coalesce_empty() {
        assert!(coalesce_ranges(&[]).is_empty());
    }

    #[test]
    fn coalesce_single_run() {
        assert_eq!(coalesce_ranges(&[5, 6, 7]), vec![(7, 5)]);
    }

    #[test]
    fn coalesce_splits_on_gaps() {
        assert_eq!(
            coalesce_ranges(&[1, 2, 3, 7, 9, 10]),
            vec![(3, 1), (7, 7), (10, 9)]
        );
    }

    #[test]
    fn coalesce_singletons() {
        assert_eq!(coalesce_ranges(&[4]), vec![(4, 4)]);
        assert_eq!(coalesce_ranges(&[4, 8]), vec![(4, 4), (8, 8)]);
    }
}
