use super::*;

/// One captured `mining.notify` job, enriched with the session's extranonce
/// grant and the height recovered from the reconstructed coinbase. Persisted
/// once and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyTemplate {
    #[serde(rename = "_id")]
    pub id: String,
    pub timestamp: String,
    pub pool_name: String,
    pub height: u64,
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
    pub extranonce1: Option<String>,
    pub extranonce2_length: Option<i64>,
}

impl NotifyTemplate {
    pub fn record(
        notify: Notify,
        pool_name: &str,
        extranonce1: Option<&str>,
        extranonce2_length: Option<i64>,
    ) -> Self {
        let height = coinbase::template_height(
            &notify.coinbase1,
            extranonce1.unwrap_or_default(),
            extranonce2_length.unwrap_or_default(),
            &notify.coinbase2,
        );

        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: capture_timestamp(),
            pool_name: pool_name.into(),
            height,
            job_id: notify.job_id,
            prev_hash: notify.prev_hash,
            coinbase1: notify.coinbase1,
            coinbase2: notify.coinbase2,
            merkle_branches: notify.merkle_branches,
            version: notify.version,
            nbits: notify.nbits,
            ntime: notify.ntime,
            clean_jobs: notify.clean_jobs,
            extranonce1: extranonce1.map(str::to_string),
            extranonce2_length,
        }
    }
}

/// Arrival time as hex-encoded nanoseconds since the epoch, no `0x` prefix.
fn capture_timestamp() -> String {
    format!(
        "{:x}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    )
}

/// Where captured templates go: the document store when historical data is
/// enabled, and always the fan-out bus. A failure on either leg never stops
/// the other.
pub(crate) struct TemplateSink {
    pub(crate) store: Option<Store>,
    pub(crate) publisher: Arc<Publisher>,
}

impl TemplateSink {
    pub(crate) async fn emit(&self, template: NotifyTemplate) {
        info!(
            "Template from {} at height {} (job {}, clean_jobs={})",
            template.pool_name, template.height, template.job_id, template.clean_jobs
        );

        if let Some(store) = &self.store {
            if let Err(err) = store.insert_notify(&template).await {
                error!("Failed to persist template {}: {err:#}", template.id);
            }
        }

        match Envelope::notify(&template) {
            Ok(envelope) => {
                if let Err(err) = self.publisher.publish(&envelope).await {
                    error!("Failed to publish template {}: {err:#}", template.id);
                }
            }
            Err(err) => error!("Failed to encode template {}: {err:#}", template.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify() -> Notify {
        Notify {
            job_id: "bf".into(),
            prev_hash: "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000".into(),
            coinbase1: "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008".into(),
            coinbase2: "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000".into(),
            merkle_branches: Vec::new(),
            version: "00000002".into(),
            nbits: "1c2ac4af".into(),
            ntime: "504e86b9".into(),
            clean_jobs: false,
        }
    }

    #[test]
    fn derived_height_matches_reconstruction() {
        let template = NotifyTemplate::record(notify(), "Slush Pool", Some("08000002"), Some(4));

        assert_eq!(template.height, 25096);

        let rederived = coinbase::template_height(
            &template.coinbase1,
            template.extranonce1.as_deref().unwrap(),
            template.extranonce2_length.unwrap(),
            &template.coinbase2,
        );

        assert_eq!(rederived, template.height);
    }

    #[test]
    fn missing_extranonce_degrades_to_height_zero() {
        // without the extranonce region the script length no longer matches
        // and the reconstruction fails to parse as a transaction
        let template = NotifyTemplate::record(notify(), "Slush Pool", None, None);

        assert_eq!(template.height, 0);
        assert_eq!(template.extranonce1, None);
        assert_eq!(template.extranonce2_length, None);
    }

    #[test]
    fn capture_timestamp_is_bare_hex() {
        let timestamp = capture_timestamp();

        assert!(!timestamp.starts_with("0x"));
        assert!(u128::from_str_radix(&timestamp, 16).is_ok());
    }

    #[test]
    fn template_serializes_with_mongo_id_key() {
        let template = NotifyTemplate::record(notify(), "Slush Pool", Some("08000002"), Some(4));
        let value = serde_json::to_value(&template).unwrap();

        assert!(value.get("_id").is_some());
        assert!(value.get("id").is_none());
        assert_eq!(value["pool_name"], "Slush Pool");
        assert_eq!(value["extranonce2_length"], 4);
    }
}
