use super::*;

/// The pool a block or template was attributed to. `Unknown` is a real
/// value, not an error: plenty of blocks carry no recognizable mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningPool {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identification_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datum_template_creator: Option<String>,
}

impl MiningPool {
    pub fn unknown() -> Self {
        Self {
            id: "unknown".into(),
            name: "Unknown".into(),
            slug: "unknown".into(),
            link: None,
            match_type: None,
            identification_method: None,
            datum_template_creator: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.id == "unknown"
    }

    pub fn is_ocean(&self) -> bool {
        [&self.id, &self.name, &self.slug]
            .iter()
            .any(|field| field.to_lowercase() == "ocean")
    }
}

/// One observed block, keyed by hash. Overwritten whole on reindex, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_hash: String,
    pub height: u64,
    pub timestamp: i64,
    pub coinbase_script_sig: String,
    pub coinbase_addresses: Vec<String>,
    pub mining_pool: MiningPool,
    #[serde(default)]
    pub analyses: AnalysisBundle,
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn unknown_pool_shape() {
        let pool = MiningPool::unknown();

        assert!(pool.is_unknown());
        assert!(!pool.is_ocean());

        let value = serde_json::to_value(&pool).unwrap();
        assert_eq!(value["id"], "unknown");
        assert_eq!(value["name"], "Unknown");
        assert!(value.get("match_type").is_none());
    }

    #[test]
    fn ocean_detection_is_exact_and_case_insensitive() {
        let mut pool = MiningPool::unknown();
        assert!(!pool.is_ocean());

        pool.slug = "OCEAN".into();
        assert!(pool.is_ocean());

        pool.slug = "oceanic".into();
        assert!(!pool.is_ocean());

        pool.name = "Ocean".into();
        assert!(pool.is_ocean());
    }

    #[test]
    fn block_record_roundtrip() {
        let record = BlockRecord {
            block_hash: "00".repeat(32),
            height: 882123,
            timestamp: 1_736_000_000,
            coinbase_script_sig: "03cb750d".into(),
            coinbase_addresses: vec!["addr_big".into(), "addr_small".into()],
            mining_pool: MiningPool::unknown(),
            analyses: AnalysisBundle::default(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: BlockRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(back, record);
    }
}
