use {super::*, std::collections::BTreeSet};

pub(crate) const SUBSIDY_HALVING_INTERVAL: u64 = 210_000;

/// Protocol subsidy in satoshis at a given height. Zero once the shift
/// exhausts the 50 BTC base.
pub(crate) fn subsidy_sats(height: u64) -> u64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;

    if halvings >= 64 {
        return 0;
    }

    (50 * COIN_VALUE) >> halvings
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkGroup {
    pub prev_hash: String,
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkDetails {
    pub groups: Vec<ForkGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offender {
    pub pool_name: String,
    pub total_sats: u64,
    pub subsidy_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffenderDetails {
    pub offenders: Vec<Offender>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum AnalysisFlag {
    PrevHashFork { icon: String, details: ForkDetails },
    InvalidCoinbaseNoMerkle { icon: String, details: OffenderDetails },
}

/// Identification output carried alongside a published block so consumers
/// see not just the verdict but what it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolIdentification {
    pub mining_pool: MiningPool,
    pub method: String,
    pub addresses_considered: Vec<String>,
}

impl PoolIdentification {
    pub(crate) fn from_pool(mining_pool: MiningPool, addresses_considered: Vec<String>) -> Self {
        let method = mining_pool
            .identification_method
            .clone()
            .unwrap_or_else(|| "none".into());

        Self {
            mining_pool,
            method,
            addresses_considered,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    pub flags: Vec<AnalysisFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_identification: Option<PoolIdentification>,
}

/// Flags a height where concurrently observed templates disagree on the
/// previous block. Templates with an empty prev_hash are skipped.
pub(crate) fn prev_hash_fork(templates: &[NotifyTemplate]) -> Option<AnalysisFlag> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for template in templates {
        let prev_hash = template.prev_hash.to_lowercase();

        if prev_hash.is_empty() {
            continue;
        }

        groups
            .entry(prev_hash)
            .or_default()
            .insert(template.pool_name.clone());
    }

    if groups.len() <= 1 {
        return None;
    }

    info!(
        "Analysis(prev_hash_fork): {} distinct prev_hash values found",
        groups.len()
    );

    Some(AnalysisFlag::PrevHashFork {
        icon: "fork".into(),
        details: ForkDetails {
            groups: groups
                .into_iter()
                .map(|(prev_hash, pools)| ForkGroup {
                    prev_hash,
                    pools: pools.into_iter().collect(),
                })
                .collect(),
        },
    })
}

/// A template claiming an empty merkle branch list mines a block containing
/// only its coinbase, so the coinbase may pay at most the subsidy. Paying
/// more is provably invalid.
pub(crate) fn invalid_coinbase_no_merkle(
    templates: &[NotifyTemplate],
    height: u64,
) -> Option<AnalysisFlag> {
    let subsidy_sats = subsidy_sats(height);
    let mut offenders = Vec::new();

    for template in templates {
        if !template.merkle_branches.is_empty() {
            continue;
        }

        let raw = coinbase::reconstruct_hex(
            &template.coinbase1,
            template.extranonce1.as_deref().unwrap_or_default(),
            template.extranonce2_length.unwrap_or_default(),
            &template.coinbase2,
        );

        let total_sats = match coinbase::decode_transaction(&raw) {
            Ok(transaction) => coinbase::total_output_sats(&transaction),
            Err(_) => 0,
        };

        if total_sats > subsidy_sats {
            offenders.push(Offender {
                pool_name: template.pool_name.clone(),
                total_sats,
                subsidy_sats,
            });
        }
    }

    if offenders.is_empty() {
        return None;
    }

    warn!(
        "Analysis(invalid_coinbase_no_merkle): {} offending templates found at height {height} (subsidy={subsidy_sats})",
        offenders.len(),
    );

    Some(AnalysisFlag::InvalidCoinbaseNoMerkle {
        icon: "error".into(),
        details: OffenderDetails { offenders },
    })
}

pub(crate) fn pool_identification(
    rules: &RuleSet,
    script_sig_hex: &str,
    addresses: &[String],
) -> PoolIdentification {
    let mining_pool = rules.identify(script_sig_hex, addresses);

    PoolIdentification::from_pool(mining_pool, addresses.to_vec())
}
