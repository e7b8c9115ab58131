use {
    super::*,
    crate::options::RuleSetOptions,
    backon::{ExponentialBuilder, Retryable},
    regex::{Regex, RegexBuilder},
};

/// One pool as published by the rule-set source. `addresses` beat `tags`
/// beat `regexes` when identifying, see [`RuleSet::identify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDefinition {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub regexes: Vec<String>,
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(de::Error::custom(format!("invalid pool id: {other}"))),
    }
}

impl PoolDefinition {
    fn slug_or_default(&self) -> String {
        self.slug
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase().replace(' ', "-"))
    }

    fn matched(&self, method: &str) -> MiningPool {
        MiningPool {
            id: self.id.clone(),
            name: self.name.clone(),
            slug: self.slug_or_default(),
            link: self.link.clone(),
            match_type: Some(method.into()),
            identification_method: Some(method.into()),
            datum_template_creator: None,
        }
    }
}

struct PoolRule {
    definition: PoolDefinition,
    addresses: HashSet<String>,
    regexes: Vec<Regex>,
}

/// An immutable snapshot of the active rule set. Readers clone the `Arc`
/// off a watch channel and never see a partially applied reload.
pub struct RuleSet {
    rules: Vec<PoolRule>,
    hash: String,
}

impl RuleSet {
    pub fn new(definitions: Vec<PoolDefinition>) -> Self {
        let hash = stable_hash(&definitions);

        let rules = definitions
            .into_iter()
            .map(|definition| {
                let addresses = definition.addresses.iter().cloned().collect();

                let regexes = definition
                    .regexes
                    .iter()
                    .filter_map(|pattern| {
                        match RegexBuilder::new(pattern).case_insensitive(true).build() {
                            Ok(regex) => Some(regex),
                            Err(err) => {
                                warn!(
                                    "Skipping invalid regex {pattern:?} for pool {}: {err}",
                                    definition.id
                                );
                                None
                            }
                        }
                    })
                    .collect();

                PoolRule {
                    definition,
                    addresses,
                    regexes,
                }
            })
            .collect();

        Self { rules, hash }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Strict cascade: address match, then literal coinbase tag, then regex.
    /// Ties within a tier go to the pool listed first. An OCEAN match is
    /// enriched with the DATUM template creator when one is embedded.
    pub fn identify(&self, script_sig_hex: &str, addresses: &[String]) -> MiningPool {
        let matched = self
            .identify_by_address(addresses)
            .or_else(|| self.identify_by_tag(script_sig_hex));

        let Some(mut pool) = matched else {
            return MiningPool::unknown();
        };

        if pool.is_ocean()
            && let Some(creator) = coinbase::datum_template_creator(script_sig_hex)
        {
            pool.datum_template_creator = Some(creator);
        }

        pool
    }

    fn identify_by_address(&self, addresses: &[String]) -> Option<MiningPool> {
        if addresses.is_empty() {
            return None;
        }

        for rule in &self.rules {
            if addresses
                .iter()
                .any(|address| rule.addresses.contains(address))
            {
                return Some(rule.definition.matched("address"));
            }
        }

        None
    }

    fn identify_by_tag(&self, script_sig_hex: &str) -> Option<MiningPool> {
        let text = coinbase::script_sig_text(script_sig_hex);

        if text.is_empty() {
            return None;
        }

        for rule in &self.rules {
            if rule.definition.tags.iter().any(|tag| text.contains(tag)) {
                return Some(rule.definition.matched("tag"));
            }
        }

        for rule in &self.rules {
            if rule.regexes.iter().any(|regex| regex.is_match(&text)) {
                return Some(rule.definition.matched("tag"));
            }
        }

        None
    }
}

/// Hash of the canonical (recursively key-sorted) JSON rendering, so a
/// reload is a change iff the content actually changed.
pub(crate) fn stable_hash(definitions: &[PoolDefinition]) -> String {
    let value = serde_json::to_value(definitions).unwrap_or(Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    sha256::Hash::hash(canonical.as_bytes()).to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let entries: BTreeMap<&String, &Value> = map.iter().collect();
            for (i, (key, entry)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(entry, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

const FAILURE_COOLDOWN: Duration = Duration::from_secs(3600);

/// Loads the rule set with a three-stage fallback (HTTP, local file, store)
/// and publishes immutable snapshots on a watch channel.
pub(crate) struct RuleSetManager {
    url: String,
    local_file: PathBuf,
    update_interval: Duration,
    store: Store,
    http: reqwest::Client,
    tx: watch::Sender<Arc<RuleSet>>,
}

impl RuleSetManager {
    pub(crate) fn new(
        options: &RuleSetOptions,
        store: Store,
    ) -> Result<(Self, watch::Receiver<Arc<RuleSet>>)> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        let (tx, rx) = watch::channel(Arc::new(RuleSet::empty()));

        Ok((
            Self {
                url: options.pool_list_url.clone(),
                local_file: options.local_pool_file.clone(),
                update_interval: Duration::from_secs(options.pool_update_interval),
                store,
                http,
                tx,
            },
            rx,
        ))
    }

    async fn fetch_remote(&self) -> Result<Vec<PoolDefinition>> {
        info!("Fetching pool definitions from {}", self.url);

        let fetch = || async {
            let response = self.http.get(&self.url).send().await?.error_for_status()?;
            Ok::<_, Error>(response.json::<Vec<PoolDefinition>>().await?)
        };

        fetch
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(5))
                    .with_factor(2.0)
                    .with_max_times(2),
            )
            .sleep(sleep)
            .notify(|err: &Error, delay: Duration| {
                warn!("Error fetching pool definitions (retrying in {delay:?}): {err:#}");
            })
            .await
    }

    fn load_local(&self) -> Result<Vec<PoolDefinition>> {
        let raw = std::fs::read_to_string(&self.local_file)
            .with_context(|| format!("failed to read {}", self.local_file.display()))?;

        serde_json::from_str(&raw)
            .with_context(|| format!("invalid pool definitions in {}", self.local_file.display()))
    }

    /// Runs one load cycle and publishes the snapshot. Errors only when all
    /// three stages fail, in which case the previous snapshot stays active.
    pub(crate) async fn load(&self) -> Result<Arc<RuleSet>> {
        let definitions = match self.fetch_remote().await {
            Ok(definitions) => {
                info!(
                    "Successfully loaded {} mining pool definitions from {}",
                    definitions.len(),
                    self.url
                );
                self.mirror(&definitions).await;
                definitions
            }
            Err(err) => {
                error!("Failed to fetch pool definitions: {err:#}");

                match self.load_local() {
                    Ok(definitions) => {
                        info!(
                            "Successfully loaded {} mining pool definitions from local file",
                            definitions.len()
                        );
                        self.mirror(&definitions).await;
                        definitions
                    }
                    Err(file_err) => {
                        warn!("{file_err:#}, falling back to the store");
                        let definitions = self
                            .store
                            .load_pools()
                            .await
                            .context("failed to load pool definitions from the store")?;
                        info!(
                            "Loaded {} mining pool definitions from the store",
                            definitions.len()
                        );
                        definitions
                    }
                }
            }
        };

        let current = self.tx.borrow().clone();

        if definitions.is_empty() && !current.is_empty() {
            warn!("Refusing to replace {} pool definitions with an empty set", current.len());
            return Ok(current);
        }

        let snapshot = Arc::new(RuleSet::new(definitions));

        if current.hash() != snapshot.hash() {
            if !current.is_empty() {
                info!(
                    "Pool definitions changed (hash {} -> {})",
                    current.hash(),
                    snapshot.hash()
                );
            }
            self.tx.send_replace(snapshot.clone());
            return Ok(snapshot);
        }

        Ok(current)
    }

    async fn mirror(&self, definitions: &[PoolDefinition]) {
        if let Err(err) = self.store.replace_pools(definitions).await {
            warn!("Could not update pools collection: {err:#}");
        }
    }

    /// Periodic reload loop. The boot-time load is the caller's job; this
    /// sleeps first, then reloads, with a shortened cool-down after failures.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut wait = self.update_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }

            info!("Checking for updates to mining pool definitions");

            wait = match self.load().await {
                Ok(_) => self.update_interval,
                Err(err) => {
                    error!("Error in pool updater task: {err:#}");
                    FAILURE_COOLDOWN.min(self.update_interval)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, name: &str) -> PoolDefinition {
        PoolDefinition {
            id: id.into(),
            name: name.into(),
            slug: None,
            link: None,
            addresses: Vec::new(),
            tags: Vec::new(),
            regexes: Vec::new(),
        }
    }

    fn tag_hex(tag: &str) -> String {
        hex::encode(tag.as_bytes())
    }

    #[test]
    fn address_match_beats_tag_match() {
        let mut tagger = definition("tagger", "Tagger");
        tagger.tags = vec!["/mined by tagger/".into()];

        let mut addressed = definition("addressed", "Addressed");
        addressed.addresses = vec!["bc1qpayout".into()];

        let rules = RuleSet::new(vec![tagger, addressed]);

        let pool = rules.identify(&tag_hex("/mined by tagger/"), &["bc1qpayout".into()]);

        assert_eq!(pool.id, "addressed");
        assert_eq!(pool.identification_method.as_deref(), Some("address"));
        assert_eq!(pool.match_type.as_deref(), Some("address"));
    }

    #[test]
    fn literal_tag_beats_regex() {
        let mut by_regex = definition("by-regex", "By Regex");
        by_regex.regexes = vec!["mined.by".into()];

        let mut by_tag = definition("by-tag", "By Tag");
        by_tag.tags = vec!["mined by".into()];

        let rules = RuleSet::new(vec![by_regex, by_tag]);

        let pool = rules.identify(&tag_hex("block mined by someone"), &[]);

        assert_eq!(pool.id, "by-tag");
        assert_eq!(pool.identification_method.as_deref(), Some("tag"));
    }

    #[test]
    fn ties_resolve_by_rule_set_order() {
        let mut first = definition("first", "First");
        first.addresses = vec!["shared".into()];

        let mut second = definition("second", "Second");
        second.addresses = vec!["shared".into()];

        let rules = RuleSet::new(vec![first, second]);

        assert_eq!(rules.identify("", &["shared".into()]).id, "first");
    }

    #[test]
    fn regex_matching_is_case_insensitive() {
        let mut pool = definition("shouty", "Shouty");
        pool.regexes = vec!["^.*SHOUTY.*$".into()];

        let rules = RuleSet::new(vec![pool]);

        assert_eq!(rules.identify(&tag_hex("very shouty pool"), &[]).id, "shouty");
    }

    #[test]
    fn invalid_regexes_are_skipped() {
        let mut pool = definition("broken", "Broken");
        pool.regexes = vec!["[unclosed".into(), "fine".into()];

        let rules = RuleSet::new(vec![pool]);

        assert_eq!(rules.identify(&tag_hex("this is fine"), &[]).id, "broken");
    }

    #[test]
    fn no_match_is_unknown() {
        let rules = RuleSet::new(vec![definition("a", "A")]);
        let pool = rules.identify(&tag_hex("nothing to see"), &["bc1qunheard".into()]);

        assert!(pool.is_unknown());
        assert_eq!(pool.name, "Unknown");
        assert_eq!(pool.identification_method, None);
    }

    #[test]
    fn slug_falls_back_to_hyphenated_name() {
        let mut pool = definition("foo", "Foo Bar Pool");
        pool.tags = vec!["foo".into()];

        let rules = RuleSet::new(vec![pool]);

        assert_eq!(rules.identify(&tag_hex("foo"), &[]).slug, "foo-bar-pool");
    }

    #[test]
    fn ocean_matches_carry_the_datum_creator() {
        let mut ocean = definition("ocean", "OCEAN");
        ocean.tags = vec!["OCEAN".into()];

        let rules = RuleSet::new(vec![ocean]);

        // height push, then a tag region naming OCEAN and a creator
        let mut script = vec![0x03, 0xe0, 0x75, 0x0d];
        let tag = b"OCEAN\x0fsolo rig".to_vec();
        script.push(u8::try_from(tag.len()).unwrap());
        script.extend_from_slice(&tag);

        let pool = rules.identify(&hex::encode(script), &[]);

        assert_eq!(pool.id, "ocean");
        assert_eq!(pool.datum_template_creator.as_deref(), Some("solo rig"));
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let parsed: PoolDefinition =
            serde_json::from_str(r#"{"id": 43, "name": "Numbered"}"#).unwrap();

        assert_eq!(parsed.id, "43");
    }

    #[test]
    fn stable_hash_ignores_key_order() {
        let mut value = serde_json::Map::new();
        value.insert("b".into(), json!(1));
        value.insert("a".into(), json!([{"z": true, "y": null}]));

        let mut reordered = serde_json::Map::new();
        reordered.insert("a".into(), json!([{"y": null, "z": true}]));
        reordered.insert("b".into(), json!(1));

        let mut lhs = String::new();
        write_canonical(&Value::Object(value), &mut lhs);

        let mut rhs = String::new();
        write_canonical(&Value::Object(reordered), &mut rhs);

        assert_eq!(lhs, rhs);
        assert_eq!(lhs, r#"{"a":[{"y":null,"z":true}],"b":1}"#);
    }

    #[test]
    fn stable_hash_detects_changes() {
        let original = vec![definition("a", "A")];
        let unchanged = vec![definition("a", "A")];

        assert_eq!(stable_hash(&original), stable_hash(&unchanged));

        let mut grown = vec![definition("a", "A")];
        grown[0].addresses.push("bc1qnew".into());

        assert_ne!(stable_hash(&original), stable_hash(&grown));
    }

    #[test]
    fn local_pool_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool_definitions.json");

        std::fs::write(
            &path,
            r#"[{"id": "ocean", "name": "OCEAN", "addresses": ["bc1q"], "tags": ["OCEAN.XYZ"], "regexes": []}]"#,
        )
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let definitions: Vec<PoolDefinition> = serde_json::from_str(&raw).unwrap();

        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].id, "ocean");
        assert_eq!(definitions[0].tags, vec!["OCEAN.XYZ"]);
    }

    #[test]
    fn rule_set_snapshot_exposes_its_hash() {
        let rules = RuleSet::new(vec![definition("a", "A")]);

        assert_eq!(rules.hash(), stable_hash(&[definition("a", "A")]));
        assert_eq!(rules.len(), 1);
        assert!(!rules.is_empty());
        assert!(RuleSet::empty().is_empty());
    }
}
