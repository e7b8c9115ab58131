use {
    super::*,
    crate::options::StoreOptions,
    mongodb::{
        Client, Collection, Cursor,
        bson::{Bson, doc, to_document},
        options::{ClientOptions, Credential},
    },
};

/// The document store behind the observer: `mining_notify` keyed by record
/// id, `blocks` keyed by block hash, and a `pools` mirror of the active rule
/// set.
#[derive(Clone)]
pub(crate) struct Store {
    notify: Collection<NotifyTemplate>,
    blocks: Collection<BlockRecord>,
    pools: Collection<PoolDefinition>,
}

impl Store {
    pub(crate) async fn connect(options: &StoreOptions) -> Result<Self> {
        let mut client_options = ClientOptions::parse(&options.mongodb_url)
            .await
            .with_context(|| format!("failed to parse MongoDB URL `{}`", options.mongodb_url))?;

        if let (Some(username), Some(password)) =
            (&options.mongodb_username, &options.mongodb_password)
        {
            client_options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .build(),
            );
        }

        let client = Client::with_options(client_options)?;
        let database = client.database(&options.mongodb_db);

        database
            .run_command(doc! {"ping": 1})
            .await
            .context("failed to ping MongoDB")?;

        info!("Connected to MongoDB at {}", options.mongodb_url);

        Ok(Self {
            notify: database.collection("mining_notify"),
            blocks: database.collection("blocks"),
            pools: database.collection("pools"),
        })
    }

    pub(crate) async fn insert_notify(&self, template: &NotifyTemplate) -> Result {
        self.notify.insert_one(template).await?;
        Ok(())
    }

    pub(crate) async fn templates_at_height(&self, height: u64) -> Result<Vec<NotifyTemplate>> {
        let mut cursor = self.notify.find(doc! {"height": height as i64}).await?;
        let mut templates = Vec::new();

        while let Some(template) = cursor.try_next().await? {
            templates.push(template);
        }

        Ok(templates)
    }

    /// Backfill path: existence is pre-checked by height, so a plain insert
    /// suffices.
    pub(crate) async fn insert_block(&self, record: &BlockRecord) -> Result {
        self.blocks.insert_one(record).await?;
        Ok(())
    }

    /// Live path and reindex: last write wins under upsert-by-hash.
    pub(crate) async fn upsert_block(&self, record: &BlockRecord) -> Result {
        self.blocks
            .update_one(
                doc! {"block_hash": &record.block_hash},
                doc! {"$set": to_document(record)?},
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    pub(crate) async fn block_exists_at_height(&self, height: u64) -> Result<bool> {
        Ok(self
            .blocks
            .find_one(doc! {"height": height as i64})
            .await?
            .is_some())
    }

    pub(crate) async fn max_height(&self) -> Result<Option<u64>> {
        Ok(self
            .blocks
            .find_one(doc! {})
            .sort(doc! {"height": -1})
            .await?
            .map(|record| record.height))
    }

    pub(crate) async fn min_height(&self) -> Result<Option<u64>> {
        Ok(self
            .blocks
            .find_one(doc! {})
            .sort(doc! {"height": 1})
            .await?
            .map(|record| record.height))
    }

    /// Heights already persisted within `[min, max)`.
    pub(crate) async fn heights_in_range(&self, min: u64, max: u64) -> Result<HashSet<u64>> {
        let values = self
            .blocks
            .distinct(
                "height",
                doc! {"height": {"$gte": min as i64, "$lt": max as i64}},
            )
            .await?;

        Ok(values
            .into_iter()
            .filter_map(|value| match value {
                Bson::Int32(height) => u64::try_from(height).ok(),
                Bson::Int64(height) => u64::try_from(height).ok(),
                Bson::Double(height) => Some(height as u64),
                _ => None,
            })
            .collect())
    }

    pub(crate) async fn count_blocks(&self) -> Result<u64> {
        Ok(self.blocks.count_documents(doc! {}).await?)
    }

    pub(crate) async fn blocks_descending(&self) -> Result<Cursor<BlockRecord>> {
        Ok(self
            .blocks
            .find(doc! {})
            .sort(doc! {"height": -1})
            .await?)
    }

    pub(crate) async fn replace_pools(&self, definitions: &[PoolDefinition]) -> Result {
        self.pools.delete_many(doc! {}).await?;

        if !definitions.is_empty() {
            self.pools.insert_many(definitions).await?;
        }

        Ok(())
    }

    pub(crate) async fn load_pools(&self) -> Result<Vec<PoolDefinition>> {
        let mut cursor = self.pools.find(doc! {}).await?;
        let mut definitions = Vec::new();

        while let Some(definition) = cursor.try_next().await? {
            definitions.push(definition);
        }

        Ok(definitions)
    }
}
