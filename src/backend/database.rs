//! Relational database driver over SQLite.
//!
//! Two tables: the keyspace (`Name, Value, Created, Tags[, Group]`) and an
//! optional tag table (`Tag, Created[, Group]`). Without a tag table the
//! driver stores values with their timestamp only and refuses tags. With a
//! `Group` every statement is scoped to that group, so several logical
//! storages can share one physical table. Column names are remappable to fit
//! a schema owned by other code.
//!
//! Timestamps are stored as fixed-width text, so `Created < ?` compares them
//! chronologically.

use super::{settle, Batch, BatchRules, Capabilities, ClearScope, Driver};
use crate::config::Options;
use crate::entry::{tags_valid, EntryMode, Freshness, Value};
use crate::error::{Error, Result};
use crate::key::{validate_key, validate_tag, KEY_MAX_DEFAULT};
use crate::observability::{default_sink, SharedSink};
use crate::timestamp::{Clock, SystemClock, Timestamp};
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "database";

/// Largest `IN (...)` list sent in one statement.
const IN_CHUNK: usize = 500;

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Column names of the keyspace table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldNames {
    pub name: String,
    pub value: String,
    pub created: String,
    pub tags: String,
    pub group: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        FieldNames {
            name: "Name".to_string(),
            value: "Value".to_string(),
            created: "Created".to_string(),
            tags: "Tags".to_string(),
            group: "Group".to_string(),
        }
    }
}

/// Column names of the tag table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFieldNames {
    pub tag: String,
    pub created: String,
    pub group: String,
}

impl Default for TagFieldNames {
    fn default() -> Self {
        TagFieldNames {
            tag: "Tag".to_string(),
            created: "Created".to_string(),
            group: "Group".to_string(),
        }
    }
}

/// Configuration of [`DatabaseDriver`].
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub table: String,
    /// Tag registry table; tags are refused when unset.
    pub tag_table: Option<String>,
    pub group: Option<String>,
    pub fields: FieldNames,
    pub tag_fields: TagFieldNames,
    pub ttl: Option<Duration>,
}

impl DatabaseConfig {
    pub fn new(table: impl Into<String>) -> Self {
        DatabaseConfig {
            table: table.into(),
            tag_table: None,
            group: None,
            fields: FieldNames::default(),
            tag_fields: TagFieldNames::default(),
            ttl: None,
        }
    }

    /// Build from `Table`, `TagTable`, `Group` and `Expire`.
    ///
    /// # Errors
    /// `Error::ConfigError` if `Table` is missing.
    pub fn from_options(options: &Options) -> Result<Self> {
        let table = Options::require(&options.table, "Table")?;
        Ok(DatabaseConfig {
            tag_table: options.tag_table.clone(),
            group: options.group.clone(),
            ttl: options.ttl(),
            ..DatabaseConfig::new(table.clone())
        })
    }

    pub fn with_tag_table(mut self, table: impl Into<String>) -> Self {
        self.tag_table = Some(table.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_fields(mut self, fields: FieldNames) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_tag_fields(mut self, fields: TagFieldNames) -> Self {
        self.tag_fields = fields;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Quote a configured identifier after checking it is a plain SQL name.
fn quote_ident(name: &str) -> Result<String> {
    let plain = !name.is_empty()
        && !name.as_bytes()[0].is_ascii_digit()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if plain {
        Ok(format!("\"{}\"", name))
    } else {
        Err(Error::ConfigError(format!(
            "{:?} is not a valid table or column name",
            name
        )))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn split_tags(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Quoted identifiers, validated once at construction.
#[derive(Debug)]
struct Sql {
    table: String,
    name: String,
    value: String,
    created: String,
    tags: String,
    group: String,
    tag_table: Option<String>,
    tag: String,
    tag_created: String,
    tag_group: String,
}

impl Sql {
    fn new(config: &DatabaseConfig) -> Result<Self> {
        Ok(Sql {
            table: quote_ident(&config.table)?,
            name: quote_ident(&config.fields.name)?,
            value: quote_ident(&config.fields.value)?,
            created: quote_ident(&config.fields.created)?,
            tags: quote_ident(&config.fields.tags)?,
            group: quote_ident(&config.fields.group)?,
            tag_table: config.tag_table.as_deref().map(quote_ident).transpose()?,
            tag: quote_ident(&config.tag_fields.tag)?,
            tag_created: quote_ident(&config.tag_fields.created)?,
            tag_group: quote_ident(&config.tag_fields.group)?,
        })
    }
}

/// Driver storing the keyspace and tag registry in SQL tables.
#[derive(Clone)]
pub struct DatabaseDriver {
    pool: SqlitePool,
    sql: Arc<Sql>,
    group: Option<String>,
    fresh: Freshness,
    sink: SharedSink,
}

impl DatabaseDriver {
    /// Wrap an already connected pool.
    ///
    /// # Errors
    /// `Error::ConfigError` for unusable table or column names.
    pub fn new(pool: SqlitePool, config: DatabaseConfig) -> Result<Self> {
        Self::with_clock(pool, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        pool: SqlitePool,
        config: DatabaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let sql = Sql::new(&config)?;
        info!(
            "✓ Database driver initialized (table: {}, tag table: {:?}, group: {:?})",
            config.table, config.tag_table, config.group
        );
        Ok(DatabaseDriver {
            pool,
            sql: Arc::new(sql),
            group: config.group,
            fresh: Freshness::new(config.ttl, clock),
            sink: default_sink(),
        })
    }

    /// Open a pool for `url` and wrap it.
    ///
    /// # Errors
    /// `Error::Unavailable` when the database cannot be opened.
    pub async fn connect(url: &str, config: DatabaseConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .connect(url)
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Self::new(pool, config)
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the keyspace and tag tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let s = &*self.sql;
        let (group_col, group_key) = match self.group {
            Some(_) => (
                format!(", {} TEXT NOT NULL DEFAULT ''", s.group),
                format!(", {}", s.group),
            ),
            None => (String::new(), String::new()),
        };
        let keyspace = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL, \
             {} TEXT NOT NULL DEFAULT ''{}, PRIMARY KEY ({}{}))",
            s.table, s.name, s.value, s.created, s.tags, group_col, s.name, group_key
        );
        sqlx::query(&keyspace)
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;

        if let Some(tag_table) = &s.tag_table {
            let (group_col, group_key) = match self.group {
                Some(_) => (
                    format!(", {} TEXT NOT NULL DEFAULT ''", s.tag_group),
                    format!(", {}", s.tag_group),
                ),
                None => (String::new(), String::new()),
            };
            let tags = format!(
                "CREATE TABLE IF NOT EXISTS {} ({} TEXT NOT NULL, {} TEXT NOT NULL{}, PRIMARY KEY ({}{}))",
                tag_table, s.tag, s.tag_created, group_col, s.tag, group_key
            );
            sqlx::query(&tags)
                .execute(&self.pool)
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    fn mode(&self) -> EntryMode {
        match self.sql.tag_table {
            Some(_) => EntryMode::Metadata,
            None => EntryMode::Raw,
        }
    }

    fn group_filter(&self) -> String {
        match self.group {
            Some(_) => format!(" AND {} = ?", self.sql.group),
            None => String::new(),
        }
    }

    fn tag_group_filter(&self) -> String {
        match self.group {
            Some(_) => format!(" AND {} = ?", self.sql.tag_group),
            None => String::new(),
        }
    }

    /// Bind the group parameter; every group filter is the last placeholder.
    fn scoped<'q>(&'q self, query: Query<'q>) -> Query<'q> {
        match &self.group {
            Some(group) => query.bind(group.as_str()),
            None => query,
        }
    }

    /// Registry rows for `tags`, fetched with one `IN` query per chunk.
    async fn registry(&self, tags: &BTreeSet<&str>) -> Result<HashMap<String, Timestamp>> {
        let mut rows = HashMap::new();
        let Some(tag_table) = &self.sql.tag_table else {
            return Ok(rows);
        };
        let tags: Vec<&str> = tags.iter().copied().collect();
        for chunk in tags.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {}, {} FROM {} WHERE {} IN ({}){}",
                self.sql.tag,
                self.sql.tag_created,
                tag_table,
                self.sql.tag,
                placeholders(chunk.len()),
                self.tag_group_filter()
            );
            let query = chunk
                .iter()
                .fold(sqlx::query(&sql), |q, tag| q.bind(*tag));
            for row in self
                .scoped(query)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::backend)?
            {
                let tag: String = row.try_get(0).map_err(Error::backend)?;
                let created: String = row.try_get(1).map_err(Error::backend)?;
                if let Some(ts) = Timestamp::parse(&created) {
                    rows.insert(tag, ts);
                }
            }
        }
        Ok(rows)
    }

    fn is_valid(&self, created: &str, tags: &[String], rows: &HashMap<String, Timestamp>) -> bool {
        match Timestamp::parse(created) {
            Some(created) => {
                self.fresh.is_fresh(&created)
                    && tags_valid(tags, &created, |tag| rows.get(tag).cloned())
            }
            None => false,
        }
    }

    async fn check_row(&self, created: &str, tags: &str) -> Result<bool> {
        let tags = split_tags(tags);
        let wanted: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
        let rows = self.registry(&wanted).await?;
        Ok(self.is_valid(created, &tags, &rows))
    }

    async fn delete_names(&self, names: &[String]) -> Result<()> {
        for chunk in names.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({}){}",
                self.sql.table,
                self.sql.name,
                placeholders(chunk.len()),
                self.group_filter()
            );
            let query = chunk
                .iter()
                .fold(sqlx::query(&sql), |q, name| q.bind(name.as_str()));
            self.scoped(query)
                .execute(&self.pool)
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    async fn delete_tags(&self, tags: &[&str]) -> Result<()> {
        let Some(tag_table) = &self.sql.tag_table else {
            return Ok(());
        };
        for chunk in tags.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({}){}",
                tag_table,
                self.sql.tag,
                placeholders(chunk.len()),
                self.tag_group_filter()
            );
            let query = chunk.iter().fold(sqlx::query(&sql), |q, tag| q.bind(*tag));
            self.scoped(query)
                .execute(&self.pool)
                .await
                .map_err(Error::backend)?;
        }
        Ok(())
    }

    async fn try_exist(&self, key: &str) -> Result<bool> {
        validate_key(key, KEY_MAX_DEFAULT)?;
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} = ?{}",
            self.sql.created,
            self.sql.tags,
            self.sql.table,
            self.sql.name,
            self.group_filter()
        );
        let row = self
            .scoped(sqlx::query(&sql).bind(key))
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::backend)?;
        match row {
            Some(row) => {
                let created: String = row.try_get(0).map_err(Error::backend)?;
                let tags: String = row.try_get(1).map_err(Error::backend)?;
                self.check_row(&created, &tags).await
            }
            None => Ok(false),
        }
    }

    async fn try_read(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key, KEY_MAX_DEFAULT)?;
        let sql = format!(
            "SELECT {}, {}, {} FROM {} WHERE {} = ?{}",
            self.sql.value,
            self.sql.created,
            self.sql.tags,
            self.sql.table,
            self.sql.name,
            self.group_filter()
        );
        let row = self
            .scoped(sqlx::query(&sql).bind(key))
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::backend)?;
        let Some(row) = row else {
            debug!("✓ Database GET {} -> MISS", key);
            return Ok(None);
        };
        let value: String = row.try_get(0).map_err(Error::backend)?;
        let created: String = row.try_get(1).map_err(Error::backend)?;
        let tags: String = row.try_get(2).map_err(Error::backend)?;
        if self.check_row(&created, &tags).await? {
            debug!("✓ Database GET {} -> HIT", key);
            Ok(Some(Value::String(value)))
        } else {
            debug!("✓ Database GET {} -> STALE", key);
            self.delete_names(&[key.to_string()]).await?;
            Ok(None)
        }
    }

    /// Every row of the group as `(name, value, created, tags)`.
    async fn rows(&self) -> Result<Vec<(String, String, String, Vec<String>)>> {
        let sql = format!(
            "SELECT {}, {}, {}, {} FROM {} WHERE 1 = 1{}",
            self.sql.name,
            self.sql.value,
            self.sql.created,
            self.sql.tags,
            self.sql.table,
            self.group_filter()
        );
        let rows = self
            .scoped(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::backend)?;
        rows.iter()
            .map(|row| {
                let tags: String = row.try_get(3).map_err(Error::backend)?;
                Ok((
                    row.try_get(0).map_err(Error::backend)?,
                    row.try_get(1).map_err(Error::backend)?,
                    row.try_get(2).map_err(Error::backend)?,
                    split_tags(&tags),
                ))
            })
            .collect()
    }

    /// Split all rows into valid ones and the names of invalid ones.
    async fn partition(
        &self,
    ) -> Result<(Vec<(String, String, Vec<String>)>, Vec<String>)> {
        let rows = self.rows().await?;
        let wanted: BTreeSet<&str> = rows
            .iter()
            .flat_map(|(_, _, _, tags)| tags.iter().map(String::as_str))
            .collect();
        let registry = self.registry(&wanted).await?;
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for (name, value, created, tags) in rows {
            if self.is_valid(&created, &tags, &registry) {
                valid.push((name, value, tags));
            } else {
                invalid.push(name);
            }
        }
        Ok((valid, invalid))
    }

    async fn try_read_all(&self) -> Result<BTreeMap<String, Value>> {
        let (valid, invalid) = self.partition().await?;
        self.delete_names(&invalid).await?;
        Ok(valid
            .into_iter()
            .map(|(name, value, _)| (name, Value::String(value)))
            .collect())
    }

    async fn try_write(&self, batch: Batch, overwrite: bool) -> Result<bool> {
        let s = &*self.sql;
        let mut tx = self.pool.begin().await.map_err(Error::backend)?;

        if overwrite {
            let sql = format!("DELETE FROM {} WHERE 1 = 1{}", s.table, self.group_filter());
            self.scoped(sqlx::query(&sql))
                .execute(&mut *tx)
                .await
                .map_err(Error::backend)?;
            if let Some(tag_table) = &s.tag_table {
                let sql = format!("DELETE FROM {} WHERE 1 = 1{}", tag_table, self.tag_group_filter());
                self.scoped(sqlx::query(&sql))
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::backend)?;
            }
        }

        if let Some(tag_table) = &s.tag_table {
            let (group_col, group_val) = match self.group {
                Some(_) => (format!(", {}", s.tag_group), ", ?"),
                None => (String::new(), ""),
            };
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}, {}{}) VALUES (?, ?{})",
                tag_table, s.tag, s.tag_created, group_col, group_val
            );
            for tag in &batch.tags {
                let query = sqlx::query(&sql)
                    .bind(tag.as_str())
                    .bind(batch.created.as_str());
                self.scoped(query)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::backend)?;
            }
        }

        let (group_col, group_val) = match self.group {
            Some(_) => (format!(", {}", s.group), ", ?"),
            None => (String::new(), ""),
        };
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, {}, {}, {}{}) VALUES (?, ?, ?, ?{})",
            s.table, s.name, s.value, s.created, s.tags, group_col, group_val
        );
        let joined = batch.tags.join(",");
        for (key, value) in &batch.entries {
            let Some(text) = value.as_str() else {
                continue;
            };
            let query = sqlx::query(&sql)
                .bind(key.as_str())
                .bind(text)
                .bind(batch.created.as_str())
                .bind(joined.as_str());
            self.scoped(query)
                .execute(&mut *tx)
                .await
                .map_err(Error::backend)?;
        }

        tx.commit().await.map_err(Error::backend)?;
        debug!(
            "✓ Database SET {} keys (tags: {:?}, overwrite: {})",
            batch.entries.len(),
            batch.tags,
            overwrite
        );
        Ok(batch.is_complete())
    }

    async fn try_delete(&self, key: &str) -> Result<bool> {
        validate_key(key, KEY_MAX_DEFAULT)?;
        self.delete_names(&[key.to_string()]).await?;
        Ok(true)
    }

    async fn try_clear(&self, scope: ClearScope<'_>) -> Result<()> {
        match scope {
            ClearScope::All => {
                let mut tx = self.pool.begin().await.map_err(Error::backend)?;
                let sql = format!(
                    "DELETE FROM {} WHERE 1 = 1{}",
                    self.sql.table,
                    self.group_filter()
                );
                self.scoped(sqlx::query(&sql))
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::backend)?;
                if let Some(tag_table) = &self.sql.tag_table {
                    let sql = format!(
                        "DELETE FROM {} WHERE 1 = 1{}",
                        tag_table,
                        self.tag_group_filter()
                    );
                    self.scoped(sqlx::query(&sql))
                        .execute(&mut *tx)
                        .await
                        .map_err(Error::backend)?;
                }
                tx.commit().await.map_err(Error::backend)?;
            }
            ClearScope::Tags(tags) => {
                let tags: Vec<&str> = tags
                    .iter()
                    .copied()
                    .filter(|t| validate_tag(t).is_ok())
                    .collect();
                self.delete_tags(&tags).await?;
            }
        }
        Ok(())
    }

    async fn try_collect_garbage(&self) -> Result<usize> {
        let mut removed = 0;
        if let Some(cutoff) = self.fresh.cutoff() {
            let sql = format!(
                "DELETE FROM {} WHERE {} < ?{}",
                self.sql.table,
                self.sql.created,
                self.group_filter()
            );
            let done = self
                .scoped(sqlx::query(&sql).bind(cutoff.as_str()))
                .execute(&self.pool)
                .await
                .map_err(Error::backend)?;
            removed += done.rows_affected() as usize;
        }

        let (valid, invalid) = self.partition().await?;
        self.delete_names(&invalid).await?;
        removed += invalid.len();

        if let Some(tag_table) = &self.sql.tag_table {
            let referenced: BTreeSet<&str> = valid
                .iter()
                .flat_map(|(_, _, tags)| tags.iter().map(String::as_str))
                .collect();
            let sql = format!(
                "SELECT {} FROM {} WHERE 1 = 1{}",
                self.sql.tag,
                tag_table,
                self.tag_group_filter()
            );
            let rows = self
                .scoped(sqlx::query(&sql))
                .fetch_all(&self.pool)
                .await
                .map_err(Error::backend)?;
            let mut orphans = Vec::new();
            for row in &rows {
                let tag: String = row.try_get(0).map_err(Error::backend)?;
                if !referenced.contains(tag.as_str()) {
                    orphans.push(tag);
                }
            }
            let orphans: Vec<&str> = orphans.iter().map(String::as_str).collect();
            self.delete_tags(&orphans).await?;
        }
        Ok(removed)
    }
}

impl Driver for DatabaseDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multi_value: false,
            non_volatile: true,
            enumerable: true,
        }
    }

    async fn exist(&self, key: &str) -> bool {
        settle(&*self.sink, NAME, "exist", self.try_exist(key).await, false)
    }

    async fn read(&self, key: &str) -> Option<Value> {
        settle(&*self.sink, NAME, "read", self.try_read(key).await, None)
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        settle(
            &*self.sink,
            NAME,
            "read_all",
            self.try_read_all().await,
            BTreeMap::new(),
        )
    }

    async fn write_all(
        &self,
        values: BTreeMap<String, Value>,
        tags: &[&str],
        overwrite: bool,
    ) -> bool {
        let rules = BatchRules {
            key_max: KEY_MAX_DEFAULT,
            mode: self.mode(),
            multi_value: false,
        };
        let result = match rules.prepare(NAME, &*self.sink, values, tags, self.fresh.now()) {
            Ok(batch) => self.try_write(batch, overwrite).await,
            Err(e) => Err(e),
        };
        settle(&*self.sink, NAME, "write", result, false)
    }

    async fn delete(&self, key: &str) -> bool {
        settle(&*self.sink, NAME, "delete", self.try_delete(key).await, false)
    }

    async fn clear(&self, scope: ClearScope<'_>) {
        settle(&*self.sink, NAME, "clear", self.try_clear(scope).await, ());
    }

    async fn garbage_collection(&self) {
        let result = self.try_collect_garbage().await;
        if let Ok(removed) = &result {
            debug!("✓ Database GC removed {} rows", removed);
        }
        settle(&*self.sink, NAME, "garbage_collection", result.map(|_| ()), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoOpSink;
    use crate::timestamp::ManualClock;
    use serde_json::json;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("sqlite")
    }

    async fn driver(config: DatabaseConfig) -> (DatabaseDriver, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let driver = DatabaseDriver::with_clock(memory_pool().await, config, clock.clone())
            .expect("driver")
            .with_sink(Arc::new(NoOpSink));
        driver.ensure_schema().await.expect("schema");
        (driver, clock)
    }

    fn tagged() -> DatabaseConfig {
        DatabaseConfig::new("cache").with_tag_table("cache_tags")
    }

    #[test]
    fn test_identifier_validation() {
        assert_eq!(quote_ident("Cache_1").expect("ident"), "\"Cache_1\"");
        assert!(quote_ident("x; DROP TABLE y").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_from_options_requires_table() {
        assert!(DatabaseConfig::from_options(&Options::default()).is_err());
        let options =
            Options::from_json(r#"{"Table": "kv", "TagTable": "kv_tags", "Group": "g"}"#)
                .expect("options");
        let config = DatabaseConfig::from_options(&options).expect("config");
        assert_eq!(config.tag_table.as_deref(), Some("kv_tags"));
        assert_eq!(config.group.as_deref(), Some("g"));
    }

    #[tokio::test]
    async fn test_round_trip_and_flat_values() {
        let (driver, _) = driver(tagged()).await;
        assert!(driver.write("k", json!("text"), &[]).await);
        assert_eq!(driver.read("k").await, Some(json!("text")));
        assert!(!driver.write("m", json!({"a": 1}), &[]).await);
        assert_eq!(driver.read("m").await, None);
    }

    #[tokio::test]
    async fn test_tag_rows_keep_first_timestamp() {
        let (driver, clock) = driver(tagged()).await;
        driver.write("a", json!("1"), &["T"]).await;
        clock.advance(Duration::from_secs(2));
        driver.write("b", json!("2"), &["T"]).await;
        assert_eq!(driver.read("a").await, Some(json!("1")));
        assert_eq!(driver.read("b").await, Some(json!("2")));

        driver.clear(ClearScope::Tags(&["T"])).await;
        assert!(!driver.exist("a").await);
        assert_eq!(driver.read("b").await, None);
    }

    #[tokio::test]
    async fn test_tags_refused_without_tag_table() {
        let (driver, _) = driver(DatabaseConfig::new("plain")).await;
        assert!(!driver.write("a", json!("1"), &["T"]).await);
        assert!(driver.write("a", json!("1"), &[]).await);
        assert_eq!(driver.read_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_groups_share_a_table() {
        let pool = memory_pool().await;
        let left = DatabaseDriver::new(pool.clone(), tagged().with_group("left")).expect("driver");
        let right = DatabaseDriver::new(pool, tagged().with_group("right")).expect("driver");
        left.ensure_schema().await.expect("schema");

        left.write("k", json!("L"), &["t"]).await;
        right.write("k", json!("R"), &["t"]).await;
        right.clear(ClearScope::All).await;

        assert_eq!(left.read("k").await, Some(json!("L")));
        assert_eq!(right.read("k").await, None);
    }

    #[tokio::test]
    async fn test_remapped_fields() {
        let fields = FieldNames {
            name: "k".into(),
            value: "v".into(),
            created: "ts".into(),
            tags: "labels".into(),
            group: "bucket".into(),
        };
        let (driver, _) = driver(tagged().with_fields(fields)).await;
        driver.write("a", json!("x"), &["t"]).await;
        let row = sqlx::query("SELECT v, labels FROM cache WHERE k = 'a'")
            .fetch_one(driver.pool())
            .await
            .expect("row");
        assert_eq!(row.get::<String, _>(0), "x");
        assert_eq!(row.get::<String, _>(1), "t");
    }

    #[tokio::test]
    async fn test_overwrite_and_gc() {
        let (driver, clock) = driver(tagged().with_ttl(Some(Duration::from_secs(10)))).await;
        let first = BTreeMap::from([
            ("a".to_string(), json!("1")),
            ("b".to_string(), json!("2")),
        ]);
        driver.write_all(first, &["old"], true).await;
        let second = BTreeMap::from([("a".to_string(), json!("9"))]);
        assert!(driver.write_all(second, &["new"], true).await);
        assert_eq!(driver.read("b").await, None);
        assert_eq!(driver.read("a").await, Some(json!("9")));

        clock.advance(Duration::from_secs(11));
        driver.write("c", json!("3"), &["kept"]).await;
        driver.garbage_collection().await;

        let names: Vec<String> = sqlx::query("SELECT Name FROM cache")
            .fetch_all(driver.pool())
            .await
            .expect("rows")
            .iter()
            .map(|r| r.get(0))
            .collect();
        assert_eq!(names, vec!["c"]);
        let tags: Vec<String> = sqlx::query("SELECT Tag FROM cache_tags")
            .fetch_all(driver.pool())
            .await
            .expect("rows")
            .iter()
            .map(|r| r.get(0))
            .collect();
        assert_eq!(tags, vec!["kept"]);
    }
}
