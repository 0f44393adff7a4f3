//! src/services/metadata_store.rs
//!
//! Row-level access to the SQLite metadata database. One shared `containers`
//! table lists every container; each container additionally owns four tables
//! whose names are derived from its GUID, so dropping a container is a matter
//! of dropping its tables.

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        audit::{AuditLogEntry, AuditLogQuery},
        container::Container,
        enumeration::{EnumerationFilter, OrderBy},
        object::{ObjectMetadata, ObjectRow},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

const CONTAINER_COLUMNS: &str = "guid, user_guid, name, objects_directory, enable_audit_logging, \
     is_public_read, is_public_write, replication, created_utc";

const OBJECT_COLUMNS: &str = "guid, object_key, content_type, content_length, md5, tags, \
     created_utc, last_update_utc, last_access_utc";

/// Names of the tables backing one container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerTables {
    pub objects: String,
    pub object_kvp: String,
    pub container_kvp: String,
    pub audit: String,
}

impl ContainerTables {
    pub fn for_container(container: &Container) -> Self {
        let suffix = container.table_suffix();
        Self {
            objects: format!("objects_{}", suffix),
            object_kvp: format!("object_kvp_{}", suffix),
            container_kvp: format!("container_kvp_{}", suffix),
            audit: format!("audit_{}", suffix),
        }
    }

    fn all(&self) -> [&str; 4] {
        [
            &self.objects,
            &self.object_kvp,
            &self.container_kvp,
            &self.audit,
        ]
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create the shared tables if they are missing.
    pub async fn init_schema(&self) -> StorageResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS containers (
                guid BLOB PRIMARY KEY,
                user_guid TEXT NOT NULL,
                name TEXT NOT NULL,
                objects_directory TEXT NOT NULL,
                enable_audit_logging INTEGER NOT NULL DEFAULT 0,
                is_public_read INTEGER NOT NULL DEFAULT 0,
                is_public_write INTEGER NOT NULL DEFAULT 0,
                replication TEXT NOT NULL DEFAULT 'none',
                created_utc TEXT NOT NULL,
                UNIQUE (user_guid, name)
            )",
        )
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn create_tables(&self, tables: &ContainerTables) -> StorageResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    guid BLOB PRIMARY KEY,
                    object_key TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    content_type TEXT NOT NULL,
                    content_length INTEGER NOT NULL,
                    md5 TEXT NOT NULL,
                    tags TEXT NOT NULL DEFAULT '[]',
                    created_utc TEXT NOT NULL,
                    last_update_utc TEXT NOT NULL,
                    last_access_utc TEXT NOT NULL
                )",
                tables.objects
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    object_guid BLOB NOT NULL,
                    kv_key TEXT NOT NULL,
                    kv_value TEXT NOT NULL,
                    PRIMARY KEY (object_guid, kv_key)
                )",
                tables.object_kvp
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    kv_key TEXT PRIMARY KEY,
                    kv_value TEXT NOT NULL
                )",
                tables.container_kvp
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    guid BLOB PRIMARY KEY,
                    object_key TEXT,
                    action TEXT NOT NULL,
                    metadata TEXT,
                    created_utc TEXT NOT NULL
                )",
                tables.audit
            ),
        ];
        for stmt in statements {
            sqlx::query(&stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn drop_tables(&self, tables: &ContainerTables) -> StorageResult<()> {
        for table in tables.all() {
            let stmt = format!("DROP TABLE IF EXISTS {}", table);
            sqlx::query(&stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn list_tables(&self) -> StorageResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(names)
    }

    // --- containers ---

    pub async fn insert_container(&self, container: &Container) -> StorageResult<()> {
        let stmt = format!(
            "INSERT INTO containers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CONTAINER_COLUMNS
        );
        match sqlx::query(&stmt)
            .bind(container.guid)
            .bind(&container.user_guid)
            .bind(&container.name)
            .bind(&container.objects_directory)
            .bind(container.enable_audit_logging)
            .bind(container.is_public_read)
            .bind(container.is_public_write)
            .bind(container.replication)
            .bind(container.created_utc)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::AlreadyExists(format!(
                "{}/{}",
                container.user_guid, container.name
            ))),
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    pub async fn update_container(&self, container: &Container) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE containers SET enable_audit_logging = ?, is_public_read = ?,
                    is_public_write = ?, replication = ?
             WHERE guid = ?",
        )
        .bind(container.enable_audit_logging)
        .bind(container.is_public_read)
        .bind(container.is_public_write)
        .bind(container.replication)
        .bind(container.guid)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(container.name.clone()));
        }
        Ok(())
    }

    pub async fn delete_container(&self, guid: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM containers WHERE guid = ?")
            .bind(guid)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn select_container(
        &self,
        user_guid: &str,
        name: &str,
    ) -> StorageResult<Option<Container>> {
        let stmt = format!(
            "SELECT {} FROM containers WHERE user_guid = ? AND name = ?",
            CONTAINER_COLUMNS
        );
        let row = sqlx::query_as::<_, Container>(&stmt)
            .bind(user_guid)
            .bind(name)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    pub async fn select_container_by_guid(&self, guid: Uuid) -> StorageResult<Option<Container>> {
        let stmt = format!("SELECT {} FROM containers WHERE guid = ?", CONTAINER_COLUMNS);
        let row = sqlx::query_as::<_, Container>(&stmt)
            .bind(guid)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    pub async fn select_containers(&self, user_guid: Option<&str>) -> StorageResult<Vec<Container>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM containers", CONTAINER_COLUMNS));
        if let Some(user) = user_guid {
            builder.push(" WHERE user_guid = ");
            builder.push_bind(user.to_string());
        }
        builder.push(" ORDER BY user_guid ASC, name ASC");
        let rows = builder.build_query_as::<Container>().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    // --- objects ---

    pub async fn insert_object(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        key: &str,
        content_type: &str,
        content_length: i64,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, '', ?, ?, ?, ?)",
            tables.objects, OBJECT_COLUMNS
        );
        match sqlx::query(&stmt)
            .bind(guid)
            .bind(key)
            .bind(content_type)
            .bind(content_length)
            .bind(tags_json(tags))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    pub async fn select_object(
        &self,
        tables: &ContainerTables,
        key: &str,
    ) -> StorageResult<Option<ObjectMetadata>> {
        let stmt = format!(
            "SELECT {} FROM {} WHERE object_key = ?",
            OBJECT_COLUMNS, tables.objects
        );
        let row = sqlx::query_as::<_, ObjectRow>(&stmt)
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(ObjectMetadata::from))
    }

    pub async fn update_object_content(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        md5: &str,
        content_length: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!(
            "UPDATE {} SET md5 = ?, content_length = ?, last_update_utc = ? WHERE guid = ?",
            tables.objects
        );
        sqlx::query(&stmt)
            .bind(md5)
            .bind(content_length)
            .bind(now)
            .bind(guid)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn update_object_tags(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        tags: &[String],
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!(
            "UPDATE {} SET tags = ?, last_update_utc = ? WHERE guid = ?",
            tables.objects
        );
        sqlx::query(&stmt)
            .bind(tags_json(tags))
            .bind(now)
            .bind(guid)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn touch_object_updated(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!("UPDATE {} SET last_update_utc = ? WHERE guid = ?", tables.objects);
        sqlx::query(&stmt).bind(now).bind(guid).execute(&*self.db).await?;
        Ok(())
    }

    pub async fn touch_object_accessed(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!("UPDATE {} SET last_access_utc = ? WHERE guid = ?", tables.objects);
        sqlx::query(&stmt).bind(now).bind(guid).execute(&*self.db).await?;
        Ok(())
    }

    pub async fn rename_object(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        new_key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let stmt = format!(
            "UPDATE {} SET object_key = ?, last_update_utc = ? WHERE guid = ?",
            tables.objects
        );
        match sqlx::query(&stmt)
            .bind(new_key)
            .bind(now)
            .bind(guid)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::AlreadyExists(new_key.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Remove the object row and its key/value pairs.
    pub async fn delete_object(&self, tables: &ContainerTables, guid: Uuid) -> StorageResult<()> {
        let stmt = format!("DELETE FROM {} WHERE object_guid = ?", tables.object_kvp);
        sqlx::query(&stmt).bind(guid).execute(&*self.db).await?;
        let stmt = format!("DELETE FROM {} WHERE guid = ?", tables.objects);
        sqlx::query(&stmt).bind(guid).execute(&*self.db).await?;
        Ok(())
    }

    /// One filtered, ordered page of objects.
    pub async fn select_objects(
        &self,
        tables: &ContainerTables,
        filter: &EnumerationFilter,
        order_by: OrderBy,
        offset: i64,
        limit: i64,
    ) -> StorageResult<Vec<ObjectMetadata>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            OBJECT_COLUMNS, tables.objects
        ));

        let windows = [
            ("created_utc", filter.created_after, filter.created_before),
            ("last_update_utc", filter.updated_after, filter.updated_before),
            ("last_access_utc", filter.accessed_after, filter.accessed_before),
        ];
        for (column, after, before) in windows {
            if let Some(after) = after {
                builder.push(format!(" AND {} >= ", column));
                builder.push_bind(after);
            }
            if let Some(before) = before {
                builder.push(format!(" AND {} <= ", column));
                builder.push_bind(before);
            }
        }

        if let Some(prefix) = &filter.prefix {
            builder.push(" AND object_key LIKE ");
            builder.push_bind(format!("{}%", escape_like(&prefix.to_lowercase())));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(md5) = &filter.md5 {
            builder.push(" AND md5 = ");
            builder.push_bind(md5.to_lowercase());
        }
        if let Some(content_type) = &filter.content_type {
            builder.push(" AND content_type = ");
            builder.push_bind(content_type.clone());
        }
        if let Some(min) = filter.size_min {
            builder.push(" AND content_length >= ");
            builder.push_bind(min);
        }
        if let Some(max) = filter.size_max {
            builder.push(" AND content_length <= ");
            builder.push_bind(max);
        }
        for tag in &filter.tags {
            // Tags are a JSON array, so an exact element appears quoted.
            let quoted = serde_json::to_string(tag).unwrap_or_default();
            builder.push(" AND tags LIKE ");
            builder.push_bind(format!("%{}%", escape_like(&quoted)));
            builder.push(" ESCAPE '\\'");
        }
        for (key, value) in &filter.key_values {
            builder.push(format!(
                " AND EXISTS (SELECT 1 FROM {kvp} kv WHERE kv.object_guid = {objects}.guid AND kv.kv_key = ",
                kvp = tables.object_kvp,
                objects = tables.objects
            ));
            builder.push_bind(key.clone());
            builder.push(" AND kv.kv_value = ");
            builder.push_bind(value.clone());
            builder.push(")");
        }

        builder.push(order_by.sql());
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder.build_query_as::<ObjectRow>().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(ObjectMetadata::from).collect())
    }

    /// `(object count, total bytes)` for the whole container.
    pub async fn object_statistics(&self, tables: &ContainerTables) -> StorageResult<(i64, i64)> {
        let stmt = format!(
            "SELECT COUNT(*), COALESCE(SUM(content_length), 0) FROM {}",
            tables.objects
        );
        let stats = sqlx::query_as::<_, (i64, i64)>(&stmt)
            .fetch_one(&*self.db)
            .await?;
        Ok(stats)
    }

    // --- key/value pairs ---

    pub async fn replace_object_kvps(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
        pairs: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        let stmt = format!("DELETE FROM {} WHERE object_guid = ?", tables.object_kvp);
        sqlx::query(&stmt).bind(guid).execute(&mut *tx).await?;
        let stmt = format!(
            "INSERT INTO {} (object_guid, kv_key, kv_value) VALUES (?, ?, ?)",
            tables.object_kvp
        );
        for (key, value) in pairs {
            sqlx::query(&stmt)
                .bind(guid)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn select_object_kvps(
        &self,
        tables: &ContainerTables,
        guid: Uuid,
    ) -> StorageResult<BTreeMap<String, String>> {
        let stmt = format!(
            "SELECT kv_key, kv_value FROM {} WHERE object_guid = ?",
            tables.object_kvp
        );
        let rows = sqlx::query_as::<_, (String, String)>(&stmt)
            .bind(guid)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn replace_container_kvps(
        &self,
        tables: &ContainerTables,
        pairs: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        let stmt = format!("DELETE FROM {}", tables.container_kvp);
        sqlx::query(&stmt).execute(&mut *tx).await?;
        let stmt = format!(
            "INSERT INTO {} (kv_key, kv_value) VALUES (?, ?)",
            tables.container_kvp
        );
        for (key, value) in pairs {
            sqlx::query(&stmt)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn select_container_kvps(
        &self,
        tables: &ContainerTables,
    ) -> StorageResult<BTreeMap<String, String>> {
        let stmt = format!("SELECT kv_key, kv_value FROM {}", tables.container_kvp);
        let rows = sqlx::query_as::<_, (String, String)>(&stmt)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows.into_iter().collect())
    }

    // --- audit log ---

    pub async fn insert_audit(
        &self,
        tables: &ContainerTables,
        entry: &AuditLogEntry,
    ) -> StorageResult<()> {
        let stmt = format!(
            "INSERT INTO {} (guid, object_key, action, metadata, created_utc) VALUES (?, ?, ?, ?, ?)",
            tables.audit
        );
        sqlx::query(&stmt)
            .bind(entry.guid)
            .bind(entry.object_key.as_deref())
            .bind(entry.action)
            .bind(entry.metadata.as_deref())
            .bind(entry.created_utc)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn select_audit(
        &self,
        tables: &ContainerTables,
        query: &AuditLogQuery,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT guid, object_key, action, metadata, created_utc FROM {} WHERE 1 = 1",
            tables.audit
        ));
        if let Some(key) = &query.object_key {
            builder.push(" AND object_key = ");
            builder.push_bind(key.to_lowercase());
        }
        if let Some(action) = query.action {
            builder.push(" AND action = ");
            builder.push_bind(action);
        }
        if let Some(after) = query.created_after {
            builder.push(" AND created_utc >= ");
            builder.push_bind(after);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND created_utc <= ");
            builder.push_bind(before);
        }
        let offset = query.index_start.unwrap_or(0).max(0);
        let limit = query.max_results.unwrap_or(100).clamp(1, 1000);
        builder.push(" ORDER BY created_utc DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder
            .build_query_as::<AuditLogEntry>()
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    pub async fn clear_audit(&self, tables: &ContainerTables) -> StorageResult<u64> {
        let stmt = format!("DELETE FROM {}", tables.audit);
        let result = sqlx::query(&stmt).execute(&*self.db).await?;
        Ok(result.rows_affected())
    }
}

fn tags_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".into())
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> MetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = MetadataStore::new(Arc::new(pool));
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn table_names_follow_guid() {
        let c = Container::new("user", "docs", std::path::Path::new("/tmp"));
        let t = ContainerTables::for_container(&c);
        assert_eq!(t.objects, format!("objects_{}", c.guid.simple()));
        assert!(!t.audit.contains('-'));
    }

    #[tokio::test]
    async fn create_and_drop_container_tables() {
        let store = store().await;
        let c = Container::new("user", "docs", std::path::Path::new("/tmp"));
        let t = ContainerTables::for_container(&c);

        store.create_tables(&t).await.unwrap();
        let tables = store.list_tables().await.unwrap();
        assert!(tables.contains(&t.objects));
        assert!(tables.contains(&t.audit));

        store.drop_tables(&t).await.unwrap();
        let tables = store.list_tables().await.unwrap();
        assert!(!tables.contains(&t.objects));
        assert!(tables.contains(&"containers".to_string()));
    }

    #[tokio::test]
    async fn duplicate_container_is_already_exists() {
        let store = store().await;
        let c = Container::new("user", "docs", std::path::Path::new("/tmp"));
        store.insert_container(&c).await.unwrap();

        let dup = Container::new("user", "docs", std::path::Path::new("/tmp"));
        let err = store.insert_container(&dup).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::AlreadyExists);

        let found = store.select_container("user", "docs").await.unwrap().unwrap();
        assert_eq!(found.guid, c.guid);
    }

    #[tokio::test]
    async fn filter_by_tag_and_key_value() {
        let store = store().await;
        let c = Container::new("user", "docs", std::path::Path::new("/tmp"));
        let t = ContainerTables::for_container(&c);
        store.create_tables(&t).await.unwrap();

        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store
            .insert_object(&t, a, "a", "text/plain", 1, &["red".into()], now)
            .await
            .unwrap();
        store
            .insert_object(&t, b, "b", "text/plain", 2, &["reddish".into()], now)
            .await
            .unwrap();
        let mut pairs = BTreeMap::new();
        pairs.insert("owner".to_string(), "bob".to_string());
        store.replace_object_kvps(&t, b, &pairs).await.unwrap();

        let filter = EnumerationFilter {
            tags: vec!["red".into()],
            ..Default::default()
        };
        let rows = store
            .select_objects(&t, &filter, OrderBy::KeyAscending, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");

        let filter = EnumerationFilter {
            key_values: pairs,
            ..Default::default()
        };
        let rows = store
            .select_objects(&t, &filter, OrderBy::KeyAscending, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "b");

        assert_eq!(store.object_statistics(&t).await.unwrap(), (2, 3));
    }
}
