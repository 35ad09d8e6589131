use std::ops::Deref;

use serde::{de::DeserializeOwned, Serialize};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::debug;

use crate::utils::config::AppConfig;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// Embedded `mem://` addresses skip authentication.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        if !address.starts_with("mem://") {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, Error> {
        Self::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
    }

    /// Defines a schemaless table plus plain indexes on `fields`.
    pub async fn ensure_table(&self, table: &str, fields: &[&str]) -> Result<(), Error> {
        let mut statements = format!("DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;");
        for field in fields {
            statements.push_str(&format!(
                "DEFINE INDEX IF NOT EXISTS idx_{table}_{field} ON TABLE {table} FIELDS {field};"
            ));
        }
        debug!(%table, "ensuring table");
        self.client.query(statements).await?.check()?;
        Ok(())
    }

    /// Replaces (or creates) the record `table:id` with `content`.
    pub async fn upsert_record<T>(&self, table: &str, id: &str, content: T) -> Result<(), Error>
    where
        T: Serialize + Send + 'static,
    {
        self.client
            .query("UPSERT type::thing($table, $id) CONTENT $content")
            .bind(("table", table.to_owned()))
            .bind(("id", id.to_owned()))
            .bind(("content", content))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn get_record<T>(&self, table: &str, id: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        self.client.select((table, id)).await
    }

    /// Records whose id is in `ids`, in no particular order.
    pub async fn get_records<T>(&self, table: &str, ids: &[String]) -> Result<Vec<T>, Error>
    where
        T: DeserializeOwned,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.client
            .query("SELECT * FROM type::table($table) WHERE record::id(id) IN $ids")
            .bind(("table", table.to_owned()))
            .bind(("ids", ids.to_vec()))
            .await?
            .take(0)
    }

    pub async fn all_records<T>(&self, table: &str) -> Result<Vec<T>, Error>
    where
        T: DeserializeOwned,
    {
        self.client
            .query("SELECT * FROM type::table($table)")
            .bind(("table", table.to_owned()))
            .await?
            .take(0)
    }

    pub async fn delete_records(&self, table: &str, ids: &[String]) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .query("DELETE type::table($table) WHERE record::id(id) IN $ids")
            .bind(("table", table.to_owned()))
            .bind(("ids", ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn drop_records(&self, table: &str) -> Result<(), Error> {
        self.client
            .query("DELETE type::table($table)")
            .bind(("table", table.to_owned()))
            .await?
            .check()?;
        Ok(())
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Dummy {
        name: String,
    }

    #[tokio::test]
    async fn test_record_helpers() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_table("dummy", &["name"])
            .await
            .expect("Failed to define table");

        db.upsert_record("dummy", "abc", Dummy { name: "first".into() })
            .await
            .expect("Failed to store");
        db.upsert_record("dummy", "abc", Dummy { name: "second".into() })
            .await
            .expect("Failed to replace");

        let fetched: Option<Dummy> = db.get_record("dummy", "abc").await.expect("fetch");
        assert_eq!(fetched, Some(Dummy { name: "second".into() }));

        let many: Vec<Dummy> = db
            .get_records("dummy", &["abc".into(), "missing".into()])
            .await
            .expect("fetch many");
        assert_eq!(many.len(), 1);

        db.delete_records("dummy", &["abc".into()])
            .await
            .expect("delete");
        let gone: Option<Dummy> = db.get_record("dummy", "abc").await.expect("fetch");
        assert!(gone.is_none());
    }
}
