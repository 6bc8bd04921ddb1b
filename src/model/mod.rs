//! Thin persistence mixin over the ambient session.
//!
//! [`ActiveModel`] gives record types `save` / `update` / `delete` / `get` /
//! `get_all`, each resolving the *current* ambient session at call time, not
//! at construction, so one long-lived model value works correctly across
//! different requests and scopes. The ORM proper (mapping, query
//! building) is a collaborator; this surface only forwards rows.
//!
//! Every operation has a suspending and a `_blocking` form; the call site
//! picks explicitly.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Db;
use crate::core::{DbScopeError, Result};

/// A record persisted as a JSON row in one table.
///
/// Rows with an `id` field are upserted by id; [`delete`](Self::delete)
/// targets the record's id when present, its full field set otherwise.
///
/// # Examples
///
/// ```
/// use dbscope::{ActiveModel, Db, SessionFactory};
/// use dbscope::engine::memory::MemoryEngine;
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: i64,
///     name: String,
/// }
///
/// impl ActiveModel for User {
///     const TABLE: &'static str = "users";
/// }
///
/// let factory = SessionFactory::builder()
///     .custom_engine(Arc::new(MemoryEngine::new()))
///     .commit_on_exit(true)
///     .build()
///     .unwrap();
/// let db = Db::new(factory);
///
/// db.scope()
///     .run_blocking(|_session| {
///         let user = User { id: 1, name: "Alice".into() };
///         user.save_blocking(&db)?;
///         let found = User::get_blocking(&db, json!({"name": "Alice"}))?;
///         assert!(found.is_some());
///         Ok::<_, dbscope::DbScopeError>(())
///     })
///     .unwrap();
/// ```
#[async_trait]
pub trait ActiveModel: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;

    async fn save(&self, db: &Db) -> Result<()> {
        db.session()?.save(Self::TABLE, serde_json::to_value(self)?).await
    }

    fn save_blocking(&self, db: &Db) -> Result<()> {
        db.session()?
            .save_blocking(Self::TABLE, serde_json::to_value(self)?)
    }

    /// Apply `fields` onto this record, then save it.
    async fn update(&mut self, db: &Db, fields: Value) -> Result<()>
    where
        Self: Sized,
    {
        apply_fields(self, &fields)?;
        self.save(db).await
    }

    fn update_blocking(&mut self, db: &Db, fields: Value) -> Result<()>
    where
        Self: Sized,
    {
        apply_fields(self, &fields)?;
        self.save_blocking(db)
    }

    async fn delete(&self, db: &Db) -> Result<()> {
        let criteria = identity(&serde_json::to_value(self)?);
        db.session()?.delete(Self::TABLE, &criteria).await?;
        Ok(())
    }

    fn delete_blocking(&self, db: &Db) -> Result<()> {
        let criteria = identity(&serde_json::to_value(self)?);
        db.session()?.delete_blocking(Self::TABLE, &criteria)?;
        Ok(())
    }

    /// First record matching `criteria` (field-equality map).
    async fn get(db: &Db, criteria: Value) -> Result<Option<Self>>
    where
        Self: Sized,
    {
        let rows = db.session()?.find(Self::TABLE, &criteria).await?;
        decode_first(rows)
    }

    fn get_blocking(db: &Db, criteria: Value) -> Result<Option<Self>>
    where
        Self: Sized,
    {
        let rows = db.session()?.find_blocking(Self::TABLE, &criteria)?;
        decode_first(rows)
    }

    /// Every record matching `criteria`. An empty map matches all.
    async fn get_all(db: &Db, criteria: Value) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        let rows = db.session()?.find(Self::TABLE, &criteria).await?;
        decode_all(rows)
    }

    fn get_all_blocking(db: &Db, criteria: Value) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        let rows = db.session()?.find_blocking(Self::TABLE, &criteria)?;
        decode_all(rows)
    }
}

fn decode_first<M: DeserializeOwned>(rows: Vec<Value>) -> Result<Option<M>> {
    rows.into_iter()
        .next()
        .map(serde_json::from_value)
        .transpose()
        .map_err(Into::into)
}

fn decode_all<M: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<M>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

fn apply_fields<M: Serialize + DeserializeOwned>(model: &mut M, fields: &Value) -> Result<()> {
    let mut value = serde_json::to_value(&*model)?;
    match (value.as_object_mut(), fields.as_object()) {
        (Some(row), Some(updates)) => {
            for (key, update) in updates {
                row.insert(key.clone(), update.clone());
            }
        }
        _ => {
            return Err(DbScopeError::Serialization(
                "models and field updates must serialize to JSON objects".into(),
            ));
        }
    }
    *model = serde_json::from_value(value)?;
    Ok(())
}

/// Delete criteria for a row: its `id` when present, all fields otherwise.
fn identity(row: &Value) -> Value {
    match row.get("id") {
        Some(id) => serde_json::json!({ "id": id }),
        None => row.clone(),
    }
}
