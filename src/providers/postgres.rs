//! PostgreSQL provider backed by sqlx connection pools.

use crate::error::ExecutionError;
use crate::provider::{BindValue, DataProvider, ProviderFactory, QueryOutput};
use crate::template::Placeholder;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, PgTypeInfo, Postgres};
use sqlx::{Database, Transaction};
use std::collections::HashMap;

/// One sqlx pool per connection name. Built once at startup and shared.
#[derive(Default)]
pub struct PostgresProviderFactory {
    pools: HashMap<String, PgPool>,
}

impl PostgresProviderFactory {
    pub fn new() -> PostgresProviderFactory {
        PostgresProviderFactory::default()
    }

    pub async fn connect(
        &mut self,
        name: &str,
        url: &str,
        max_connections: u32,
    ) -> Result<(), sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        self.pools.insert(name.to_string(), pool);
        Ok(())
    }

    pub fn add_pool(&mut self, name: &str, pool: PgPool) {
        self.pools.insert(name.to_string(), pool);
    }
}

#[async_trait]
impl ProviderFactory for PostgresProviderFactory {
    async fn provider(&self, name: &str) -> Result<Box<dyn DataProvider>, ExecutionError> {
        let pool = self
            .pools
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownConnection(name.to_string()))?;
        Ok(Box::new(PostgresProvider {
            pool: pool.clone(),
            tx: None,
        }))
    }
}

pub struct PostgresProvider {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl DataProvider for PostgresProvider {
    fn placeholder(&self) -> Placeholder {
        Placeholder::Numbered
    }

    fn value_converter(&self, ty: &str, value: BindValue) -> BindValue {
        match (ty, value) {
            ("blob", BindValue::Text(s)) => BindValue::Bytes(s.into_bytes()),
            (_, value) => value,
        }
    }

    async fn begin(&mut self) -> Result<(), ExecutionError> {
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: Vec<BindValue>,
    ) -> Result<QueryOutput, ExecutionError> {
        tracing::debug!(sql = %sql, "executing twig");
        let mut query = sqlx::query(sql);
        for p in params {
            query = query.bind(PgBind(p));
        }
        let rows = match &mut self.tx {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(QueryOutput {
            rows: rows.iter().map(row_to_json).collect(),
            // PostgreSQL has no cursor-level row id; inserts should RETURNING.
            last_inserted_id: Value::Null,
        })
    }

    async fn commit(&mut self) -> Result<(), ExecutionError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ExecutionError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

struct PgBind(BindValue);

impl<'q> Encode<'q, Postgres> for PgBind {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match &self.0 {
            BindValue::Null => <Option<i32> as Encode<Postgres>>::encode_by_ref(&None, buf)?,
            BindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            BindValue::Int(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            BindValue::Float(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            BindValue::Text(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            BindValue::Bytes(b) => {
                let b_ref: &[u8] = b.as_slice();
                <&[u8] as Encode<Postgres>>::encode_by_ref(&b_ref, buf)?
            }
            BindValue::Json(v) => <serde_json::Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }
}

impl sqlx::Type<Postgres> for PgBind {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

fn row_to_json(row: &PgRow) -> Value {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = serde_json::Map::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    Value::Object(map)
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return j;
    }
    Value::Null
}
