//! Row helpers built on [`Scope::query`].

use crate::db::context::Context;
use crate::db::scope::Scope;
use crate::error::{DbError, DbResult};
use crate::models::{FromValue, Row, Rows, Value};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::hash::Hash;

/// A pending query whose rows are consumed by one of the helper methods.
pub struct Fetcher<'a> {
    scope: &'a dyn Scope,
    ctx: Context,
    sql: &'a str,
    args: &'a [Value],
}

impl<'a> Fetcher<'a> {
    pub fn new(scope: &'a dyn Scope, ctx: &Context, sql: &'a str, args: &'a [Value]) -> Self {
        Self {
            scope,
            ctx: ctx.clone(),
            sql,
            args,
        }
    }

    async fn rows(&self) -> DbResult<Rows> {
        self.scope.query(&self.ctx, self.sql, self.args).await
    }

    /// Call `f` for every row; returns the number of rows visited.
    pub async fn for_each<F>(self, mut f: F) -> DbResult<usize>
    where
        F: FnMut(&Row) -> DbResult<()>,
    {
        let rows = self.rows().await?;
        for row in &rows {
            f(row)?;
        }
        Ok(rows.len())
    }

    /// The first row `f` accepts; [`DbError::NoRows`] if it accepts none.
    pub async fn one<T, F>(self, mut f: F) -> DbResult<T>
    where
        F: FnMut(&Row) -> DbResult<Option<T>>,
    {
        for row in &self.rows().await? {
            if let Some(value) = f(row)? {
                return Ok(value);
            }
        }
        Err(DbError::NoRows)
    }

    /// Every row `f` accepts, in result order.
    pub async fn all<T, F>(self, mut f: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<Option<T>>,
    {
        let rows = self.rows().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(value) = f(row)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Key/value pairs produced by `f`; later rows overwrite earlier keys.
    pub async fn map<K, V, F>(self, mut f: F) -> DbResult<HashMap<K, V>>
    where
        K: Eq + Hash,
        F: FnMut(&Row) -> DbResult<Option<(K, V)>>,
    {
        let rows = self.rows().await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            if let Some((key, value)) = f(row)? {
                out.insert(key, value);
            }
        }
        Ok(out)
    }

    /// First column as key, second column as value.
    pub async fn dictionary<K, V>(self) -> DbResult<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash,
        V: FromValue,
    {
        let rows = self.rows().await?;
        // Unscripted or undescribed empty results carry no columns to check.
        let shapeless = rows.is_empty() && rows.columns().is_empty();
        if !shapeless && rows.columns().len() < 2 {
            return Err(DbError::invalid_input(format!(
                "dictionary needs two columns, query returned {}",
                rows.columns().len()
            )));
        }
        rows.iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect()
    }

    /// The first row as a column-name to JSON map.
    pub async fn json_map(self) -> DbResult<Map<String, JsonValue>> {
        self.rows()
            .await?
            .first()
            .map(Row::to_json_map)
            .ok_or(DbError::NoRows)
    }

    /// Every row as a column-name to JSON map.
    pub async fn json_maps(self) -> DbResult<Vec<Map<String, JsonValue>>> {
        Ok(self.rows().await?.iter().map(Row::to_json_map).collect())
    }
}
