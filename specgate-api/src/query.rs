//! Prepared queries and the projection of DB result sets into JSON.
//!
//! The database itself is an abstract [`QuerySource`] that streams
//! result-set events; the return-shape tag decides how rows land in the
//! response body.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use specgate_core::{Error, Result};

/// Database failure classes.  Connectors map driver-specific error codes
/// onto these; the gateway maps them onto HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Signal or file not found: 404
    NotFound,
    /// Duplicate entry: 409
    Duplicate,
    /// Application signal: 400
    BadRequest,
    /// Access denied: 401
    AccessDenied,
    /// Anything else: 500, message logged but not exposed
    Other,
}

#[derive(Debug, Clone)]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> DbError {
        DbError { kind, message: message.into() }
    }

    fn into_error(self) -> Error {
        match self.kind {
            DbErrorKind::NotFound => Error::Key(self.message),
            DbErrorKind::Duplicate => Error::Conflict(self.message),
            DbErrorKind::BadRequest => Error::Validation(self.message),
            DbErrorKind::AccessDenied => Error::AccessDenied,
            DbErrorKind::Other => {
                error!("DB error: {}", self.message);
                Error::Internal(anyhow::anyhow!("database error"))
            }
        }
    }
}

/// Streamed result-set events, in protocol order: for each result set a
/// `BeginResult`, its `Row`s, an `EndResult`; finally `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    BeginResult { columns: Vec<String> },
    Row(Vec<Value>),
    EndResult,
    Done,
    Error(DbError),
}

/// An abstract source of query results (a DB connection pool).
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Submit `sql`; events arrive on the returned channel.
    async fn query(&self, sql: &str) -> Result<mpsc::Receiver<QueryEvent>>;
}

/// How a result set is projected into the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Ok,
    HList,
    List,
    Fields,
    Dict,
    One,
    Bool,
    U64,
    S64,
}

impl ReturnShape {
    pub fn parse(name: &str) -> Result<ReturnShape> {
        match name {
            "ok" => Ok(ReturnShape::Ok),
            "hlist" => Ok(ReturnShape::HList),
            "list" => Ok(ReturnShape::List),
            "fields" => Ok(ReturnShape::Fields),
            "dict" => Ok(ReturnShape::Dict),
            "one" => Ok(ReturnShape::One),
            "bool" => Ok(ReturnShape::Bool),
            "u64" => Ok(ReturnShape::U64),
            "s64" => Ok(ReturnShape::S64),
            other => Err(Error::Validation(format!("unsupported query return type '{other}'"))),
        }
    }
}

/// A prepared query: SQL template, return shape and field labels.
#[derive(Debug, Clone)]
pub struct QueryDef {
    pub sql: String,
    pub ret: ReturnShape,
    pub fields: Option<Vec<String>>,
}

impl QueryDef {
    pub fn from_config(config: &Value) -> Result<QueryDef> {
        let sql = config
            .get("sql")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if sql.is_empty() {
            return Err(Error::Validation("query must have 'sql'".into()));
        }

        let fields = match config.get("fields") {
            Some(Value::Array(items)) => {
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(name) if !name.is_empty() => fields.push(name.to_string()),
                        _ => return Err(Error::Validation("invalid field name".into())),
                    }
                }
                Some(fields)
            }
            Some(_) => return Err(Error::Validation("'fields' must be a list".into())),
            None => None,
        };

        let default = if fields.is_some() { "fields" } else { "ok" };
        let ret =
            ReturnShape::parse(config.get("return").and_then(|v| v.as_str()).unwrap_or(default))?;

        Ok(QueryDef { sql, ret, fields })
    }

    /// Run resolved SQL and project the results.
    ///
    /// Returns the status and optional JSON body. Empty results map to
    /// 404 for the single-row shapes and to empty containers for the
    /// list shapes.
    pub async fn exec(
        &self,
        source: &Arc<dyn QuerySource>,
        sql: &str,
    ) -> Result<(u16, Option<Value>)> {
        debug!("query: {sql}");
        let mut events = source.query(sql).await?;

        let mut columns: Vec<String> = Vec::new();
        let mut row_count = 0usize;
        let mut result_count = 0usize;

        // Shape accumulators
        let mut list: Vec<Value> = Vec::new();
        let mut dict = Map::new();
        let mut scalar: Option<Value> = None;
        let mut fields_out = Map::new();
        let mut current_field: Option<String> = None;

        while let Some(event) = events.recv().await {
            match event {
                QueryEvent::BeginResult { columns: cols } => {
                    columns = cols;

                    if self.ret == ReturnShape::Fields {
                        let fields = self
                            .fields
                            .as_ref()
                            .ok_or_else(|| Error::Validation("fields cannot be null".into()))?;
                        let field = fields.get(result_count).ok_or_else(|| {
                            Error::Validation("unexpected DB result".into())
                        })?;
                        current_field = Some(field.clone());
                    }
                }

                QueryEvent::Row(values) => {
                    row_count += 1;
                    self.accumulate_row(
                        &columns,
                        values,
                        &mut list,
                        &mut dict,
                        &mut scalar,
                        &mut fields_out,
                        current_field.as_deref(),
                    )?;
                }

                QueryEvent::EndResult => {
                    result_count += 1;
                }

                QueryEvent::Done => {
                    return self.finish(row_count, list, dict, scalar, fields_out);
                }

                QueryEvent::Error(db_error) => return Err(db_error.into_error()),
            }
        }

        Err(Error::Upstream("query source closed without Done".into()))
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_row(
        &self,
        columns: &[String],
        values: Vec<Value>,
        list: &mut Vec<Value>,
        dict: &mut Map<String, Value>,
        scalar: &mut Option<Value>,
        fields_out: &mut Map<String, Value>,
        current_field: Option<&str>,
    ) -> Result<()> {
        match self.ret {
            ReturnShape::Ok => Ok(()),

            ReturnShape::HList => {
                if list.is_empty() {
                    list.push(Value::Array(
                        columns.iter().map(|c| Value::from(c.clone())).collect(),
                    ));
                }
                list.push(Value::Array(values));
                Ok(())
            }

            ReturnShape::List => {
                if columns.len() == 1 {
                    list.push(values.into_iter().next().unwrap_or(Value::Null));
                } else {
                    list.push(row_dict(columns, values));
                }
                Ok(())
            }

            ReturnShape::Dict => {
                if dict.is_empty() {
                    if let Value::Object(row) = row_dict(columns, values) {
                        *dict = row;
                    }
                }
                Ok(())
            }

            ReturnShape::One | ReturnShape::Bool | ReturnShape::U64 | ReturnShape::S64 => {
                if columns.len() != 1 {
                    return Err(Error::Validation(format!(
                        "single-value query returned {} columns",
                        columns.len()
                    )));
                }
                if scalar.is_none() {
                    let value = values.into_iter().next().unwrap_or(Value::Null);
                    *scalar = Some(self.coerce_scalar(value)?);
                }
                Ok(())
            }

            ReturnShape::Fields => {
                let field = current_field
                    .ok_or_else(|| Error::Validation("row outside a result set".into()))?;

                if field == "*" {
                    // Merge the row's columns into the outer dict
                    if let Value::Object(row) = row_dict(columns, values) {
                        fields_out.extend(row);
                    }
                } else if let Some(name) = field.strip_prefix('*') {
                    let entry = fields_out
                        .entry(name.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let (Value::Object(target), Value::Object(row)) =
                        (entry, row_dict(columns, values))
                    {
                        target.extend(row);
                    }
                } else {
                    let entry = fields_out
                        .entry(field.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(target) = entry {
                        if columns.len() == 1 {
                            target.push(values.into_iter().next().unwrap_or(Value::Null));
                        } else {
                            target.push(row_dict(columns, values));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn coerce_scalar(&self, value: Value) -> Result<Value> {
        match self.ret {
            ReturnShape::Bool => Ok(Value::from(truthy(&value))),
            ReturnShape::U64 => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .map(Value::from)
                .ok_or_else(|| Error::Validation(format!("expected u64, got {value}"))),
            ReturnShape::S64 => value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .map(Value::from)
                .ok_or_else(|| Error::Validation(format!("expected s64, got {value}"))),
            _ => Ok(value),
        }
    }

    fn finish(
        &self,
        row_count: usize,
        list: Vec<Value>,
        dict: Map<String, Value>,
        scalar: Option<Value>,
        fields_out: Map<String, Value>,
    ) -> Result<(u16, Option<Value>)> {
        match self.ret {
            ReturnShape::Ok => Ok((200, None)),

            // An empty result set is an empty outer list
            ReturnShape::HList | ReturnShape::List => Ok((200, Some(Value::Array(list)))),

            ReturnShape::Dict => {
                if row_count == 0 {
                    Err(Error::Key("not found".into()))
                } else {
                    Ok((200, Some(Value::Object(dict))))
                }
            }

            ReturnShape::One | ReturnShape::Bool | ReturnShape::U64 | ReturnShape::S64 => {
                match scalar {
                    Some(value) => Ok((200, Some(value))),
                    None => Err(Error::Key("not found".into())),
                }
            }

            ReturnShape::Fields => {
                if row_count == 0 {
                    Err(Error::Key("not found".into()))
                } else {
                    Ok((200, Some(Value::Object(fields_out))))
                }
            }
        }
    }
}

fn row_dict(columns: &[String], values: Vec<Value>) -> Value {
    let mut row = Map::new();
    for (column, value) in columns.iter().zip(values) {
        row.insert(column.clone(), value);
    }
    Value::Object(row)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Value::Null => false,
        _ => true,
    }
}

/// One in-memory result set for the fake source.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Deterministic in-memory query source for tests and demos.
///
/// A handler callback maps SQL to result sets or a [`DbError`].
pub struct FakeQuerySource {
    #[allow(clippy::type_complexity)]
    handler: Box<
        dyn Fn(&str) -> std::result::Result<Vec<ResultSet>, DbError> + Send + Sync,
    >,
}

impl FakeQuerySource {
    pub fn new(
        handler: impl Fn(&str) -> std::result::Result<Vec<ResultSet>, DbError>
            + Send
            + Sync
            + 'static,
    ) -> FakeQuerySource {
        FakeQuerySource { handler: Box::new(handler) }
    }
}

#[async_trait]
impl QuerySource for FakeQuerySource {
    async fn query(&self, sql: &str) -> Result<mpsc::Receiver<QueryEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let outcome = (self.handler)(sql);

        tokio::spawn(async move {
            match outcome {
                Ok(results) => {
                    for result in results {
                        let _ = tx
                            .send(QueryEvent::BeginResult { columns: result.columns.clone() })
                            .await;
                        for row in result.rows {
                            let _ = tx.send(QueryEvent::Row(row)).await;
                        }
                        let _ = tx.send(QueryEvent::EndResult).await;
                    }
                    let _ = tx.send(QueryEvent::Done).await;
                }
                Err(error) => {
                    let _ = tx.send(QueryEvent::Error(error)).await;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source_with(results: Vec<ResultSet>) -> Arc<dyn QuerySource> {
        Arc::new(FakeQuerySource::new(move |_| Ok(results.clone())))
    }

    fn def(ret: &str, fields: Option<Vec<&str>>) -> QueryDef {
        QueryDef {
            sql: "SELECT 1".into(),
            ret: ReturnShape::parse(ret).unwrap(),
            fields: fields.map(|f| f.into_iter().map(String::from).collect()),
        }
    }

    fn users_rows() -> ResultSet {
        ResultSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(42), json!("ann")], vec![json!(43), json!("bob")]],
        }
    }

    #[tokio::test]
    async fn shape_ok() {
        let source = source_with(vec![ResultSet::default()]);
        let (code, body) = def("ok", None).exec(&source, "SELECT 1").await.unwrap();
        assert_eq!(code, 200);
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn shape_dict() {
        let source = source_with(vec![users_rows()]);
        let (code, body) = def("dict", None).exec(&source, "q").await.unwrap();
        assert_eq!(code, 200);
        assert_eq!(body.unwrap(), json!({"id": 42, "name": "ann"}));
    }

    #[tokio::test]
    async fn shape_dict_empty_is_404() {
        let source = source_with(vec![ResultSet {
            columns: vec!["id".into()],
            rows: vec![],
        }]);
        let err = def("dict", None).exec(&source, "q").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn shape_list_scalar_and_dict_rows() {
        let source = source_with(vec![ResultSet {
            columns: vec!["name".into()],
            rows: vec![vec![json!("ann")], vec![json!("bob")]],
        }]);
        let (_, body) = def("list", None).exec(&source, "q").await.unwrap();
        assert_eq!(body.unwrap(), json!(["ann", "bob"]));

        let source = source_with(vec![users_rows()]);
        let (_, body) = def("list", None).exec(&source, "q").await.unwrap();
        assert_eq!(
            body.unwrap(),
            json!([{"id": 42, "name": "ann"}, {"id": 43, "name": "bob"}])
        );
    }

    #[tokio::test]
    async fn shape_list_empty_is_empty_list() {
        let source = source_with(vec![ResultSet { columns: vec!["x".into()], rows: vec![] }]);
        let (code, body) = def("list", None).exec(&source, "q").await.unwrap();
        assert_eq!(code, 200);
        assert_eq!(body.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn shape_hlist_header_first() {
        let source = source_with(vec![users_rows()]);
        let (_, body) = def("hlist", None).exec(&source, "q").await.unwrap();
        assert_eq!(
            body.unwrap(),
            json!([["id", "name"], [42, "ann"], [43, "bob"]])
        );
    }

    #[tokio::test]
    async fn shape_hlist_empty_is_empty_list_with_200() {
        let source = source_with(vec![ResultSet { columns: vec!["x".into()], rows: vec![] }]);
        let (code, body) = def("hlist", None).exec(&source, "q").await.unwrap();
        assert_eq!(code, 200);
        assert_eq!(body.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn shape_one_and_scalars() {
        let source = source_with(vec![ResultSet {
            columns: vec!["count".into()],
            rows: vec![vec![json!(7)]],
        }]);
        let (_, body) = def("one", None).exec(&source, "q").await.unwrap();
        assert_eq!(body.unwrap(), json!(7));

        let source = source_with(vec![ResultSet {
            columns: vec!["ok".into()],
            rows: vec![vec![json!(1)]],
        }]);
        let (_, body) = def("bool", None).exec(&source, "q").await.unwrap();
        assert_eq!(body.unwrap(), json!(true));

        let source = source_with(vec![ResultSet {
            columns: vec!["n".into()],
            rows: vec![vec![json!("123")]],
        }]);
        let (_, body) = def("u64", None).exec(&source, "q").await.unwrap();
        assert_eq!(body.unwrap(), json!(123));
    }

    #[tokio::test]
    async fn shape_one_empty_is_404() {
        let source = source_with(vec![ResultSet { columns: vec!["x".into()], rows: vec![] }]);
        let err = def("one", None).exec(&source, "q").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn shape_fields_multi_result() {
        let source = source_with(vec![
            ResultSet {
                columns: vec!["name".into()],
                rows: vec![vec![json!("ann")], vec![json!("bob")]],
            },
            ResultSet {
                columns: vec!["version".into(), "uptime".into()],
                rows: vec![vec![json!("1.0"), json!(99)]],
            },
        ]);
        let (_, body) = def("fields", Some(vec!["users", "*meta"])).exec(&source, "q").await.unwrap();
        assert_eq!(
            body.unwrap(),
            json!({"users": ["ann", "bob"], "meta": {"version": "1.0", "uptime": 99}})
        );
    }

    #[tokio::test]
    async fn shape_fields_bare_star_merges_outer() {
        let source = source_with(vec![ResultSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(1), json!("ann")]],
        }]);
        let (_, body) = def("fields", Some(vec!["*"])).exec(&source, "q").await.unwrap();
        assert_eq!(body.unwrap(), json!({"id": 1, "name": "ann"}));
    }

    #[tokio::test]
    async fn db_error_mapping() {
        for (kind, status) in [
            (DbErrorKind::NotFound, 404),
            (DbErrorKind::Duplicate, 409),
            (DbErrorKind::BadRequest, 400),
            (DbErrorKind::AccessDenied, 401),
            (DbErrorKind::Other, 500),
        ] {
            let source: Arc<dyn QuerySource> =
                Arc::new(FakeQuerySource::new(move |_| Err(DbError::new(kind, "boom"))));
            let err = def("ok", None).exec(&source, "q").await.unwrap_err();
            assert_eq!(err.status_code(), status, "{kind:?}");
        }
    }

    #[test]
    fn config_validation() {
        assert!(QueryDef::from_config(&json!({})).is_err());
        assert!(QueryDef::from_config(&json!({"sql": "  "})).is_err());

        let def = QueryDef::from_config(&json!({"sql": "SELECT 1"})).unwrap();
        assert_eq!(def.ret, ReturnShape::Ok);

        let def =
            QueryDef::from_config(&json!({"sql": "SELECT 1", "fields": ["a"]})).unwrap();
        assert_eq!(def.ret, ReturnShape::Fields);

        assert!(QueryDef::from_config(&json!({"sql": "x", "return": "wat"})).is_err());
    }
}
