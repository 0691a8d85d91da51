//! Queries over a collection.
//!
//! A query is compiled once from a JSON AST into SQL plus a parameter
//! binding map, then run any number of times with different parameters.

mod planner;

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

use crate::db::Collection;
use crate::error::{Error, Result};

pub use planner::MAX_VECTOR_RESULTS;

/// A compiled query.
#[derive(Debug)]
pub struct Query {
    collection: Collection,
    sql: String,
    /// Parameter name bound at each positional placeholder, in order.
    param_names: Vec<String>,
    column_names: Vec<String>,
}

impl Query {
    /// Compile `ast` against `collection`'s stores and indexes.
    pub fn compile(collection: Collection, ast: Value) -> Result<Query> {
        let compiled = planner::plan(&collection, &ast)?;
        Ok(Query {
            collection,
            sql: compiled.sql,
            param_names: compiled.param_names,
            column_names: compiled.column_names,
        })
    }

    /// The generated SQL, for diagnostics.
    pub fn explain(&self) -> &str {
        &self.sql
    }

    /// Names of the result columns, from `WHAT` aliases.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Names of the `$parameters` this query expects.
    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Execute with named parameters; every `$name` in the query must be
    /// present in `params`.
    pub fn run(&self, params: &Value) -> Result<Vec<Vec<Value>>> {
        let mut bound: Vec<SqlValue> = Vec::with_capacity(self.param_names.len());
        for name in &self.param_names {
            let value = params
                .get(name)
                .ok_or_else(|| Error::invalid_parameter(format!("missing parameter ${name}")))?;
            bound.push(json_param_to_sql(value));
        }
        self.collection.store().storage().with_conn(|conn| {
            let mut stmt = conn.prepare(&self.sql)?;
            for (i, value) in bound.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, value)?;
            }
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut cols = Vec::with_capacity(self.column_names.len());
                for i in 0..self.column_names.len() {
                    cols.push(sql_to_json(row.get_ref(i)?));
                }
                out.push(cols);
            }
            Ok(out)
        })
    }
}

fn json_param_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Arrays and objects bind as JSON text; encode_vector() and
        // fl_value() know how to consume it.
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(data_encoding::BASE64.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{Database, DatabaseConfig, PutOptions};
    use crate::store::{IndexKind, IndexSpec};
    use serde_json::json;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("q"), DatabaseConfig::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn select_where_order_limit() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        for (name, age) in [("ada", 36), ("grace", 85), ("alan", 41)] {
            coll.put(
                name,
                &json!({"name": name, "age": age}),
                PutOptions::default(),
            )?;
        }
        let query = coll.query(json!({
            "WHAT": [["AS", [".name"], "name"], [".age"]],
            "WHERE": [">", [".age"], 40],
            "ORDER_BY": [["DESC", [".age"]]],
            "LIMIT": 10
        }))?;
        let rows = query.run(&json!({}))?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![json!("grace"), json!(85)]);
        assert_eq!(rows[1], vec![json!("alan"), json!(41)]);
        assert_eq!(query.column_names()[0], "name");
        Ok(())
    }

    #[test]
    fn parameters_bind_by_name() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        for i in 0..10 {
            coll.put(&format!("doc-{i}"), &json!({"i": i}), PutOptions::default())?;
        }
        let query = coll.query(json!({
            "WHAT": [["._id"]],
            "WHERE": ["AND", [">=", [".i"], ["$min"]], ["<", [".i"], ["$max"]]],
        }))?;
        assert_eq!(query.param_names(), &["min", "max"]);
        let rows = query.run(&json!({"min": 3, "max": 6}))?;
        assert_eq!(rows.len(), 3);
        let err = query.run(&json!({"min": 3})).unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidParameter(_)));
        Ok(())
    }

    #[test]
    fn deleted_documents_are_excluded() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        coll.put("keep", &json!({"x": 1}), PutOptions::default())?;
        coll.put("gone", &json!({"x": 2}), PutOptions::default())?;
        coll.delete("gone")?;
        let query = coll.query(json!({"WHAT": [["._id"]]}))?;
        let rows = query.run(&json!({}))?;
        assert_eq!(rows, vec![vec![json!("keep")]]);
        Ok(())
    }

    #[test]
    fn full_text_match_joins_index() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        coll.create_index(&IndexSpec {
            name: "bytext".into(),
            kind: IndexKind::FullText,
            expression: "summary".into(),
        })?;
        coll.put(
            "a",
            &json!({"summary": "the quick brown fox"}),
            PutOptions::default(),
        )?;
        coll.put(
            "b",
            &json!({"summary": "lazy dogs sleep"}),
            PutOptions::default(),
        )?;
        let query = coll.query(json!({
            "WHAT": [["._id"]],
            "WHERE": ["MATCH()", "bytext", "fox"],
        }))?;
        assert!(query.explain().contains("MATCH"));
        let rows = query.run(&json!({}))?;
        assert_eq!(rows, vec![vec![json!("a")]]);
        Ok(())
    }

    #[test]
    fn vector_query_returns_nearest() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        coll.create_index(&IndexSpec {
            name: "byvec".into(),
            kind: IndexKind::Vector { dimensions: 4 },
            expression: "v".into(),
        })?;
        for i in 0..20 {
            let v = [i as f64, 0.0, 0.0, 0.0];
            coll.put(&format!("doc-{i:02}"), &json!({"v": v}), PutOptions::default())?;
        }
        let query = coll.query(json!({
            "WHAT": [["._id"], ["AS", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]], "dist"]],
            "WHERE": ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]], 1e30],
            "ORDER_BY": [[".dist"]],
            "LIMIT": 5
        }))?;
        let rows = query.run(&json!({"target": [3.0, 0.0, 0.0, 0.0]}))?;
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0][0], json!("doc-03"));
        assert_eq!(rows[0][1], json!(0.0));
        let dists: Vec<f64> = rows.iter().map(|r| r[1].as_f64().unwrap()).collect();
        assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }

    #[test]
    fn vector_query_validation() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        coll.create_index(&IndexSpec {
            name: "byvec".into(),
            kind: IndexKind::Vector { dimensions: 4 },
            expression: "v".into(),
        })?;
        // Missing LIMIT.
        assert!(coll
            .query(json!({
                "WHAT": [["._id"]],
                "WHERE": ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$t"]], 10],
            }))
            .is_err());
        // accurate=true is unsupported.
        assert!(coll
            .query(json!({
                "WHAT": [["._id"]],
                "WHERE": ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$t"], null, null, true], 10],
                "LIMIT": 5
            }))
            .is_err());
        // Inside an OR.
        assert!(coll
            .query(json!({
                "WHAT": [["._id"]],
                "WHERE": ["OR",
                    ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$t"]], 10],
                    ["=", ["._id"], "x"]],
                "LIMIT": 5
            }))
            .is_err());
        // LIMIT over the cap.
        assert!(coll
            .query(json!({
                "WHAT": [["._id"]],
                "WHERE": ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$t"]], 10],
                "LIMIT": 20000
            }))
            .is_err());
        Ok(())
    }

    #[test]
    fn hybrid_vector_query_joins() -> anyhow::Result<()> {
        let (_dir, db) = open_db();
        let coll = db.default_collection()?;
        coll.create_index(&IndexSpec {
            name: "byvec".into(),
            kind: IndexKind::Vector { dimensions: 2 },
            expression: "v".into(),
        })?;
        for i in 0..10 {
            coll.put(
                &format!("doc-{i}"),
                &json!({"v": [i as f64, 0.0], "cat": if i % 2 == 0 { "even" } else { "odd" }}),
                PutOptions::default(),
            )?;
        }
        let query = coll.query(json!({
            "WHAT": [["._id"]],
            "WHERE": ["AND",
                ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]], 1e30],
                ["=", [".cat"], "even"]],
            "ORDER_BY": [["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]]],
            "LIMIT": 3
        }))?;
        // Hybrid queries join the vector table directly instead of
        // nesting a nearest-neighbor SELECT.
        assert!(!query.explain().contains("(SELECT rowid"));
        let rows = query.run(&json!({"target": [0.0, 0.0]}))?;
        assert_eq!(rows[0][0], json!("doc-0"));
        assert!(rows.iter().all(|r| {
            let id = r[0].as_str().unwrap();
            id.trim_start_matches("doc-").parse::<i64>().unwrap() % 2 == 0
        }));
        Ok(())
    }
}
