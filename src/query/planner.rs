//! JSON query AST -> SQL translation.
//!
//! The input is a dictionary with `WHAT` / `WHERE` / `ORDER_BY` / `LIMIT` /
//! `OFFSET` keys; expressions are JSON arrays whose first element names the
//! operation. Property paths compile to `fl_value(body, 'path')` calls;
//! full-text `MATCH()` and `APPROX_VECTOR_DISTANCE()` compile to joins
//! against the index shadow tables.

use serde_json::Value;

use crate::db::Collection;
use crate::error::{Error, Result};
use crate::store::{DocumentFlags, IndexKind};

/// Hard cap on the LIMIT of a nearest-neighbor query.
pub const MAX_VECTOR_RESULTS: i64 = 10_000;

const DOC_ALIAS: &str = "_doc";
const VECTOR_FN: &str = "APPROX_VECTOR_DISTANCE()";
const MATCH_FN: &str = "MATCH()";

#[derive(Debug)]
pub(super) struct Compiled {
    pub sql: String,
    pub param_names: Vec<String>,
    pub column_names: Vec<String>,
}

#[derive(Debug)]
struct FtsJoin {
    index: String,
    alias: String,
    table: String,
}

#[derive(Debug)]
struct VectorJoin {
    /// Canonical text of (property, metric) identifying the call.
    key: String,
    alias: String,
    table: String,
    metric: String,
    target_sql: String,
    /// Non-hybrid queries nest the nearest-neighbor SELECT.
    nested: bool,
    limit: i64,
}

struct Planner<'a> {
    collection: &'a Collection,
    params: Vec<String>,
    aliases: Vec<(String, String)>,
    fts_joins: Vec<FtsJoin>,
    vector_joins: Vec<VectorJoin>,
}

/// Case-insensitive lookup in the top-level query dictionary.
fn top_level<'v>(ast: &'v Value, key: &str) -> Option<&'v Value> {
    let map = ast.as_object()?;
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn op_name(expr: &Value) -> Option<&str> {
    expr.as_array()?.first()?.as_str()
}

fn is_vector_call(expr: &Value) -> bool {
    op_name(expr)
        .map(|op| op.eq_ignore_ascii_case(VECTOR_FN))
        .unwrap_or(false)
}

pub(super) fn plan(collection: &Collection, ast: &Value) -> Result<Compiled> {
    if !ast.is_object() {
        return Err(Error::invalid_query("query must be a dictionary"));
    }
    let what = top_level(ast, "WHAT");
    let where_clause = top_level(ast, "WHERE");
    let order_by = top_level(ast, "ORDER_BY");
    let limit = match top_level(ast, "LIMIT") {
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| Error::invalid_query("LIMIT must be an integer"))?,
        ),
        None => None,
    };
    let offset = match top_level(ast, "OFFSET") {
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| Error::invalid_query("OFFSET must be an integer"))?,
        ),
        None => None,
    };

    if let Some(where_clause) = where_clause {
        reject_vector_inside_or(where_clause, false)?;
    }

    let mut planner = Planner {
        collection,
        params: Vec::new(),
        aliases: Vec::new(),
        fts_joins: Vec::new(),
        vector_joins: Vec::new(),
    };

    // Scan the whole query for vector-distance calls so joins exist before
    // any expression referencing the distance column is compiled.
    let non_hybrid = non_hybrid_where(where_clause);
    let mut scan_roots: Vec<&Value> = Vec::new();
    if let Some(what) = what {
        scan_roots.push(what);
    }
    if let Some(where_clause) = where_clause {
        scan_roots.push(where_clause);
    }
    if let Some(order_by) = order_by {
        scan_roots.push(order_by);
    }
    for root in scan_roots {
        planner.register_vector_calls(root, non_hybrid, limit)?;
    }

    // WHAT list: build the select columns and the alias registry used by
    // ORDER BY.
    let default_what = Value::Array(vec![Value::Array(vec![Value::String("._id".into())])]);
    let what = what.unwrap_or(&default_what);
    let what_items = what
        .as_array()
        .ok_or_else(|| Error::invalid_query("WHAT must be an array"))?;
    if what_items.is_empty() {
        return Err(Error::invalid_query("WHAT must not be empty"));
    }
    let mut select_list = Vec::new();
    let mut column_names = Vec::new();
    for (i, item) in what_items.iter().enumerate() {
        let (sql, name) = planner.compile_what_item(item, i)?;
        planner.aliases.push((name.clone(), sql.clone()));
        select_list.push(sql);
        column_names.push(name);
    }

    // Compile WHERE and ORDER BY before assembling the statement: a MATCH()
    // in either registers its join table.
    let where_sql = match where_clause {
        Some(where_clause) => Some(planner.compile_expr(where_clause)?),
        None => None,
    };
    let order_sql = match order_by {
        Some(order_by) => {
            let items = order_by
                .as_array()
                .ok_or_else(|| Error::invalid_query("ORDER_BY must be an array"))?;
            let mut clauses = Vec::new();
            for item in items {
                clauses.push(planner.compile_order_item(item)?);
            }
            clauses
        }
        None => Vec::new(),
    };

    let mut sql = format!(
        "SELECT {} FROM {} AS {DOC_ALIAS}",
        select_list.join(", "),
        collection.store().table()
    );
    for join in &planner.fts_joins {
        sql.push_str(&format!(
            " JOIN {} AS {} ON {}.rowid = {DOC_ALIAS}.rowid",
            join.table,
            quote_ident(&join.alias),
            quote_ident(&join.alias)
        ));
    }
    for join in &planner.vector_joins {
        if join.nested {
            sql.push_str(&format!(
                " JOIN (SELECT rowid, vec_distance(vector, encode_vector({target}), {metric}) \
                 AS distance FROM {table} WHERE vector IS NOT NULL \
                 ORDER BY distance LIMIT {limit}) AS {alias} \
                 ON {alias}.rowid = {DOC_ALIAS}.rowid",
                target = join.target_sql,
                metric = quote_string(&join.metric),
                table = join.table,
                limit = join.limit,
                alias = quote_ident(&join.alias),
            ));
        } else {
            sql.push_str(&format!(
                " JOIN {table} AS {alias} ON {alias}.rowid = {DOC_ALIAS}.rowid",
                table = join.table,
                alias = quote_ident(&join.alias),
            ));
        }
    }

    sql.push_str(&format!(
        " WHERE ({DOC_ALIAS}.flags & {}) = 0",
        DocumentFlags::DELETED.0
    ));
    if let Some(where_sql) = where_sql {
        sql.push_str(&format!(" AND {where_sql}"));
    }
    if !order_sql.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order_sql.join(", ")));
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = offset {
        if limit.is_none() {
            sql.push_str(" LIMIT -1");
        }
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    Ok(Compiled {
        sql,
        param_names: planner.params,
        column_names,
    })
}

/// True when the WHERE clause does not force a hybrid plan: it is absent,
/// or is exactly a bound on a vector-distance call.
fn non_hybrid_where(where_clause: Option<&Value>) -> bool {
    let Some(expr) = where_clause else { return true };
    let Some(items) = expr.as_array() else {
        return false;
    };
    if items.len() != 3 {
        return false;
    }
    match items[0].as_str() {
        Some("<") | Some("<=") => is_vector_call(&items[1]),
        Some(">") | Some(">=") => is_vector_call(&items[2]),
        _ => false,
    }
}

/// A vector-distance bound may not appear under an OR inside WHERE: the
/// index join would wrongly filter rows matched by the other branch.
fn reject_vector_inside_or(expr: &Value, in_or: bool) -> Result<()> {
    let Some(items) = expr.as_array() else {
        return Ok(());
    };
    if is_vector_call(expr) && in_or {
        return Err(Error::invalid_query(
            "APPROX_VECTOR_DISTANCE cannot be used inside an OR",
        ));
    }
    let in_or = in_or
        || op_name(expr)
            .map(|op| op.eq_ignore_ascii_case("OR"))
            .unwrap_or(false);
    for item in items {
        reject_vector_inside_or(item, in_or)?;
    }
    Ok(())
}

impl<'a> Planner<'a> {
    fn register_vector_calls(
        &mut self,
        expr: &Value,
        non_hybrid: bool,
        limit: Option<i64>,
    ) -> Result<()> {
        if is_vector_call(expr) {
            self.register_vector_call(expr, non_hybrid, limit)?;
        }
        if let Some(items) = expr.as_array() {
            // The first element of an operation array is its name, which
            // can never itself be a call; recursing over everything also
            // covers plain lists like WHAT and ORDER_BY.
            for item in items {
                self.register_vector_calls(item, non_hybrid, limit)?;
            }
        } else if let Some(map) = expr.as_object() {
            for item in map.values() {
                self.register_vector_calls(item, non_hybrid, limit)?;
            }
        }
        Ok(())
    }

    fn register_vector_call(
        &mut self,
        expr: &Value,
        non_hybrid: bool,
        limit: Option<i64>,
    ) -> Result<()> {
        let items = expr.as_array().expect("vector call is an array");
        let prop = items
            .get(1)
            .and_then(property_path)
            .ok_or_else(|| {
                Error::invalid_query(
                    "first argument to APPROX_VECTOR_DISTANCE must be an indexed property",
                )
            })?;
        let metric = match items.get(3) {
            None | Some(Value::Null) => "euclidean2".to_string(),
            Some(Value::String(m)) if m == "euclidean2" || m == "cosine" => m.clone(),
            Some(other) => {
                return Err(Error::invalid_query(format!(
                    "unsupported vector metric: {other}"
                )))
            }
        };
        if let Some(probes) = items.get(4) {
            if !probes.is_null() {
                let n = probes.as_i64().unwrap_or(0);
                if n <= 0 {
                    return Err(Error::invalid_query(
                        "numProbes must be a positive integer",
                    ));
                }
            }
        }
        if let Some(accurate) = items.get(5) {
            if !accurate.is_null() {
                if !accurate.is_boolean() {
                    return Err(Error::invalid_query("'accurate' argument must be boolean"));
                }
                if accurate.as_bool() == Some(true) {
                    return Err(Error::unsupported(
                        "APPROX_VECTOR_DISTANCE does not support accurate=true",
                    ));
                }
            }
        }
        let key = format!("{prop}\u{1}{metric}");
        if self.vector_joins.iter().any(|j| j.key == key) {
            return Ok(());
        }
        let index = self
            .collection
            .get_indexes_info()?
            .into_iter()
            .find(|info| {
                matches!(info.kind, IndexKind::Vector { .. }) && info.expression == prop
            })
            .ok_or_else(|| {
                Error::invalid_query(format!("no vector index on property '{prop}'"))
            })?;
        let limit = if non_hybrid {
            let limit = limit.ok_or_else(|| {
                Error::invalid_query("a LIMIT must be given when using APPROX_VECTOR_DISTANCE")
            })?;
            if limit <= 0 || limit > MAX_VECTOR_RESULTS {
                return Err(Error::invalid_query(format!(
                    "LIMIT must be between 1 and {MAX_VECTOR_RESULTS} when using \
                     APPROX_VECTOR_DISTANCE"
                )));
            }
            limit
        } else {
            0
        };
        let target_sql = self.compile_expr(items.get(2).ok_or_else(|| {
            Error::invalid_query("APPROX_VECTOR_DISTANCE requires a target vector")
        })?)?;
        let alias = format!("vec{}", self.vector_joins.len() + 1);
        self.vector_joins.push(VectorJoin {
            key,
            alias,
            table: self.collection.store().vector_table(&index.name),
            metric,
            target_sql,
            nested: non_hybrid,
            limit,
        });
        Ok(())
    }

    fn compile_what_item(&mut self, item: &Value, position: usize) -> Result<(String, String)> {
        if let Some(items) = item.as_array() {
            if items.first().and_then(Value::as_str) == Some("AS") {
                let expr = items
                    .get(1)
                    .ok_or_else(|| Error::invalid_query("AS requires an expression"))?;
                let alias = items
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_query("AS requires an alias name"))?;
                return Ok((self.compile_expr(expr)?, alias.to_string()));
            }
        }
        let sql = self.compile_expr(item)?;
        let name = match item.as_array().and_then(|a| a.first()).and_then(Value::as_str) {
            Some(prop) if prop.starts_with('.') => {
                let path = &prop[1..];
                let leaf = path.rsplit('.').next().unwrap_or(path);
                leaf.trim_start_matches('_').to_string()
            }
            _ => format!("${}", position + 1),
        };
        Ok((sql, name))
    }

    fn compile_order_item(&mut self, item: &Value) -> Result<String> {
        let (expr, dir) = match item.as_array() {
            Some(items)
                if items
                    .first()
                    .and_then(Value::as_str)
                    .map(|s| s.eq_ignore_ascii_case("ASC") || s.eq_ignore_ascii_case("DESC"))
                    .unwrap_or(false) =>
            {
                let dir = if items[0].as_str().unwrap().eq_ignore_ascii_case("DESC") {
                    " DESC"
                } else {
                    " ASC"
                };
                (
                    items
                        .get(1)
                        .ok_or_else(|| Error::invalid_query("ORDER_BY direction needs an expression"))?,
                    dir,
                )
            }
            _ => (item, ""),
        };
        // A property reference that names a WHAT alias sorts by that column.
        if let Some(path) = property_path(expr) {
            if let Some((_, sql)) = self.aliases.iter().find(|(name, _)| *name == path) {
                return Ok(format!("{sql}{dir}"));
            }
        }
        Ok(format!("{}{dir}", self.compile_expr(expr)?))
    }

    fn compile_expr(&mut self, expr: &Value) -> Result<String> {
        match expr {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(quote_string(s)),
            Value::Array(items) => self.compile_compound(items),
            Value::Object(_) => Err(Error::invalid_query(
                "dictionaries are not valid expressions",
            )),
        }
    }

    fn compile_compound(&mut self, items: &[Value]) -> Result<String> {
        let op = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_query("expression array must start with an operator"))?;

        if let Some(path) = op.strip_prefix('.') {
            return self.compile_property(path, items);
        }
        if let Some(name) = op.strip_prefix('$') {
            return Ok(self.bind_param(name));
        }
        if op == "[]" {
            // Array literal, carried as JSON text.
            return Ok(quote_string(&Value::Array(items[1..].to_vec()).to_string()));
        }

        let upper = op.to_ascii_uppercase();
        match upper.as_str() {
            "=" | "!=" | "<" | "<=" | ">" | ">=" | "LIKE" => {
                let (a, b) = self.two_args(items, op)?;
                let sql_op = if upper == "=" {
                    "="
                } else if upper == "!=" {
                    "<>"
                } else {
                    upper.as_str()
                };
                Ok(format!("({a} {sql_op} {b})"))
            }
            "+" | "-" | "*" | "/" | "%" => {
                if items.len() == 2 && upper == "-" {
                    let a = self.compile_expr(&items[1])?;
                    return Ok(format!("(-{a})"));
                }
                let (a, b) = self.two_args(items, op)?;
                Ok(format!("({a} {upper} {b})"))
            }
            "AND" | "OR" => {
                let mut parts = Vec::new();
                for item in &items[1..] {
                    parts.push(self.compile_expr(item)?);
                }
                if parts.is_empty() {
                    return Err(Error::invalid_query(format!("{op} requires operands")));
                }
                Ok(format!("({})", parts.join(&format!(" {upper} "))))
            }
            "NOT" => {
                let a = self.compile_expr(
                    items
                        .get(1)
                        .ok_or_else(|| Error::invalid_query("NOT requires an operand"))?,
                )?;
                Ok(format!("(NOT {a})"))
            }
            "IN" => {
                let needle = self.compile_expr(
                    items
                        .get(1)
                        .ok_or_else(|| Error::invalid_query("IN requires a value"))?,
                )?;
                let list = items
                    .get(2)
                    .and_then(Value::as_array)
                    .filter(|a| a.first().and_then(Value::as_str) == Some("[]"))
                    .ok_or_else(|| Error::invalid_query("IN requires an array literal"))?;
                let mut parts = Vec::new();
                for item in &list[1..] {
                    parts.push(self.compile_expr(item)?);
                }
                Ok(format!("({needle} IN ({}))", parts.join(", ")))
            }
            "BETWEEN" => {
                if items.len() != 4 {
                    return Err(Error::invalid_query("BETWEEN requires three operands"));
                }
                let a = self.compile_expr(&items[1])?;
                let lo = self.compile_expr(&items[2])?;
                let hi = self.compile_expr(&items[3])?;
                Ok(format!("({a} BETWEEN {lo} AND {hi})"))
            }
            "IS" | "IS NOT" => {
                let (a, b) = self.two_args(items, op)?;
                Ok(format!("({a} {upper} {b})"))
            }
            "CASE" => self.compile_case(items),
            MATCH_FN => self.compile_match(items),
            VECTOR_FN => self.compile_vector_distance(items),
            _ if upper.ends_with("()") => self.compile_function(&upper, items),
            _ => Err(Error::invalid_query(format!("unknown operator: {op}"))),
        }
    }

    fn compile_property(&mut self, path: &str, items: &[Value]) -> Result<String> {
        let path = if path.is_empty() {
            // [".", "a", "b"] spelled-out form.
            let mut parts = Vec::new();
            for item in &items[1..] {
                parts.push(
                    item.as_str()
                        .ok_or_else(|| Error::invalid_query("property path parts must be strings"))?
                        .to_string(),
                );
            }
            parts.join(".")
        } else {
            path.to_string()
        };
        match path.as_str() {
            "_id" => Ok(format!("{DOC_ALIAS}.key")),
            "_sequence" => Ok(format!("{DOC_ALIAS}.sequence")),
            "_deleted" => Ok(format!(
                "(({DOC_ALIAS}.flags & {}) != 0)",
                DocumentFlags::DELETED.0
            )),
            _ => Ok(format!(
                "fl_value({DOC_ALIAS}.body, {})",
                quote_string(&path)
            )),
        }
    }

    fn bind_param(&mut self, name: &str) -> String {
        let position = match self.params.iter().position(|p| p == name) {
            Some(i) => i,
            None => {
                self.params.push(name.to_string());
                self.params.len() - 1
            }
        };
        format!("?{}", position + 1)
    }

    fn two_args(&mut self, items: &[Value], op: &str) -> Result<(String, String)> {
        if items.len() != 3 {
            return Err(Error::invalid_query(format!(
                "{op} requires exactly two operands"
            )));
        }
        Ok((self.compile_expr(&items[1])?, self.compile_expr(&items[2])?))
    }

    fn compile_case(&mut self, items: &[Value]) -> Result<String> {
        if items.len() < 4 {
            return Err(Error::invalid_query("CASE requires operand, when, then"));
        }
        let mut sql = "CASE".to_string();
        let mut rest = &items[1..];
        if !rest[0].is_null() {
            sql.push(' ');
            sql.push_str(&self.compile_expr(&rest[0])?);
        }
        rest = &rest[1..];
        while rest.len() >= 2 {
            sql.push_str(&format!(
                " WHEN {} THEN {}",
                self.compile_expr(&rest[0])?,
                self.compile_expr(&rest[1])?
            ));
            rest = &rest[2..];
        }
        if let Some(else_expr) = rest.first() {
            sql.push_str(&format!(" ELSE {}", self.compile_expr(else_expr)?));
        }
        sql.push_str(" END");
        Ok(sql)
    }

    fn compile_match(&mut self, items: &[Value]) -> Result<String> {
        let index = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_query("MATCH requires an index name"))?;
        let query_sql = self.compile_expr(
            items
                .get(2)
                .ok_or_else(|| Error::invalid_query("MATCH requires a query string"))?,
        )?;
        let known = self
            .collection
            .get_indexes_info()?
            .into_iter()
            .any(|info| info.kind == IndexKind::FullText && info.name == index);
        if !known {
            return Err(Error::invalid_query(format!(
                "no full-text index named '{index}'"
            )));
        }
        let alias = match self.fts_joins.iter().find(|j| j.index == index) {
            Some(join) => join.alias.clone(),
            None => {
                let alias = format!("fts{}", self.fts_joins.len() + 1);
                self.fts_joins.push(FtsJoin {
                    index: index.to_string(),
                    alias: alias.clone(),
                    table: self.collection.store().fts_table(index),
                });
                alias
            }
        };
        Ok(format!("({} MATCH {query_sql})", quote_ident(&alias)))
    }

    fn compile_vector_distance(&mut self, items: &[Value]) -> Result<String> {
        let prop = items.get(1).and_then(property_path).ok_or_else(|| {
            Error::invalid_query("first argument to APPROX_VECTOR_DISTANCE must be a property")
        })?;
        let metric = match items.get(3) {
            None | Some(Value::Null) => "euclidean2".to_string(),
            Some(Value::String(m)) => m.clone(),
            Some(_) => return Err(Error::invalid_query("vector metric must be a string")),
        };
        let key = format!("{prop}\u{1}{metric}");
        let join = self
            .vector_joins
            .iter()
            .find(|j| j.key == key)
            .ok_or_else(|| Error::invalid_query("vector call was not registered"))?;
        if join.nested {
            Ok(format!("{}.distance", quote_ident(&join.alias)))
        } else {
            let alias = quote_ident(&join.alias);
            let target = join.target_sql.clone();
            let metric = quote_string(&join.metric);
            Ok(format!(
                "vec_distance({alias}.vector, encode_vector({target}), {metric})"
            ))
        }
    }

    fn compile_function(&mut self, upper: &str, items: &[Value]) -> Result<String> {
        let name = upper.trim_end_matches("()");
        let sql_name = match name {
            "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" | "ABS" | "ROUND" | "LENGTH" | "LOWER"
            | "UPPER" | "TRIM" => name,
            _ => {
                return Err(Error::invalid_query(format!(
                    "unknown function: {name}"
                )))
            }
        };
        if items.len() == 1 {
            if name == "COUNT" {
                return Ok("COUNT(*)".to_string());
            }
            return Err(Error::invalid_query(format!("{name} requires arguments")));
        }
        let mut args = Vec::new();
        for item in &items[1..] {
            args.push(self.compile_expr(item)?);
        }
        Ok(format!("{sql_name}({})", args.join(", ")))
    }
}

/// The dotted path of a property expression, if `expr` is one.
fn property_path(expr: &Value) -> Option<String> {
    let items = expr.as_array()?;
    let head = items.first()?.as_str()?;
    let path = head.strip_prefix('.')?;
    if path.is_empty() {
        let mut parts = Vec::new();
        for item in &items[1..] {
            parts.push(item.as_str()?);
        }
        Some(parts.join("."))
    } else {
        Some(path.to_string())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DatabaseConfig};
    use serde_json::json;

    fn collection() -> (tempfile::TempDir, Database, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("p"), DatabaseConfig::default()).unwrap();
        let coll = db.default_collection().unwrap();
        (dir, db, coll)
    }

    #[test]
    fn property_paths_compile_to_fl_value() {
        let (_dir, _db, coll) = collection();
        let compiled = plan(
            &coll,
            &json!({"WHAT": [[".address.city"]], "WHERE": ["=", [".name"], "ada"]}),
        )
        .unwrap();
        assert!(compiled.sql.contains("fl_value(_doc.body, 'address.city')"));
        assert!(compiled.sql.contains("fl_value(_doc.body, 'name')"));
        assert!(compiled.sql.contains("= 'ada'"));
        assert_eq!(compiled.column_names, vec!["city"]);
    }

    #[test]
    fn repeated_params_share_a_placeholder() {
        let (_dir, _db, coll) = collection();
        let compiled = plan(
            &coll,
            &json!({
                "WHAT": [["._id"]],
                "WHERE": ["OR", ["=", [".a"], ["$x"]], ["=", [".b"], ["$x"]]],
            }),
        )
        .unwrap();
        assert_eq!(compiled.param_names, vec!["x"]);
        assert_eq!(compiled.sql.matches("?1").count(), 2);
    }

    #[test]
    fn meta_properties() {
        let (_dir, _db, coll) = collection();
        let compiled = plan(
            &coll,
            &json!({"WHAT": [["._id"], ["._sequence"]], "ORDER_BY": [["._sequence"]]}),
        )
        .unwrap();
        assert!(compiled.sql.contains("_doc.key"));
        assert!(compiled.sql.contains("_doc.sequence"));
        assert_eq!(compiled.column_names, vec!["id", "sequence"]);
    }

    #[test]
    fn operators_translate() {
        let (_dir, _db, coll) = collection();
        let compiled = plan(
            &coll,
            &json!({
                "WHAT": [["CASE", null, ["=", [".x"], 1], "one", "other"]],
                "WHERE": ["AND",
                    ["BETWEEN", [".n"], 1, 10],
                    ["IN", [".tag"], ["[]", "a", "b"]],
                    ["IS NOT", [".opt"], null],
                    ["LIKE", [".name"], "a%"],
                    ["NOT", ["=", [".x"], 2]]],
            }),
        )
        .unwrap();
        assert!(compiled.sql.contains("BETWEEN 1 AND 10"));
        assert!(compiled.sql.contains("IN ('a', 'b')"));
        assert!(compiled.sql.contains("IS NOT NULL"));
        assert!(compiled.sql.contains("LIKE 'a%'"));
        assert!(compiled.sql.contains("CASE WHEN"));
        assert!(compiled.sql.contains("(NOT"));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let (_dir, _db, coll) = collection();
        let err = plan(
            &coll,
            &json!({"WHAT": [["._id"]], "WHERE": ["FROB", 1, 2]}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }
}
