//! Structured read-only relational queries.
//!
//! Callers never hand the engine SQL text. Queries arrive as a SELECT-only
//! AST; identifiers are validated, every literal is bound as a parameter,
//! and inline arrays compile to `rarray(?)` table values, so the result is
//! read-only and injection-free by construction. Column names come back
//! with the case they were written with; comparison inside the engine is
//! case-insensitive as usual for SQLite.

use std::rc::Rc;

use indexmap::IndexMap;
use itertools::Itertools;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::err::{Error, Result};

/// A literal value, going into or coming out of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(r) => SqlValue::Real(r),
            Value::Text(t) => SqlValue::Text(t),
            Value::Blob(b) => SqlValue::Blob(b),
        }
    }
}

impl From<SqlValue> for Value {
    fn from(v: SqlValue) -> Self {
        match v {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(r) => Value::Real(r),
            SqlValue::Text(t) => Value::Text(t),
            SqlValue::Blob(b) => Value::Blob(b),
        }
    }
}

/// One output row, column names in select-list order.
pub type Row = IndexMap<String, Value>;

/// A read-only SELECT.
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub items: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<(Expr, Direction)>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FromItem {
    /// A schema table, optionally aliased.
    Table { name: String, alias: Option<String> },
    /// An inline array joined as a one-column table:
    /// `TABLE(column = (values...)) AS alias`.
    Values {
        alias: String,
        column: String,
        values: Vec<Value>,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// `*`
    All,
    Column {
        table: Option<String>,
        name: String,
    },
    /// A literal, always bound as a parameter.
    Param(Value),
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// `expr IN (values...)`, bound as an array parameter.
    InList {
        expr: Box<Expr>,
        values: Vec<Value>,
    },
    IsNull(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Shorthand for an unqualified column reference.
pub fn col(name: &str) -> Expr {
    Expr::Column {
        table: None,
        name: name.to_string(),
    }
}

/// Shorthand for a bound literal.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Param(value.into())
}

impl Select {
    pub fn column(mut self, name: &str) -> Self {
        self.items.push(SelectItem {
            expr: col(name),
            alias: None,
        });
        self
    }

    pub fn item(mut self, expr: Expr, alias: Option<&str>) -> Self {
        self.items.push(SelectItem {
            expr,
            alias: alias.map(str::to_string),
        });
        self
    }

    pub fn from_table(mut self, name: &str) -> Self {
        self.from.push(FromItem::Table {
            name: name.to_string(),
            alias: None,
        });
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, direction: Direction) -> Self {
        self.order_by.push((expr, direction));
        self
    }
}

/// Scalar functions callable from a query.
const FUNCTIONS: &[&str] = &[
    "abs",
    "avg",
    "count",
    "length",
    "lower",
    "max",
    "min",
    "sum",
    "unpack_score",
    "unpack_value",
    "upper",
];

enum Param {
    Scalar(SqlValue),
    Array(Rc<Vec<SqlValue>>),
}

struct Compiled {
    sql: String,
    params: Vec<Param>,
}

fn check_ident(s: &str) -> Result<&str> {
    let mut chars = s.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(s)
    } else {
        Err(Error::BadQuery(format!("invalid identifier {:?}", s)))
    }
}

struct Compiler {
    out: Compiled,
}

impl Compiler {
    fn bind(&mut self, value: Value) {
        self.out.params.push(Param::Scalar(value.into()));
        self.out.sql.push_str(&format!("?{}", self.out.params.len()));
    }

    fn bind_array(&mut self, values: Vec<Value>) {
        let array: Vec<SqlValue> = values.into_iter().map(Into::into).collect();
        self.out.params.push(Param::Array(Rc::new(array)));
        self.out
            .sql
            .push_str(&format!("rarray(?{})", self.out.params.len()));
    }

    fn expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::All => self.out.sql.push('*'),
            Expr::Column { table, name } => {
                if let Some(table) = table {
                    self.out.sql.push_str(check_ident(table)?);
                    self.out.sql.push('.');
                }
                self.out.sql.push_str(check_ident(name)?);
            }
            Expr::Param(value) => self.bind(value.clone()),
            Expr::Call { func, args } => {
                let func = check_ident(func)?;
                if !FUNCTIONS.contains(&func.to_ascii_lowercase().as_str()) {
                    return Err(Error::BadQuery(format!("unknown function {:?}", func)));
                }
                self.out.sql.push_str(func);
                self.out.sql.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.sql.push_str(", ");
                    }
                    self.expr(arg)?;
                }
                self.out.sql.push(')');
            }
            Expr::Cmp { op, lhs, rhs } => {
                self.out.sql.push('(');
                self.expr(lhs)?;
                self.out.sql.push(' ');
                self.out.sql.push_str(op.sql());
                self.out.sql.push(' ');
                self.expr(rhs)?;
                self.out.sql.push(')');
            }
            Expr::And(terms) | Expr::Or(terms) => {
                let (sep, empty) = match expr {
                    Expr::And(_) => (" AND ", "1"),
                    _ => (" OR ", "0"),
                };
                if terms.is_empty() {
                    self.out.sql.push_str(empty);
                    return Ok(());
                }
                self.out.sql.push('(');
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        self.out.sql.push_str(sep);
                    }
                    self.expr(term)?;
                }
                self.out.sql.push(')');
            }
            Expr::Not(inner) => {
                self.out.sql.push_str("(NOT ");
                self.expr(inner)?;
                self.out.sql.push(')');
            }
            Expr::InList { expr, values } => {
                self.out.sql.push('(');
                self.expr(expr)?;
                self.out.sql.push_str(" IN (SELECT value FROM ");
                self.bind_array(values.clone());
                self.out.sql.push_str("))");
            }
            Expr::IsNull(inner) => {
                self.out.sql.push('(');
                self.expr(inner)?;
                self.out.sql.push_str(" IS NULL)");
            }
        }
        Ok(())
    }

    fn from_item(&mut self, item: &FromItem) -> Result<()> {
        match item {
            FromItem::Table { name, alias } => {
                self.out.sql.push_str(check_ident(name)?);
                if let Some(alias) = alias {
                    self.out.sql.push_str(" AS ");
                    self.out.sql.push_str(check_ident(alias)?);
                }
            }
            FromItem::Values {
                alias,
                column,
                values,
            } => {
                self.out.sql.push_str("(SELECT value AS ");
                self.out.sql.push_str(check_ident(column)?);
                self.out.sql.push_str(" FROM ");
                self.bind_array(values.clone());
                self.out.sql.push_str(") AS ");
                self.out.sql.push_str(check_ident(alias)?);
            }
        }
        Ok(())
    }
}

fn compile(select: &Select) -> Result<Compiled> {
    if select.items.is_empty() {
        return Err(Error::BadQuery("empty select list".to_string()));
    }
    let mut c = Compiler {
        out: Compiled {
            sql: String::from("SELECT "),
            params: Vec::new(),
        },
    };
    for (i, item) in select.items.iter().enumerate() {
        if i > 0 {
            c.out.sql.push_str(", ");
        }
        c.expr(&item.expr)?;
        if let Some(alias) = &item.alias {
            c.out.sql.push_str(" AS ");
            c.out.sql.push_str(check_ident(alias)?);
        }
    }
    if !select.from.is_empty() {
        c.out.sql.push_str(" FROM ");
        for (i, item) in select.from.iter().enumerate() {
            if i > 0 {
                c.out.sql.push_str(", ");
            }
            c.from_item(item)?;
        }
    }
    if let Some(filter) = &select.filter {
        c.out.sql.push_str(" WHERE ");
        c.expr(filter)?;
    }
    if !select.group_by.is_empty() {
        c.out.sql.push_str(" GROUP BY ");
        for (i, expr) in select.group_by.iter().enumerate() {
            if i > 0 {
                c.out.sql.push_str(", ");
            }
            c.expr(expr)?;
        }
    }
    if !select.order_by.is_empty() {
        c.out.sql.push_str(" ORDER BY ");
        for (i, (expr, direction)) in select.order_by.iter().enumerate() {
            if i > 0 {
                c.out.sql.push_str(", ");
            }
            c.expr(expr)?;
            c.out.sql.push_str(match direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
        }
    }
    if let Some(limit) = select.limit {
        c.out.sql.push_str(&format!(" LIMIT {}", limit));
    }
    Ok(c.out)
}

/// Compile and run a SELECT, returning ordered row maps.
pub fn run(conn: &Connection, select: &Select) -> Result<Vec<Row>> {
    let compiled = compile(select)?;
    tracing::debug!("query: {}", compiled.sql);
    let mut stmt = conn.prepare(&compiled.sql)?;
    for (i, param) in compiled.params.iter().enumerate() {
        match param {
            Param::Scalar(value) => stmt.raw_bind_parameter(i + 1, value)?,
            Param::Array(array) => stmt.raw_bind_parameter(i + 1, Rc::clone(array))?,
        }
    }
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (i, name) in names.iter().enumerate() {
            let value: SqlValue = row.get(i)?;
            map.insert(name.clone(), value.into());
        }
        out.push(map);
    }
    Ok(out)
}

/// Extract one column from a row set, for compact assertions and logs.
pub fn column_of(rows: &[Row], name: &str) -> Vec<Value> {
    rows.iter()
        .filter_map(|row| row.get(name).cloned())
        .collect_vec()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;

    use super::*;
    use crate::db::schema;

    fn connect() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        rusqlite::vtab::array::load_module(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO dataset (id, name, cohort) VALUES (1, 'id1', 'TCGA');
             INSERT INTO dataset (id, name, cohort) VALUES (2, 'id2', 'GTEX');
             INSERT INTO field (id, dataset_id, name) VALUES (10, 1, 'probe1');
             INSERT INTO field (id, dataset_id, name) VALUES (11, 1, 'probe2');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn select_ordered_columns() {
        let conn = connect();
        let q = Select::default()
            .column("name")
            .from_table("field")
            .order_by(col("id"), Direction::Asc);
        let rows = run(&conn, &q).unwrap();
        assert_eq!(
            column_of(&rows, "name"),
            vec![Value::Text("probe1".into()), Value::Text("probe2".into())]
        );
    }

    #[test]
    fn filters_bind_parameters() {
        let conn = connect();
        let q = Select::default()
            .column("name")
            .from_table("dataset")
            .filter(Expr::Cmp {
                op: CmpOp::Eq,
                lhs: Box::new(col("cohort")),
                rhs: Box::new(lit("TCGA")),
            });
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::Text("id1".into()));
    }

    #[test]
    fn inline_arrays_join_on_name_lists() {
        let conn = connect();
        let q = Select {
            items: vec![SelectItem {
                expr: Expr::Column {
                    table: Some("f".into()),
                    name: "id".into(),
                },
                alias: None,
            }],
            from: vec![
                FromItem::Table {
                    name: "field".into(),
                    alias: Some("f".into()),
                },
                FromItem::Values {
                    alias: "wanted".into(),
                    column: "name".into(),
                    values: vec!["probe2".into(), "nosuch".into()],
                },
            ],
            filter: Some(Expr::Cmp {
                op: CmpOp::Eq,
                lhs: Box::new(Expr::Column {
                    table: Some("f".into()),
                    name: "name".into(),
                }),
                rhs: Box::new(Expr::Column {
                    table: Some("wanted".into()),
                    name: "name".into(),
                }),
            }),
            ..Default::default()
        };
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Integer(11));
    }

    #[test]
    fn in_list_matches_members() {
        let conn = connect();
        let q = Select::default()
            .column("name")
            .from_table("dataset")
            .filter(Expr::InList {
                expr: Box::new(col("name")),
                values: vec!["id2".into(), "id9".into()],
            });
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::Text("id2".into()));
    }

    #[test]
    fn aggregates_and_grouping() {
        let conn = connect();
        let q = Select {
            items: vec![
                SelectItem {
                    expr: col("dataset_id"),
                    alias: None,
                },
                SelectItem {
                    expr: Expr::Call {
                        func: "count".into(),
                        args: vec![Expr::All],
                    },
                    alias: Some("n".into()),
                },
            ],
            from: vec![FromItem::Table {
                name: "field".into(),
                alias: None,
            }],
            group_by: vec![col("dataset_id")],
            ..Default::default()
        };
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], Value::Integer(2));
    }

    #[test]
    fn aliases_preserve_case() {
        let conn = connect();
        let q = Select::default()
            .item(col("name"), Some("DataSet"))
            .from_table("dataset")
            .order_by(col("name"), Direction::Desc);
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows[0].keys().next().unwrap(), "DataSet");
        assert_eq!(rows[0]["DataSet"], Value::Text("id2".into()));
    }

    #[rstest::rstest]
    #[case("name; DROP TABLE dataset")]
    #[case("name--")]
    #[case("")]
    #[case("1name")]
    fn hostile_identifiers_are_rejected(#[case] ident: &str) {
        let conn = connect();
        let q = Select::default().column(ident).from_table("dataset");
        assert!(matches!(run(&conn, &q), Err(Error::BadQuery(_))));
    }

    #[test]
    fn unknown_functions_are_rejected() {
        let conn = connect();
        let q = Select::default()
            .item(
                Expr::Call {
                    func: "load_extension".into(),
                    args: vec![],
                },
                None,
            )
            .from_table("dataset");
        assert!(matches!(run(&conn, &q), Err(Error::BadQuery(_))));
    }

    #[test]
    fn empty_select_list_is_rejected() {
        let conn = connect();
        let q = Select::default().from_table("dataset");
        assert!(matches!(run(&conn, &q), Err(Error::BadQuery(_))));
    }

    #[test]
    fn limit_and_null_checks() {
        let conn = connect();
        let q = Select {
            items: vec![SelectItem {
                expr: col("name"),
                alias: None,
            }],
            from: vec![FromItem::Table {
                name: "dataset".into(),
                alias: None,
            }],
            filter: Some(Expr::Not(Box::new(Expr::IsNull(Box::new(col("cohort")))))),
            order_by: vec![(col("name"), Direction::Asc)],
            limit: Some(1),
            ..Default::default()
        };
        let rows = run(&conn, &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::Text("id1".into()));
    }
}
