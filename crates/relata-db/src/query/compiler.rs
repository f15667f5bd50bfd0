//! SQL statement AST and compiler.
//!
//! The query builder produces a [`Query`] (or an [`InsertQuery`],
//! [`UpdateQuery`], [`DeleteQuery`]) and [`SqlCompiler`] renders it into a
//! parameterized SQL string. Every column reference is qualified with its
//! table alias, so the same predicate tree can be rendered inside joins,
//! subqueries and UPDATE/DELETE statements.
//!
//! PostgreSQL uses `$1, $2, ...` placeholders, SQLite uses `?`.

use std::fmt::Write as _;

use relata_core::{RelataError, RelataResult};

use crate::value::Value;

/// The type of database backend, used by the compiler to generate
/// backend-specific SQL syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackendType {
    /// PostgreSQL (uses `$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (uses `?` placeholders).
    SQLite,
}

/// A column qualified by its table alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// The table alias.
    pub alias: String,
    /// The column name.
    pub column: String,
}

impl ColumnRef {
    /// Creates a new column reference.
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CompareOp {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// An aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    /// `MIN`
    Min,
    /// `MAX`
    Max,
    /// `SUM`
    Sum,
    /// `AVG`
    Avg,
}

impl AggregateFunc {
    /// Returns the SQL function name.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
        }
    }
}

/// A projected column.
#[derive(Debug, Clone)]
pub enum SelectColumn {
    /// A column with an output label.
    Column {
        /// The column.
        column: ColumnRef,
        /// The output label.
        label: String,
    },
    /// An aggregate over a column.
    Aggregate {
        /// The function.
        func: AggregateFunc,
        /// The column.
        column: ColumnRef,
        /// The output label.
        label: String,
    },
    /// `COUNT(*)`.
    CountStar {
        /// The output label.
        label: String,
    },
}

/// The source of a SELECT.
#[derive(Debug, Clone)]
pub enum FromSource {
    /// A table, aliased by the query alias.
    Table(String),
    /// A derived table.
    Subquery(Box<Query>),
}

/// SQL JOIN types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// INNER JOIN.
    Inner,
    /// LEFT OUTER JOIN.
    Left,
}

impl JoinType {
    /// Returns the SQL keyword for this join type.
    pub const fn sql_keyword(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// A JOIN clause. The ON condition is a conjunction of column equalities.
#[derive(Debug, Clone)]
pub struct Join {
    /// The table to join.
    pub table: String,
    /// The alias of the joined table.
    pub alias: String,
    /// The type of join.
    pub join_type: JoinType,
    /// Pairs of `(joined column, existing column)` that must be equal.
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

/// A column ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// The column to order by.
    pub column: ColumnRef,
    /// Whether to sort in descending order.
    pub descending: bool,
}

impl OrderBy {
    /// Creates an ascending order.
    pub const fn asc(column: ColumnRef) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    /// Creates a descending order.
    pub const fn desc(column: ColumnRef) -> Self {
        Self {
            column,
            descending: true,
        }
    }
}

/// A WHERE clause node.
#[derive(Debug, Clone)]
pub enum WhereNode {
    /// `column <op> value`.
    Compare {
        /// The column.
        column: ColumnRef,
        /// The operator.
        op: CompareOp,
        /// The bound value.
        value: Value,
    },
    /// `column LIKE pattern ESCAPE '\'`. The pattern is already escaped.
    Like {
        /// The column.
        column: ColumnRef,
        /// The LIKE pattern.
        pattern: String,
        /// Whether the match ignores case.
        case_insensitive: bool,
    },
    /// `column IS [NOT] NULL`.
    IsNull {
        /// The column.
        column: ColumnRef,
        /// Whether to render `IS NOT NULL`.
        negated: bool,
    },
    /// `column IN (values...)`; an empty list never matches.
    In {
        /// The column.
        column: ColumnRef,
        /// The candidate values.
        values: Vec<Value>,
    },
    /// `(c1, c2) IN ((v1, v2), ...)`.
    TupleIn {
        /// The columns.
        columns: Vec<ColumnRef>,
        /// One tuple per candidate.
        rows: Vec<Vec<Value>>,
    },
    /// `(c1, ...) IN (SELECT ...)`.
    InSubquery {
        /// The columns.
        columns: Vec<ColumnRef>,
        /// The subquery, projecting as many columns.
        query: Box<Query>,
    },
    /// Logical AND of conditions.
    And(Vec<WhereNode>),
    /// Logical OR of conditions.
    Or(Vec<WhereNode>),
    /// Logical NOT of a condition.
    Not(Box<WhereNode>),
}

/// A SELECT statement.
#[derive(Debug, Clone)]
pub struct Query {
    /// The FROM source.
    pub from: FromSource,
    /// The alias of the FROM source.
    pub alias: String,
    /// Projected columns.
    pub select: Vec<SelectColumn>,
    /// JOIN clauses.
    pub joins: Vec<Join>,
    /// WHERE clause.
    pub where_clause: Option<WhereNode>,
    /// ORDER BY clauses.
    pub order_by: Vec<OrderBy>,
    /// LIMIT.
    pub limit: Option<usize>,
    /// OFFSET.
    pub offset: Option<usize>,
    /// DISTINCT flag.
    pub distinct: bool,
}

impl Query {
    /// Creates a query over `table`, aliased by its own name.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            alias: table.clone(),
            from: FromSource::Table(table),
            select: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    /// Creates a query over a derived table.
    pub fn from_subquery(query: Self, alias: impl Into<String>) -> Self {
        Self {
            from: FromSource::Subquery(Box::new(query)),
            alias: alias.into(),
            select: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }
}

/// A (possibly multi-row) INSERT statement.
#[derive(Debug, Clone)]
pub struct InsertQuery {
    /// The target table.
    pub table: String,
    /// Inserted columns; empty means `DEFAULT VALUES`.
    pub columns: Vec<String>,
    /// One value list per row.
    pub rows: Vec<Vec<Value>>,
    /// Columns returned by `RETURNING`.
    pub returning: Vec<String>,
}

/// The right-hand side of an UPDATE assignment.
#[derive(Debug, Clone)]
pub enum SetExpr {
    /// A bound value.
    Value(Value),
    /// `CASE WHEN key = k THEN v ... ELSE column END`, keyed by primary key.
    Case {
        /// The key columns compared in each branch.
        key_columns: Vec<ColumnRef>,
        /// `(key values, new value)` branches.
        branches: Vec<(Vec<Value>, Value)>,
    },
}

/// An UPDATE statement. Column references in the predicate use the table
/// name as their alias.
#[derive(Debug, Clone)]
pub struct UpdateQuery {
    /// The target table.
    pub table: String,
    /// `(column, expression)` assignments.
    pub assignments: Vec<(String, SetExpr)>,
    /// WHERE clause.
    pub where_clause: Option<WhereNode>,
}

/// A DELETE statement.
#[derive(Debug, Clone)]
pub struct DeleteQuery {
    /// The target table.
    pub table: String,
    /// WHERE clause.
    pub where_clause: Option<WhereNode>,
}

/// A generic database row for passing data between backends and the ORM.
///
/// `Row` holds a list of column labels and their corresponding values. It
/// provides typed access via the [`get`](Row::get) method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> RelataResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            RelataError::Database(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Returns the raw value of a column, if present.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Converts the row into a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.columns
                .iter()
                .zip(&self.values)
                .map(|(c, v)| (c.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Converts a [`Value`] into a Rust type.
pub trait FromValue: Sized {
    /// Performs the conversion.
    fn from_value(value: &Value) -> RelataResult<Self>;
}

fn type_mismatch(expected: &str, value: &Value) -> RelataError {
    RelataError::Type(format!("expected {expected}, got {value:?}"))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> RelataResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(Self::from(*b)),
            other => Err(type_mismatch("integer", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> RelataResult<Self> {
        value.as_f64().ok_or_else(|| type_mismatch("number", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> RelataResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            other => Err(type_mismatch("boolean", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> RelataResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(type_mismatch("string", other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> RelataResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> RelataResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Escapes the LIKE wildcards in `value` so it only matches itself.
///
/// ```
/// use relata_db::query::compiler::escape_like;
///
/// assert_eq!(escape_like("100%_off"), r"100\%\_off");
/// ```
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn render_column(col: &ColumnRef) -> String {
    format!("{}.{}", quote(&col.alias), quote(&col.column))
}

/// Compiles statement ASTs into SQL strings for one backend.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    backend: DatabaseBackendType,
}

impl SqlCompiler {
    /// Creates a new compiler for the given backend type.
    pub const fn new(backend: DatabaseBackendType) -> Self {
        Self { backend }
    }

    /// Returns the backend this compiler targets.
    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    fn bind(&self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        match self.backend {
            DatabaseBackendType::PostgreSQL => format!("${}", params.len()),
            DatabaseBackendType::SQLite => "?".to_string(),
        }
    }

    /// Compiles a SELECT query into SQL and parameters.
    pub fn compile_select(&self, query: &Query) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.render_select(query, &mut params);
        (sql, params)
    }

    fn render_select(&self, query: &Query, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        if query.distinct {
            sql.push_str("DISTINCT ");
        }

        let items: Vec<String> = if query.select.is_empty() {
            vec!["*".to_string()]
        } else {
            query
                .select
                .iter()
                .map(|item| match item {
                    SelectColumn::Column { column, label } => {
                        format!("{} AS {}", render_column(column), quote(label))
                    }
                    SelectColumn::Aggregate {
                        func,
                        column,
                        label,
                    } => format!(
                        "{}({}) AS {}",
                        func.as_sql(),
                        render_column(column),
                        quote(label)
                    ),
                    SelectColumn::CountStar { label } => format!("COUNT(*) AS {}", quote(label)),
                })
                .collect()
        };
        sql.push_str(&items.join(", "));

        match &query.from {
            FromSource::Table(table) if *table == query.alias => {
                let _ = write!(sql, " FROM {}", quote(table));
            }
            FromSource::Table(table) => {
                let _ = write!(sql, " FROM {} AS {}", quote(table), quote(&query.alias));
            }
            FromSource::Subquery(inner) => {
                let inner_sql = self.render_select(inner, params);
                let _ = write!(sql, " FROM ({inner_sql}) AS {}", quote(&query.alias));
            }
        }

        for join in &query.joins {
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(left, right)| format!("{} = {}", render_column(left), render_column(right)))
                .collect();
            let _ = write!(
                sql,
                " {} {} AS {} ON {}",
                join.join_type.sql_keyword(),
                quote(&join.table),
                quote(&join.alias),
                on.join(" AND ")
            );
        }

        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            self.compile_where_node(where_clause, &mut sql, params);
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let dir = if o.descending { "DESC" } else { "ASC" };
                    format!("{} {dir}", render_column(&o.column))
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", orders.join(", "));
        }

        match (query.limit, query.offset) {
            (Some(limit), offset) => {
                let _ = write!(sql, " LIMIT {limit}");
                if let Some(offset) = offset {
                    let _ = write!(sql, " OFFSET {offset}");
                }
            }
            // SQLite requires a LIMIT before OFFSET.
            (None, Some(offset)) => match self.backend {
                DatabaseBackendType::SQLite => {
                    let _ = write!(sql, " LIMIT -1 OFFSET {offset}");
                }
                DatabaseBackendType::PostgreSQL => {
                    let _ = write!(sql, " OFFSET {offset}");
                }
            },
            (None, None) => {}
        }

        sql
    }

    /// Compiles an INSERT statement.
    pub fn compile_insert(&self, query: &InsertQuery) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("INSERT INTO {}", quote(&query.table));

        if query.columns.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let columns: Vec<String> = query.columns.iter().map(|c| quote(c)).collect();
            let _ = write!(sql, " ({}) VALUES ", columns.join(", "));
            let rows: Vec<String> = query
                .rows
                .iter()
                .map(|row| {
                    let placeholders: Vec<String> = row
                        .iter()
                        .map(|v| self.bind(v.clone(), &mut params))
                        .collect();
                    format!("({})", placeholders.join(", "))
                })
                .collect();
            sql.push_str(&rows.join(", "));
        }

        if !query.returning.is_empty() {
            let returning: Vec<String> = query.returning.iter().map(|c| quote(c)).collect();
            let _ = write!(sql, " RETURNING {}", returning.join(", "));
        }

        (sql, params)
    }

    /// Compiles an UPDATE statement.
    pub fn compile_update(&self, query: &UpdateQuery) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("UPDATE {} SET ", quote(&query.table));

        let mut first = true;
        for (column, expr) in &query.assignments {
            if !first {
                sql.push_str(", ");
            }
            first = false;
            let _ = write!(sql, "{} = ", quote(column));
            match expr {
                SetExpr::Value(v) => {
                    let ph = self.bind(v.clone(), &mut params);
                    sql.push_str(&ph);
                }
                SetExpr::Case {
                    key_columns,
                    branches,
                } => {
                    sql.push_str("CASE");
                    for (keys, value) in branches {
                        let conds: Vec<String> = key_columns
                            .iter()
                            .zip(keys)
                            .map(|(col, key)| {
                                let ph = self.bind(key.clone(), &mut params);
                                format!("{} = {ph}", render_column(col))
                            })
                            .collect();
                        let ph = self.bind(value.clone(), &mut params);
                        let _ = write!(sql, " WHEN {} THEN {ph}", conds.join(" AND "));
                    }
                    let _ = write!(
                        sql,
                        " ELSE {} END",
                        render_column(&ColumnRef::new(query.table.clone(), column.clone()))
                    );
                }
            }
        }

        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            self.compile_where_node(where_clause, &mut sql, &mut params);
        }

        (sql, params)
    }

    /// Compiles a DELETE statement.
    pub fn compile_delete(&self, query: &DeleteQuery) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote(&query.table));
        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            self.compile_where_node(where_clause, &mut sql, &mut params);
        }
        (sql, params)
    }

    /// Compiles a `WhereNode` into SQL, appending to the provided string.
    fn compile_where_node(&self, node: &WhereNode, sql: &mut String, params: &mut Vec<Value>) {
        match node {
            WhereNode::Compare { column, op, value } => {
                let ph = self.bind(value.clone(), params);
                let _ = write!(sql, "{} {} {ph}", render_column(column), op.as_sql());
            }
            WhereNode::Like {
                column,
                pattern,
                case_insensitive,
            } => {
                let ph = self.bind(Value::String(pattern.clone()), params);
                let col = render_column(column);
                match (*case_insensitive, self.backend) {
                    (false, _) => {
                        let _ = write!(sql, "{col} LIKE {ph} ESCAPE '\\'");
                    }
                    (true, DatabaseBackendType::PostgreSQL) => {
                        let _ = write!(sql, "{col} ILIKE {ph} ESCAPE '\\'");
                    }
                    (true, DatabaseBackendType::SQLite) => {
                        let _ = write!(sql, "LOWER({col}) LIKE LOWER({ph}) ESCAPE '\\'");
                    }
                }
            }
            WhereNode::IsNull { column, negated } => {
                let not = if *negated { " NOT" } else { "" };
                let _ = write!(sql, "{} IS{not} NULL", render_column(column));
            }
            WhereNode::In { column, values } => {
                if values.is_empty() {
                    sql.push_str("1 = 0");
                    return;
                }
                let placeholders: Vec<String> =
                    values.iter().map(|v| self.bind(v.clone(), params)).collect();
                let _ = write!(sql, "{} IN ({})", render_column(column), placeholders.join(", "));
            }
            WhereNode::TupleIn { columns, rows } => {
                if rows.is_empty() {
                    sql.push_str("1 = 0");
                    return;
                }
                if let [column] = columns.as_slice() {
                    let values = rows.iter().filter_map(|r| r.first().cloned()).collect();
                    self.compile_where_node(
                        &WhereNode::In {
                            column: column.clone(),
                            values,
                        },
                        sql,
                        params,
                    );
                    return;
                }
                let cols: Vec<String> = columns.iter().map(render_column).collect();
                let tuples: Vec<String> = rows
                    .iter()
                    .map(|row| {
                        let phs: Vec<String> =
                            row.iter().map(|v| self.bind(v.clone(), params)).collect();
                        format!("({})", phs.join(", "))
                    })
                    .collect();
                let _ = write!(sql, "({}) IN ({})", cols.join(", "), tuples.join(", "));
            }
            WhereNode::InSubquery { columns, query } => {
                let cols: Vec<String> = columns.iter().map(render_column).collect();
                let lhs = if cols.len() == 1 {
                    cols[0].clone()
                } else {
                    format!("({})", cols.join(", "))
                };
                let inner = self.render_select(query, params);
                let _ = write!(sql, "{lhs} IN ({inner})");
            }
            WhereNode::And(children) => {
                self.compile_group(children, " AND ", "1 = 1", sql, params);
            }
            WhereNode::Or(children) => {
                self.compile_group(children, " OR ", "1 = 0", sql, params);
            }
            WhereNode::Not(inner) => {
                sql.push_str("NOT (");
                self.compile_where_node(inner, sql, params);
                sql.push(')');
            }
        }
    }

    fn compile_group(
        &self,
        children: &[WhereNode],
        joiner: &str,
        empty: &str,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        if children.is_empty() {
            sql.push_str(empty);
            return;
        }
        sql.push('(');
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                sql.push_str(joiner);
            }
            self.compile_where_node(child, sql, params);
        }
        sql.push(')');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::PostgreSQL)
    }

    fn sqlite() -> SqlCompiler {
        SqlCompiler::new(DatabaseBackendType::SQLite)
    }

    fn col(name: &str) -> ColumnRef {
        ColumnRef::new("books", name)
    }

    fn select_books() -> Query {
        let mut q = Query::new("books");
        q.select.push(SelectColumn::Column {
            column: col("id"),
            label: "id".into(),
        });
        q
    }

    #[test]
    fn test_row_get() {
        let row = Row::new(
            vec!["id".into(), "title".into(), "note".into()],
            vec![Value::Int(1), Value::from("Dune"), Value::Null],
        );
        assert_eq!(row.get::<i64>("id").unwrap(), 1);
        assert_eq!(row.get::<String>("title").unwrap(), "Dune");
        assert_eq!(row.get::<Option<String>>("note").unwrap(), None);
        assert!(row.get::<i64>("missing").is_err());
        assert!(row.get::<i64>("title").is_err());
        assert_eq!(row.to_json()["title"], "Dune");
    }

    #[test]
    fn test_simple_select() {
        let (sql, params) = sqlite().compile_select(&select_books());
        assert_eq!(sql, r#"SELECT "books"."id" AS "id" FROM "books""#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_select_with_join_order_limit() {
        let mut q = select_books();
        q.joins.push(Join {
            table: "authors".into(),
            alias: "books__author".into(),
            join_type: JoinType::Left,
            on: vec![(ColumnRef::new("books__author", "id"), col("author"))],
        });
        q.order_by.push(OrderBy::desc(col("year")));
        q.limit = Some(5);
        q.offset = Some(10);
        let (sql, _) = sqlite().compile_select(&q);
        assert_eq!(
            sql,
            r#"SELECT "books"."id" AS "id" FROM "books" LEFT JOIN "authors" AS "books__author" ON "books__author"."id" = "books"."author" ORDER BY "books"."year" DESC LIMIT 5 OFFSET 10"#
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let mut q = select_books();
        q.offset = Some(3);
        assert!(sqlite().compile_select(&q).0.ends_with("LIMIT -1 OFFSET 3"));
        assert!(pg().compile_select(&q).0.ends_with(" OFFSET 3"));
    }

    #[test]
    fn test_pg_param_numbering() {
        let mut q = select_books();
        q.where_clause = Some(WhereNode::And(vec![
            WhereNode::Compare {
                column: col("year"),
                op: CompareOp::Gt,
                value: Value::Int(1900),
            },
            WhereNode::In {
                column: col("genre"),
                values: vec![Value::from("a"), Value::from("b")],
            },
        ]));
        let (sql, params) = pg().compile_select(&q);
        assert!(sql.ends_with(r#"WHERE ("books"."year" > $1 AND "books"."genre" IN ($2, $3))"#));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_like_escape_rendering() {
        let mut q = select_books();
        q.where_clause = Some(WhereNode::Like {
            column: col("title"),
            pattern: format!("%{}%", escape_like("%")),
            case_insensitive: false,
        });
        let (sql, params) = sqlite().compile_select(&q);
        assert!(sql.ends_with(r#""books"."title" LIKE ? ESCAPE '\'"#));
        assert_eq!(params[0], Value::from(r"%\%%"));
    }

    #[test]
    fn test_icontains_per_backend() {
        let node = WhereNode::Like {
            column: col("title"),
            pattern: "%x%".into(),
            case_insensitive: true,
        };
        let mut q = select_books();
        q.where_clause = Some(node);
        assert!(sqlite().compile_select(&q).0.contains(r#"LOWER("books"."title") LIKE LOWER(?)"#));
        assert!(pg().compile_select(&q).0.contains(r#""books"."title" ILIKE $1"#));
    }

    #[test]
    fn test_empty_in_and_groups() {
        let mut q = select_books();
        q.where_clause = Some(WhereNode::Or(vec![
            WhereNode::In {
                column: col("id"),
                values: vec![],
            },
            WhereNode::Not(Box::new(WhereNode::And(vec![]))),
        ]));
        let (sql, _) = sqlite().compile_select(&q);
        assert!(sql.ends_with("WHERE (1 = 0 OR NOT (1 = 1))"));
    }

    #[test]
    fn test_tuple_in_and_subquery() {
        let mut q = select_books();
        let mut inner = select_books();
        inner.distinct = true;
        inner.limit = Some(2);
        q.where_clause = Some(WhereNode::And(vec![
            WhereNode::TupleIn {
                columns: vec![col("a"), col("b")],
                rows: vec![vec![Value::Int(1), Value::Int(2)]],
            },
            WhereNode::InSubquery {
                columns: vec![col("id")],
                query: Box::new(inner),
            },
        ]));
        let (sql, params) = pg().compile_select(&q);
        assert!(sql.contains(r#"("books"."a", "books"."b") IN (($1, $2))"#));
        assert!(sql.contains(r#""books"."id" IN (SELECT DISTINCT "books"."id" AS "id" FROM "books" LIMIT 2)"#));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_aggregate_over_subquery() {
        let mut inner = select_books();
        inner.distinct = true;
        let mut outer = Query::from_subquery(inner, "sub");
        outer.select.push(SelectColumn::Aggregate {
            func: AggregateFunc::Sum,
            column: ColumnRef::new("sub", "id"),
            label: "id".into(),
        });
        let (sql, _) = sqlite().compile_select(&outer);
        assert_eq!(
            sql,
            r#"SELECT SUM("sub"."id") AS "id" FROM (SELECT DISTINCT "books"."id" AS "id" FROM "books") AS "sub""#
        );
    }

    #[test]
    fn test_multi_row_insert_returning() {
        let (sql, params) = pg().compile_insert(&InsertQuery {
            table: "books".into(),
            columns: vec!["title".into(), "year".into()],
            rows: vec![
                vec![Value::from("a"), Value::Int(1)],
                vec![Value::from("b"), Value::Int(2)],
            ],
            returning: vec!["id".into()],
        });
        assert_eq!(
            sql,
            r#"INSERT INTO "books" ("title", "year") VALUES ($1, $2), ($3, $4) RETURNING "id""#
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_insert_default_values() {
        let (sql, _) = sqlite().compile_insert(&InsertQuery {
            table: "tags".into(),
            columns: vec![],
            rows: vec![vec![]],
            returning: vec!["id".into()],
        });
        assert_eq!(sql, r#"INSERT INTO "tags" DEFAULT VALUES RETURNING "id""#);
    }

    #[test]
    fn test_update_with_case() {
        let (sql, params) = pg().compile_update(&UpdateQuery {
            table: "books".into(),
            assignments: vec![(
                "year".into(),
                SetExpr::Case {
                    key_columns: vec![col("id")],
                    branches: vec![
                        (vec![Value::Int(1)], Value::Int(1999)),
                        (vec![Value::Int(2)], Value::Int(2000)),
                    ],
                },
            )],
            where_clause: Some(WhereNode::In {
                column: col("id"),
                values: vec![Value::Int(1), Value::Int(2)],
            }),
        });
        assert_eq!(
            sql,
            r#"UPDATE "books" SET "year" = CASE WHEN "books"."id" = $1 THEN $2 WHEN "books"."id" = $3 THEN $4 ELSE "books"."year" END WHERE "books"."id" IN ($5, $6)"#
        );
        assert_eq!(params.len(), 6);
    }

    #[test]
    fn test_delete() {
        let (sql, params) = sqlite().compile_delete(&DeleteQuery {
            table: "books".into(),
            where_clause: Some(WhereNode::Compare {
                column: col("id"),
                op: CompareOp::Eq,
                value: Value::Int(1),
            }),
        });
        assert_eq!(sql, r#"DELETE FROM "books" WHERE "books"."id" = ?"#);
        assert_eq!(params, vec![Value::Int(1)]);
    }

    #[test]
    fn test_quote_escapes_identifiers() {
        assert_eq!(quote(r#"we"ird"#), r#""we""ird""#);
    }
}
