//! SQL parser implementation using nom.
//!
//! Covers the statement forms the execution pipeline actually needs to
//! exercise end to end: `CREATE TABLE`/`CREATE INDEX` (and their `DROP`
//! counterparts), `INSERT`/`UPDATE`/`DELETE` with `RETURNING`,
//! `SELECT` with `WHERE`/`ORDER BY`/`LIMIT`/`OFFSET` and one `WITH RECURSIVE`
//! form, and the transaction-control statements (`BEGIN`/`COMMIT`/
//! `ROLLBACK`, `SAVEPOINT`/`RELEASE`/`ROLLBACK TO`). Column names are
//! resolved against a table's schema one layer up, in `src/database.rs`'s
//! binder — this module only produces a syntax tree.

use crate::value::Value;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1},
    combinator::{map, opt, recognize},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};

fn parse_identifier(input: &str) -> IResult<&str, String> {
    let (input, first) = alpha1.parse(input)?;
    let (input, rest) = many0(alt((alphanumeric1, tag("_")))).parse(input)?;
    Ok((input, format!("{first}{}", rest.join(""))))
}

fn ws(input: &str) -> IResult<&str, ()> {
    map(multispace0, |_| ()).parse(input)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    /// Two or more `SELECT`s joined by `UNION [ALL]`/`INTERSECT`/`EXCEPT`,
    /// distinct from the single hard-coded `base UNION ALL recursive` shape
    /// a `WITH RECURSIVE` clause parses on its own.
    SetOp(CompoundSelect),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    DropTable(DropTableStatement),
    CreateIndex(CreateIndexStatement),
    DropIndex(DropIndexStatement),
    Begin,
    Commit,
    Rollback,
    Savepoint(Option<String>),
    Release(Option<String>),
    RollbackTo(Option<String>),
}

/// A `WITH RECURSIVE name AS (base UNION ALL recursive)` clause, scoped to
/// the one recursive-CTE shape the execution pipeline supports: a named
/// working table whose recursive term refers back to `name` in its own
/// `FROM`.
#[derive(Debug, Clone, PartialEq)]
pub struct CteClause {
    pub name: String,
    pub base: Box<SelectStatement>,
    pub recursive: Box<SelectStatement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumns {
    Star,
    List(Vec<RawExpr>),
}

/// `[INNER|LEFT [OUTER]] JOIN <table> ON <predicate>`, one join per
/// `SELECT` — enough to reach the nested-loop `PlanNode::Join` the
/// execution pipeline already implements, not a general join-tree parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinType,
    pub table: String,
    pub on: RawExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub cte: Option<CteClause>,
    pub columns: SelectColumns,
    pub table: String,
    pub join: Option<JoinClause>,
    pub where_clause: Option<RawExpr>,
    pub group_by: Vec<RawExpr>,
    pub having: Option<RawExpr>,
    pub order_by: Vec<(RawExpr, OrderDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

/// A chain of `SELECT`s combined by set operators, left-associative:
/// `first <op> rest[0] <op> rest[1] ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundSelect {
    pub first: SelectStatement,
    pub rest: Vec<(CompoundOp, SelectStatement)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReturningItem {
    Star,
    OldStar,
    NewStar,
    Column(String),
    OldColumn(String),
    NewColumn(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReturningClause {
    pub items: Vec<ReturningItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
    pub returning: Option<ReturningClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: RawExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<RawExpr>,
    pub returning: Option<ReturningClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub where_clause: Option<RawExpr>,
    pub returning: Option<ReturningClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Integer,
    BigInt,
    Real,
    Text,
    Boolean,
    Blob,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
}

/// A table-level clause following the column list: a multi-column primary
/// key, or a named `CHECK` predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Check { name: Option<String>, predicate: RawExpr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub table: String,
    pub columns: Vec<ColumnDefinition>,
    pub table_constraints: Vec<TableConstraint>,
    pub using_module: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    pub table: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    pub index_name: String,
    pub table_name: String,
    pub column_name: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropIndexStatement {
    pub index_name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

/// The syntax tree for a scalar expression, unresolved: `Column` carries a
/// bare name, not yet looked up against any table's schema.
#[derive(Debug, Clone, PartialEq)]
pub enum RawExpr {
    Column(String),
    Literal(Value),
    Not(Box<RawExpr>),
    IsNull { expr: Box<RawExpr>, negated: bool },
    BinaryOp { op: RawOp, left: Box<RawExpr>, right: Box<RawExpr> },
    /// `name(*)` or `name(arg)` — only meaningful where the binder expects
    /// one of the five aggregate functions (`COUNT`/`SUM`/`AVG`/`MIN`/`MAX`);
    /// anywhere else the binder rejects it.
    FunctionCall { name: String, arg: Option<Box<RawExpr>>, star: bool },
}

/// Parses a bare scalar expression, with no surrounding statement. Used by
/// the binder to re-parse a `CheckConstraint`'s stored `expression_text`
/// back into a syntax tree at plan-build time (schema storage only keeps
/// the text, per §5.6's "opaque to the core" design).
pub fn parse_expr_standalone(input: &str) -> Result<RawExpr, String> {
    let (remaining, expr) = delimited(multispace0, parse_expr, multispace0).parse(input).map_err(|e| format!("parse error: {e:?}"))?;
    if !remaining.is_empty() {
        return Err(format!("unexpected input after expression: '{remaining}'"));
    }
    Ok(expr)
}

/// The inverse of `parse_expr`: renders a bound `CHECK` predicate back to
/// SQL text for storage in `CheckConstraint::expression_text`, fully
/// parenthesized so `parse_expr_standalone` always reparses it identically
/// regardless of the original precedence.
pub fn raw_expr_to_sql(expr: &RawExpr) -> String {
    match expr {
        RawExpr::Column(name) => name.clone(),
        RawExpr::Literal(v) => literal_to_sql(v),
        RawExpr::Not(inner) => format!("NOT ({})", raw_expr_to_sql(inner)),
        RawExpr::IsNull { expr, negated } => {
            format!("({}) IS {}NULL", raw_expr_to_sql(expr), if *negated { "NOT " } else { "" })
        }
        RawExpr::BinaryOp { op, left, right } => {
            format!("({}) {} ({})", raw_expr_to_sql(left), op_to_sql(*op), raw_expr_to_sql(right))
        }
        RawExpr::FunctionCall { name, arg, star } => {
            if *star {
                format!("{name}(*)")
            } else {
                format!("{name}({})", raw_expr_to_sql(arg.as_ref().expect("non-star function call carries an argument")))
            }
        }
    }
}

fn literal_to_sql(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Real(r) if r.fract() == 0.0 => format!("{r:.1}"),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "")),
        Value::Blob(_) => "NULL".to_string(),
    }
}

fn op_to_sql(op: RawOp) -> &'static str {
    match op {
        RawOp::And => "AND",
        RawOp::Or => "OR",
        RawOp::Eq => "=",
        RawOp::Ne => "!=",
        RawOp::Lt => "<",
        RawOp::Le => "<=",
        RawOp::Gt => ">",
        RawOp::Ge => ">=",
        RawOp::Add => "+",
        RawOp::Sub => "-",
        RawOp::Mul => "*",
        RawOp::Div => "/",
    }
}

/// Parses one SQL statement, tolerating a trailing `;` and whitespace.
pub fn parse_sql(input: &str) -> Result<Statement, String> {
    let (remaining, statement) = parse_statement.parse(input).map_err(|e| format!("parse error: {e:?}"))?;
    let remaining = remaining.trim_start();
    let remaining = remaining.strip_prefix(';').unwrap_or(remaining);
    if !remaining.trim().is_empty() {
        return Err(format!("unexpected input after statement: '{remaining}'"));
    }
    Ok(statement)
}

fn parse_statement(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(input)?;
    alt((
        parse_with_recursive_select,
        parse_create_table,
        parse_create_index,
        parse_drop_index,
        parse_drop_table,
        parse_insert,
        parse_update,
        parse_delete,
        parse_compound_select,
        parse_savepoint,
        parse_release,
        parse_rollback_to,
        parse_begin,
        parse_commit,
        parse_rollback,
    ))
    .parse(input)
}

fn parse_value(input: &str) -> IResult<&str, Value> {
    alt((
        map(tag_no_case("NULL"), |_| Value::Null),
        map(tag_no_case("TRUE"), |_| Value::Boolean(true)),
        map(tag_no_case("FALSE"), |_| Value::Boolean(false)),
        map(parse_string_literal, Value::Text),
        map(parse_real, Value::Real),
        map(parse_integer, Value::Integer),
    ))
    .parse(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, String> {
    delimited(char('\''), map(take_while1(|c| c != '\''), |s: &str| s.to_string()), char('\'')).parse(input)
}

fn parse_integer(input: &str) -> IResult<&str, i64> {
    let (input, s) = recognize(pair(opt(char('-')), digit1)).parse(input)?;
    let value = s.parse::<i64>().map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((input, value))
}

fn parse_real(input: &str) -> IResult<&str, f64> {
    let (input, s) = recognize((opt(char('-')), digit1, char('.'), digit1)).parse(input)?;
    let value = s.parse::<f64>().map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((input, value))
}

// ---- expressions (precedence: OR < AND < NOT < comparison/IS < additive < multiplicative < primary) ----

fn parse_expr(input: &str) -> IResult<&str, RawExpr> {
    parse_or_expr(input)
}

fn parse_or_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_and_expr(input)?;
    let (input, rest) = many0(preceded(delimited(multispace0, tag_no_case("OR"), multispace1), parse_and_expr)).parse(input)?;
    Ok((input, rest.into_iter().fold(left, |acc, r| RawExpr::BinaryOp { op: RawOp::Or, left: Box::new(acc), right: Box::new(r) })))
}

fn parse_and_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_not_expr(input)?;
    let (input, rest) = many0(preceded(delimited(multispace0, tag_no_case("AND"), multispace1), parse_not_expr)).parse(input)?;
    Ok((input, rest.into_iter().fold(left, |acc, r| RawExpr::BinaryOp { op: RawOp::And, left: Box::new(acc), right: Box::new(r) })))
}

fn parse_not_expr(input: &str) -> IResult<&str, RawExpr> {
    if let Ok((input, _)) = delimited(multispace0, tag_no_case("NOT"), multispace1).parse(input) {
        let (input, e) = parse_not_expr(input)?;
        return Ok((input, RawExpr::Not(Box::new(e))));
    }
    parse_is_expr(input)
}

fn parse_is_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_comparison_expr(input)?;
    if let Ok((input, _)) = delimited(multispace0, tag_no_case("IS"), multispace1).parse(input) {
        let (input, negated) = opt(delimited(tag_no_case("NOT"), multispace1, |i| Ok((i, ())))).parse(input)?;
        let (input, _) = tag_no_case("NULL").parse(input)?;
        return Ok((input, RawExpr::IsNull { expr: Box::new(left), negated: negated.is_some() }));
    }
    Ok((input, left))
}

fn parse_comparison_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_additive_expr(input)?;
    if let Ok((input, op)) = delimited(multispace0, parse_comparison_op, multispace0).parse(input) {
        let (input, right) = parse_additive_expr(input)?;
        return Ok((input, RawExpr::BinaryOp { op, left: Box::new(left), right: Box::new(right) }));
    }
    Ok((input, left))
}

fn parse_comparison_op(input: &str) -> IResult<&str, RawOp> {
    alt((
        map(tag(">="), |_| RawOp::Ge),
        map(tag("<="), |_| RawOp::Le),
        map(tag("!="), |_| RawOp::Ne),
        map(tag("<>"), |_| RawOp::Ne),
        map(tag("="), |_| RawOp::Eq),
        map(tag("<"), |_| RawOp::Lt),
        map(tag(">"), |_| RawOp::Gt),
    ))
    .parse(input)
}

fn parse_additive_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_multiplicative_expr(input)?;
    let (input, rest) = many0(pair(delimited(multispace0, alt((map(char('+'), |_| RawOp::Add), map(char('-'), |_| RawOp::Sub))), multispace0), parse_multiplicative_expr)).parse(input)?;
    Ok((input, rest.into_iter().fold(left, |acc, (op, r)| RawExpr::BinaryOp { op, left: Box::new(acc), right: Box::new(r) })))
}

fn parse_multiplicative_expr(input: &str) -> IResult<&str, RawExpr> {
    let (input, left) = parse_primary_expr(input)?;
    let (input, rest) = many0(pair(delimited(multispace0, alt((map(char('*'), |_| RawOp::Mul), map(char('/'), |_| RawOp::Div))), multispace0), parse_primary_expr)).parse(input)?;
    Ok((input, rest.into_iter().fold(left, |acc, (op, r)| RawExpr::BinaryOp { op, left: Box::new(acc), right: Box::new(r) })))
}

fn parse_primary_expr(input: &str) -> IResult<&str, RawExpr> {
    alt((
        delimited(char('('), delimited(multispace0, parse_expr, multispace0), char(')')),
        map(parse_value, RawExpr::Literal),
        parse_function_call,
        map(parse_identifier, RawExpr::Column),
    ))
    .parse(input)
}

/// `name(*)` or `name(expr)`. Tried before a bare column reference since
/// both start with an identifier; falls back to `RawExpr::Column` when no
/// `(` follows.
fn parse_function_call(input: &str) -> IResult<&str, RawExpr> {
    let (input, name) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, char('('), multispace0).parse(input)?;
    let (input, arg) = alt((map(char('*'), |_| None), map(parse_expr, Some))).parse(input)?;
    let (input, _) = delimited(multispace0, char(')'), |i| Ok((i, ()))).parse(input)?;
    Ok((input, RawExpr::FunctionCall { name, star: arg.is_none(), arg: arg.map(Box::new) }))
}

// ---- SELECT ----

fn parse_select_column_list(input: &str) -> IResult<&str, SelectColumns> {
    if let Ok((input, _)) = tag::<&str, &str, nom::error::Error<&str>>("*").parse(input) {
        return Ok((input, SelectColumns::Star));
    }
    let (input, exprs) = separated_list1(delimited(multispace0, char(','), multispace0), parse_expr).parse(input)?;
    Ok((input, SelectColumns::List(exprs)))
}

fn parse_where_clause(input: &str) -> IResult<&str, RawExpr> {
    let (input, _) = delimited(multispace0, tag_no_case("WHERE"), multispace1).parse(input)?;
    parse_expr(input)
}

fn parse_order_by(input: &str) -> IResult<&str, Vec<(RawExpr, OrderDirection)>> {
    let (input, _) = delimited(multispace0, tag_no_case("ORDER"), multispace1).parse(input)?;
    let (input, _) = delimited(tag_no_case("BY"), multispace1, |i| Ok((i, ()))).parse(input)?;
    separated_list1(delimited(multispace0, char(','), multispace0), parse_order_item).parse(input)
}

fn parse_order_item(input: &str) -> IResult<&str, (RawExpr, OrderDirection)> {
    let (input, expr) = parse_expr(input)?;
    let (input, dir) = opt(preceded(multispace1, alt((map(tag_no_case("ASC"), |_| OrderDirection::Asc), map(tag_no_case("DESC"), |_| OrderDirection::Desc))))).parse(input)?;
    Ok((input, (expr, dir.unwrap_or(OrderDirection::Asc))))
}

fn parse_limit(input: &str) -> IResult<&str, u64> {
    let (input, _) = delimited(multispace0, tag_no_case("LIMIT"), multispace1).parse(input)?;
    let (input, digits) = digit1(input)?;
    let n = digits.parse::<u64>().map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((input, n))
}

fn parse_offset(input: &str) -> IResult<&str, u64> {
    let (input, _) = delimited(multispace0, tag_no_case("OFFSET"), multispace1).parse(input)?;
    let (input, digits) = digit1(input)?;
    let n = digits.parse::<u64>().map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((input, n))
}

fn parse_join_clause(input: &str) -> IResult<&str, JoinClause> {
    let (input, _) = multispace0.parse(input)?;
    let (input, kind) = opt(alt((
        map((tag_no_case("LEFT"), multispace1, opt((tag_no_case("OUTER"), multispace1))), |_| JoinType::Left),
        map((tag_no_case("INNER"), multispace1), |_| JoinType::Inner),
    )))
    .parse(input)?;
    let (input, _) = tag_no_case("JOIN").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("ON"), multispace1).parse(input)?;
    let (input, on) = parse_expr(input)?;
    Ok((input, JoinClause { kind: kind.unwrap_or(JoinType::Inner), table, on }))
}

fn parse_group_by(input: &str) -> IResult<&str, Vec<RawExpr>> {
    let (input, _) = delimited(multispace0, tag_no_case("GROUP"), multispace1).parse(input)?;
    let (input, _) = delimited(tag_no_case("BY"), multispace1, |i| Ok((i, ()))).parse(input)?;
    separated_list1(delimited(multispace0, char(','), multispace0), parse_expr).parse(input)
}

fn parse_having(input: &str) -> IResult<&str, RawExpr> {
    let (input, _) = delimited(multispace0, tag_no_case("HAVING"), multispace1).parse(input)?;
    parse_expr(input)
}

fn parse_select_statement(input: &str) -> IResult<&str, SelectStatement> {
    let (input, _) = tag_no_case("SELECT").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, columns) = parse_select_column_list(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("FROM"), multispace1).parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, join) = opt(parse_join_clause).parse(input)?;
    let (input, where_clause) = opt(parse_where_clause).parse(input)?;
    let (input, group_by) = opt(parse_group_by).parse(input)?;
    let (input, having) = opt(parse_having).parse(input)?;
    let (input, order_by) = opt(parse_order_by).parse(input)?;
    let (input, limit) = opt(parse_limit).parse(input)?;
    let (input, offset) = opt(parse_offset).parse(input)?;
    Ok((
        input,
        SelectStatement {
            cte: None,
            columns,
            table,
            join,
            where_clause,
            group_by: group_by.unwrap_or_default(),
            having,
            order_by: order_by.unwrap_or_default(),
            limit,
            offset,
        },
    ))
}

fn parse_compound_op(input: &str) -> IResult<&str, CompoundOp> {
    alt((
        map((tag_no_case("UNION"), multispace1, tag_no_case("ALL")), |_| CompoundOp::UnionAll),
        map(tag_no_case("UNION"), |_| CompoundOp::Union),
        map(tag_no_case("INTERSECT"), |_| CompoundOp::Intersect),
        map(tag_no_case("EXCEPT"), |_| CompoundOp::Except),
    ))
    .parse(input)
}

/// One `SELECT`, optionally followed by `UNION [ALL]`/`INTERSECT`/`EXCEPT`
/// chained onto more `SELECT`s. Collapses back to a plain `Statement::Select`
/// when no set operator follows, so the ordinary single-query path is
/// unaffected.
fn parse_compound_select(input: &str) -> IResult<&str, Statement> {
    let (input, first) = parse_select_statement(input)?;
    let (input, rest) = many0(pair(delimited(multispace0, parse_compound_op, multispace1), parse_select_statement)).parse(input)?;
    if rest.is_empty() {
        Ok((input, Statement::Select(first)))
    } else {
        Ok((input, Statement::SetOp(CompoundSelect { first, rest })))
    }
}

/// `WITH RECURSIVE name AS ( base UNION ALL recursive ) select`.
fn parse_with_recursive_select(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("WITH").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, _) = tag_no_case("RECURSIVE").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, name) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("AS"), multispace0).parse(input)?;
    let (input, _) = char('(').parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, base) = parse_select_statement(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("UNION"), multispace1).parse(input)?;
    let (input, _) = delimited(tag_no_case("ALL"), multispace0, |i| Ok((i, ()))).parse(input)?;
    let (input, recursive) = parse_select_statement(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, _) = char(')').parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, mut outer) = parse_select_statement(input)?;
    outer.cte = Some(CteClause { name, base: Box::new(base), recursive: Box::new(recursive) });
    Ok((input, Statement::Select(outer)))
}

// ---- RETURNING ----

fn parse_returning_item(input: &str) -> IResult<&str, ReturningItem> {
    alt((
        map(pair(tag_no_case("OLD"), preceded(char('.'), char('*'))), |_| ReturningItem::OldStar),
        map(pair(tag_no_case("NEW"), preceded(char('.'), char('*'))), |_| ReturningItem::NewStar),
        map(pair(tag_no_case("OLD"), preceded(char('.'), parse_identifier)), |(_, c)| ReturningItem::OldColumn(c)),
        map(pair(tag_no_case("NEW"), preceded(char('.'), parse_identifier)), |(_, c)| ReturningItem::NewColumn(c)),
        map(char('*'), |_| ReturningItem::Star),
        map(parse_identifier, ReturningItem::Column),
    ))
    .parse(input)
}

fn parse_returning_clause(input: &str) -> IResult<&str, ReturningClause> {
    let (input, _) = delimited(multispace0, tag_no_case("RETURNING"), multispace1).parse(input)?;
    let (input, items) = separated_list1(delimited(multispace0, char(','), multispace0), parse_returning_item).parse(input)?;
    Ok((input, ReturningClause { items }))
}

// ---- INSERT ----

fn parse_insert(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("INSERT").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, _) = tag_no_case("INTO").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, columns) = opt(delimited(
        char('('),
        separated_list1(delimited(multispace0, char(','), multispace0), parse_identifier),
        char(')'),
    ))
    .parse(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("VALUES"), multispace0).parse(input)?;
    let (input, values) = separated_list1(
        delimited(multispace0, char(','), multispace0),
        delimited(char('('), separated_list0(delimited(multispace0, char(','), multispace0), parse_value), char(')')),
    )
    .parse(input)?;
    let (input, returning) = opt(parse_returning_clause).parse(input)?;
    Ok((input, Statement::Insert(InsertStatement { table, columns: columns.unwrap_or_default(), values, returning })))
}

// ---- UPDATE ----

fn parse_assignment(input: &str) -> IResult<&str, Assignment> {
    let (input, column) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, char('='), multispace0).parse(input)?;
    let (input, value) = parse_expr(input)?;
    Ok((input, Assignment { column, value }))
}

fn parse_update(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("UPDATE").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("SET"), multispace1).parse(input)?;
    let (input, assignments) = separated_list1(delimited(multispace0, char(','), multispace0), parse_assignment).parse(input)?;
    let (input, where_clause) = opt(parse_where_clause).parse(input)?;
    let (input, returning) = opt(parse_returning_clause).parse(input)?;
    Ok((input, Statement::Update(UpdateStatement { table, assignments, where_clause, returning })))
}

// ---- DELETE ----

fn parse_delete(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("DELETE").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, _) = tag_no_case("FROM").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, where_clause) = opt(parse_where_clause).parse(input)?;
    let (input, returning) = opt(parse_returning_clause).parse(input)?;
    Ok((input, Statement::Delete(DeleteStatement { table, where_clause, returning })))
}

// ---- CREATE TABLE ----

fn parse_data_type(input: &str) -> IResult<&str, DataType> {
    alt((
        map(tag_no_case("INTEGER"), |_| DataType::Integer),
        map(tag_no_case("INT"), |_| DataType::Integer),
        map(tag_no_case("BIGINT"), |_| DataType::BigInt),
        map(tag_no_case("REAL"), |_| DataType::Real),
        map(tag_no_case("FLOAT"), |_| DataType::Real),
        map(tag_no_case("BOOLEAN"), |_| DataType::Boolean),
        map(tag_no_case("BOOL"), |_| DataType::Boolean),
        map(tag_no_case("BLOB"), |_| DataType::Blob),
        map(alt((tag_no_case("TEXT"), tag_no_case("VARCHAR"))), |_| DataType::Text),
    ))
    .parse(input)
}

fn parse_column_constraint(input: &str) -> IResult<&str, ColumnConstraint> {
    alt((
        map((tag_no_case("PRIMARY"), multispace1, tag_no_case("KEY")), |_| ColumnConstraint::PrimaryKey),
        map((tag_no_case("NOT"), multispace1, tag_no_case("NULL")), |_| ColumnConstraint::NotNull),
        map(tag_no_case("UNIQUE"), |_| ColumnConstraint::Unique),
    ))
    .parse(input)
}

fn parse_column_definition(input: &str) -> IResult<&str, ColumnDefinition> {
    let (input, name) = parse_identifier(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, data_type) = parse_data_type(input)?;
    let (input, constraints) = many0(preceded(multispace1, parse_column_constraint)).parse(input)?;
    Ok((input, ColumnDefinition { name, data_type, constraints }))
}

fn parse_table_constraint(input: &str) -> IResult<&str, TableConstraint> {
    alt((
        map(
            (tag_no_case("PRIMARY"), multispace1, tag_no_case("KEY"), multispace0, char('('), separated_list1(delimited(multispace0, char(','), multispace0), parse_identifier), char(')')),
            |(_, _, _, _, _, cols, _)| TableConstraint::PrimaryKey(cols),
        ),
        map(
            (
                tag_no_case("CONSTRAINT"),
                multispace1,
                parse_identifier,
                multispace1,
                tag_no_case("CHECK"),
                multispace0,
                char('('),
                delimited(multispace0, parse_expr, multispace0),
                char(')'),
            ),
            |(_, _, name, _, _, _, _, predicate, _)| TableConstraint::Check { name: Some(name), predicate },
        ),
        map((tag_no_case("CHECK"), multispace0, char('('), delimited(multispace0, parse_expr, multispace0), char(')')), |(_, _, _, predicate, _)| {
            TableConstraint::Check { name: None, predicate }
        }),
    ))
    .parse(input)
}

/// A column list entry is either an ordinary column definition or a
/// table-level constraint; distinguished by whether it starts with a
/// constraint keyword.
fn parse_table_item(input: &str) -> IResult<&str, Result<ColumnDefinition, TableConstraint>> {
    alt((map(parse_table_constraint, Err), map(parse_column_definition, Ok))).parse(input)
}

fn parse_create_table(input: &str) -> IResult<&str, Statement> {
    let (input, _) = delimited(multispace0, tag_no_case("CREATE"), multispace1).parse(input)?;
    let (input, _) = tag_no_case("TABLE").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, table) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, char('('), multispace0).parse(input)?;
    let (input, items) = separated_list0(delimited(multispace0, char(','), multispace0), parse_table_item).parse(input)?;
    let (input, _) = delimited(multispace0, char(')'), multispace0).parse(input)?;
    let (input, using_module) = opt(preceded(delimited(tag_no_case("USING"), multispace1, |i| Ok((i, ()))), parse_identifier)).parse(input)?;

    let mut columns = Vec::new();
    let mut table_constraints = Vec::new();
    for item in items {
        match item {
            Ok(col) => columns.push(col),
            Err(constraint) => table_constraints.push(constraint),
        }
    }
    Ok((input, Statement::CreateTable(CreateTableStatement { table, columns, table_constraints, using_module })))
}

fn parse_drop_table(input: &str) -> IResult<&str, Statement> {
    let (input, _) = delimited(multispace0, tag_no_case("DROP"), multispace1).parse(input)?;
    let (input, _) = tag_no_case("TABLE").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, if_exists) = opt(delimited(tag_no_case("IF"), multispace1, preceded(tag_no_case("EXISTS"), multispace1))).parse(input)?;
    let (input, table) = parse_identifier(input)?;
    Ok((input, Statement::DropTable(DropTableStatement { table, if_exists: if_exists.is_some() })))
}

fn parse_create_index(input: &str) -> IResult<&str, Statement> {
    let (input, _) = delimited(multispace0, tag_no_case("CREATE"), multispace1).parse(input)?;
    let (input, unique) = opt(delimited(tag_no_case("UNIQUE"), multispace1, |i| Ok((i, ())))).parse(input)?;
    let (input, _) = tag_no_case("INDEX").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, index_name) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, tag_no_case("ON"), multispace1).parse(input)?;
    let (input, table_name) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, char('('), multispace0).parse(input)?;
    let (input, column_name) = parse_identifier(input)?;
    let (input, _) = delimited(multispace0, char(')'), multispace0).parse(input)?;
    Ok((input, Statement::CreateIndex(CreateIndexStatement { index_name, table_name, column_name, unique: unique.is_some() })))
}

fn parse_drop_index(input: &str) -> IResult<&str, Statement> {
    let (input, _) = delimited(multispace0, tag_no_case("DROP"), multispace1).parse(input)?;
    let (input, _) = tag_no_case("INDEX").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, if_exists) = opt(delimited(tag_no_case("IF"), multispace1, preceded(tag_no_case("EXISTS"), multispace1))).parse(input)?;
    let (input, index_name) = parse_identifier(input)?;
    Ok((input, Statement::DropIndex(DropIndexStatement { index_name, if_exists: if_exists.is_some() })))
}

// ---- transaction control ----

fn parse_begin(input: &str) -> IResult<&str, Statement> {
    map(
        pair(alt((tag_no_case("BEGIN"), tag_no_case("START"))), opt(preceded(multispace1, tag_no_case("TRANSACTION")))),
        |_| Statement::Begin,
    )
    .parse(input)
}

fn parse_commit(input: &str) -> IResult<&str, Statement> {
    map(tag_no_case("COMMIT"), |_| Statement::Commit).parse(input)
}

fn parse_rollback(input: &str) -> IResult<&str, Statement> {
    map(tag_no_case("ROLLBACK"), |_| Statement::Rollback).parse(input)
}

fn parse_savepoint(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("SAVEPOINT").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, name) = parse_identifier(input)?;
    Ok((input, Statement::Savepoint(Some(name))))
}

fn parse_release(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("RELEASE").parse(input)?;
    let (input, _) = opt(delimited(multispace1, tag_no_case("SAVEPOINT"), |i| Ok((i, ())))).parse(input)?;
    let (input, name) = opt(preceded(multispace1, parse_identifier)).parse(input)?;
    Ok((input, Statement::Release(name)))
}

fn parse_rollback_to(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("ROLLBACK").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, _) = tag_no_case("TO").parse(input)?;
    let (input, _) = opt(delimited(multispace1, tag_no_case("SAVEPOINT"), |i| Ok((i, ())))).parse(input)?;
    let (input, name) = opt(preceded(multispace1, parse_identifier)).parse(input)?;
    Ok((input, Statement::RollbackTo(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table_with_constraints() {
        let stmt = parse_sql("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL, CHECK (id > 0))").unwrap();
        match stmt {
            Statement::CreateTable(c) => {
                assert_eq!(c.table, "t");
                assert_eq!(c.columns.len(), 2);
                assert_eq!(c.table_constraints.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_multi_column_primary_key() {
        let stmt = parse_sql("CREATE TABLE t (a INTEGER, b INTEGER, PRIMARY KEY (a, b))").unwrap();
        match stmt {
            Statement::CreateTable(c) => match &c.table_constraints[0] {
                TableConstraint::PrimaryKey(cols) => assert_eq!(cols, &vec!["a".to_string(), "b".to_string()]),
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_insert_with_returning() {
        let stmt = parse_sql("INSERT INTO t (id, name) VALUES (1, 'a') RETURNING *").unwrap();
        match stmt {
            Statement::Insert(i) => {
                assert_eq!(i.values, vec![vec![Value::Integer(1), Value::Text("a".into())]]);
                assert_eq!(i.returning, Some(ReturningClause { items: vec![ReturningItem::Star] }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_update_with_old_new_returning() {
        let stmt = parse_sql("UPDATE t SET x = x + 1 WHERE id = 1 RETURNING OLD.x, NEW.x").unwrap();
        match stmt {
            Statement::Update(u) => {
                assert_eq!(u.assignments.len(), 1);
                assert!(u.where_clause.is_some());
                assert_eq!(u.returning.unwrap().items, vec![ReturningItem::OldColumn("x".into()), ReturningItem::NewColumn("x".into())]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_select_with_where_order_limit_offset() {
        let stmt = parse_sql("SELECT * FROM t WHERE id > 1 ORDER BY id DESC LIMIT 10 OFFSET 5").unwrap();
        match stmt {
            Statement::Select(s) => {
                assert_eq!(s.columns, SelectColumns::Star);
                assert!(s.where_clause.is_some());
                assert_eq!(s.order_by.len(), 1);
                assert_eq!(s.limit, Some(10));
                assert_eq!(s.offset, Some(5));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_with_recursive_select() {
        let stmt = parse_sql("WITH RECURSIVE counter AS (SELECT * FROM seed UNION ALL SELECT * FROM counter) SELECT * FROM counter").unwrap();
        match stmt {
            Statement::Select(s) => {
                let cte = s.cte.unwrap();
                assert_eq!(cte.name, "counter");
                assert_eq!(cte.base.table, "seed");
                assert_eq!(cte.recursive.table, "counter");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_savepoint_family() {
        assert_eq!(parse_sql("SAVEPOINT s1").unwrap(), Statement::Savepoint(Some("s1".into())));
        assert_eq!(parse_sql("RELEASE SAVEPOINT s1").unwrap(), Statement::Release(Some("s1".into())));
        assert_eq!(parse_sql("ROLLBACK TO SAVEPOINT s1").unwrap(), Statement::RollbackTo(Some("s1".into())));
        assert_eq!(parse_sql("ROLLBACK TO s1").unwrap(), Statement::RollbackTo(Some("s1".into())));
    }

    #[test]
    fn parses_is_null_and_boolean_logic() {
        let stmt = parse_sql("SELECT * FROM t WHERE a IS NOT NULL AND b IS NULL OR c = 1").unwrap();
        match stmt {
            Statement::Select(s) => assert!(s.where_clause.is_some()),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
