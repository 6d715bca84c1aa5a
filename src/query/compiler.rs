use std::collections::HashSet;

use crate::sql_writer::SqlWriter;
use crate::value::Value;
use indexmap::IndexMap;

use super::QueryError;

type Result<T, E = QueryError> = std::result::Result<T, E>;

macro_rules! fail {
    ($($arg:tt)*) => {
        return Err(QueryError::InvalidQuery(format!($($arg)*)))
    };
}

/// How an [Operation]'s SQL gets emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Prefix,
    Postfix,
    Infix,
    In,
    Between,
    Exists,
    Match,
    Property,
    Parameter,
    Select,
    Fallback,
}

/// One entry of the operator table: symbol, arity range, precedence and
/// emission handler.
#[derive(Debug)]
struct Operation {
    op: &'static str,
    min_args: usize,
    max_args: usize,
    precedence: i32,
    handler: Handler,
}

const fn op(
    op: &'static str,
    min_args: usize,
    max_args: usize,
    precedence: i32,
    handler: Handler,
) -> Operation {
    Operation {
        op,
        min_args,
        max_args,
        precedence,
        handler,
    }
}

// The operator table. Scanned in order; the empty-symbol entry at the end is
// the fallback for function-call syntax and must stay last. Its precedence is
// the maximum so unknown operators always emit atomically.
// See http://www.sqlite.org/lang_expr.html for the SQL precedence levels.
static OPERATIONS: &[Operation] = &[
    op(".", 1, 9, 9, Handler::Property),
    op("$", 1, 1, 9, Handler::Parameter),
    //
    op("||", 2, 9, 8, Handler::Infix),
    //
    op("*", 2, 9, 7, Handler::Infix),
    op("/", 2, 2, 7, Handler::Infix),
    op("%", 2, 2, 7, Handler::Infix),
    //
    op("+", 2, 9, 6, Handler::Infix),
    op("-", 2, 2, 6, Handler::Infix),
    op("-", 1, 1, 9, Handler::Prefix),
    //
    op("<", 2, 2, 4, Handler::Infix),
    op("<=", 2, 2, 4, Handler::Infix),
    op(">", 2, 2, 4, Handler::Infix),
    op(">=", 2, 2, 4, Handler::Infix),
    //
    op("=", 2, 2, 3, Handler::Infix),
    op("!=", 2, 2, 3, Handler::Infix),
    op("IS", 2, 2, 3, Handler::Infix),
    op("IS NOT", 2, 2, 3, Handler::Infix),
    op("IN", 2, 9, 3, Handler::In),
    op("NOT IN", 2, 9, 3, Handler::In),
    op("LIKE", 2, 2, 3, Handler::Infix),
    op("MATCH", 2, 2, 3, Handler::Match),
    op("BETWEEN", 3, 3, 3, Handler::Between),
    op("EXISTS", 1, 1, 8, Handler::Exists),
    //
    op("NOT", 1, 1, 9, Handler::Prefix),
    op("AND", 2, 9, 2, Handler::Infix),
    op("OR", 2, 9, 2, Handler::Infix),
    //
    op("SELECT", 1, 1, 1, Handler::Select),
    //
    op("DESC", 1, 1, 2, Handler::Postfix),
    //
    op("", 0, 0, 10, Handler::Fallback),
];

static ARG_LIST: Operation = op(",", 0, 9, -2, Handler::Infix);
static ORDER_BY: Operation = op("ORDER BY", 1, 9, -3, Handler::Infix);
static OUTER: Operation = op("", 1, 1, -1, Handler::Infix);

/// Translates a JSON-encoded expression tree into a SQL statement against
/// the backing document table.
///
/// Instances are single-use: after a `parse` the emitted SQL, the full-text
/// property list and the parameter-name set stay readable until the compiler
/// is dropped.
#[derive(Debug)]
pub struct QueryCompiler {
    table_name: String,
    body_column: String,
    property_path: String,
    base_result_columns: Vec<String>,
    default_limit: String,
    default_offset: String,

    sql: SqlWriter,
    context: Vec<&'static Operation>,
    fts_properties: Vec<String>,
    parameters: HashSet<String>,
}

impl QueryCompiler {
    pub fn new(table_name: &str, body_column: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            body_column: body_column.to_string(),
            property_path: String::new(),
            base_result_columns: Vec::new(),
            default_limit: String::new(),
            default_offset: String::new(),
            sql: SqlWriter::new(),
            context: vec![&OUTER],
            fts_properties: Vec::new(),
            parameters: HashSet::new(),
        }
    }

    /// Path prefix prepended to every property reference, for compiling
    /// expressions scoped inside a document subtree.
    pub fn set_property_path(&mut self, path: &str) {
        self.property_path = path.to_string();
    }

    /// Result columns emitted ahead of any full-text `offsets(..)` columns.
    /// With none configured the SELECT falls back to `*`.
    pub fn set_base_result_columns(&mut self, columns: &[&str]) {
        self.base_result_columns = columns.iter().map(|c| c.to_string()).collect();
    }

    /// LIMIT fragment appended to a compiled SELECT. Fragment compilation
    /// only; the executor binds `$limit` itself.
    pub fn set_default_limit(&mut self, fragment: &str) {
        self.default_limit = fragment.to_string();
    }

    pub fn set_default_offset(&mut self, fragment: &str) {
        self.default_offset = fragment.to_string();
    }

    /// The SQL emitted by the last `parse`.
    pub fn sql(&self) -> &str {
        self.sql.as_str()
    }

    /// Property paths found as MATCH sources, in discovery order. Positions
    /// are the 1-based FTS table aliases in the emitted SQL.
    pub fn fts_properties(&self) -> &[String] {
        &self.fts_properties
    }

    /// Names referenced by `["$", name]` parameter nodes.
    pub fn parameters(&self) -> &HashSet<String> {
        &self.parameters
    }

    fn reset(&mut self) {
        self.context.clear();
        self.context.push(&OUTER);
        self.sql.clear();
    }

    /// Compiles a complete query. A dictionary is taken as the operands of a
    /// SELECT, an array starting with `"SELECT"` as a full select operation,
    /// and any other expression as the WHERE clause of an implicit SELECT.
    pub fn parse(&mut self, expression: &Value) -> Result<()> {
        self.reset();
        match expression {
            Value::Dict(operands) => self.write_select_dict(operands),
            Value::Array(items)
                if items.first().and_then(Value::as_str) == Some("SELECT") =>
            {
                self.parse_node(expression)
            }
            _ => self.write_select(Some(expression), None),
        }
    }

    /// Compiles JSON text.
    pub fn parse_json(&mut self, json: &str) -> Result<()> {
        let expression = Value::from_json(json)
            .map_err(|e| QueryError::InvalidQuery(format!("invalid JSON: {}", e)))?;
        self.parse(&expression)
    }

    /// Compiles a single expression with no SELECT wrapper, for SQL
    /// fragments.
    pub fn parse_just_expression(&mut self, expression: &Value) -> Result<()> {
        self.reset();
        self.parse_node(expression)
    }

    /// Compiles an expression as a bare WHERE clause and returns it. Runs
    /// the full-text scan first, so `fts_properties` is complete afterwards.
    pub fn compile_where(&mut self, expression: &Value) -> Result<String> {
        self.reset();
        self.find_fts_properties(expression)?;
        self.parse_node(expression)?;
        Ok(self.sql.take())
    }

    /// Compiles an array of ordering terms as a bare ORDER BY list.
    pub fn compile_order_by(&mut self, order: &Value) -> Result<String> {
        self.reset();
        let Some(terms) = order.as_array() else {
            fail!("Expected a JSON array");
        };
        self.context.push(&ORDER_BY);
        self.write_arg_list(terms)?;
        self.context.pop();
        Ok(self.sql.take())
    }

    /// SQL snippet reading one document property, e.g. for index creation.
    pub fn property_getter(property: &str, body_column: &str) -> Result<String> {
        let mut qp = QueryCompiler::new("XXX", body_column);
        qp.write_property_getter("fl_value", property)?;
        Ok(qp.sql.build())
    }

    fn write_select_dict(&mut self, operands: &IndexMap<String, Value>) -> Result<()> {
        self.write_select(operands.get("WHERE"), Some(operands))
    }

    fn write_select(
        &mut self,
        where_clause: Option<&Value>,
        operands: Option<&IndexMap<String, Value>>,
    ) -> Result<()> {
        // All properties involved in MATCH have to be known before the FROM
        // clause is emitted:
        if let Some(node) = where_clause {
            self.find_fts_properties(node)?;
        }

        // 'What' clause:
        self.sql.write_str("SELECT");
        let mut n_col = 0;
        for col in &self.base_result_columns {
            self.sql.write_str(if n_col > 0 { ", " } else { " " });
            self.sql.write_str(col);
            n_col += 1;
        }
        for property_path in &self.fts_properties {
            self.sql.write_str(if n_col > 0 { ", " } else { " " });
            self.sql.write_str("offsets(");
            self.sql
                .write_name(&format!("{}::{}", self.table_name, property_path));
            self.sql.write_char(')');
            n_col += 1;
        }
        if operands.is_some_and(|o| o.get("WHAT").is_some()) {
            fail!("WHAT parameter to SELECT isn't supported yet, sorry");
        }
        if n_col == 0 {
            self.sql.write_str(" *");
        }

        // FROM clause:
        if operands.is_some_and(|o| o.get("FROM").is_some()) {
            fail!("FROM parameter to SELECT isn't supported yet, sorry");
        }
        write!(self.sql, " FROM {}", self.table_name);
        for (i, property_path) in self.fts_properties.iter().enumerate() {
            self.sql.write_str(", ");
            self.sql
                .write_name(&format!("{}::{}", self.table_name, property_path));
            write!(self.sql, " AS FTS{}", i + 1);
        }

        // WHERE clause:
        if let Some(node) = where_clause {
            self.sql.write_str(" WHERE ");
            self.parse_node(node)?;
        }

        // ORDER BY clause:
        if let Some(order) = operands.and_then(|o| o.get("ORDER BY")) {
            self.sql.write_str(" ORDER BY ");
            let Some(terms) = order.as_array() else {
                fail!("Expected a JSON array");
            };
            // suppress parens around the arg list
            self.context.push(&ORDER_BY);
            self.write_arg_list(terms)?;
            self.context.pop();
        }

        // LIMIT, OFFSET clauses:
        if !self.default_limit.is_empty() {
            write!(self.sql, " LIMIT {}", self.default_limit);
        }
        if !self.default_offset.is_empty() {
            write!(self.sql, " OFFSET {}", self.default_offset);
        }
        Ok(())
    }

    fn parse_node(&mut self, node: &Value) -> Result<()> {
        match node {
            Value::Null => self.sql.write_str("null"),
            Value::Int(n) => write!(self.sql, "{}", n),
            Value::Float(f) => write!(self.sql, "{}", f),
            // SQL doesn't have true/false
            Value::Bool(b) => self.sql.write_char(if *b { '1' } else { '0' }),
            Value::String(s) => self.sql.write_string_literal(s),
            Value::Data(_) => fail!("Binary data not supported in query"),
            Value::Array(items) => self.parse_op_node(items)?,
            Value::Dict(_) => fail!("Dictionaries not supported in query"),
        }
        Ok(())
    }

    fn parse_op_node(&mut self, node: &[Value]) -> Result<()> {
        let Some((first, operands)) = node.split_first() else {
            fail!("Empty JSON array");
        };
        let Some(op) = first.as_str() else {
            fail!("Operation must be a string");
        };

        // Look up the handler. Arity beyond 9 clamps for the lookup but all
        // operands still get emitted.
        let nargs = operands.len().min(9);
        let mut name_matched = false;
        let mut found = None;
        for def in OPERATIONS {
            if def.op.is_empty() {
                found = Some(def); // fallback; ends the scan
                break;
            }
            if def.op == op {
                name_matched = true;
                if (def.min_args..=def.max_args).contains(&nargs) {
                    found = Some(def);
                    break;
                }
            }
        }
        let def = found.expect("operator table ends with the fallback entry");
        if name_matched && def.op.is_empty() {
            fail!("Wrong number of arguments to {}", op);
        }
        self.handle_operation(def, op, operands)
    }

    /// Dispatches one operation: pushes it on the context stack and wraps the
    /// emission in parens when its precedence doesn't beat the context's.
    fn handle_operation(
        &mut self,
        op_desc: &'static Operation,
        op: &str,
        operands: &[Value],
    ) -> Result<()> {
        let outer = self
            .context
            .last()
            .expect("context stack is never empty")
            .precedence;
        let parenthesize = op_desc.precedence <= outer;
        self.context.push(op_desc);
        if parenthesize {
            self.sql.write_char('(');
        }

        match op_desc.handler {
            Handler::Prefix => self.prefix_op(op, operands)?,
            Handler::Postfix => self.postfix_op(op, operands)?,
            Handler::Infix => self.infix_op(op, operands)?,
            Handler::In => self.in_op(op, operands)?,
            Handler::Between => self.between_op(op, operands)?,
            Handler::Exists => self.exists_op(op, operands)?,
            Handler::Match => self.match_op(op, operands)?,
            Handler::Property => self.property_op(op, operands)?,
            Handler::Parameter => self.parameter_op(op, operands)?,
            Handler::Select => self.select_op(op, operands)?,
            Handler::Fallback => self.fallback_op(op, operands)?,
        }

        if parenthesize {
            self.sql.write_char(')');
        }
        self.context.pop();
        Ok(())
    }

    /// Writes operands as a comma-separated list, parenthesized depending on
    /// the current precedence.
    fn write_arg_list(&mut self, operands: &[Value]) -> Result<()> {
        self.handle_operation(&ARG_LIST, ARG_LIST.op, operands)
    }

    // Handles prefix (unary) operators
    fn prefix_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        self.sql.write_str(op);
        if op.ends_with(|c: char| c.is_ascii_alphabetic()) {
            self.sql.write_char(' ');
        }
        self.parse_node(&operands[0])
    }

    // Handles postfix operators
    fn postfix_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        self.parse_node(&operands[0])?;
        self.sql.write_char(' ');
        self.sql.write_str(op);
        Ok(())
    }

    // Handles infix operators
    fn infix_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        for (n, operand) in operands.iter().enumerate() {
            if n > 0 {
                if op != "," {
                    // special case for argument lists
                    self.sql.write_char(' ');
                }
                self.sql.write_str(op);
                self.sql.write_char(' ');
            }
            self.parse_node(operand)?;
        }
        Ok(())
    }

    // Handles "x IN y" and "x NOT IN y" expressions
    fn in_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        self.parse_node(&operands[0])?;
        write!(self.sql, " {} ", op);
        self.write_arg_list(&operands[1..])
    }

    // Handles "x BETWEEN y AND z" expressions
    fn between_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        self.parse_node(&operands[0])?;
        write!(self.sql, " {} ", op);
        self.parse_node(&operands[1])?;
        self.sql.write_str(" AND ");
        self.parse_node(&operands[2])
    }

    // Handles EXISTS
    fn exists_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        // "EXISTS propertyname" turns into a call to fl_exists()
        if self.write_nested_property_op_if_any("fl_exists", operands)? {
            return Ok(());
        }
        self.sql.write_str(op);
        if op.ends_with(|c: char| c.is_ascii_alphabetic()) {
            self.sql.write_char(' ');
        }
        self.parse_node(&operands[0])
    }

    // Handles "property MATCH pattern" expressions (FTS)
    fn match_op(&mut self, _op: &str, operands: &[Value]) -> Result<()> {
        let Some(property) = property_from_node(&operands[0])? else {
            fail!("Source of MATCH must be a property");
        };
        // Write the match expression (using an implicit join):
        let fts_table_no = self.add_fts_property(&property);
        write!(self.sql, "(FTS{}.text MATCH ", fts_table_no);
        self.parse_node(&operands[1])?;
        write!(
            self.sql,
            " AND FTS{}.rowid = {}.sequence)",
            fts_table_no, self.table_name
        );
        Ok(())
    }

    // Handles document property accessors, e.g. [".", "prop"] -->
    // fl_value(body, 'prop')
    fn property_op(&mut self, _op: &str, operands: &[Value]) -> Result<()> {
        self.write_property_op("fl_value", operands)
    }

    // Handles substituted query parameters, e.g. ["$", "x"] --> $_x
    fn parameter_op(&mut self, _op: &str, operands: &[Value]) -> Result<()> {
        let name = match &operands[0] {
            Value::String(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            _ => fail!("Query parameter name must be number or string"),
        };
        write!(self.sql, "$_{}", name);
        self.parameters.insert(name);
        Ok(())
    }

    // Handles SELECT; its operands are encoded as an object
    fn select_op(&mut self, _op: &str, operands: &[Value]) -> Result<()> {
        let Some(dict) = operands[0].as_dict() else {
            fail!("Argument to SELECT must be an object");
        };
        if self.context.len() <= 2 {
            // Outer SELECT
            self.write_select_dict(dict)
        } else {
            // Nested SELECT; use a fresh compiler
            let mut nested = QueryCompiler::new(&self.table_name, &self.body_column);
            nested.parse(&operands[0])?;
            self.sql.write_str(nested.sql());
            Ok(())
        }
    }

    // Handles unrecognized operators. If op ends in "()" it's a function
    // call; else fail.
    fn fallback_op(&mut self, op: &str, operands: &[Value]) -> Result<()> {
        if op.len() <= 2 || !op.ends_with("()") {
            fail!("Unknown operator: {}", op);
        }
        let name = &op[..op.len() - 2];

        // Special case: "count(propertyname)" turns into a call to fl_count,
        // and rank() over an FTS property reads the match info:
        if name == "count" && self.write_nested_property_op_if_any("fl_count", operands)? {
            return Ok(());
        }
        if name == "rank" && self.write_nested_property_op_if_any("rank", operands)? {
            return Ok(());
        }

        self.sql.write_str(name);
        self.write_arg_list(operands)
    }

    // Writes a property-access function call given the path operands and a
    // SQL function name
    fn write_property_op(&mut self, fn_name: &str, operands: &[Value]) -> Result<()> {
        let property = property_from_operands(operands)?;
        self.write_property_getter(fn_name, &property)
    }

    // If the first operand is a property operation, writes it using the
    // given SQL function name and returns true; else returns false.
    fn write_nested_property_op_if_any(
        &mut self,
        fn_name: &str,
        operands: &[Value],
    ) -> Result<bool> {
        let Some(nested) = operands.first().and_then(Value::as_array) else {
            return Ok(false);
        };
        if nested.first().and_then(Value::as_str) != Some(".") {
            return Ok(false);
        }
        self.write_property_op(fn_name, &nested[1..])?;
        Ok(true)
    }

    // Writes a call to a document-accessor SQL function, including the
    // closing ")".
    fn write_property_getter(&mut self, fn_name: &str, property: &str) -> Result<()> {
        if property == "_id" {
            if fn_name != "fl_value" {
                fail!("can't use '_id' in this context");
            }
            self.sql.write_str("key");
        } else if property == "_sequence" {
            if fn_name != "fl_value" {
                fail!("can't use '_sequence' in this context");
            }
            self.sql.write_str("sequence");
        } else if fn_name == "rank" {
            // FTS rank() needs special treatment
            if self.fts_property_index(property) == 0 {
                fail!("rank() can only be used with FTS properties");
            }
            self.sql.write_str("rank(matchinfo(");
            self.sql
                .write_name(&format!("{}::{}", self.table_name, property));
            self.sql.write_str("))");
        } else {
            write!(self.sql, "{}({}, ", fn_name, self.body_column);
            let path = append_paths(&self.property_path, property);
            self.sql.write_string_literal(&path);
            self.sql.write_char(')');
        }
        Ok(())
    }

    /// Pre-walks a WHERE tree collecting every property that appears as the
    /// source of a MATCH, so the FROM clause can join the FTS tables.
    fn find_fts_properties(&mut self, node: &Value) -> Result<()> {
        let Some(items) = node.as_array() else {
            return Ok(());
        };
        let Some((first, rest)) = items.split_first() else {
            return Ok(());
        };
        let mut operands = rest;
        if first.as_str() == Some("MATCH") {
            if let Some((property_node, tail)) = operands.split_first() {
                if let Some(property) = property_from_node(property_node)? {
                    self.add_fts_property(&property);
                }
                operands = tail;
            }
        }
        // Recurse into operands:
        for operand in operands {
            self.find_fts_properties(operand)?;
        }
        Ok(())
    }

    /// 1-based position of a path in the FTS-property list, or 0 if absent.
    fn fts_property_index(&self, property_path: &str) -> usize {
        self.fts_properties
            .iter()
            .position(|p| p == property_path)
            .map_or(0, |i| i + 1)
    }

    fn add_fts_property(&mut self, property: &str) -> usize {
        // Each FTS index is a separate virtual table that FROM has to name:
        let property_path = append_paths(&self.property_path, property);
        let index = self.fts_property_index(&property_path);
        if index != 0 {
            return index;
        }
        self.fts_properties.push(property_path);
        self.fts_properties.len()
    }
}

// Appends two property-path strings.
fn append_paths(parent: &str, child: &str) -> String {
    let child = child
        .strip_prefix("$.")
        .or_else(|| child.strip_prefix('$'))
        .unwrap_or(child);
    if parent.is_empty() {
        child.to_string()
    } else if child.starts_with('[') {
        format!("{}{}", parent, child)
    } else {
        format!("{}.{}", parent, child)
    }
}

// Given the operands following the ".", builds the property-path string.
fn property_from_operands(operands: &[Value]) -> Result<String> {
    let mut property = String::new();
    for (n, item) in operands.iter().enumerate() {
        if let Some(index_item) = item.as_array() {
            if n == 0 {
                fail!("Property path can't start with an array index");
            }
            if index_item.len() != 1 {
                fail!("Property array index must have exactly one item");
            }
            let Some(index) = index_item[0].as_int() else {
                fail!("Invalid JSON value in property path");
            };
            property.push('[');
            property.push_str(&index.to_string());
            property.push(']');
        } else if let Some(name) = item.as_str() {
            if n > 0 {
                property.push('.');
            }
            property.push_str(name);
        } else {
            fail!("Invalid JSON value in property path");
        }
    }
    Ok(property)
}

// Returns the path of a property node, or None if the node isn't one.
fn property_from_node(node: &Value) -> Result<Option<String>> {
    let Some(items) = node.as_array() else {
        return Ok(None);
    };
    if items.len() < 2 || items[0].as_str() != Some(".") {
        return Ok(None);
    }
    property_from_operands(&items[1..]).map(Some)
}
