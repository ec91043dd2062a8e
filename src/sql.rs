use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::SlotId;

/// Parsed command from SQL input. Three fixed tables: `resources`,
/// `slots` (a resource's available set), `bookings` (the caller's own).
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        description: String,
        category: String,
        slots: Vec<SlotId>,
    },
    UpdateResource {
        id: Ulid,
        name: String,
        description: String,
        category: String,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertSlots {
        resource_id: Ulid,
        slots: Vec<SlotId>,
    },
    DeleteSlot {
        resource_id: Ulid,
        slot: SlotId,
    },
    InsertBooking {
        id: Ulid,
        resource_id: Ulid,
        slot: SlotId,
    },
    UpdateBooking {
        id: Ulid,
        slot: SlotId,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings,
    SelectResources,
    SelectSlots {
        resource_id: Ulid,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "resources" => {
            let values = &rows[0];
            if values.is_empty() {
                return Err(SqlError::WrongArity("resources", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = opt_string(values.get(1))?;
            let description = opt_string(values.get(2))?;
            let category = opt_string(values.get(3))?;
            let slots = match values.get(4) {
                Some(expr) => parse_slot_array(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertResource {
                id,
                name,
                description,
                category,
                slots,
            })
        }
        "slots" => {
            // One (resource_id, slot) pair per row; all rows must target
            // the same resource.
            let mut resource_id = None;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 2 {
                    return Err(SqlError::WrongArity("slots row", 2, row.len()));
                }
                let rid =
                    parse_ulid(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                match resource_id {
                    None => resource_id = Some(rid),
                    Some(prev) if prev != rid => {
                        return Err(SqlError::Parse(
                            "all slot rows must share one resource_id".into(),
                        ));
                    }
                    Some(_) => {}
                }
                slots.push(
                    parse_string(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
            }
            Ok(Command::InsertSlots {
                resource_id: resource_id.ok_or(SqlError::WrongArity("slots", 2, 0))?,
                slots,
            })
        }
        "bookings" => {
            let values = &rows[0];
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                slot: parse_string(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = extract_eq_filters(selection)?;
    let id = filters
        .ulid("id")?
        .ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "bookings" => {
            let slot = assignment_value(assignments, "slot")?
                .ok_or(SqlError::Parse("UPDATE bookings requires SET slot".into()))?;
            Ok(Command::UpdateBooking { id, slot })
        }
        "resources" => {
            let name = assignment_value(assignments, "name")?.unwrap_or_default();
            let description = assignment_value(assignments, "description")?.unwrap_or_default();
            let category = assignment_value(assignments, "category")?.unwrap_or_default();
            Ok(Command::UpdateResource {
                id,
                name,
                description,
                category,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = extract_eq_filters(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource {
            id: filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "slots" => Ok(Command::DeleteSlot {
            resource_id: filters
                .ulid("resource_id")?
                .ok_or(SqlError::MissingFilter("resource_id"))?,
            slot: filters
                .string("slot")
                .ok_or(SqlError::MissingFilter("slot"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "bookings" => Ok(Command::SelectBookings),
        "resources" => Ok(Command::SelectResources),
        "slots" => {
            let filters = extract_eq_filters(&select.selection)?;
            Ok(Command::SelectSlots {
                resource_id: filters
                    .ulid("resource_id")?
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Column = value pairs collected from an AND chain.
struct EqFilters(Vec<(String, String)>);

impl EqFilters {
    fn string(&self, column: &str) -> Option<SlotId> {
        self.0
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.clone())
    }

    fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        match self.string(column) {
            Some(s) => Ulid::from_string(&s)
                .map(Some)
                .map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
            None => Ok(None),
        }
    }
}

fn extract_eq_filters(selection: &Option<Expr>) -> Result<EqFilters, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut pairs)?;
    }
    Ok(EqFilters(pairs))
}

fn collect_eq(expr: &Expr, pairs: &mut Vec<(String, String)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, pairs)?;
            collect_eq(right, pairs)?;
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                pairs.push((col, parse_string(right)?));
            }
        }
        other => return Err(SqlError::Unsupported(format!("WHERE clause: {other}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_value(assignments: &[ast::Assignment], column: &str) -> Result<Option<String>, SqlError> {
    for a in assignments {
        let name = match &a.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        if name.as_deref() == Some(column) {
            return parse_string(&a.value).map(Some);
        }
    }
    Ok(None)
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn opt_string(expr: Option<&Expr>) -> Result<String, SqlError> {
    match expr {
        None => Ok(String::new()),
        Some(e) => match extract_value(e) {
            Some(Value::Null) => Ok(String::new()),
            _ => parse_string(e),
        },
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Slots arrive as `ARRAY['9am', '10am']` or a single quoted string.
fn parse_slot_array(expr: &Expr) -> Result<Vec<SlotId>, SqlError> {
    match expr {
        Expr::Array(array) => array.elem.iter().map(parse_string).collect(),
        _ => Ok(vec![parse_string(expr)?]),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const RID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_resource_full() {
        let sql = format!(
            "INSERT INTO resources (id, name, description, category, slots) \
             VALUES ('{RID}', 'Room A', 'Small meeting room', 'meeting', ARRAY['9am', '10am'])"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertResource {
                id,
                name,
                description,
                category,
                slots,
            } => {
                assert_eq!(id.to_string(), RID);
                assert_eq!(name, "Room A");
                assert_eq!(description, "Small meeting room");
                assert_eq!(category, "meeting");
                assert_eq!(slots, vec!["9am".to_string(), "10am".to_string()]);
            }
            _ => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_resource_minimal() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{RID}')");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertResource {
                name, slots, ..
            } => {
                assert!(name.is_empty());
                assert!(slots.is_empty());
            }
            _ => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_resource() {
        let sql = format!(
            "UPDATE resources SET name = 'Room B', description = 'Bigger', category = 'conference' WHERE id = '{RID}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateResource {
                id,
                name,
                description,
                category,
            } => {
                assert_eq!(id.to_string(), RID);
                assert_eq!(name, "Room B");
                assert_eq!(description, "Bigger");
                assert_eq!(category, "conference");
            }
            _ => panic!("expected UpdateResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_resource() {
        let sql = format!("DELETE FROM resources WHERE id = '{RID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::DeleteResource { id } if id.to_string() == RID));
    }

    #[test]
    fn parse_insert_slots_multi_row() {
        let sql = format!(
            "INSERT INTO slots (resource_id, slot) VALUES ('{RID}', '11am'), ('{RID}', '1pm')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSlots { resource_id, slots } => {
                assert_eq!(resource_id.to_string(), RID);
                assert_eq!(slots, vec!["11am".to_string(), "1pm".to_string()]);
            }
            _ => panic!("expected InsertSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_slots_mixed_resources_rejected() {
        let other = "01BX5ZZKBKACTAV9WEVGEMMVS0";
        let sql = format!(
            "INSERT INTO slots (resource_id, slot) VALUES ('{RID}', '11am'), ('{other}', '1pm')"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_delete_slot() {
        let sql = format!("DELETE FROM slots WHERE resource_id = '{RID}' AND slot = '9am'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DeleteSlot { resource_id, slot } => {
                assert_eq!(resource_id.to_string(), RID);
                assert_eq!(slot, "9am");
            }
            _ => panic!("expected DeleteSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking() {
        let bid = "01BX5ZZKBKACTAV9WEVGEMMVS0";
        let sql = format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{bid}', '{RID}', '9am')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking {
                id,
                resource_id,
                slot,
            } => {
                assert_eq!(id.to_string(), bid);
                assert_eq!(resource_id.to_string(), RID);
                assert_eq!(slot, "9am");
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_booking() {
        let sql = format!("UPDATE bookings SET slot = '10am' WHERE id = '{RID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateBooking { id, slot } => {
                assert_eq!(id.to_string(), RID);
                assert_eq!(slot, "10am");
            }
            _ => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_booking_without_slot_rejected() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{RID}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{RID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::DeleteBooking { id } if id.to_string() == RID));
    }

    #[test]
    fn parse_select_bookings() {
        assert_eq!(parse_sql("SELECT * FROM bookings").unwrap(), Command::SelectBookings);
    }

    #[test]
    fn parse_select_resources() {
        assert_eq!(
            parse_sql("SELECT * FROM resources").unwrap(),
            Command::SelectResources
        );
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!("SELECT * FROM slots WHERE resource_id = '{RID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::SelectSlots { resource_id } if resource_id.to_string() == RID));
    }

    #[test]
    fn parse_select_slots_without_filter_rejected() {
        assert!(matches!(
            parse_sql("SELECT * FROM slots"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_listen() {
        let sql = format!("LISTEN resource_{RID}");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::Listen { channel } => {
                assert_eq!(channel, format!("resource_{RID}"));
            }
            _ => panic!("expected Listen, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{RID}')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(parse_sql(sql).is_err());
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
