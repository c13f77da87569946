// ============================================================================
// Statement parsing for the in-memory engine
// ============================================================================

use crate::core::{Column, DataType, DbError, Result, Value};
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// A literal or a `$n` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Literal(Value),
    /// 0-based index into the bound parameters.
    Param(usize),
}

impl Operand {
    pub(crate) fn resolve(&self, params: &[Value]) -> Result<Value> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Param(idx) => params.get(*idx).cloned().ok_or_else(|| {
                DbError::ExecutionError(format!("No value bound for parameter ${}", idx + 1))
            }),
        }
    }
}

/// `column = operand`; a filter is the conjunction of its conditions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub column: String,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    CreateTable {
        name: String,
        columns: Vec<Column>,
        if_not_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Operand>>,
    },
    Select {
        table: String,
        /// `None` for `SELECT *`.
        projection: Option<Vec<String>>,
        filter: Vec<Condition>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Operand)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
}

pub(crate) fn parse(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| DbError::ParseError(e.to_string()))?;

    if statements.len() != 1 {
        return Err(DbError::UnsupportedOperation(format!(
            "Expected exactly one statement, got {}",
            statements.len()
        )));
    }

    match statements.remove(0) {
        sql_ast::Statement::CreateTable(create) => convert_create_table(create),
        sql_ast::Statement::Insert(insert) => convert_insert(insert),
        sql_ast::Statement::Query(query) => convert_query(*query),
        sql_ast::Statement::Delete(delete) => convert_delete(delete),
        sql_ast::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => convert_update(table, assignments, selection),
        other => Err(DbError::UnsupportedOperation(format!(
            "Statement type not supported: {}",
            other
        ))),
    }
}

fn convert_create_table(create: sql_ast::CreateTable) -> Result<Statement> {
    let name = extract_table_name(&create.name)?;
    let columns = create
        .columns
        .into_iter()
        .map(convert_column_def)
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::CreateTable {
        name,
        columns,
        if_not_exists: create.if_not_exists,
    })
}

fn convert_column_def(col: sql_ast::ColumnDef) -> Result<Column> {
    let data_type = convert_data_type(&col.data_type)?;
    let not_null = col
        .options
        .iter()
        .any(|opt| matches!(opt.option, sql_ast::ColumnOption::NotNull));

    let column = Column::new(col.name.value, data_type);
    Ok(if not_null { column.not_null() } else { column })
}

fn convert_data_type(dt: &sql_ast::DataType) -> Result<DataType> {
    match dt {
        sql_ast::DataType::Int(_)
        | sql_ast::DataType::Integer(_)
        | sql_ast::DataType::BigInt(_) => Ok(DataType::Integer),

        sql_ast::DataType::Float(_)
        | sql_ast::DataType::Double(_)
        | sql_ast::DataType::Real => Ok(DataType::Float),

        sql_ast::DataType::Text
        | sql_ast::DataType::Varchar(_)
        | sql_ast::DataType::Char(_)
        | sql_ast::DataType::String(_) => Ok(DataType::Text),

        sql_ast::DataType::Boolean | sql_ast::DataType::Bool => Ok(DataType::Boolean),

        sql_ast::DataType::Timestamp(_, _) => Ok(DataType::Timestamp),

        _ => Err(DbError::TypeMismatch(format!(
            "Unsupported data type: {}",
            dt
        ))),
    }
}

fn convert_insert(insert: sql_ast::Insert) -> Result<Statement> {
    let table = insert.table.to_string();

    let columns = if insert.columns.is_empty() {
        None
    } else {
        Some(insert.columns.into_iter().map(|id| id.value).collect())
    };

    let Some(source) = insert.source else {
        return Err(DbError::UnsupportedOperation(
            "INSERT requires a VALUES clause".into(),
        ));
    };
    let sql_ast::SetExpr::Values(values) = *source.body else {
        return Err(DbError::UnsupportedOperation(
            "Only VALUES clause supported".into(),
        ));
    };

    let rows = values
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(convert_operand).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::Insert {
        table,
        columns,
        rows,
    })
}

fn convert_query(query: sql_ast::Query) -> Result<Statement> {
    if query.order_by.is_some() || query.limit_clause.is_some() {
        return Err(DbError::UnsupportedOperation(
            "ORDER BY and LIMIT are not supported".into(),
        ));
    }

    let sql_ast::SetExpr::Select(select) = *query.body else {
        return Err(DbError::UnsupportedOperation(
            "Only SELECT queries supported".into(),
        ));
    };
    let select = *select;

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(DbError::UnsupportedOperation(
            "SELECT must read exactly one table".into(),
        ));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut projection = Vec::new();
    let mut wildcard = false;
    for item in select.projection {
        match item {
            sql_ast::SelectItem::Wildcard(_) => wildcard = true,
            sql_ast::SelectItem::UnnamedExpr(sql_ast::Expr::Identifier(ident)) => {
                projection.push(ident.value)
            }
            other => {
                return Err(DbError::UnsupportedOperation(format!(
                    "Unsupported projection: {}",
                    other
                )));
            }
        }
    }
    if wildcard && !projection.is_empty() {
        return Err(DbError::UnsupportedOperation(
            "Cannot mix * with named columns".into(),
        ));
    }

    Ok(Statement::Select {
        table,
        projection: if wildcard { None } else { Some(projection) },
        filter: convert_filter(select.selection)?,
    })
}

fn convert_update(
    table: sql_ast::TableWithJoins,
    assignments: Vec<sql_ast::Assignment>,
    selection: Option<sql_ast::Expr>,
) -> Result<Statement> {
    let table = table_factor_name(&table.relation)?;

    let assignments = assignments
        .into_iter()
        .map(|assign| {
            let column = match assign.target {
                sql_ast::AssignmentTarget::ColumnName(col_name) if col_name.0.len() == 1 => {
                    col_name.0[0].to_string()
                }
                _ => {
                    return Err(DbError::UnsupportedOperation(
                        "Only simple column names supported in UPDATE".into(),
                    ));
                }
            };
            Ok((column, convert_operand(assign.value)?))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::Update {
        table,
        assignments,
        filter: convert_filter(selection)?,
    })
}

fn convert_delete(delete: sql_ast::Delete) -> Result<Statement> {
    let tables = match delete.from {
        sql_ast::FromTable::WithFromKeyword(tables) => tables,
        sql_ast::FromTable::WithoutKeyword(tables) => tables,
    };
    let Some(first) = tables.first() else {
        return Err(DbError::ParseError("DELETE requires table name".into()));
    };

    Ok(Statement::Delete {
        table: table_factor_name(&first.relation)?,
        filter: convert_filter(delete.selection)?,
    })
}

fn convert_filter(selection: Option<sql_ast::Expr>) -> Result<Vec<Condition>> {
    let mut conditions = Vec::new();
    if let Some(expr) = selection {
        collect_conditions(expr, &mut conditions)?;
    }
    Ok(conditions)
}

fn collect_conditions(expr: sql_ast::Expr, out: &mut Vec<Condition>) -> Result<()> {
    match expr {
        sql_ast::Expr::Nested(inner) => collect_conditions(*inner, out),
        sql_ast::Expr::BinaryOp {
            left,
            op: sql_ast::BinaryOperator::And,
            right,
        } => {
            collect_conditions(*left, out)?;
            collect_conditions(*right, out)
        }
        sql_ast::Expr::BinaryOp {
            left,
            op: sql_ast::BinaryOperator::Eq,
            right,
        } => match *left {
            sql_ast::Expr::Identifier(ident) => {
                out.push(Condition {
                    column: ident.value,
                    value: convert_operand(*right)?,
                });
                Ok(())
            }
            other => Err(DbError::UnsupportedOperation(format!(
                "Left side of '=' must be a column, got: {}",
                other
            ))),
        },
        other => Err(DbError::UnsupportedOperation(format!(
            "Only `column = value` conditions joined by AND are supported, got: {}",
            other
        ))),
    }
}

fn convert_operand(expr: sql_ast::Expr) -> Result<Operand> {
    match expr {
        sql_ast::Expr::Nested(inner) => convert_operand(*inner),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match convert_operand(*expr)? {
            Operand::Literal(Value::Integer(i)) => Ok(Operand::Literal(Value::Integer(-i))),
            Operand::Literal(Value::Float(f)) => Ok(Operand::Literal(Value::Float(-f))),
            _ => Err(DbError::TypeMismatch("Unary minus needs a numeric literal".into())),
        },
        sql_ast::Expr::Value(val) => convert_value(val.value),
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported expression: {}",
            other
        ))),
    }
}

fn convert_value(val: sql_ast::Value) -> Result<Operand> {
    let value = match val {
        sql_ast::Value::Placeholder(placeholder) => {
            let index = placeholder
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    DbError::ParseError(format!("Invalid placeholder '{}'", placeholder))
                })?;
            return Ok(Operand::Param(index - 1));
        }
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Value::Integer(i)
            } else if let Ok(f) = n.parse::<f64>() {
                Value::Float(f)
            } else {
                return Err(DbError::TypeMismatch(format!("Invalid number: {}", n)));
            }
        }
        sql_ast::Value::SingleQuotedString(s) => Value::Text(s),
        sql_ast::Value::Boolean(b) => Value::Boolean(b),
        sql_ast::Value::Null => Value::Null,
        other => {
            return Err(DbError::UnsupportedOperation(format!(
                "Unsupported value: {}",
                other
            )));
        }
    };
    Ok(Operand::Literal(value))
}

fn table_factor_name(factor: &sql_ast::TableFactor) -> Result<String> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => extract_table_name(name),
        _ => Err(DbError::UnsupportedOperation(
            "Complex table references not supported".into(),
        )),
    }
}

fn extract_table_name(name: &sql_ast::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.to_string())
        .ok_or_else(|| DbError::ParseError("Invalid table name".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_table() {
        let stmt = parse(
            "CREATE TABLE IF NOT EXISTS repodefault (timestamp TIMESTAMP, owner TEXT NOT NULL, repo TEXT)",
        )
        .unwrap();

        match stmt {
            Statement::CreateTable {
                name,
                columns,
                if_not_exists,
            } => {
                assert_eq!(name, "repodefault");
                assert!(if_not_exists);
                assert_eq!(columns.len(), 3);
                assert_eq!(columns[0].data_type, DataType::Timestamp);
                assert!(!columns[1].nullable);
                assert!(columns[2].nullable);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_insert_with_placeholders() {
        let stmt = parse("INSERT INTO http (method, path) VALUES ($1, $2), ('GET', -1)").unwrap();

        assert_eq!(
            stmt,
            Statement::Insert {
                table: "http".into(),
                columns: Some(vec!["method".into(), "path".into()]),
                rows: vec![
                    vec![Operand::Param(0), Operand::Param(1)],
                    vec![
                        Operand::Literal(Value::Text("GET".into())),
                        Operand::Literal(Value::Integer(-1)),
                    ],
                ],
            }
        );
    }

    #[test]
    fn test_parse_select_with_filter() {
        let stmt = parse("SELECT owner, repo FROM repodefault WHERE owner = $1 AND repo = 'saver'")
            .unwrap();

        assert_eq!(
            stmt,
            Statement::Select {
                table: "repodefault".into(),
                projection: Some(vec!["owner".into(), "repo".into()]),
                filter: vec![
                    Condition {
                        column: "owner".into(),
                        value: Operand::Param(0),
                    },
                    Condition {
                        column: "repo".into(),
                        value: Operand::Literal(Value::Text("saver".into())),
                    },
                ],
            }
        );
    }

    #[test]
    fn test_parse_update_and_delete() {
        assert!(matches!(
            parse("UPDATE csp SET status_code = 404 WHERE document_uri = $1").unwrap(),
            Statement::Update { ref assignments, ref filter, .. }
                if assignments.len() == 1 && filter.len() == 1
        ));
        assert!(matches!(
            parse("DELETE FROM beacon").unwrap(),
            Statement::Delete { ref filter, .. } if filter.is_empty()
        ));
    }

    #[test]
    fn test_rejects_unsupported() {
        assert!(matches!(parse("INSRT INTO x"), Err(DbError::ParseError(_))));
        assert!(matches!(
            parse("SELECT * FROM a WHERE x > 1"),
            Err(DbError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            parse("SELECT 1; SELECT 2"),
            Err(DbError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            parse("INSERT INTO a VALUES ($0)"),
            Err(DbError::ParseError(_))
        ));
    }

    #[test]
    fn test_operand_resolve() {
        let params = [Value::from("GET")];
        assert_eq!(Operand::Param(0).resolve(&params).unwrap(), Value::from("GET"));
        assert!(Operand::Param(1).resolve(&params).is_err());
    }
}
