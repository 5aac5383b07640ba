//! Statement dispatch: `Executor::execute` matches over `Statement` variants.
//! Begin/Commit/Abort manage the executor's own current XID directly;
//! everything else runs inside an implicit auto-commit transaction.

use std::sync::Arc;

use crate::catalog::{Catalog, FieldType, Value};
use crate::common::Xid;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::parser::{Literal, Statement};
use crate::vm::{IsolationLevel, Vm};

/// One row or status line of a statement's result.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Ok,
    Affected(usize),
    Rows(Vec<Vec<Value>>),
    Tables(Vec<String>),
}

fn coerce(lit: &Literal, ty: FieldType) -> Result<Value> {
    match (lit, ty) {
        (Literal::Int(n), FieldType::Int32) => Ok(Value::Int32(*n as i32)),
        (Literal::Int(n), FieldType::Int64) => Ok(Value::Int64(*n)),
        (Literal::Str(s), FieldType::Str) => Ok(Value::Str(s.clone())),
        _ => Err(EngineError::InvalidValues),
    }
}

/// One client connection's statement handler. Exactly one outstanding
/// transaction at a time; a nested `begin` is rejected.
pub struct Executor {
    catalog: Arc<Catalog>,
    vm: Arc<Vm>,
    default_isolation: IsolationLevel,
    current_xid: Option<Xid>,
}

impl Executor {
    pub fn new(catalog: Arc<Catalog>, vm: Arc<Vm>, config: &EngineConfig) -> Self {
        Self {
            catalog,
            vm,
            default_isolation: config.default_isolation,
            current_xid: None,
        }
    }

    pub fn execute(&mut self, stmt: Statement) -> Result<QueryResult> {
        match stmt {
            Statement::Begin { isolation } => {
                if self.current_xid.is_some() {
                    return Err(EngineError::NestedTransaction);
                }
                let level = isolation.unwrap_or(self.default_isolation);
                self.current_xid = Some(self.vm.begin(level)?);
                Ok(QueryResult::Ok)
            }
            Statement::Commit => {
                let xid = self.current_xid.take().ok_or(EngineError::NoTransaction)?;
                self.vm.commit(xid)?;
                Ok(QueryResult::Ok)
            }
            Statement::Abort => {
                let xid = self.current_xid.take().ok_or(EngineError::NoTransaction)?;
                self.vm.abort(xid)?;
                Ok(QueryResult::Ok)
            }
            Statement::Show => Ok(QueryResult::Tables(self.catalog.list_tables())),
            Statement::CreateTable { name, fields, indexed } => {
                self.catalog.create_table(&name, &fields, &indexed)?;
                Ok(QueryResult::Ok)
            }
            Statement::DropTable { .. } => Err(EngineError::NotImplemented("drop table".into())),
            other => self.run_in_transaction(other),
        }
    }

    /// Wraps one data statement in an implicit transaction when none is
    /// current, committing on success and aborting on error.
    fn run_in_transaction(&mut self, stmt: Statement) -> Result<QueryResult> {
        let implicit = self.current_xid.is_none();
        let xid = match self.current_xid {
            Some(xid) => xid,
            None => self.vm.begin(self.default_isolation)?,
        };

        let result = self.dispatch(xid, stmt);

        if implicit {
            match &result {
                Ok(_) => self.vm.commit(xid)?,
                Err(_) => {
                    let _ = self.vm.abort(xid);
                }
            }
        }
        result
    }

    fn dispatch(&mut self, xid: Xid, stmt: Statement) -> Result<QueryResult> {
        match stmt {
            Statement::Select { table, where_clause, .. } => {
                let rows = self.catalog.select(xid, &table, where_clause.as_ref())?;
                Ok(QueryResult::Rows(rows))
            }
            Statement::Insert { table, values } => {
                let field_types = self.field_types(&table)?;
                if values.len() != field_types.len() {
                    return Err(EngineError::InvalidValues);
                }
                let typed: Vec<Value> = values
                    .iter()
                    .zip(field_types.iter())
                    .map(|(lit, ty)| coerce(lit, *ty))
                    .collect::<Result<_>>()?;
                self.catalog.insert(xid, &table, &typed)?;
                Ok(QueryResult::Affected(1))
            }
            Statement::Update { table, field, value, where_clause } => {
                let field_types = self.field_types(&table)?;
                let idx = self.field_index(&table, &field)?;
                let typed = coerce(&value, field_types[idx])?;
                let n = self.catalog.update(xid, &table, &field, typed, where_clause.as_ref())?;
                Ok(QueryResult::Affected(n))
            }
            Statement::Delete { table, where_clause } => {
                let n = self.catalog.delete(xid, &table, where_clause.as_ref())?;
                Ok(QueryResult::Affected(n))
            }
            _ => unreachable!("Begin/Commit/Abort/Show/CreateTable/DropTable handled by execute()"),
        }
    }

    fn field_types(&self, table: &str) -> Result<Vec<FieldType>> {
        Ok(self.catalog.field_types(table)?)
    }

    fn field_index(&self, table: &str, field: &str) -> Result<usize> {
        self.catalog.field_index_of(table, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::Dm;
    use crate::lock_table::LockTable;
    use crate::storage::{page, Pager};
    use crate::tm::Tm;
    use crate::wal::Wal;
    use tempfile::tempdir;

    fn setup(dir: &tempfile::TempDir) -> Executor {
        let db = dir.path().join("t.db");
        let log = dir.path().join("t.log");
        let xid_file = dir.path().join("t.xid");
        let boot = dir.path().join("t.bt");
        let pager = Arc::new(Pager::create(db.to_str().unwrap(), 0).unwrap());
        let wal = Arc::new(Wal::create(log.to_str().unwrap()).unwrap());
        let tm = Arc::new(Tm::create(xid_file.to_str().unwrap()).unwrap());
        pager.new_page(&page::new_page_one_raw()).unwrap();
        let dm = Arc::new(Dm::new(Arc::clone(&pager), wal, 0).unwrap());
        let lock_table = Arc::new(LockTable::new());
        let vm = Arc::new(Vm::new(dm, Arc::clone(&pager), tm, lock_table, 0));
        let catalog = Arc::new(Catalog::open(Arc::clone(&vm), pager, boot.to_str().unwrap()).unwrap());
        Executor::new(catalog, vm, &EngineConfig::default())
    }

    #[test]
    fn create_insert_select_round_trip() {
        let dir = tempdir().unwrap();
        let mut ex = setup(&dir);
        ex.execute(crate::parser::parse("create table users (id int64 name string) index id").unwrap())
            .unwrap();
        ex.execute(crate::parser::parse("insert into users values 1, 'alice'").unwrap())
            .unwrap();
        let result = ex.execute(crate::parser::parse("select * from users where id = 1").unwrap()).unwrap();
        match result {
            QueryResult::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn nested_begin_rejected() {
        let dir = tempdir().unwrap();
        let mut ex = setup(&dir);
        ex.execute(crate::parser::parse("begin").unwrap()).unwrap();
        match ex.execute(crate::parser::parse("begin").unwrap()) {
            Err(EngineError::NestedTransaction) => {}
            other => panic!("expected NestedTransaction, got {other:?}"),
        }
    }
}
