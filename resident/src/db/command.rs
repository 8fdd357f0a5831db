use serde_json::{Map, Value};

use crate::db::{Connection, ConnectionErrorSignatures, DbError, Endpoint, Rows, Statement};

///
/// A SQL statement bound to a connection. A failure that looks like a lost
/// connection is answered with one reconnect, a fresh prepare and a single
/// retry; anything else, including a second failure, is returned as is.
/// Inside a transaction a lost connection is never retried.
///
pub struct Command<'c, C: Connection> {
    connection: &'c mut C,
    signatures: ConnectionErrorSignatures,
    sql: String,
    params: Vec<Value>,
    statement: Option<Box<dyn Statement>>,
    use_primary: bool,
}

impl<'c, C: Connection> Command<'c, C> {
    pub fn new(connection: &'c mut C, sql: &str) -> Command<'c, C> {
        Command {
            connection,
            signatures: ConnectionErrorSignatures::default(),
            sql: sql.to_owned(),
            params: Vec::new(),
            statement: None,
            use_primary: false,
        }
    }

    pub fn with_signatures(mut self, signatures: ConnectionErrorSignatures) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn bind(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Force the primary endpoint even for read queries.
    pub fn use_primary(mut self, use_primary: bool) -> Self {
        self.use_primary = use_primary;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    ///
    /// Run a statement that does not return rows, answering the number of
    /// affected rows. An empty statement is a no-op.
    ///
    pub async fn execute(&mut self) -> Result<u64, DbError> {
        if self.sql.trim().is_empty() {
            return Ok(0);
        }

        self.prepare(Some(false)).await?;

        let affected = match self.run_execute().await {
            Ok(affected) => affected,
            Err(e) if self.is_connection_error(&e) => {
                self.reconnect(Some(false), e).await?;
                self.run_execute().await?
            }
            Err(e) => return Err(e),
        };

        if let Some(table) = schema_target(&self.sql) {
            self.connection.refresh_table_schema(&table).await;
        }

        Ok(affected)
    }

    pub async fn query(&mut self) -> Result<Rows, DbError> {
        self.prepare(None).await?;

        match self.run_query().await {
            Ok(rows) => Ok(rows),
            Err(e) if self.is_connection_error(&e) => {
                self.reconnect(None, e).await?;
                self.run_query().await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn query_all(&mut self) -> Result<Vec<Map<String, Value>>, DbError> {
        Ok(self.query().await?.into_maps())
    }

    pub async fn query_one(&mut self) -> Result<Option<Map<String, Value>>, DbError> {
        Ok(self.query().await?.into_maps().into_iter().next())
    }

    /// The first column of every row.
    pub async fn query_column(&mut self) -> Result<Vec<Value>, DbError> {
        let rows = self.query().await?;

        Ok(rows
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// The first column of the first row.
    pub async fn query_scalar(&mut self) -> Result<Option<Value>, DbError> {
        Ok(self.query_column().await?.into_iter().next())
    }

    fn endpoint(&self, for_read: Option<bool>) -> Endpoint {
        if self.use_primary || self.connection.in_transaction() {
            return Endpoint::Primary;
        }

        let read = match for_read {
            Some(read) => read,
            None => self.connection.is_read_query(&self.sql),
        };

        if read {
            Endpoint::Replica
        } else {
            Endpoint::Primary
        }
    }

    async fn prepare(&mut self, for_read: Option<bool>) -> Result<(), DbError> {
        if self.statement.is_some() {
            return Ok(());
        }

        let endpoint = self.endpoint(for_read);
        let statement = self.connection.prepare(&self.sql, endpoint).await?;
        self.statement = Some(statement);

        Ok(())
    }

    fn is_connection_error(&self, error: &DbError) -> bool {
        let info = self.statement.as_ref().and_then(|s| s.error_info());

        self.signatures.is_transient(error, info.as_ref())
    }

    async fn reconnect(&mut self, for_read: Option<bool>, cause: DbError) -> Result<(), DbError> {
        if self.connection.in_transaction() {
            warn!("lost the connection inside a transaction, not retrying: {}", cause);
            return Err(cause);
        }

        warn!("lost the database connection, reconnecting: {}", cause);

        self.statement = None;
        self.connection.close().await;
        self.connection.open().await?;

        let endpoint = self.endpoint(for_read);
        let statement = self
            .connection
            .prepare(&self.sql, endpoint)
            .await
            .map_err(|e| DbError::Prepare {
                sql: self.sql.clone(),
                message: e.to_string(),
            })?;
        self.statement = Some(statement);

        Ok(())
    }

    async fn run_execute(&mut self) -> Result<u64, DbError> {
        match self.statement {
            Some(ref mut statement) => statement.execute(&self.params).await,
            None => Err(DbError::Other("statement is not prepared".to_owned())),
        }
    }

    async fn run_query(&mut self) -> Result<Rows, DbError> {
        match self.statement {
            Some(ref mut statement) => statement.query(&self.params).await,
            None => Err(DbError::Other("statement is not prepared".to_owned())),
        }
    }
}

///
/// The table a schema-changing statement touches, e.g. `users` for
/// `ALTER TABLE users ADD ...`.
///
pub fn schema_target(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace().map(|w| w.to_ascii_uppercase());

    match words.next().as_deref() {
        Some("CREATE") | Some("ALTER") | Some("DROP") | Some("TRUNCATE") | Some("RENAME") => {}
        _ => return None,
    }

    let mut originals = sql.split_whitespace().skip(1);
    let mut next = originals.next()?;
    if next.eq_ignore_ascii_case("TEMPORARY") {
        next = originals.next()?;
    }
    if !next.eq_ignore_ascii_case("TABLE") {
        return None;
    }

    let mut name = originals.next()?;
    if name.eq_ignore_ascii_case("IF") {
        name = originals.next()?;
        if name.eq_ignore_ascii_case("NOT") {
            originals.next()?;
        }
        name = originals.next()?;
    }

    let table: String = name
        .split('(')
        .next()
        .unwrap_or("")
        .trim_matches(|c| c == '`' || c == '"' || c == '\'' || c == ';')
        .to_owned();

    if table.is_empty() {
        None
    } else {
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        results: VecDeque<Result<u64, DbError>>,
        opens: usize,
        closes: usize,
        prepares: Vec<Endpoint>,
        executions: usize,
        refreshed: Vec<String>,
    }

    struct FakeStatement {
        script: Arc<Mutex<Script>>,
    }

    #[async_trait]
    impl Statement for FakeStatement {
        async fn execute(&mut self, _params: &[Value]) -> Result<u64, DbError> {
            let mut script = self.script.lock().unwrap();
            script.executions += 1;
            script.results.pop_front().unwrap_or(Ok(1))
        }

        async fn query(&mut self, _params: &[Value]) -> Result<Rows, DbError> {
            let mut script = self.script.lock().unwrap();
            script.executions += 1;
            match script.results.pop_front().unwrap_or(Ok(1)) {
                Ok(n) => Ok(Rows {
                    columns: vec!["n".to_owned(), "label".to_owned()],
                    rows: vec![vec![Value::from(n), Value::from("first")]],
                }),
                Err(e) => Err(e),
            }
        }
    }

    struct FakeConnection {
        script: Arc<Mutex<Script>>,
        in_transaction: bool,
    }

    impl FakeConnection {
        fn with(results: Vec<Result<u64, DbError>>) -> (FakeConnection, Arc<Mutex<Script>>) {
            let script = Arc::new(Mutex::new(Script {
                results: results.into_iter().collect(),
                ..Script::default()
            }));

            (
                FakeConnection {
                    script: script.clone(),
                    in_transaction: false,
                },
                script,
            )
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn open(&mut self) -> Result<(), DbError> {
            self.script.lock().unwrap().opens += 1;
            Ok(())
        }

        async fn close(&mut self) {
            self.script.lock().unwrap().closes += 1;
        }

        fn in_transaction(&self) -> bool {
            self.in_transaction
        }

        async fn prepare(&mut self, _sql: &str, endpoint: Endpoint) -> Result<Box<dyn Statement>, DbError> {
            self.script.lock().unwrap().prepares.push(endpoint);
            Ok(Box::new(FakeStatement {
                script: self.script.clone(),
            }))
        }

        async fn refresh_table_schema(&mut self, table: &str) {
            self.script.lock().unwrap().refreshed.push(table.to_owned());
        }
    }

    fn gone_away() -> DbError {
        DbError::driver(2006, "MySQL server has gone away")
    }

    #[tokio::test]
    async fn it_should_reconnect_once_and_retry() {
        let (mut connection, script) = FakeConnection::with(vec![Err(gone_away()), Ok(3)]);

        let affected = Command::new(&mut connection, "UPDATE users SET active = 1")
            .execute()
            .await
            .unwrap();

        let script = script.lock().unwrap();
        assert_eq!(affected, 3);
        assert_eq!(script.closes, 1);
        assert_eq!(script.opens, 1);
        assert_eq!(script.prepares, vec![Endpoint::Primary, Endpoint::Primary]);
        assert_eq!(script.executions, 2);
    }

    #[tokio::test]
    async fn it_should_give_up_after_a_second_failure() {
        let (mut connection, script) =
            FakeConnection::with(vec![Err(gone_away()), Err(gone_away()), Ok(1)]);

        let result = Command::new(&mut connection, "DELETE FROM t").execute().await;

        assert_eq!(result.err().and_then(|e| e.code()), Some(2006));
        let script = script.lock().unwrap();
        assert_eq!(script.executions, 2);
        assert_eq!(script.opens, 1);
    }

    #[tokio::test]
    async fn it_should_not_reconnect_inside_a_transaction() {
        let (mut connection, script) = FakeConnection::with(vec![Err(gone_away()), Ok(1)]);
        connection.in_transaction = true;

        let result = Command::new(&mut connection, "INSERT INTO t VALUES (1)")
            .execute()
            .await;

        assert!(result.is_err());
        let script = script.lock().unwrap();
        assert_eq!(script.closes, 0);
        assert_eq!(script.opens, 0);
        assert_eq!(script.executions, 1);
    }

    #[tokio::test]
    async fn it_should_pass_application_errors_through() {
        let (mut connection, script) =
            FakeConnection::with(vec![Err(DbError::driver(1062, "Duplicate entry"))]);

        let result = Command::new(&mut connection, "INSERT INTO t VALUES (1)")
            .execute()
            .await;

        assert_eq!(result.err().and_then(|e| e.code()), Some(1062));
        assert_eq!(script.lock().unwrap().closes, 0);
    }

    #[tokio::test]
    async fn it_should_read_from_the_replica_unless_forced() {
        let (mut connection, script) = FakeConnection::with(vec![Err(gone_away()), Ok(5)]);

        let scalar = Command::new(&mut connection, "SELECT count(*) FROM users")
            .query_scalar()
            .await
            .unwrap();
        assert_eq!(scalar, Some(Value::from(5)));
        assert_eq!(
            script.lock().unwrap().prepares,
            vec![Endpoint::Replica, Endpoint::Replica]
        );

        let row = Command::new(&mut connection, "SELECT * FROM users")
            .use_primary(true)
            .query_one()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["label"], "first");
        assert_eq!(script.lock().unwrap().prepares[2], Endpoint::Primary);
    }

    #[tokio::test]
    async fn it_should_refresh_the_schema_after_ddl() {
        let (mut connection, script) = FakeConnection::with(vec![Ok(0), Ok(0)]);

        Command::new(&mut connection, "ALTER TABLE `users` ADD COLUMN age INT")
            .execute()
            .await
            .unwrap();
        assert_eq!(Command::new(&mut connection, "   ").execute().await.unwrap(), 0);

        let script = script.lock().unwrap();
        assert_eq!(script.refreshed, vec!["users".to_owned()]);
        assert_eq!(script.executions, 1);
    }

    #[test]
    fn it_should_find_the_table_of_ddl_statements() {
        assert_eq!(schema_target("CREATE TABLE IF NOT EXISTS post (id INT)"), Some("post".to_owned()));
        assert_eq!(schema_target("drop table users;"), Some("users".to_owned()));
        assert_eq!(schema_target("TRUNCATE TABLE logs"), Some("logs".to_owned()));
        assert_eq!(schema_target("CREATE INDEX i ON t (a)"), None);
        assert_eq!(schema_target("SELECT 1"), None);
    }
}
