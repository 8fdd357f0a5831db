use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use crate::db::{Command, Connection, ConnectionErrorSignatures, DbError};

type Factory<C> = Box<dyn Fn() -> C + Send + Sync>;

///
/// Connections shared by every request of a worker. A connection is checked
/// out for one command (or one transaction) and goes back when the guard is
/// dropped.
///
pub struct Pool<C: Connection> {
    idle: Mutex<Vec<C>>,
    factory: Factory<C>,
    signatures: ConnectionErrorSignatures,
}

impl<C: Connection> Pool<C> {
    pub fn new<F>(factory: F) -> Pool<C>
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Pool {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            signatures: ConnectionErrorSignatures::default(),
        }
    }

    pub fn with_signatures(mut self, signatures: ConnectionErrorSignatures) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn idle_count(&self) -> usize {
        match self.idle.lock() {
            Ok(idle) => idle.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Take an idle connection, opening a new one when none is left.
    pub async fn get(&self) -> Result<PooledConnection<'_, C>, DbError> {
        let idle = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };

        let connection = match idle {
            Some(connection) => connection,
            None => {
                let mut connection = (self.factory)();
                connection.open().await?;
                connection
            }
        };

        Ok(PooledConnection {
            pool: self,
            connection: Some(connection),
        })
    }

    fn release(&self, connection: C) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(connection),
            Err(poisoned) => poisoned.into_inner().push(connection),
        }
    }
}

pub struct PooledConnection<'p, C: Connection> {
    pool: &'p Pool<C>,
    connection: Option<C>,
}

impl<'p, C: Connection> PooledConnection<'p, C> {
    /// A command on this connection using the pool's error signatures.
    pub fn command(&mut self, sql: &str) -> Command<'_, C> {
        let signatures = self.pool.signatures.clone();

        Command::new(&mut **self, sql).with_signatures(signatures)
    }
}

impl<'p, C: Connection> Deref for PooledConnection<'p, C> {
    type Target = C;

    fn deref(&self) -> &C {
        match self.connection {
            Some(ref connection) => connection,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<'p, C: Connection> DerefMut for PooledConnection<'p, C> {
    fn deref_mut(&mut self) -> &mut C {
        match self.connection {
            Some(ref mut connection) => connection,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<'p, C: Connection> Drop for PooledConnection<'p, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
