use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::session::{SessionBackend, SessionError};

///
/// Session documents kept in redis as `SET key value EX ttl`. The connection
/// manager reconnects on its own, so one backend serves the whole worker.
///
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<RedisBackend, SessionError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        info!("session store connected to {}", url);

        Ok(RedisBackend { manager })
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, SessionError> {
        let mut connection = self.manager.clone();
        let data: Option<String> = connection.get(key).await?;

        Ok(data)
    }

    async fn write(&self, key: &str, data: &str, ttl: u64) -> Result<(), SessionError> {
        let mut connection = self.manager.clone();

        if ttl > 0 {
            connection.set_ex::<_, _, ()>(key, data, ttl).await?;
        } else {
            connection.set::<_, _, ()>(key, data).await?;
        }

        Ok(())
    }

    async fn destroy(&self, key: &str) -> Result<(), SessionError> {
        let mut connection = self.manager.clone();
        connection.del::<_, ()>(key).await?;

        Ok(())
    }
}
