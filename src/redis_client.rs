use redis::{aio::MultiplexedConnection, aio::PubSub, Client};

/// Command connection plus the client handle needed to open pub/sub
/// connections (SUBSCRIBE takes over a connection exclusively).
#[derive(Clone)]
pub struct RedisClient {
    pub client: Client,
    pub conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisClient { client, conn })
    }

    pub async fn pubsub(&self) -> redis::RedisResult<PubSub> {
        self.client.get_async_pubsub().await
    }
}
