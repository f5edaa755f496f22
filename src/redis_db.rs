use anyhow::Context;
use redis::{AsyncCommands, Client as RedisClient};

use crate::keys::Key;
use crate::models::{ChainNode, PROJECT_ID};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The node blob for this cursor is gone, either because the client sent
    /// an unknown cursor or because the chain expired underneath it.
    #[error("cursor {0} is not resolvable in the chain")]
    CursorNotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to one resource's cursor chain. The watch strategies are
/// written against this seam so they can run over an in-memory chain in
/// tests; `RedisDb` is the production implementation.
pub(crate) trait ChainStore {
    /// Up to `step` nodes strictly after `cursor`, in chain order. Empty iff
    /// nothing lies after the cursor (it is the tail sentinel, or the chain
    /// holds no real events).
    async fn get_nodes_from_cursor(
        &self,
        step: usize,
        cursor: &str,
        key: &Key,
    ) -> StoreResult<Vec<ChainNode>>;

    /// The oldest and newest real nodes, or the sentinels themselves when
    /// the chain is empty. Callers detect emptiness by sentinel identity
    /// (`cursor == head_key()` / `tail_key()`), never by next pointers: a
    /// lone real node's `next_cursor` also equals the tail cursor.
    async fn get_head_tail_target_nodes(&self, key: &Key) -> StoreResult<(ChainNode, ChainNode)>;

    /// The newest real node plus its detail, or None on an empty chain.
    async fn get_latest_event_detail(&self, key: &Key)
        -> StoreResult<Option<(ChainNode, String)>>;

    /// Pipelined multi-GET of detail payloads, one round trip.
    async fn get_details(&self, detail_keys: &[String]) -> StoreResult<Vec<String>>;

    async fn get_detail(&self, detail_key: &str) -> StoreResult<String>;
}

pub struct RedisDb {
    client: RedisClient,
}

impl RedisDb {
    pub async fn new() -> anyhow::Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        tracing::info!(target: PROJECT_ID, %redis_url, "connecting to Redis");

        let client = redis::Client::open(redis_url.as_str())?;

        // Test connection
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(target: PROJECT_ID, "Redis connection established");

        Ok(Self { client })
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("get Redis connection")
    }

    async fn get_node(&self, key: &Key, cursor: &str) -> StoreResult<ChainNode> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key.node_key(cursor))
            .await
            .context("get chain node")?;
        let Some(raw) = raw else {
            return Err(StoreError::CursorNotFound(cursor.to_string()));
        };
        let node: ChainNode = serde_json::from_str(&raw).context("decode chain node")?;
        Ok(node)
    }
}

impl ChainStore for RedisDb {
    async fn get_nodes_from_cursor(
        &self,
        step: usize,
        cursor: &str,
        key: &Key,
    ) -> StoreResult<Vec<ChainNode>> {
        if cursor == key.tail_key() {
            return Ok(Vec::new());
        }
        // The chain is a linked list, so the walk is sequential GETs bounded
        // by `step`. The start node is only read for its next pointer.
        let start = self.get_node(key, cursor).await?;
        let mut next = start.next_cursor;
        let mut nodes = Vec::new();
        while nodes.len() < step && next != key.tail_key() {
            let node = self.get_node(key, &next).await?;
            next = node.next_cursor.clone();
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn get_head_tail_target_nodes(&self, key: &Key) -> StoreResult<(ChainNode, ChainNode)> {
        let head = self.get_node(key, key.head_key()).await?;
        let tail = self.get_node(key, key.tail_key()).await?;
        if head.next_cursor == key.tail_key() || tail.next_cursor == key.head_key() {
            // no real events, the sentinels stand in for the targets
            return Ok((head, tail));
        }
        let oldest = self.get_node(key, &head.next_cursor).await?;
        let newest = self.get_node(key, &tail.next_cursor).await?;
        Ok((oldest, newest))
    }

    async fn get_latest_event_detail(
        &self,
        key: &Key,
    ) -> StoreResult<Option<(ChainNode, String)>> {
        let tail = self.get_node(key, key.tail_key()).await?;
        if tail.next_cursor == key.head_key() {
            return Ok(None);
        }
        let newest = self.get_node(key, &tail.next_cursor).await?;
        let detail = self.get_detail(&key.detail_key(&newest.cursor)).await?;
        Ok(Some((newest, detail)))
    }

    async fn get_details(&self, detail_keys: &[String]) -> StoreResult<Vec<String>> {
        if detail_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for detail_key in detail_keys {
            pipe.get(detail_key);
        }
        let values: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .context("pipelined detail fetch")?;
        let mut details = Vec::with_capacity(values.len());
        for (value, detail_key) in values.into_iter().zip(detail_keys) {
            match value {
                Some(detail) => details.push(detail),
                None => {
                    return Err(StoreError::Backend(anyhow::anyhow!(
                        "event detail missing for {detail_key}"
                    )))
                }
            }
        }
        Ok(details)
    }

    async fn get_detail(&self, detail_key: &str) -> StoreResult<String> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(detail_key).await.context("get event detail")?;
        value.ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("event detail missing for {detail_key}"))
        })
    }
}
