//! Redis-backed ticket store.
//!
//! Layout:
//! - `cas:ticket:<id>`   JSON record
//! - `cas:consumed:<id>` consumed marker for single-use tickets
//! - `cas:children:<id>` set of ids granted under `<id>`
//!
//! Every operation that must be atomic runs as a Lua script, so check-and-set
//! never spans two round trips.

use crate::ticket::error::StoreError;
use crate::ticket::store::{ConsumeOutcome, InsertOutcome, TicketStore};
use crate::ticket::types::{ExpirationPolicy, Ticket, TicketKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use redis::{AsyncCommands, Client as RedisClient, Script};
use std::sync::Arc;

const KEY_PREFIX: &str = "cas:";

/// Extra time single-use records are kept after their lifetime, so that late
/// validations are told the ticket expired rather than that it is unknown.
const EXPIRED_RETENTION_SECONDS: i64 = 300;

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 1 end
if ARGV[3] == '1' then
  if redis.call('EXISTS', KEYS[2]) == 0 then return 2 end
  redis.call('SADD', KEYS[3], ARGV[4])
  redis.call('PERSIST', KEYS[2])
  redis.call('PERSIST', KEYS[4])
end
if tonumber(ARGV[2]) > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[1])
end
return 0
"#;

const CONSUME_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local ttl = redis.call('PTTL', KEYS[1])
local ok
if ttl > 0 then
  ok = redis.call('SET', KEYS[2], '1', 'NX', 'PX', ttl)
else
  ok = redis.call('SET', KEYS[2], '1', 'NX')
end
if ok then return 1 end
return 0
"#;

const REVOKE_SCRIPT: &str = r#"
local prefix = ARGV[2]
local root = ARGV[1]
local raw = redis.call('GET', prefix .. 'ticket:' .. root)
if not raw then return false end
local record = cjson.decode(raw)
if record.granted_by then
  redis.call('SREM', prefix .. 'children:' .. record.granted_by, root)
end
local removed = {}
local pending = {root}
while #pending > 0 do
  local id = table.remove(pending)
  local children = redis.call('SMEMBERS', prefix .. 'children:' .. id)
  for _, child in ipairs(children) do table.insert(pending, child) end
  redis.call('DEL', prefix .. 'ticket:' .. id, prefix .. 'consumed:' .. id, prefix .. 'children:' .. id)
  table.insert(removed, id)
end
return removed
"#;

/// Drop members of a children set whose records are gone (key TTL expiry).
const PRUNE_SCRIPT: &str = r#"
local pruned = 0
for _, child in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. 'ticket:' .. child) == 0 then
    redis.call('SREM', KEYS[1], child)
    pruned = pruned + 1
  end
end
return pruned
"#;

pub struct RedisTicketStore {
    redis_client: Arc<RedisClient>,
    policy: ExpirationPolicy,
    create_script: Script,
    consume_script: Script,
    revoke_script: Script,
    prune_script: Script,
}

impl RedisTicketStore {
    pub fn new(redis_client: Arc<RedisClient>, policy: ExpirationPolicy) -> Self {
        Self {
            redis_client,
            policy,
            create_script: Script::new(CREATE_SCRIPT),
            consume_script: Script::new(CONSUME_SCRIPT),
            revoke_script: Script::new(REVOKE_SCRIPT),
            prune_script: Script::new(PRUNE_SCRIPT),
        }
    }

    pub fn open(redis_url: &str, policy: ExpirationPolicy) -> Result<Self, StoreError> {
        let client = RedisClient::open(redis_url)?;
        info!("Using Redis ticket store at {}", redis_url);
        Ok(Self::new(Arc::new(client), policy))
    }

    /// Key TTL for a record, 0 meaning none.
    fn ttl_seconds(&self, kind: TicketKind) -> i64 {
        if !kind.is_single_use() {
            return 0;
        }
        self.policy
            .lifetime(kind)
            .map_or(0, |lifetime| lifetime.num_seconds() + EXPIRED_RETENTION_SECONDS)
    }

    // Redis key constructors
    fn ticket_key(&self, id: &str) -> String {
        format!("{}ticket:{}", KEY_PREFIX, id)
    }

    fn consumed_key(&self, id: &str) -> String {
        format!("{}consumed:{}", KEY_PREFIX, id)
    }

    fn children_key(&self, id: &str) -> String {
        format!("{}children:{}", KEY_PREFIX, id)
    }

    async fn scan_keys(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        pattern: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    /// Remove ids of TTL-expired records from every children set.
    async fn prune_children(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<usize, StoreError> {
        let pattern = format!("{}children:*", KEY_PREFIX);
        let mut pruned = 0;
        for key in self.scan_keys(conn, &pattern).await? {
            let count: i64 = self
                .prune_script
                .key(&key)
                .arg(KEY_PREFIX)
                .invoke_async(conn)
                .await?;
            pruned += usize::try_from(count).unwrap_or(0);
        }
        if pruned > 0 {
            debug!("Pruned {} expired ids from children sets", pruned);
        }
        Ok(pruned)
    }
}

#[async_trait]
impl TicketStore for RedisTicketStore {
    async fn create(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(&ticket)?;
        let id = ticket.id();
        let (has_parent, parent) = match ticket.granted_by() {
            Some(parent) => ("1", parent),
            None => ("0", id),
        };

        let result: i64 = self
            .create_script
            .key(self.ticket_key(id))
            .key(self.ticket_key(parent))
            .key(self.children_key(parent))
            .key(self.consumed_key(parent))
            .arg(json)
            .arg(self.ttl_seconds(ticket.kind()))
            .arg(has_parent)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        Ok(match result {
            0 => InsertOutcome::Inserted,
            1 => InsertOutcome::Collision,
            _ => InsertOutcome::ParentMissing,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let (record, consumed): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(self.ticket_key(id))
            .arg(self.consumed_key(id))
            .query_async(&mut conn)
            .await?;

        match record {
            Some(json) => {
                let mut ticket: Ticket = serde_json::from_str(&json)?;
                if consumed.is_some() {
                    ticket.mark_consumed();
                }
                Ok(Some(ticket))
            }
            None => Ok(None),
        }
    }

    async fn consume(&self, id: &str) -> Result<ConsumeOutcome, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let result: i64 = self
            .consume_script
            .key(self.ticket_key(id))
            .key(self.consumed_key(id))
            .invoke_async(&mut conn)
            .await?;

        Ok(match result {
            1 => ConsumeOutcome::Consumed,
            0 => ConsumeOutcome::AlreadyConsumed,
            _ => ConsumeOutcome::Missing,
        })
    }

    async fn revoke_tree(&self, root_id: &str) -> Result<Option<Vec<String>>, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let removed: Option<Vec<String>> = self
            .revoke_script
            .arg(root_id)
            .arg(KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn purge_expired(
        &self,
        policy: &ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;

        // Single-use records expire through key TTLs, which leaves their ids
        // behind in the parent's children set.
        self.prune_children(&mut conn).await?;

        if policy.tgt_max_lifetime.is_none() {
            return Ok(0);
        }

        let pattern = format!("{}ticket:{}-*", KEY_PREFIX, TicketKind::TicketGranting.prefix());
        let keys = self.scan_keys(&mut conn, &pattern).await?;

        let mut removed = 0;
        for key in keys {
            let json: Option<String> = conn.get(&key).await?;
            let Some(json) = json else { continue };
            let ticket: Ticket = serde_json::from_str(&json)?;
            if policy.is_expired(ticket.kind(), ticket.issued_at(), now) {
                if let Some(ids) = self.revoke_tree(ticket.id()).await? {
                    removed += ids.len();
                }
            }
        }

        if removed > 0 {
            debug!("Purged {} tickets under expired sessions", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_per_kind() {
        let client = Arc::new(RedisClient::open("redis://localhost:6379").unwrap());
        let store = RedisTicketStore::new(client, ExpirationPolicy::default());

        assert_eq!(store.ttl_seconds(TicketKind::Service), 600);
        assert_eq!(store.ttl_seconds(TicketKind::Login), 600);
        assert_eq!(store.ttl_seconds(TicketKind::TicketGranting), 0);
        assert_eq!(store.ttl_seconds(TicketKind::ProxyGranting), 0);
    }

    #[test]
    fn test_key_layout() {
        let client = Arc::new(RedisClient::open("redis://localhost:6379").unwrap());
        let store = RedisTicketStore::new(client, ExpirationPolicy::default());

        assert_eq!(store.ticket_key("ST-1"), "cas:ticket:ST-1");
        assert_eq!(store.consumed_key("ST-1"), "cas:consumed:ST-1");
        assert_eq!(store.children_key("TGC-1"), "cas:children:TGC-1");
    }
}
