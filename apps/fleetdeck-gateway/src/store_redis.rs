use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::protocol::MachineStatus;
use crate::store::{
    ApiKeyRecord, MachineRecord, RelayStore, SessionRecord, SessionStatus, StoreError,
    TelemetrySample, TransitionOutcome,
};

/// Redis-backed store keyed the way the rest of the platform keys these
/// records: one JSON value per machine/session/API key, plus a SETEX'd
/// telemetry entry per machine.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn get_json<T: for<'de> serde::Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(value)?;
        conn.set::<_, _, ()>(key, json).await?;
        Ok(())
    }
}

fn machine_key(machine_id: &str) -> String {
    format!("machine:{}", machine_id)
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn telemetry_key(machine_id: &str) -> String {
    format!("machine:{}:telemetry", machine_id)
}

fn api_key_key(key_hash: &str) -> String {
    format!("apikey:{}", key_hash)
}

#[async_trait]
impl RelayStore for RedisStore {
    async fn put_machine(&self, record: MachineRecord) -> Result<(), StoreError> {
        self.put_json(&machine_key(&record.id), &record).await
    }

    async fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRecord>, StoreError> {
        self.get_json(&machine_key(machine_id)).await
    }

    async fn set_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.get_machine(machine_id).await? else {
            return Ok(false);
        };
        let changed = record.status != status;
        record.status = status;
        record.last_seen = last_seen;
        self.put_machine(record).await?;
        Ok(changed)
    }

    async fn put_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.put_json(&session_key(&record.id), &record).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.get_json(&session_key(session_id)).await
    }

    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        stopped_at: DateTime<Utc>,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let Some(mut record) = self.get_session(session_id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if record.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }
        record.status = status;
        record.stopped_at = Some(stopped_at);
        record.exit_code = exit_code;
        record.error = error;
        self.put_session(record).await?;
        Ok(TransitionOutcome::Applied)
    }

    async fn put_telemetry(
        &self,
        sample: TelemetrySample,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(&sample)?;
        conn.set_ex::<_, _, ()>(
            telemetry_key(&sample.machine_id),
            json,
            ttl.as_secs().max(1),
        )
        .await?;
        Ok(())
    }

    async fn get_telemetry(
        &self,
        machine_id: &str,
    ) -> Result<Option<TelemetrySample>, StoreError> {
        self.get_json(&telemetry_key(machine_id)).await
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        self.get_json(&api_key_key(key_hash)).await
    }

    async fn put_api_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        self.put_json(&api_key_key(&record.key_hash), &record).await
    }

    async fn touch_api_key(&self, key_hash: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(mut record) = self.find_api_key(key_hash).await? else {
            return Ok(());
        };
        record.last_used_at = Some(at);
        self.put_api_key(record).await
    }
}
