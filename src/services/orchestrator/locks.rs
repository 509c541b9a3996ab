use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-server mutual exclusion with an expiring lease, so a crashed worker
/// never wedges a server permanently.
#[async_trait]
pub trait LockKeeper: Send + Sync {
    /// Claims the server's lease for `holder`. Returns false when another
    /// holder has an unexpired lease; never blocks waiting for it.
    async fn acquire(&self, server_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool>;

    /// Releases the lease if `holder` still owns it.
    async fn release(&self, server_id: Uuid, holder: Uuid) -> Result<()>;
}

pub struct PgLockKeeper {
    db: PgPool,
}

impl PgLockKeeper {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LockKeeper for PgLockKeeper {
    async fn acquire(&self, server_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool> {
        // Single atomic statement: insert wins, or an expired lease is taken
        // over. A live lease makes the upsert a no-op and returns no row.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO server_locks (server_id, holder, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + make_interval(secs => $3))
            ON CONFLICT (server_id) DO UPDATE
            SET holder = EXCLUDED.holder,
                acquired_at = now(),
                expires_at = EXCLUDED.expires_at
            WHERE server_locks.expires_at <= now() OR server_locks.holder = $2
            RETURNING holder
            "#,
        )
        .bind(server_id)
        .bind(holder)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.db)
        .await
        .context("failed to claim server lock")?;

        Ok(claimed.is_some())
    }

    async fn release(&self, server_id: Uuid, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM server_locks WHERE server_id = $1 AND holder = $2")
            .bind(server_id)
            .bind(holder)
            .execute(&self.db)
            .await
            .context("failed to release server lock")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLockKeeper {
    entries: Mutex<HashMap<Uuid, (Uuid, Instant)>>,
}

impl MemoryLockKeeper {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockKeeper for MemoryLockKeeper {
    async fn acquire(&self, server_id: Uuid, holder: Uuid, lease: Duration) -> Result<bool> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if let Some((current, expires_at)) = entries.get(&server_id) {
            if *current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(server_id, (holder, now + lease));
        Ok(true)
    }

    async fn release(&self, server_id: Uuid, holder: Uuid) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((current, _)) = entries.get(&server_id) {
            if *current == holder {
                entries.remove(&server_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let keeper = MemoryLockKeeper::new();
        let server = Uuid::new_v4();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let lease = Duration::from_secs(60);

        assert!(keeper.acquire(server, job_a, lease).await.unwrap());
        assert!(!keeper.acquire(server, job_b, lease).await.unwrap());
        assert!(!keeper.acquire(server, job_b, lease).await.unwrap());

        keeper.release(server, job_a).await.unwrap();
        assert!(keeper.acquire(server, job_b, lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_claimable() {
        let keeper = MemoryLockKeeper::new();
        let server = Uuid::new_v4();
        let crashed = Uuid::new_v4();
        let next = Uuid::new_v4();

        assert!(keeper
            .acquire(server, crashed, Duration::from_millis(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(keeper
            .acquire(server, next, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let keeper = MemoryLockKeeper::new();
        let server = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let lease = Duration::from_secs(60);

        assert!(keeper.acquire(server, owner, lease).await.unwrap());
        keeper.release(server, stranger).await.unwrap();
        assert!(!keeper.acquire(server, stranger, lease).await.unwrap());
    }

    #[tokio::test]
    async fn holder_reacquire_extends_its_own_lease() {
        let keeper = MemoryLockKeeper::new();
        let server = Uuid::new_v4();
        let owner = Uuid::new_v4();

        assert!(keeper
            .acquire(server, owner, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(keeper
            .acquire(server, owner, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn locks_for_different_servers_are_independent() {
        let keeper = MemoryLockKeeper::new();
        let job = Uuid::new_v4();
        let lease = Duration::from_secs(60);

        assert!(keeper.acquire(Uuid::new_v4(), job, lease).await.unwrap());
        assert!(keeper.acquire(Uuid::new_v4(), job, lease).await.unwrap());
    }

    #[tokio::test]
    async fn racing_tasks_admit_exactly_one_winner() {
        let keeper = std::sync::Arc::new(MemoryLockKeeper::new());
        let server = Uuid::new_v4();
        let lease = Duration::from_secs(60);

        let contender = |keeper: std::sync::Arc<MemoryLockKeeper>| {
            tokio::spawn(async move { keeper.acquire(server, Uuid::new_v4(), lease).await })
        };
        let a = contender(keeper.clone());
        let b = contender(keeper);
        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();

        assert!(first ^ second);
    }
}
