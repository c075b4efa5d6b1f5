use async_trait::async_trait;
use cloudbid_types::{
    Bid, BidId, BidRequest, BidStatus, PageDirection, Resource, ResourceId, ResourceSpec, UserId,
    PAGE_SIZE,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::admission::{check_admission, AdmissionInputs};
use crate::store::{AwardOutcome, MarketStore, SettlementOrder, StoreError};

const RESOURCE_COLUMNS: &str = "rid, uid, cpu_cores, memory, storage, gpu, bandwidth, \
     cost_per_minute, available, computing, created_at";

const BID_COLUMNS: &str = "bid, uid, rid, amount, duration, status, computing, created_at";

/// Escrow held by a user: pending bids plus accepted bids still computing.
const COMMITTED_SQL: &str = "SELECT COALESCE(SUM(amount * duration), 0)::DOUBLE PRECISION \
     FROM bids \
     WHERE uid = $1 AND (status = 'pending' OR (status = 'accepted' AND computing))";

fn resource_from_row(row: &PgRow) -> Result<Resource, sqlx::Error> {
    Ok(Resource {
        rid: ResourceId(row.try_get("rid")?),
        owner: UserId(row.try_get("uid")?),
        spec: ResourceSpec {
            cpu_cores: row.try_get("cpu_cores")?,
            memory_gb: row.try_get("memory")?,
            storage_gb: row.try_get("storage")?,
            gpu: row.try_get("gpu")?,
            bandwidth_mbps: row.try_get("bandwidth")?,
            cost_per_minute: row.try_get("cost_per_minute")?,
        },
        available: row.try_get("available")?,
        computing: row.try_get("computing")?,
        created_at: row.try_get("created_at")?,
    })
}

fn bid_from_row(row: &PgRow) -> Result<Bid, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<BidStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(Bid {
        bid: BidId(row.try_get("bid")?),
        renter: UserId(row.try_get("uid")?),
        rid: ResourceId(row.try_get("rid")?),
        amount: row.try_get("amount")?,
        duration: row.try_get("duration")?,
        status,
        computing: row.try_get("computing")?,
        created_at: row.try_get("created_at")?,
    })
}

fn resources_from_rows(rows: &[PgRow]) -> Result<Vec<Resource>, StoreError> {
    rows.iter()
        .map(|row| resource_from_row(row).map_err(StoreError::from))
        .collect()
}

/// PostgreSQL implementation of [`MarketStore`].
#[derive(Clone, Debug)]
pub struct PostgresMarketStore {
    pool: PgPool,
}

impl PostgresMarketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin_tx(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool.begin().await.map_err(StoreError::Database)
    }

    async fn lock_wallet(
        tx: &mut Transaction<'_, Postgres>,
        uid: UserId,
    ) -> Result<f64, StoreError> {
        sqlx::query("SELECT credits FROM wallets WHERE uid = $1 FOR UPDATE")
            .bind(uid.get())
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| row.try_get::<f64, _>("credits"))
            .transpose()?
            .ok_or_else(|| StoreError::user_not_found(uid))
    }

    async fn lock_resource(
        tx: &mut Transaction<'_, Postgres>,
        rid: ResourceId,
    ) -> Result<Option<Resource>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE rid = $1 FOR UPDATE"
        ))
        .bind(rid.get())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.as_ref().map(resource_from_row).transpose()?)
    }

    async fn lock_bid(
        tx: &mut Transaction<'_, Postgres>,
        bid: BidId,
    ) -> Result<Bid, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE bid = $1 FOR UPDATE"
        ))
        .bind(bid.get())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::bid_not_found(bid))?;
        Ok(bid_from_row(&row)?)
    }

    /// Accepts `bid` inside `tx`. The caller holds the resource row lock.
    async fn accept_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        bid: BidId,
    ) -> Result<Bid, StoreError> {
        let current = Self::lock_bid(tx, bid).await?;
        if !matches!(current.status, BidStatus::Pending | BidStatus::Processing) {
            return Err(StoreError::InvariantViolation(format!(
                "bid {bid} is {} and cannot be accepted",
                current.status
            )));
        }

        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM bids WHERE rid = $1 AND computing)",
        )
        .bind(current.rid.get())
        .fetch_one(&mut **tx)
        .await?;
        if busy {
            return Err(StoreError::ResourceComputing);
        }

        let row = sqlx::query(&format!(
            "UPDATE bids SET status = 'accepted', computing = TRUE WHERE bid = $1 \
             RETURNING {BID_COLUMNS}"
        ))
        .bind(bid.get())
        .fetch_one(&mut **tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE resources SET computing = TRUE WHERE rid = $1 AND available",
        )
        .bind(current.rid.get())
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ResourceNotBiddable);
        }

        Ok(bid_from_row(&row)?)
    }

    async fn count(&self, sql: &str, uid: UserId) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(uid.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MarketStore for PostgresMarketStore {
    async fn register_or_authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserId, bool), StoreError> {
        let mut tx = self.begin_tx().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO users (username, password) VALUES ($1, $2) \
             ON CONFLICT (username) DO NOTHING RETURNING uid",
        )
        .bind(username)
        .bind(password)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(uid) = inserted {
            sqlx::query("INSERT INTO wallets (uid, credits) VALUES ($1, 0)")
                .bind(uid)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok((UserId(uid), true));
        }

        let row = sqlx::query("SELECT uid, password FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let stored: String = row.try_get("password")?;
        if stored != password {
            return Err(StoreError::InvalidCredentials);
        }
        Ok((UserId(row.try_get("uid")?), false))
    }

    async fn issue_session_token(&self, uid: UserId, token: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO tokens (uid, token) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(uid.get())
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let uid: Option<i64> = sqlx::query_scalar("SELECT uid FROM tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(uid.map(UserId))
    }

    async fn revoke_token(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tokens WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_tokens_of_user(&self, uid: UserId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM tokens WHERE uid = $1")
            .bind(uid.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_resource(
        &self,
        owner: UserId,
        spec: &ResourceSpec,
    ) -> Result<ResourceId, StoreError> {
        let rid: i64 = sqlx::query_scalar(
            "INSERT INTO resources \
             (uid, cpu_cores, memory, storage, gpu, bandwidth, cost_per_minute) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING rid",
        )
        .bind(owner.get())
        .bind(spec.cpu_cores)
        .bind(spec.memory_gb)
        .bind(spec.storage_gb)
        .bind(&spec.gpu)
        .bind(spec.bandwidth_mbps)
        .bind(spec.cost_per_minute)
        .fetch_one(&self.pool)
        .await?;
        Ok(ResourceId(rid))
    }

    async fn delete_resource(&self, rid: ResourceId) -> Result<(), StoreError> {
        let mut tx = self.begin_tx().await?;
        let resource = Self::lock_resource(&mut tx, rid)
            .await?
            .ok_or_else(|| StoreError::resource_not_found(rid))?;
        if resource.available {
            return Err(StoreError::ResourceStillAvailable);
        }
        sqlx::query("DELETE FROM resources WHERE rid = $1")
            .bind(rid.get())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn flip_availability(&self, rid: ResourceId) -> Result<bool, StoreError> {
        let mut tx = self.begin_tx().await?;
        let resource = Self::lock_resource(&mut tx, rid)
            .await?
            .ok_or_else(|| StoreError::resource_not_found(rid))?;
        if resource.computing {
            return Err(StoreError::ResourceComputing);
        }
        let available: bool = sqlx::query_scalar(
            "UPDATE resources SET available = NOT available WHERE rid = $1 RETURNING available",
        )
        .bind(rid.get())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(available)
    }

    async fn is_available(&self, rid: ResourceId) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT available FROM resources WHERE rid = $1")
            .bind(rid.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::resource_not_found(rid))
    }

    async fn owner_of(&self, rid: ResourceId) -> Result<UserId, StoreError> {
        let uid: Option<i64> = sqlx::query_scalar("SELECT uid FROM resources WHERE rid = $1")
            .bind(rid.get())
            .fetch_optional(&self.pool)
            .await?;
        uid.map(UserId)
            .ok_or_else(|| StoreError::resource_not_found(rid))
    }

    async fn get_resource(&self, rid: ResourceId) -> Result<Resource, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE rid = $1"
        ))
        .bind(rid.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::resource_not_found(rid))?;
        Ok(resource_from_row(&row)?)
    }

    async fn list_owned_resources(&self, uid: UserId) -> Result<Vec<Resource>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE uid = $1 ORDER BY rid"
        ))
        .bind(uid.get())
        .fetch_all(&self.pool)
        .await?;
        resources_from_rows(&rows)
    }

    async fn page_available_resources(
        &self,
        viewer: UserId,
        pivot: ResourceId,
        direction: PageDirection,
    ) -> Result<Vec<Resource>, StoreError> {
        let (operator, order) = match direction {
            PageDirection::Prev => ("<", "DESC"),
            PageDirection::Next => (">", "ASC"),
        };
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources \
             WHERE rid {operator} $1 AND available AND uid <> $2 \
             ORDER BY rid {order} LIMIT $3"
        ))
        .bind(pivot.get())
        .bind(viewer.get())
        .bind(PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut page = resources_from_rows(&rows)?;
        if direction == PageDirection::Prev {
            page.reverse();
        }
        Ok(page)
    }

    async fn list_auctionable_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources \
             WHERE available AND NOT computing ORDER BY rid"
        ))
        .fetch_all(&self.pool)
        .await?;
        resources_from_rows(&rows)
    }

    async fn insert_bid(&self, renter: UserId, request: &BidRequest) -> Result<Bid, StoreError> {
        let mut tx = self.begin_tx().await?;

        // Wallet first, then resource: the same order settlement uses.
        let credits = Self::lock_wallet(&mut tx, renter).await?;
        let resource = Self::lock_resource(&mut tx, request.rid)
            .await?
            .ok_or_else(|| StoreError::resource_not_found(request.rid))?;

        let committed: f64 = sqlx::query_scalar(COMMITTED_SQL)
            .bind(renter.get())
            .fetch_one(&mut *tx)
            .await?;

        let leader = sqlx::query(
            "SELECT amount, duration FROM bids WHERE rid = $1 AND status = 'pending' \
             ORDER BY amount DESC, duration DESC LIMIT 1",
        )
        .bind(request.rid.get())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| -> Result<(f64, i32), sqlx::Error> {
            Ok((row.try_get("amount")?, row.try_get("duration")?))
        })
        .transpose()?;

        let inputs = AdmissionInputs {
            renter,
            resource: &resource,
            credits,
            committed,
            leader,
        };
        check_admission(&inputs, request)?;

        let row = sqlx::query(&format!(
            "INSERT INTO bids (uid, rid, amount, duration) VALUES ($1, $2, $3, $4) \
             RETURNING {BID_COLUMNS}"
        ))
        .bind(renter.get())
        .bind(request.rid.get())
        .bind(request.amount)
        .bind(request.duration)
        .fetch_one(&mut *tx)
        .await?;
        let bid = bid_from_row(&row)?;

        tx.commit().await?;
        Ok(bid)
    }

    async fn get_bid(&self, bid: BidId) -> Result<Bid, StoreError> {
        let row = sqlx::query(&format!("SELECT {BID_COLUMNS} FROM bids WHERE bid = $1"))
            .bind(bid.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::bid_not_found(bid))?;
        Ok(bid_from_row(&row)?)
    }

    async fn bid_owner(&self, bid: BidId) -> Result<UserId, StoreError> {
        let uid: Option<i64> = sqlx::query_scalar("SELECT uid FROM bids WHERE bid = $1")
            .bind(bid.get())
            .fetch_optional(&self.pool)
            .await?;
        uid.map(UserId).ok_or_else(|| StoreError::bid_not_found(bid))
    }

    async fn delete_bid(&self, bid: BidId) -> Result<Bid, StoreError> {
        let mut tx = self.begin_tx().await?;
        let current = Self::lock_bid(&mut tx, bid).await?;
        if current.computing {
            return Err(StoreError::BidComputing(bid));
        }
        sqlx::query("DELETE FROM bids WHERE bid = $1")
            .bind(bid.get())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(current)
    }

    async fn list_user_bids(&self, uid: UserId) -> Result<Vec<Bid>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BID_COLUMNS} FROM bids WHERE uid = $1 ORDER BY rid, bid"
        ))
        .bind(uid.get())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| bid_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn has_bid_on_resource(&self, uid: UserId, rid: ResourceId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM bids WHERE uid = $1 AND rid = $2)",
        )
        .bind(uid.get())
        .bind(rid.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_bid_rejected(&self, bid: BidId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bids SET status = 'rejected' \
             WHERE bid = $1 AND status IN ('pending', 'processing')",
        )
        .bind(bid.get())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_bid_accepted(&self, bid: BidId) -> Result<Bid, StoreError> {
        let mut tx = self.begin_tx().await?;
        let rid: i64 = sqlx::query_scalar("SELECT rid FROM bids WHERE bid = $1")
            .bind(bid.get())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::bid_not_found(bid))?;
        Self::lock_resource(&mut tx, ResourceId(rid)).await?;
        let accepted = Self::accept_in_tx(&mut tx, bid).await?;
        tx.commit().await?;
        Ok(accepted)
    }

    async fn pick_max_bid(&self, rid: ResourceId) -> Result<AwardOutcome, StoreError> {
        let mut tx = self.begin_tx().await?;
        let resource = match Self::lock_resource(&mut tx, rid).await? {
            Some(resource) if resource.available => resource,
            _ => return Ok(AwardOutcome::Withdrawn),
        };
        if resource.computing {
            return Err(StoreError::ResourceComputing);
        }

        let moved = sqlx::query(
            "UPDATE bids SET status = 'processing' WHERE rid = $1 AND status = 'pending'",
        )
        .bind(rid.get())
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(AwardOutcome::NoBids);
        }

        let best: i64 = sqlx::query_scalar(
            "SELECT bid FROM bids WHERE rid = $1 AND status = 'processing' \
             ORDER BY amount DESC, duration DESC, created_at ASC, bid ASC LIMIT 1",
        )
        .bind(rid.get())
        .fetch_one(&mut *tx)
        .await?;

        let winner = Self::accept_in_tx(&mut tx, BidId(best)).await?;
        let rejected: Vec<i64> = sqlx::query_scalar(
            "UPDATE bids SET status = 'rejected' WHERE rid = $1 AND status = 'processing' \
             RETURNING bid",
        )
        .bind(rid.get())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AwardOutcome::Awarded {
            winner,
            rejected: rejected.into_iter().map(BidId).collect(),
        })
    }

    async fn reject_pending_bids(&self, rid: ResourceId) -> Result<Vec<BidId>, StoreError> {
        let rejected: Vec<i64> = sqlx::query_scalar(
            "UPDATE bids SET status = 'rejected' \
             WHERE rid = $1 AND status IN ('pending', 'processing') RETURNING bid",
        )
        .bind(rid.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rejected.into_iter().map(BidId).collect())
    }

    async fn settle(&self, order: &SettlementOrder) -> Result<(), StoreError> {
        let mut tx = self.begin_tx().await?;

        let (low, high) = if order.renter <= order.loaner {
            (order.renter, order.loaner)
        } else {
            (order.loaner, order.renter)
        };
        let low_balance = Self::lock_wallet(&mut tx, low).await?;
        let high_balance = if high != low {
            Self::lock_wallet(&mut tx, high).await?
        } else {
            low_balance
        };
        let renter_balance = if order.renter == low {
            low_balance
        } else {
            high_balance
        };

        Self::lock_resource(&mut tx, order.rid).await?;
        let bid = Self::lock_bid(&mut tx, order.bid).await?;
        if !bid.computing || bid.rid != order.rid {
            return Err(StoreError::NotComputing(order.bid));
        }
        if renter_balance < order.amount {
            return Err(StoreError::InsufficientCredits {
                available: renter_balance,
                attempted: order.amount,
            });
        }

        sqlx::query("UPDATE wallets SET credits = credits - $2 WHERE uid = $1")
            .bind(order.renter.get())
            .bind(order.amount)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE wallets SET credits = credits + $2 WHERE uid = $1")
            .bind(order.loaner.get())
            .bind(order.amount)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE bids SET computing = FALSE WHERE bid = $1")
            .bind(order.bid.get())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE resources SET computing = FALSE WHERE rid = $1")
            .bind(order.rid.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_credits(&self, uid: UserId, amount: f64) -> Result<f64, StoreError> {
        let balance: Option<f64> = sqlx::query_scalar(
            "UPDATE wallets SET credits = credits + $2 WHERE uid = $1 RETURNING credits",
        )
        .bind(uid.get())
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        balance.ok_or_else(|| StoreError::user_not_found(uid))
    }

    async fn credits(&self, uid: UserId) -> Result<f64, StoreError> {
        let balance: Option<f64> = sqlx::query_scalar("SELECT credits FROM wallets WHERE uid = $1")
            .bind(uid.get())
            .fetch_optional(&self.pool)
            .await?;
        balance.ok_or_else(|| StoreError::user_not_found(uid))
    }

    async fn count_resources(&self, uid: UserId) -> Result<i64, StoreError> {
        self.count("SELECT COUNT(*) FROM resources WHERE uid = $1", uid)
            .await
    }

    async fn count_active_resources(&self, uid: UserId) -> Result<i64, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM resources WHERE uid = $1 AND computing",
            uid,
        )
        .await
    }

    async fn pending_bid_commitment(&self, uid: UserId) -> Result<f64, StoreError> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount * duration), 0)::DOUBLE PRECISION \
             FROM bids WHERE uid = $1 AND status = 'pending'",
        )
        .bind(uid.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn count_running_accepted_bids(&self, uid: UserId) -> Result<i64, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM bids WHERE uid = $1 AND status = 'accepted' AND computing",
            uid,
        )
        .await
    }
}
