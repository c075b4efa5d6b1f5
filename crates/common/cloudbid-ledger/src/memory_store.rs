use async_trait::async_trait;
use chrono::Utc;
use cloudbid_types::{
    Bid, BidId, BidRequest, BidStatus, PageDirection, Resource, ResourceId, ResourceSpec, UserId,
    PAGE_SIZE,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::admission::{check_admission, AdmissionInputs};
use crate::store::{AwardOutcome, MarketStore, SettlementOrder, StoreError};

#[derive(Debug, Clone)]
struct UserRecord {
    password: String,
}

#[derive(Debug, Default)]
struct MarketState {
    next_uid: i64,
    next_rid: i64,
    next_bid: i64,
    users: HashMap<UserId, UserRecord>,
    usernames: HashMap<String, UserId>,
    wallets: HashMap<UserId, f64>,
    tokens: HashMap<String, UserId>,
    resources: BTreeMap<ResourceId, Resource>,
    bids: BTreeMap<BidId, Bid>,
}

impl MarketState {
    fn resource(&self, rid: ResourceId) -> Result<&Resource, StoreError> {
        self.resources
            .get(&rid)
            .ok_or_else(|| StoreError::resource_not_found(rid))
    }

    fn resource_mut(&mut self, rid: ResourceId) -> Result<&mut Resource, StoreError> {
        self.resources
            .get_mut(&rid)
            .ok_or_else(|| StoreError::resource_not_found(rid))
    }

    fn bid(&self, bid: BidId) -> Result<&Bid, StoreError> {
        self.bids.get(&bid).ok_or_else(|| StoreError::bid_not_found(bid))
    }

    fn wallet(&self, uid: UserId) -> Result<f64, StoreError> {
        self.wallets
            .get(&uid)
            .copied()
            .ok_or_else(|| StoreError::user_not_found(uid))
    }

    fn wallet_mut(&mut self, uid: UserId) -> Result<&mut f64, StoreError> {
        self.wallets
            .get_mut(&uid)
            .ok_or_else(|| StoreError::user_not_found(uid))
    }

    fn committed(&self, uid: UserId) -> f64 {
        self.bids
            .values()
            .filter(|b| b.renter == uid)
            .filter(|b| b.status == BidStatus::Pending || (b.status == BidStatus::Accepted && b.computing))
            .map(Bid::commitment)
            .sum()
    }

    fn pending_leader(&self, rid: ResourceId) -> Option<&Bid> {
        self.bids
            .values()
            .filter(|b| b.rid == rid && b.status == BidStatus::Pending)
            .max_by(|a, b| a.rank(b))
    }

    fn accept(&mut self, id: BidId) -> Result<Bid, StoreError> {
        let bid = self.bid(id)?.clone();
        if !matches!(bid.status, BidStatus::Pending | BidStatus::Processing) {
            return Err(StoreError::InvariantViolation(format!(
                "bid {id} is {} and cannot be accepted",
                bid.status
            )));
        }
        if self.bids.values().any(|b| b.rid == bid.rid && b.computing) {
            return Err(StoreError::ResourceComputing);
        }
        let resource = self.resource_mut(bid.rid)?;
        if !resource.available {
            return Err(StoreError::ResourceNotBiddable);
        }
        resource.computing = true;

        let entry = self
            .bids
            .get_mut(&id)
            .ok_or_else(|| StoreError::bid_not_found(id))?;
        entry.status = BidStatus::Accepted;
        entry.computing = true;
        Ok(entry.clone())
    }

    fn reject_where(&mut self, rid: ResourceId, statuses: &[BidStatus]) -> Vec<BidId> {
        let mut rejected = Vec::new();
        for bid in self.bids.values_mut() {
            if bid.rid == rid && statuses.contains(&bid.status) {
                bid.status = BidStatus::Rejected;
                rejected.push(bid.bid);
            }
        }
        rejected
    }
}

/// In-process store guarded by a single lock, so every operation is atomic.
/// Used for tests and for running the service without a database.
#[derive(Debug, Default)]
pub struct InMemoryMarketStore {
    state: RwLock<MarketState>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    async fn register_or_authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserId, bool), StoreError> {
        let mut state = self.state.write().await;
        if let Some(uid) = state.usernames.get(username).copied() {
            let record = state
                .users
                .get(&uid)
                .ok_or_else(|| StoreError::InvariantViolation(format!("user {uid} has no record")))?;
            if record.password != password {
                return Err(StoreError::InvalidCredentials);
            }
            return Ok((uid, false));
        }

        state.next_uid += 1;
        let uid = UserId(state.next_uid);
        state.users.insert(
            uid,
            UserRecord {
                password: password.to_string(),
            },
        );
        state.usernames.insert(username.to_string(), uid);
        state.wallets.insert(uid, 0.0);
        Ok((uid, true))
    }

    async fn issue_session_token(&self, uid: UserId, token: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&uid) {
            return Err(StoreError::NotFound(format!("user {uid}")));
        }
        state.tokens.insert(token.to_string(), uid);
        Ok(())
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        Ok(self.state.read().await.tokens.get(token).copied())
    }

    async fn revoke_token(&self, token: &str) -> Result<(), StoreError> {
        self.state.write().await.tokens.remove(token);
        Ok(())
    }

    async fn revoke_tokens_of_user(&self, uid: UserId) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let before = state.tokens.len();
        state.tokens.retain(|_, owner| *owner != uid);
        Ok((before - state.tokens.len()) as u64)
    }

    async fn create_resource(
        &self,
        owner: UserId,
        spec: &ResourceSpec,
    ) -> Result<ResourceId, StoreError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&owner) {
            return Err(StoreError::NotFound(format!("user {owner}")));
        }
        state.next_rid += 1;
        let rid = ResourceId(state.next_rid);
        state.resources.insert(
            rid,
            Resource {
                rid,
                owner,
                spec: spec.clone(),
                available: false,
                computing: false,
                created_at: Utc::now(),
            },
        );
        Ok(rid)
    }

    async fn delete_resource(&self, rid: ResourceId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.resource(rid)?.available {
            return Err(StoreError::ResourceStillAvailable);
        }
        state.resources.remove(&rid);
        state.bids.retain(|_, bid| bid.rid != rid);
        Ok(())
    }

    async fn flip_availability(&self, rid: ResourceId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let resource = state.resource_mut(rid)?;
        if resource.computing {
            return Err(StoreError::ResourceComputing);
        }
        resource.available = !resource.available;
        Ok(resource.available)
    }

    async fn is_available(&self, rid: ResourceId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.resource(rid)?.available)
    }

    async fn owner_of(&self, rid: ResourceId) -> Result<UserId, StoreError> {
        Ok(self.state.read().await.resource(rid)?.owner)
    }

    async fn get_resource(&self, rid: ResourceId) -> Result<Resource, StoreError> {
        Ok(self.state.read().await.resource(rid)?.clone())
    }

    async fn list_owned_resources(&self, uid: UserId) -> Result<Vec<Resource>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .resources
            .values()
            .filter(|r| r.owner == uid)
            .cloned()
            .collect())
    }

    async fn page_available_resources(
        &self,
        viewer: UserId,
        pivot: ResourceId,
        direction: PageDirection,
    ) -> Result<Vec<Resource>, StoreError> {
        let state = self.state.read().await;
        let visible = |r: &&Resource| r.available && r.owner != viewer;
        let limit = PAGE_SIZE as usize;
        let page = match direction {
            PageDirection::Next => state
                .resources
                .range((std::ops::Bound::Excluded(pivot), std::ops::Bound::Unbounded))
                .map(|(_, r)| r)
                .filter(visible)
                .take(limit)
                .cloned()
                .collect(),
            PageDirection::Prev => {
                let mut page: Vec<Resource> = state
                    .resources
                    .range(..pivot)
                    .rev()
                    .map(|(_, r)| r)
                    .filter(visible)
                    .take(limit)
                    .cloned()
                    .collect();
                page.reverse();
                page
            }
        };
        Ok(page)
    }

    async fn list_auctionable_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .resources
            .values()
            .filter(|r| r.is_biddable())
            .cloned()
            .collect())
    }

    async fn insert_bid(&self, renter: UserId, request: &BidRequest) -> Result<Bid, StoreError> {
        let mut state = self.state.write().await;
        let credits = state.wallet(renter)?;
        let resource = state.resource(request.rid)?;
        let inputs = AdmissionInputs {
            renter,
            resource,
            credits,
            committed: state.committed(renter),
            leader: state.pending_leader(request.rid).map(|b| (b.amount, b.duration)),
        };
        check_admission(&inputs, request)?;

        state.next_bid += 1;
        let bid = Bid {
            bid: BidId(state.next_bid),
            renter,
            rid: request.rid,
            amount: request.amount,
            duration: request.duration,
            status: BidStatus::Pending,
            computing: false,
            created_at: Utc::now(),
        };
        state.bids.insert(bid.bid, bid.clone());
        Ok(bid)
    }

    async fn get_bid(&self, bid: BidId) -> Result<Bid, StoreError> {
        Ok(self.state.read().await.bid(bid)?.clone())
    }

    async fn bid_owner(&self, bid: BidId) -> Result<UserId, StoreError> {
        Ok(self.state.read().await.bid(bid)?.renter)
    }

    async fn delete_bid(&self, bid: BidId) -> Result<Bid, StoreError> {
        let mut state = self.state.write().await;
        if state.bid(bid)?.computing {
            return Err(StoreError::BidComputing(bid));
        }
        state
            .bids
            .remove(&bid)
            .ok_or_else(|| StoreError::bid_not_found(bid))
    }

    async fn list_user_bids(&self, uid: UserId) -> Result<Vec<Bid>, StoreError> {
        let state = self.state.read().await;
        let mut bids: Vec<Bid> = state
            .bids
            .values()
            .filter(|b| b.renter == uid)
            .cloned()
            .collect();
        bids.sort_by_key(|b| (b.rid, b.bid));
        Ok(bids)
    }

    async fn has_bid_on_resource(&self, uid: UserId, rid: ResourceId) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state.bids.values().any(|b| b.renter == uid && b.rid == rid))
    }

    async fn mark_bid_rejected(&self, bid: BidId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .bids
            .get_mut(&bid)
            .ok_or_else(|| StoreError::bid_not_found(bid))?;
        if matches!(entry.status, BidStatus::Pending | BidStatus::Processing) {
            entry.status = BidStatus::Rejected;
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_bid_accepted(&self, bid: BidId) -> Result<Bid, StoreError> {
        self.state.write().await.accept(bid)
    }

    async fn pick_max_bid(&self, rid: ResourceId) -> Result<AwardOutcome, StoreError> {
        let mut state = self.state.write().await;
        let resource = match state.resources.get(&rid) {
            Some(resource) if resource.available => resource,
            _ => return Ok(AwardOutcome::Withdrawn),
        };
        if resource.computing {
            return Err(StoreError::ResourceComputing);
        }

        let mut contenders: Vec<BidId> = Vec::new();
        for bid in state.bids.values_mut() {
            if bid.rid == rid && bid.status == BidStatus::Pending {
                bid.status = BidStatus::Processing;
                contenders.push(bid.bid);
            }
        }
        let Some(winner) = contenders
            .iter()
            .filter_map(|id| state.bids.get(id))
            .max_by(|a, b| a.rank(b))
            .map(|b| b.bid)
        else {
            return Ok(AwardOutcome::NoBids);
        };

        let winner = state.accept(winner)?;
        let rejected = state.reject_where(rid, &[BidStatus::Processing]);
        Ok(AwardOutcome::Awarded { winner, rejected })
    }

    async fn reject_pending_bids(&self, rid: ResourceId) -> Result<Vec<BidId>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.reject_where(rid, &[BidStatus::Pending, BidStatus::Processing]))
    }

    async fn settle(&self, order: &SettlementOrder) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let bid = state.bid(order.bid)?;
        if !bid.computing || bid.rid != order.rid {
            return Err(StoreError::NotComputing(order.bid));
        }
        let balance = state.wallet(order.renter)?;
        state.wallet(order.loaner)?;
        if balance < order.amount {
            return Err(StoreError::InsufficientCredits {
                available: balance,
                attempted: order.amount,
            });
        }

        *state.wallet_mut(order.renter)? -= order.amount;
        *state.wallet_mut(order.loaner)? += order.amount;
        if let Some(bid) = state.bids.get_mut(&order.bid) {
            bid.computing = false;
        }
        state.resource_mut(order.rid)?.computing = false;
        Ok(())
    }

    async fn add_credits(&self, uid: UserId, amount: f64) -> Result<f64, StoreError> {
        let mut state = self.state.write().await;
        let wallet = state.wallet_mut(uid)?;
        *wallet += amount;
        Ok(*wallet)
    }

    async fn credits(&self, uid: UserId) -> Result<f64, StoreError> {
        self.state.read().await.wallet(uid)
    }

    async fn count_resources(&self, uid: UserId) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state.resources.values().filter(|r| r.owner == uid).count() as i64)
    }

    async fn count_active_resources(&self, uid: UserId) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .resources
            .values()
            .filter(|r| r.owner == uid && r.computing)
            .count() as i64)
    }

    async fn pending_bid_commitment(&self, uid: UserId) -> Result<f64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .bids
            .values()
            .filter(|b| b.renter == uid && b.status == BidStatus::Pending)
            .map(Bid::commitment)
            .sum())
    }

    async fn count_running_accepted_bids(&self, uid: UserId) -> Result<i64, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .bids
            .values()
            .filter(|b| b.renter == uid && b.status == BidStatus::Accepted && b.computing)
            .count() as i64)
    }
}
