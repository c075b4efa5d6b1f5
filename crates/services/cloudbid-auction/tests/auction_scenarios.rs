//! End-to-end auction runs against the in-memory store with a paused clock.

use cloudbid_auction::{AuctionError, AuctionService, AuctionTimings, Availability, EventStream, StreamFrame};
use cloudbid_ledger::{CreditLedger, InMemoryMarketStore, LedgerError, MarketStore, SettlementPolicy, StoreError};
use cloudbid_types::{BidRequest, BidStatus, ResourceId, ResourceSpec, UserId};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MINUTE: Duration = Duration::from_secs(60);

struct Fixture {
    store: Arc<dyn MarketStore>,
    service: AuctionService,
}

impl Fixture {
    fn new(policy: SettlementPolicy) -> Self {
        let store: Arc<dyn MarketStore> = Arc::new(InMemoryMarketStore::new());
        let ledger = CreditLedger::new(store.clone(), policy);
        let service = AuctionService::new(
            ledger,
            AuctionTimings {
                window: WINDOW,
                compute_minute: MINUTE,
            },
        );
        Self { store, service }
    }

    async fn user(&self, name: &str, credits: f64) -> UserId {
        let (uid, created) = self.store.register_or_authenticate(name, "pw").await.unwrap();
        assert!(created);
        if credits > 0.0 {
            self.service.ledger().top_up(uid, credits).await.unwrap();
        }
        uid
    }

    async fn resource(&self, owner: UserId, cost_per_minute: f64) -> ResourceId {
        self.store
            .create_resource(
                owner,
                &ResourceSpec {
                    cpu_cores: 8,
                    memory_gb: 32,
                    storage_gb: 512,
                    gpu: "rtx-4090".into(),
                    bandwidth_mbps: 1000,
                    cost_per_minute,
                },
            )
            .await
            .unwrap()
    }

    async fn open(&self, owner: UserId, rid: ResourceId) -> EventStream {
        match self.service.toggle_availability(owner, rid).await.unwrap() {
            Availability::Opened(stream) => stream,
            Availability::Closed => panic!("resource {rid} should have opened"),
        }
    }

    async fn bid(&self, renter: UserId, rid: ResourceId, amount: f64, duration: i32) -> EventStream {
        let (_, stream) = self
            .service
            .place_bid(renter, &BidRequest { rid, amount, duration })
            .await
            .unwrap();
        stream
    }

    async fn credits(&self, uid: UserId) -> f64 {
        self.store.credits(uid).await.unwrap()
    }
}

fn rejected(reason: &str) -> Option<StreamFrame> {
    Some(StreamFrame::rejected(reason))
}

#[tokio::test(start_paused = true)]
async fn happy_path_runs_window_compute_and_settlement() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;

    let opened_at = Instant::now();
    let mut loaner = fx.open(b, rid).await;
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;

    assert_eq!(bidder.next().await, Some(StreamFrame::starting_connection()));
    let waited = opened_at.elapsed();
    assert!(waited >= WINDOW && waited < WINDOW + Duration::from_secs(1));
    assert!(fx.store.get_resource(rid).await.unwrap().computing);

    assert_eq!(bidder.next().await, Some(StreamFrame::connection_ended()));
    assert!(opened_at.elapsed() >= WINDOW + MINUTE * 3);
    assert_eq!(bidder.next().await, None);

    assert_eq!(fx.credits(a).await, 985.0);
    assert_eq!(fx.credits(b).await, 15.0);

    assert_eq!(loaner.next().await, Some(StreamFrame::starting_connection()));
    assert_eq!(loaner.next().await, Some(StreamFrame::connection_ended()));
    assert_eq!(loaner.next().await, None);

    let resource = fx.store.get_resource(rid).await.unwrap();
    assert!(resource.available);
    assert!(!resource.computing);
    let bids = fx.store.list_user_bids(a).await.unwrap();
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].status, BidStatus::Accepted);
    assert!(!bids[0].computing);
}

#[tokio::test(start_paused = true)]
async fn better_bid_preempts_leader() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let c = fx.user("c", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;

    let mut first = fx.bid(a, rid, 5.0, 3).await;
    let mut second = fx.bid(c, rid, 6.0, 3).await;

    assert_eq!(
        first.next().await,
        rejected("A better bid with amount: 6.000000 and duration: 3")
    );
    assert_eq!(first.next().await, None);
    let a_bids = fx.store.list_user_bids(a).await.unwrap();
    assert_eq!(a_bids[0].status, BidStatus::Rejected);

    assert_eq!(second.next().await, Some(StreamFrame::starting_connection()));
    assert_eq!(second.next().await, Some(StreamFrame::connection_ended()));

    assert_eq!(fx.credits(a).await, 1000.0);
    assert_eq!(fx.credits(c).await, 982.0);
    assert_eq!(fx.credits(b).await, 18.0);
}

#[tokio::test(start_paused = true)]
async fn ties_break_on_duration() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let c = fx.user("c", 1000.0).await;
    let b = fx.user("b", 0.0).await;

    let longer = fx.resource(b, 2.0).await;
    let _l1 = fx.open(b, longer).await;
    let mut first = fx.bid(a, longer, 5.0, 3).await;
    let _second = fx.bid(c, longer, 5.0, 4).await;
    assert_eq!(
        first.next().await,
        rejected("A better bid with amount: 5.000000 and duration: 4")
    );

    let equal = fx.resource(b, 2.0).await;
    let _l2 = fx.open(b, equal).await;
    let _leader = fx.bid(a, equal, 5.0, 3).await;
    let err = fx
        .service
        .place_bid(c, &BidRequest { rid: equal, amount: 5.0, duration: 3 })
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::Ledger(LedgerError::BidNotCompetitive)));
    assert_eq!(err.to_string(), "existing bid is better or equal");
}

#[tokio::test(start_paused = true)]
async fn bid_at_floor_is_refused() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;

    let err = fx
        .service
        .place_bid(a, &BidRequest { rid, amount: 2.0, duration: 10 })
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::Ledger(LedgerError::BidBelowFloor { .. })));
    assert!(fx.store.list_user_bids(a).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn escrow_counts_pending_commitments() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 10.0).await;
    let b = fx.user("b", 0.0).await;
    let held = fx.resource(b, 2.0).await;
    let wanted = fx.resource(b, 0.5).await;
    let _l1 = fx.open(b, held).await;
    let _l2 = fx.open(b, wanted).await;

    let _pending = fx.bid(a, held, 4.0, 2).await;
    let err = fx
        .service
        .place_bid(a, &BidRequest { rid: wanted, amount: 1.0, duration: 5 })
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("only 10.00 credits available"));
    assert!(message.contains("total bid amount is 13.00"));
    match err {
        AuctionError::Ledger(LedgerError::InsufficientCredits { available, attempted }) => {
            assert_eq!(available, 10.0);
            assert_eq!(attempted, 13.0);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn revocation_mid_window_rejects_leader() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let mut loaner = fx.open(b, rid).await;
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;

    sleep(Duration::from_secs(30)).await;
    assert!(matches!(
        fx.service.toggle_availability(b, rid).await.unwrap(),
        Availability::Closed
    ));

    assert_eq!(bidder.next().await, rejected("resource is no longer available"));
    assert_eq!(bidder.next().await, None);
    assert_eq!(loaner.next().await, None);

    let bids = fx.store.list_user_bids(a).await.unwrap();
    assert_eq!(bids[0].status, BidStatus::Rejected);

    sleep(WINDOW * 2).await;
    let resource = fx.store.get_resource(rid).await.unwrap();
    assert!(!resource.available);
    assert!(!resource.computing);
    assert_eq!(fx.credits(a).await, 1000.0);
    assert_eq!(fx.service.ledger().user_info(a).await.unwrap().pending_bids, 0.0);
}

#[tokio::test(start_paused = true)]
async fn window_without_bids_reports_to_loaner_and_rearms() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;

    let mut loaner = fx.open(b, rid).await;
    assert_eq!(loaner.next().await, Some(StreamFrame::no_bids()));
    assert_eq!(loaner.next().await, None);
    assert!(fx.store.is_available(rid).await.unwrap());
    assert!(fx.service.coordinator().is_running(rid));

    let mut bidder = fx.bid(a, rid, 3.0, 1).await;
    assert_eq!(bidder.next().await, Some(StreamFrame::starting_connection()));
    assert_eq!(bidder.next().await, Some(StreamFrame::connection_ended()));
    assert_eq!(fx.credits(b).await, 3.0);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_does_not_stop_settlement() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    drop(fx.open(b, rid).await);

    let mut bidder = fx.bid(a, rid, 5.0, 3).await;
    assert_eq!(bidder.next().await, Some(StreamFrame::starting_connection()));
    drop(bidder);

    sleep(MINUTE * 3 + Duration::from_secs(1)).await;
    assert_eq!(fx.credits(a).await, 985.0);
    assert_eq!(fx.credits(b).await, 15.0);
    assert!(!fx.store.get_resource(rid).await.unwrap().computing);
}

#[tokio::test(start_paused = true)]
async fn deleting_leading_bid_withdraws_it() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let c = fx.user("c", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;

    let (bid, mut bidder) = fx
        .service
        .place_bid(a, &BidRequest { rid, amount: 5.0, duration: 3 })
        .await
        .unwrap();

    let err = fx.service.delete_bid(c, bid.bid).await.unwrap_err();
    assert!(matches!(err, AuctionError::NotBidOwner { .. }));

    let removed = fx.service.delete_bid(a, bid.bid).await.unwrap();
    assert_eq!(removed.bid, bid.bid);
    assert_eq!(bidder.next().await, rejected("bid withdrawn"));
    assert!(fx.service.registry().leader(rid).is_none());

    let mut replacement = fx.bid(c, rid, 3.0, 1).await;
    assert_eq!(replacement.next().await, Some(StreamFrame::starting_connection()));
}

#[tokio::test(start_paused = true)]
async fn only_owner_may_toggle_or_delete() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 0.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;

    assert!(matches!(
        fx.service.toggle_availability(a, rid).await,
        Err(AuctionError::NotResourceOwner { .. })
    ));
    assert!(matches!(
        fx.service.delete_resource(a, rid).await,
        Err(AuctionError::NotResourceOwner { .. })
    ));

    let _loaner = fx.open(b, rid).await;
    assert!(matches!(
        fx.service.delete_resource(b, rid).await,
        Err(AuctionError::Store(StoreError::ResourceStillAvailable))
    ));

    fx.service.toggle_availability(b, rid).await.unwrap();
    fx.service.delete_resource(b, rid).await.unwrap();
    assert!(!fx.service.coordinator().is_running(rid));
    assert!(matches!(
        fx.service.delete_resource(b, rid).await,
        Err(AuctionError::Store(StoreError::NotFound(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn toggle_is_refused_while_computing() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;
    assert_eq!(bidder.next().await, Some(StreamFrame::starting_connection()));

    assert!(matches!(
        fx.service.toggle_availability(b, rid).await,
        Err(AuctionError::Store(StoreError::ResourceComputing))
    ));
    let err = fx
        .service
        .place_bid(a, &BidRequest { rid, amount: 9.0, duration: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::Ledger(LedgerError::ResourceNotBiddable(_))));
}

#[tokio::test(start_paused = true)]
async fn one_winner_among_many_bidders() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let b = fx.user("owner", 0.0).await;
    let rid = fx.resource(b, 1.0).await;
    let _loaner = fx.open(b, rid).await;

    let mut streams = Vec::new();
    for i in 0..8 {
        let renter = fx.user(&format!("renter-{i}"), 1000.0).await;
        streams.push(fx.bid(renter, rid, 2.0 + f64::from(i), 2).await);
    }

    let mut started = 0;
    let mut lost = 0;
    for stream in &mut streams {
        match stream.next().await {
            Some(frame) if frame == StreamFrame::starting_connection() => started += 1,
            Some(frame) if frame.data == "rejected" => lost += 1,
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(lost, 7);

    let winner = streams.last_mut().unwrap();
    assert_eq!(winner.next().await, Some(StreamFrame::connection_ended()));
    assert_eq!(fx.credits(b).await, 18.0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_settles_running_compute() {
    let fx = Fixture::new(SettlementPolicy::Elapsed);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;
    assert_eq!(bidder.next().await, Some(StreamFrame::starting_connection()));

    sleep(Duration::from_secs(90)).await;
    fx.service.shutdown().await;

    assert_eq!(bidder.next().await, Some(StreamFrame::connection_ended()));
    assert_eq!(fx.credits(a).await, 990.0);
    assert_eq!(fx.credits(b).await, 10.0);
    assert!(!fx.store.get_resource(rid).await.unwrap().computing);
    assert!(!fx.service.coordinator().is_running(rid));

    let c = fx.user("c", 100.0).await;
    let err = fx
        .service
        .place_bid(c, &BidRequest { rid, amount: 3.0, duration: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::ShuttingDown));
    assert!(fx.store.list_user_bids(c).await.unwrap().is_empty());
    assert_eq!(fx.service.ledger().user_info(c).await.unwrap().pending_bids, 0.0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_open_window() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;

    fx.service.shutdown().await;
    assert_eq!(
        bidder.next().await,
        Some(StreamFrame::error_occurred("auction service is shutting down"))
    );
    assert_eq!(fx.credits(a).await, 1000.0);

    let bids = fx.store.list_user_bids(a).await.unwrap();
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].status, BidStatus::Rejected);
    assert_eq!(fx.service.ledger().user_info(a).await.unwrap().pending_bids, 0.0);

    // A restarted service resumes the window but has nothing to award.
    let restarted = AuctionService::new(
        CreditLedger::new(fx.store.clone(), SettlementPolicy::FullQuote),
        AuctionTimings {
            window: WINDOW,
            compute_minute: MINUTE,
        },
    );
    assert_eq!(restarted.bootstrap().await.unwrap(), 1);
    sleep(WINDOW + MINUTE * 3 + Duration::from_secs(1)).await;
    assert_eq!(fx.credits(a).await, 1000.0);
    assert_eq!(fx.credits(b).await, 0.0);
    assert!(!fx.store.get_resource(rid).await.unwrap().computing);
}

#[tokio::test(start_paused = true)]
async fn bid_admitted_as_resource_is_withdrawn_is_rejected_at_once() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let _loaner = fx.open(b, rid).await;
    assert!(matches!(
        fx.service.toggle_availability(b, rid).await.unwrap(),
        Availability::Closed
    ));

    // The store still admits bids, as it would for one that passed its
    // checks just before the withdrawal landed.
    fx.store.flip_availability(rid).await.unwrap();

    let placed_at = Instant::now();
    let mut bidder = fx.bid(a, rid, 5.0, 3).await;
    assert_eq!(bidder.next().await, rejected("resource is not open for bidding"));
    assert_eq!(bidder.next().await, None);
    assert!(placed_at.elapsed() < Duration::from_secs(1));

    assert!(!fx.service.registry().is_open(rid));
    let bids = fx.store.list_user_bids(a).await.unwrap();
    assert_eq!(bids[0].status, BidStatus::Rejected);
    assert_eq!(fx.service.ledger().user_info(a).await.unwrap().pending_bids, 0.0);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_resumes_available_resources() {
    let fx = Fixture::new(SettlementPolicy::FullQuote);
    let a = fx.user("a", 1000.0).await;
    let b = fx.user("b", 0.0).await;
    let rid = fx.resource(b, 2.0).await;
    let idle = fx.resource(b, 2.0).await;
    fx.store.flip_availability(rid).await.unwrap();
    fx.service
        .ledger()
        .admit(a, &BidRequest { rid, amount: 5.0, duration: 3 })
        .await
        .unwrap();

    assert_eq!(fx.service.bootstrap().await.unwrap(), 1);
    assert!(fx.service.coordinator().is_running(rid));
    assert!(!fx.service.coordinator().is_running(idle));

    sleep(WINDOW + MINUTE * 3 + Duration::from_secs(1)).await;
    assert_eq!(fx.credits(a).await, 985.0);
    assert_eq!(fx.credits(b).await, 15.0);
}
