use cloudbid_ledger::{
    AwardOutcome, CreditLedger, InMemoryMarketStore, LedgerError, MarketStore, SettlementPolicy,
};
use cloudbid_types::{BidRequest, BidStatus, ResourceId, ResourceSpec, UserId};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const RENTERS: usize = 6;
const RESOURCES: usize = 8;
const ROUNDS: usize = 40;

async fn committed(store: &dyn MarketStore, uid: UserId) -> f64 {
    store
        .list_user_bids(uid)
        .await
        .unwrap()
        .iter()
        .filter(|b| b.status == BidStatus::Pending || (b.status == BidStatus::Accepted && b.computing))
        .map(|b| b.commitment())
        .sum()
}

async fn assert_escrow_holds(store: &dyn MarketStore, users: &[UserId]) {
    for &uid in users {
        let wallet = store.credits(uid).await.unwrap();
        let held = committed(store, uid).await;
        assert!(
            wallet + 1e-9 >= held,
            "escrow violated for {uid}: wallet {wallet} < committed {held}"
        );
        assert!(wallet >= 0.0);
    }
}

async fn assert_single_winner(store: &dyn MarketStore, renters: &[UserId], rids: &[ResourceId]) {
    for &rid in rids {
        let mut computing = 0;
        for &uid in renters {
            computing += store
                .list_user_bids(uid)
                .await
                .unwrap()
                .iter()
                .filter(|b| b.rid == rid && b.computing)
                .count();
        }
        assert!(computing <= 1, "resource {rid} has {computing} computing bids");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_concurrent_placements_never_break_escrow() {
    let store: Arc<dyn MarketStore> = Arc::new(InMemoryMarketStore::new());
    let ledger = Arc::new(CreditLedger::new(store.clone(), SettlementPolicy::FullQuote));
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let (owner, _) = store.register_or_authenticate("owner", "pw").await.unwrap();
    let mut renters = Vec::new();
    for i in 0..RENTERS {
        let (uid, _) = store
            .register_or_authenticate(&format!("renter-{i}"), "pw")
            .await
            .unwrap();
        ledger.top_up(uid, rng.gen_range(10.0..60.0)).await.unwrap();
        renters.push(uid);
    }

    let mut rids = Vec::new();
    for _ in 0..RESOURCES {
        let spec = ResourceSpec {
            cpu_cores: 2,
            memory_gb: 4,
            storage_gb: 32,
            gpu: "none".into(),
            bandwidth_mbps: 50,
            cost_per_minute: rng.gen_range(0.0..1.0),
        };
        let rid = store.create_resource(owner, &spec).await.unwrap();
        store.flip_availability(rid).await.unwrap();
        rids.push(rid);
    }

    let mut all_users = renters.clone();
    all_users.push(owner);

    for _ in 0..ROUNDS {
        let placements: Vec<_> = (0..12)
            .map(|_| {
                let ledger = ledger.clone();
                let renter = renters[rng.gen_range(0..RENTERS)];
                let request = BidRequest {
                    rid: rids[rng.gen_range(0..RESOURCES)],
                    amount: rng.gen_range(0.5..6.0),
                    duration: rng.gen_range(1..6),
                };
                tokio::spawn(async move { ledger.admit(renter, &request).await })
            })
            .collect();

        for outcome in join_all(placements).await {
            match outcome.unwrap() {
                Ok(bid) => assert_eq!(bid.status, BidStatus::Pending),
                Err(LedgerError::InsufficientCredits { available, attempted }) => {
                    assert!(attempted > available)
                }
                Err(
                    LedgerError::BidBelowFloor { .. }
                    | LedgerError::BidNotCompetitive
                    | LedgerError::ResourceNotBiddable(_),
                ) => {}
                Err(other) => panic!("unexpected admission failure: {other}"),
            }
        }
        assert_escrow_holds(store.as_ref(), &all_users).await;

        // Close a random window and settle a random running bid.
        let rid = rids[rng.gen_range(0..RESOURCES)];
        if let Ok(AwardOutcome::Awarded { winner, .. }) = store.pick_max_bid(rid).await {
            assert_single_winner(store.as_ref(), &renters, &rids).await;
            let before = store.credits(winner.renter).await.unwrap() + store.credits(owner).await.unwrap();
            ledger
                .settle(&winner, owner, f64::from(winner.duration))
                .await
                .unwrap();
            let after = store.credits(winner.renter).await.unwrap() + store.credits(owner).await.unwrap();
            assert!((before - after).abs() < 1e-9, "settlement must conserve credits");
        }
        assert_escrow_holds(store.as_ref(), &all_users).await;
    }
}
