//! Concurrent admission: however many threads race the same
//! idempotency key, exactly one wins `Accepted`.

use std::sync::Arc;
use std::thread;

use relay::{Admission, Asset, InMemoryLedger, PayoutIntent, PayoutLedger, SqliteLedger};

fn intent(key: &str) -> PayoutIntent {
    PayoutIntent {
        idempotency_key: key.to_string(),
        amount: "50.00".to_string(),
        asset: Asset::Usdt,
        destination_address: "0x14CE4c8E705531c3CbDDa925b9DeE6Df37aEE48e".to_string(),
        source_session_id: "cs_race".to_string(),
    }
}

fn race(ledger: Arc<dyn PayoutLedger>, threads: usize) -> usize {
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.admit(&intent("evt_race")).unwrap())
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|a| *a == Admission::Accepted)
        .count()
}

#[test]
fn in_memory_single_winner() {
    let ledger: Arc<dyn PayoutLedger> = Arc::new(InMemoryLedger::new());
    assert_eq!(race(ledger, 32), 1);
}

#[test]
fn sqlite_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let ledger: Arc<dyn PayoutLedger> =
        Arc::new(SqliteLedger::open(path.to_str().unwrap()).unwrap());
    assert_eq!(race(ledger, 32), 1);
}

#[test]
fn distinct_keys_all_accepted() {
    let ledger: Arc<dyn PayoutLedger> = Arc::new(InMemoryLedger::new());
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.admit(&intent(&format!("evt_{i}"))).unwrap())
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Admission::Accepted);
    }
}
