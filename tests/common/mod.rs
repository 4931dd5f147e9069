// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once};

use log::LevelFilter;
use tempfile::{TempDir, tempdir};

use delivery_negotiation::{
    NegotiationService, StoreError,
    config::EngineConfig,
    identity::SessionIdentity,
    listing::{Currency, ListingDetails, TimeStamp},
    request::{DeliveryRequest, DeliveryRequestDetails},
    store::{DurableStore, Guard, SledStore, Subscription, Table, WriteOp},
    thread::{ChatThread, Role},
    utils::new_uuid_to_bech32,
};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests. `RUST_LOG` still overrides the level.
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .parse_default_env()
            .is_test(true)
            .try_init();
    });
}

/// Short backoff so retry paths don't slow the suite down.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_attempts: 3,
        backoff_ms: 1,
        dedup_window_ms: 30_000,
        feed_poll_ms: 20,
    }
}

/// Sled store that can be told to fail.
///
/// `fail_next(n)` makes the next `n` calls of any kind report the store as
/// unavailable. `take_down(table)` makes every guarded write touching that
/// table fail until `bring_up` is called. `break_reads(table)` does the same
/// for plain reads, and `hold_next_insert(table)` parks one insert on a gate.
pub struct FlakyStore {
    inner: SledStore,
    failures_left: AtomicU32,
    down: Mutex<HashSet<Table>>,
    unreadable: Mutex<HashSet<Table>>,
    held: Mutex<Option<(Table, Arc<InsertGate>)>>,
}

/// Both sides wait on `entered` once the insert is parked, then on `release` to let it go.
pub struct InsertGate {
    pub entered: Barrier,
    pub release: Barrier,
}

impl FlakyStore {
    pub fn new(inner: SledStore) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
            down: Mutex::new(HashSet::new()),
            unreadable: Mutex::new(HashSet::new()),
            held: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures_left.store(calls, Ordering::SeqCst);
    }

    pub fn take_down(&self, table: Table) {
        self.down.lock().unwrap().insert(table);
    }

    pub fn bring_up(&self, table: Table) {
        self.down.lock().unwrap().remove(&table);
    }

    pub fn break_reads(&self, table: Table) {
        self.unreadable.lock().unwrap().insert(table);
    }

    pub fn restore_reads(&self, table: Table) {
        self.unreadable.lock().unwrap().remove(&table);
    }

    pub fn hold_next_insert(&self, table: Table) -> Arc<InsertGate> {
        let gate = Arc::new(InsertGate {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        *self.held.lock().unwrap() = Some((table, gate.clone()));
        gate
    }

    fn trip_read(&self, table: Table) -> Result<(), StoreError> {
        self.trip()?;
        if self.unreadable.lock().unwrap().contains(&table) {
            return Err(StoreError::Unavailable(format!("{table:?} is unreadable")));
        }
        Ok(())
    }

    fn trip(&self) -> Result<(), StoreError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(StoreError::Unavailable("injected".into())),
            Err(_) => Ok(()),
        }
    }

    fn trip_guarded(&self, guard: &Guard) -> Result<(), StoreError> {
        self.trip()?;
        if self.down.lock().unwrap().contains(&guard.table) {
            return Err(StoreError::Unavailable(format!("{:?} is down", guard.table)));
        }
        Ok(())
    }
}

impl DurableStore for FlakyStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.trip_read(table)?;
        self.inner.get(table, key)
    }

    fn insert(&self, table: Table, key: &str, row: Vec<u8>) -> Result<(), StoreError> {
        self.trip()?;
        let parked = {
            let mut held = self.held.lock().unwrap();
            match held.take() {
                Some((t, gate)) if t == table => Some(gate),
                other => {
                    *held = other;
                    None
                }
            }
        };
        if let Some(gate) = parked {
            gate.entered.wait();
            gate.release.wait();
        }
        self.inner.insert(table, key, row)
    }

    fn update(&self, table: Table, key: &str, expected: &[u8], row: Vec<u8>) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.update(table, key, expected, row)
    }

    fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.delete(table, key)
    }

    fn query(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.trip_read(table)?;
        self.inner.query(table, prefix)
    }

    fn apply(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        self.trip()?;
        self.inner.apply(writes)
    }

    fn apply_if(&self, guard: &Guard, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        self.trip_guarded(guard)?;
        self.inner.apply_if(guard, writes)
    }

    fn subscribe(&self, table: Table, prefix: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(table, prefix)
    }
}

pub type Service = NegotiationService<FlakyStore>;

/// One signed-in device: its own session and its own service over the shared store.
pub struct Party {
    pub id: String,
    pub identity: Arc<SessionIdentity>,
    pub service: Arc<Service>,
}

pub struct Fixture {
    // held so the db outlives the test
    _dir: TempDir,
    pub store: Arc<FlakyStore>,
    pub carrier: Party,
    pub client: Party,
}

impl Fixture {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        setup_logging();
        // sled locks the db file, so every test gets its own directory
        let dir = tempdir()?;
        let sled = SledStore::open(dir.path().join(format!("{name}.db")))?;
        let store = Arc::new(FlakyStore::new(sled));

        let carrier = party(&store, &new_uuid_to_bech32("user_")?);
        let client = party(&store, &new_uuid_to_bech32("user_")?);
        Ok(Self {
            _dir: dir,
            store,
            carrier,
            client,
        })
    }

    pub fn as_role(&self, role: Role) -> &Party {
        match role {
            Role::Carrier => &self.carrier,
            Role::Client => &self.client,
        }
    }

    pub fn stranger(&self) -> anyhow::Result<Party> {
        Ok(party(&self.store, &new_uuid_to_bech32("user_")?))
    }

    /// The carrier publishes a Paris -> Dakar listing and the client asks for a delivery on it.
    pub fn open_request(&self) -> anyhow::Result<(DeliveryRequest, ChatThread)> {
        let listing = self.carrier.service.publish_listing(listing_details())?;
        let opened = self
            .client
            .service
            .create_delivery_request(&listing.id, request_details())?;
        Ok(opened)
    }
}

pub fn party(store: &Arc<FlakyStore>, user: &str) -> Party {
    let identity = SessionIdentity::signed_in(user);
    let service = Arc::new(NegotiationService::new(
        store.clone(),
        identity.clone(),
        test_config(),
    ));
    Party {
        id: user.to_string(),
        identity,
        service,
    }
}

pub fn day(d: u32) -> TimeStamp<chrono::Utc> {
    TimeStamp::new_with(2025, 3, d, 9, 0, 0).unwrap()
}

pub fn listing_details() -> ListingDetails {
    ListingDetails::new()
        .set_carrier_name("Awa Transport")
        .set_route("Paris", "Dakar")
        .set_deposit_deadline(day(2))
        .set_departure_date(day(4))
        .set_arrival_date(day(5))
        .set_pickup_address("12 rue de la Paix")
        .set_max_weight_kg(23)
        .set_price(10, Currency::EUR)
}

pub fn request_details() -> DeliveryRequestDetails {
    DeliveryRequestDetails::new()
        .set_recipient("Moussa Diop", "Rue 10, Medina", "Dakar")
        .set_parcel_name("Books")
}
