//! Shared test infrastructure: a loopback DNS server with a mutable record
//! table, and builders for the controller stack.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA, SOA};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType};
use hickory_server::authority::{
    Authority, AuthorityObject, Catalog, LookupControlFlow, LookupError, LookupOptions,
    LookupRecords, MessageRequest, UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use hickory_server::ServerFuture;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use dns_masquerade::error::CheckError;
use dns_masquerade::events::{Event, EventRecorder};
use dns_masquerade::RecordChecker;

// --- Constants ---

pub const TTL: u32 = 10;

// --- StaticAuthority ---

/// Name → addresses table shared between a test and its server.
#[derive(Clone, Default)]
pub struct RecordTable {
    records: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the addresses of `name`.
    pub fn set(&self, name: &str, addresses: &[&str]) {
        let addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
        self.records.write().insert(name.to_string(), addresses);
    }

    pub fn remove(&self, name: &str) {
        self.records.write().remove(name);
    }

    fn get(&self, name: &str) -> Option<Vec<IpAddr>> {
        self.records.read().get(name).cloned()
    }
}

/// Authority for the root zone answering A/AAAA queries from a [`RecordTable`].
pub struct StaticAuthority {
    origin: LowerName,
    table: RecordTable,
}

impl StaticAuthority {
    pub fn new(table: RecordTable) -> Self {
        Self {
            origin: LowerName::from(Name::root()),
            table,
        }
    }

    fn build_records(&self, name: Name, rtype: RecordType, addresses: &[IpAddr]) -> RecordSet {
        let mut record_set = RecordSet::new(name.clone(), rtype, 0);
        for address in addresses {
            let rdata = match (rtype, address) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A::from(*v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA::from(*v6)),
                _ => continue,
            };
            let mut record = Record::from_rdata(name.clone(), TTL, rdata);
            record.set_dns_class(DNSClass::IN);
            record_set.insert(record, 0);
        }
        record_set
    }

    fn build_soa_record(&self) -> RecordSet {
        let soa = SOA::new(Name::root(), Name::root(), 1, 3600, 600, 86400, TTL);
        let mut record_set = RecordSet::new(Name::root(), RecordType::SOA, 0);
        let mut record = Record::from_rdata(Name::root(), TTL, RData::SOA(soa));
        record.set_dns_class(DNSClass::IN);
        record_set.insert(record, 0);
        record_set
    }
}

#[async_trait]
impl Authority for StaticAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        if rtype == RecordType::SOA {
            let record_set = Arc::new(self.build_soa_record());
            return LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)));
        }

        let name_str = name.to_string();
        let Some(addresses) = self.table.get(name_str.trim_end_matches('.')) else {
            return LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NXDomain)));
        };

        let record_set = self.build_records(Name::from(name.clone()), rtype, &addresses);
        if record_set.is_empty() {
            return LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)));
        }
        LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, Arc::new(record_set))))
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        Authority::lookup(
            self,
            request_info.query.name(),
            request_info.query.query_type(),
            lookup_options,
        )
        .await
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        Err(ResponseCode::NotImp)
    }
}

// --- Loopback server ---

/// A DNS server on a loopback TCP port; stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a server answering from `table`.
pub async fn start_server(table: RecordTable) -> TestServer {
    let authority: Arc<dyn AuthorityObject> = Arc::new(StaticAuthority::new(table));
    let mut catalog = Catalog::new();
    catalog.upsert(authority.origin().clone(), vec![authority]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = ServerFuture::new(catalog);
    server.register_listener(listener, Duration::from_secs(5));

    let task = tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });
    TestServer { addr, task }
}

// --- Checker ---

/// Checker whose answer the test flips.
#[derive(Clone, Default)]
pub struct SwitchChecker {
    active: Arc<RwLock<bool>>,
    calls: Arc<RwLock<Vec<(String, String)>>>,
}

impl SwitchChecker {
    pub fn new(active: bool) -> Self {
        let checker = Self::default();
        checker.set(active);
        checker
    }

    pub fn set(&self, active: bool) {
        *self.active.write() = active;
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.read().clone()
    }
}

#[async_trait]
impl RecordChecker for SwitchChecker {
    async fn check_record(&self, host: &str, expected: &str) -> Result<bool, CheckError> {
        self.calls.write().push((host.to_string(), expected.to_string()));
        Ok(*self.active.read())
    }
}

// --- Events ---

/// Keeps recorded events for inspection.
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<RwLock<Vec<Event>>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, event: Event) {
        self.events.write().push(event);
    }
}

// --- Polling ---

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
