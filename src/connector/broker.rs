//! Broker-backed connectors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connector::{token_mismatch, ConnectorStats, ResumptionToken, RetryPolicy};
use crate::error::{ConfigError, ConnectorError};
use crate::models::BrokerTransport;

/// The address scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// A record fetched from a broker partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// The capability of a message broker.
///
/// Implementations report retryable faults as `ConnectorError::Transient`; connectors apply their
/// own retry policy on top.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Fetch the record at the given offset, waiting at most `max_wait` for it to be written.
    async fn fetch(&self, topic: &str, partition: u32, offset: u64, max_wait: Duration) -> Result<Option<BrokerRecord>, ConnectorError>;

    /// Append a record to the given partition, returning its offset once acknowledged.
    async fn produce(&self, topic: &str, partition: u32, payload: Vec<u8>) -> Result<u64, ConnectorError>;

    /// Commit the next offset to be consumed by the given group.
    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<(), ConnectorError>;

    /// The last offset committed by the given group, if any.
    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>, ConnectorError>;
}

/// The set of broker clients known to the process, keyed by address.
#[derive(Clone, Default)]
pub struct BrokerClients {
    clients: Arc<ArcSwap<HashMap<String, Arc<dyn Broker>>>>,
    memory: Arc<ArcSwap<HashMap<String, Arc<MemoryBroker>>>>,
}

impl BrokerClients {
    /// Register a client under the given address, replacing any previous client.
    pub fn register(&self, address: &str, client: Arc<dyn Broker>) {
        let orig = self.clients.load_full();
        let mut updated = orig.as_ref().clone();
        updated.insert(address.to_string(), client);
        self.clients.store(Arc::new(updated));
    }

    /// Resolve the client of the given address.
    ///
    /// Addresses of the `memory://` scheme resolve to an in-process broker, created on first use.
    pub fn resolve(&self, address: &str) -> Result<Arc<dyn Broker>, ConfigError> {
        if let Some(client) = self.clients.load().get(address) {
            return Ok(client.clone());
        }
        if !address.starts_with(MEMORY_SCHEME) {
            return Err(ConfigError(format!("no broker client available for address {}", address)));
        }
        let client: Arc<dyn Broker> = self.memory(address);
        Ok(client)
    }

    /// Get or create the in-process broker of the given address.
    pub fn memory(&self, address: &str) -> Arc<MemoryBroker> {
        if let Some(broker) = self.memory.load().get(address) {
            return broker.clone();
        }
        let created = Arc::new(MemoryBroker::default());
        self.memory.rcu(|map| {
            let mut updated = HashMap::clone(map);
            updated.entry(address.to_string()).or_insert_with(|| created.clone());
            updated
        });
        self.memory.load().get(address).cloned().unwrap_or(created)
    }
}

/// A dedicated reader of a single broker partition.
#[derive(Debug)]
struct PartitionReader {
    partition: u32,
    /// The next offset to fetch, `None` until initialized from a checkpoint or the broker.
    position: Option<u64>,
    /// The next offset to be consumed according to committed progress.
    committed: u64,
    /// Offsets which have been polled but not yet acked, in poll order.
    in_flight: VecDeque<u64>,
}

/// An input connector reading a set of broker partitions.
pub struct BrokerInput {
    client: Arc<dyn Broker>,
    topic: String,
    group: String,
    readers: Vec<PartitionReader>,
    next_reader: usize,
    watermark: usize,
    retry: RetryPolicy,
    stats: Arc<ConnectorStats>,
}

impl BrokerInput {
    pub fn new(client: Arc<dyn Broker>, transport: &BrokerTransport, group: String, watermark: usize, retry: RetryPolicy, stats: Arc<ConnectorStats>) -> Self {
        let readers = transport
            .partitions
            .iter()
            .map(|partition| PartitionReader {
                partition: *partition,
                position: None,
                committed: 0,
                in_flight: VecDeque::new(),
            })
            .collect();
        Self {
            client,
            topic: transport.topic.clone(),
            group,
            readers,
            next_reader: 0,
            watermark: watermark.max(1),
            retry,
            stats,
        }
    }

    pub fn unacked(&self) -> usize {
        self.readers.iter().map(|reader| reader.in_flight.len()).sum()
    }

    /// True once every partition reader holds `watermark` unacked batches.
    pub fn saturated(&self) -> bool {
        self.readers.iter().all(|reader| reader.in_flight.len() >= self.watermark)
    }

    pub fn capacity(&self) -> usize {
        self.watermark * self.readers.len().max(1)
    }

    /// Initialize the positions of all readers which were not given a checkpoint, resuming from
    /// the broker's committed offsets.
    async fn ensure_initialized(&mut self) -> Result<(), ConnectorError> {
        for idx in 0..self.readers.len() {
            if self.readers[idx].position.is_some() {
                continue;
            }
            let (client, topic, group, partition) = (self.client.clone(), self.topic.as_str(), self.group.as_str(), self.readers[idx].partition);
            let committed = self
                .retry
                .run(&self.stats, "offset lookup", || client.committed(group, topic, partition))
                .await?
                .unwrap_or(0);
            tracing::debug!(topic, partition, committed, "broker partition reader initialized");
            let reader = &mut self.readers[idx];
            reader.position = Some(committed);
            reader.committed = committed;
        }
        Ok(())
    }

    /// Fetch the next record of the given reader.
    async fn fetch(&self, idx: usize, max_wait: Duration) -> Result<Option<BrokerRecord>, ConnectorError> {
        let reader = &self.readers[idx];
        let (client, topic, partition, offset) = (self.client.clone(), self.topic.as_str(), reader.partition, reader.position.unwrap_or(reader.committed));
        self.retry.run(&self.stats, "fetch", || client.fetch(topic, partition, offset, max_wait)).await
    }

    fn deliver(&mut self, idx: usize, record: BrokerRecord) -> (Vec<u8>, ResumptionToken) {
        self.next_reader = (idx + 1) % self.readers.len();
        let reader = &mut self.readers[idx];
        let next = record.offset + 1;
        reader.position = Some(next);
        reader.in_flight.push_back(record.offset);
        let token = ResumptionToken::Offsets {
            offsets: [(reader.partition, next)].into_iter().collect(),
        };
        (record.payload, token)
    }

    /// Poll the partitions round-robin, skipping any reader at its watermark.
    ///
    /// The watermark bounds the unacked batches of each partition independently.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<(Vec<u8>, ResumptionToken)>, ConnectorError> {
        self.ensure_initialized().await?;
        if self.readers.is_empty() {
            return Ok(None);
        }
        let count = self.readers.len();
        let eligible: Vec<usize> = (0..count)
            .map(|step| (self.next_reader + step) % count)
            .filter(|idx| self.readers[*idx].in_flight.len() < self.watermark)
            .collect();

        for idx in eligible.iter().copied() {
            if let Some(record) = self.fetch(idx, Duration::ZERO).await? {
                return Ok(Some(self.deliver(idx, record)));
            }
        }
        // Nothing is immediately available, so wait on the next reader in line.
        let idx = match eligible.first() {
            Some(idx) => *idx,
            None => return Ok(None),
        };
        self.next_reader = (idx + 1) % count;
        match self.fetch(idx, timeout).await? {
            Some(record) => Ok(Some(self.deliver(idx, record))),
            None => Ok(None),
        }
    }

    /// Commit the offsets of the given token.
    pub async fn ack(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        let offsets = match token {
            ResumptionToken::Offsets { offsets } => offsets,
            other => return Err(token_mismatch(other, "broker")),
        };
        for (partition, next) in offsets.iter() {
            let idx = match self.readers.iter().position(|reader| reader.partition == *partition) {
                Some(idx) => idx,
                None => {
                    tracing::warn!(partition, topic = %self.topic, "ack for unassigned partition ignored");
                    continue;
                }
            };
            if *next <= self.readers[idx].committed {
                continue;
            }
            let (client, topic, group) = (self.client.clone(), self.topic.as_str(), self.group.as_str());
            self.retry
                .run(&self.stats, "offset commit", || client.commit(group, topic, *partition, *next))
                .await?;
            let reader = &mut self.readers[idx];
            reader.committed = *next;
            while reader.in_flight.front().map(|offset| *offset < *next).unwrap_or(false) {
                reader.in_flight.pop_front();
            }
        }
        Ok(())
    }

    /// Resume the partitions of the given token from its offsets.
    pub fn seek(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        let offsets = match token {
            ResumptionToken::Offsets { offsets } => offsets,
            other => return Err(token_mismatch(other, "broker")),
        };
        for reader in self.readers.iter_mut() {
            if let Some(offset) = offsets.get(&reader.partition) {
                reader.position = Some(*offset);
                reader.committed = *offset;
                reader.in_flight.clear();
            }
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> ResumptionToken {
        ResumptionToken::Offsets {
            offsets: self
                .readers
                .iter()
                .filter(|reader| reader.position.is_some())
                .map(|reader| (reader.partition, reader.committed))
                .collect(),
        }
    }
}

/// An output connector publishing to a single broker partition.
pub struct BrokerOutput {
    client: Arc<dyn Broker>,
    topic: String,
    partition: u32,
    retry: RetryPolicy,
    stats: Arc<ConnectorStats>,
}

impl BrokerOutput {
    pub fn new(client: Arc<dyn Broker>, transport: &BrokerTransport, retry: RetryPolicy, stats: Arc<ConnectorStats>) -> Self {
        Self {
            client,
            topic: transport.topic.clone(),
            partition: transport.partitions.first().copied().unwrap_or_default(),
            retry,
            stats,
        }
    }

    pub async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectorError> {
        let (client, topic, partition) = (self.client.clone(), self.topic.as_str(), self.partition);
        let offset = self
            .retry
            .run(&self.stats, "produce", || client.produce(topic, partition, bytes.clone()))
            .await?;
        tracing::trace!(topic, partition, offset, "batch produced");
        Ok(())
    }

    /// Produces are acknowledged before `send` returns, so there is nothing left to flush.
    pub async fn flush(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// An in-process broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
    unavailable: AtomicBool,
    failing_produces: AtomicU32,
    produce_delay_ms: AtomicU32,
}

#[derive(Default)]
struct MemoryState {
    logs: HashMap<(String, u32), Vec<Vec<u8>>>,
    commits: HashMap<(String, String, u32), u64>,
}

impl MemoryBroker {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark this broker as reachable or not; while unreachable all calls fail transiently.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Fail the next `count` produce calls with a transient error.
    pub fn fail_produces(&self, count: u32) {
        self.failing_produces.store(count, Ordering::SeqCst);
    }

    /// Delay every produce acknowledgement by the given duration.
    pub fn set_produce_delay(&self, delay: Duration) {
        self.produce_delay_ms.store(u32::try_from(delay.as_millis()).unwrap_or(u32::MAX), Ordering::SeqCst);
    }

    /// Append a record to the given partition.
    pub fn append(&self, topic: &str, partition: u32, payload: Vec<u8>) -> u64 {
        let offset = {
            let mut state = self.state();
            let log = state.logs.entry((topic.to_string(), partition)).or_default();
            log.push(payload);
            log.len() as u64 - 1
        };
        self.notify.notify_waiters();
        offset
    }

    /// All records of the given partition.
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Vec<u8>> {
        self.state().logs.get(&(topic.to_string(), partition)).cloned().unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), ConnectorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConnectorError::Transient("broker unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn fetch(&self, topic: &str, partition: u32, offset: u64, max_wait: Duration) -> Result<Option<BrokerRecord>, ConnectorError> {
        let deadline = Instant::now() + max_wait;
        let key = (topic.to_string(), partition);
        loop {
            // Registered before checking the log so that no append is missed.
            let notified = self.notify.notified();
            self.check_available()?;
            let payload = self.state().logs.get(&key).and_then(|log| log.get(offset as usize).cloned());
            if let Some(payload) = payload {
                return Ok(Some(BrokerRecord { offset, payload }));
            }
            let now = Instant::now();
            if now >= deadline || tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn produce(&self, topic: &str, partition: u32, payload: Vec<u8>) -> Result<u64, ConnectorError> {
        let delay = self.produce_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.check_available()?;
        let failing = self.failing_produces.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        if failing.is_ok() {
            return Err(ConnectorError::Transient("produce request timed out".into()));
        }
        Ok(self.append(topic, partition, payload))
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<(), ConnectorError> {
        self.check_available()?;
        self.state().commits.insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>, ConnectorError> {
        self.check_available()?;
        Ok(self.state().commits.get(&(group.to_string(), topic.to_string(), partition)).copied())
    }
}
