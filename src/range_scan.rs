//! Range-scan orchestrator: fans a key- or sampling-range scan out across
//! every vbucket's owning node, then either forwards items as they arrive
//! (stream order) or merges the per-partition results back into key order
//! (sort order).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::cluster_config::ClusterConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::kv::{opcode, status_to_error_kind, Credentials, Frame, KvConnectionPool, KvSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    StreamOrder,
    KeyOrder,
}

#[derive(Debug, Clone)]
pub struct RangeScanBounds {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RangeScanOptions {
    pub collection_id: u32,
    pub key_only: bool,
    pub sort: SortOrder,
    pub item_limit: Option<u32>,
    pub byte_limit: Option<u32>,
    pub timeout: Duration,
}

impl Default for RangeScanOptions {
    fn default() -> Self {
        RangeScanOptions {
            collection_id: 0,
            key_only: false,
            sort: SortOrder::StreamOrder,
            item_limit: None,
            byte_limit: None,
            timeout: Duration::from_secs(75),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanItem {
    pub key: Vec<u8>,
    pub value: Option<Bytes>,
    pub cas: u64,
}

/// Enough to cancel one in-flight partition's server-side cursor: the
/// session it was issued on (so the cancel reuses the same connection) and
/// the uuid the server handed back from `RANGE_SCAN_CREATE`.
struct PartitionCancelInfo {
    session: KvSession,
    vbucket: u16,
    scan_uuid: Vec<u8>,
}

async fn send_cancel(info: &PartitionCancelInfo, deadline: tokio::time::Instant) {
    let frame = Frame::request(opcode::RANGE_SCAN_CANCEL, info.vbucket, 0).with_extras(info.scan_uuid.clone());
    let _ = info.session.call(frame, deadline).await;
}

/// Handle returned alongside a scan's item stream: lets a caller close the
/// server-side cursors for every partition still in flight without waiting
/// for the stream to drain on its own.
#[derive(Clone)]
pub struct RangeScanHandle {
    partitions: Vec<Arc<Mutex<Option<PartitionCancelInfo>>>>,
}

impl RangeScanHandle {
    fn new(partition_count: usize) -> Self {
        RangeScanHandle {
            partitions: (0..partition_count).map(|_| Arc::new(Mutex::new(None))).collect(),
        }
    }

    /// Sends `RANGE_SCAN_CANCEL` for every partition still registered. A
    /// partition that already completed (or was never started) has nothing
    /// to cancel, so this is silently a no-op for it -- in particular, a
    /// key-order scan has already drained every partition by the time its
    /// caller can reach this handle, so `cancel()` on one is always a no-op.
    pub async fn cancel(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        for slot in self.partitions.iter() {
            if let Some(info) = slot.lock().await.take() {
                send_cancel(&info, deadline).await;
            }
        }
    }
}

/// A scan's item stream plus the handle to cancel it early.
pub struct RangeScan {
    rx: mpsc::Receiver<Result<ScanItem>>,
    handle: RangeScanHandle,
}

impl RangeScan {
    pub async fn next(&mut self) -> Option<Result<ScanItem>> {
        self.rx.recv().await
    }

    pub async fn cancel(&self) {
        self.handle.cancel().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_partition_scan(
    pool: &KvConnectionPool,
    host: &str,
    port: u16,
    bucket: Option<&str>,
    credentials: Option<&Credentials>,
    vbucket: u16,
    bounds: &RangeScanBounds,
    options: &RangeScanOptions,
    deadline: tokio::time::Instant,
) -> Result<Option<(KvSession, Vec<u8>)>> {
    let session = pool.acquire(host, port, bucket, credentials).await?;
    let mut value = Vec::new();
    value.extend_from_slice(&options.collection_id.to_be_bytes());
    value.extend_from_slice(&(bounds.start.len() as u32).to_be_bytes());
    value.extend_from_slice(&bounds.start);
    value.extend_from_slice(&(bounds.end.len() as u32).to_be_bytes());
    value.extend_from_slice(&bounds.end);

    let frame = Frame::request(opcode::RANGE_SCAN_CREATE, vbucket, 0).with_value(value);
    let response = session.call(frame, deadline).await?;

    if response.status() == crate::kv::status::KEY_NOT_FOUND {
        // Document-not-found on create means the partition has nothing in
        // range: an empty partition, not a failure.
        return Ok(None);
    }
    if let Some(kind) = status_to_error_kind(response.status()) {
        return Err(Error::new(kind, "range-scan-create failed"));
    }
    Ok(Some((session, response.value.to_vec())))
}

#[allow(clippy::too_many_arguments)]
async fn continue_partition_scan(
    session: &KvSession,
    vbucket: u16,
    scan_uuid: &[u8],
    options: &RangeScanOptions,
    deadline: tokio::time::Instant,
    tx: &mpsc::Sender<Result<ScanItem>>,
    budget: Option<&Arc<AtomicI64>>,
) -> Result<()> {
    loop {
        if let Some(budget) = budget {
            if budget.load(Ordering::SeqCst) <= 0 {
                // The scan-wide item budget is spent: stop pulling more
                // pages and close the server-side cursor for this partition
                // rather than leaving it open for the server to reap later.
                send_cancel(
                    &PartitionCancelInfo {
                        session: session.clone(),
                        vbucket,
                        scan_uuid: scan_uuid.to_vec(),
                    },
                    deadline,
                )
                .await;
                return Ok(());
            }
        }

        let mut extras = scan_uuid.to_vec();
        if let Some(limit) = options.item_limit {
            extras.extend_from_slice(&limit.to_be_bytes());
        }
        let frame = Frame::request(opcode::RANGE_SCAN_CONTINUE, vbucket, 0).with_extras(extras);
        let response = session.call(frame, deadline).await?;

        if response.status() == crate::kv::status::SUCCESS || response.status() == crate::kv::status::RANGE_SCAN_MORE {
            for item in decode_scan_items(&response.value, options.key_only)? {
                if let Some(budget) = budget {
                    if budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
                        return Ok(());
                    }
                }
                if tx.send(Ok(item)).await.is_err() {
                    return Ok(());
                }
            }
            if response.status() == crate::kv::status::SUCCESS {
                return Ok(());
            }
            continue;
        }

        if let Some(kind) = status_to_error_kind(response.status()) {
            if kind == ErrorKind::RangeScanCompleted {
                return Ok(());
            }
            return Err(Error::new(kind, "range-scan-continue failed"));
        }
        return Ok(());
    }
}

fn decode_scan_items(body: &[u8], key_only: bool) -> Result<Vec<ScanItem>> {
    use byteorder::{BigEndian, ByteOrder};
    let mut items = Vec::new();
    let mut pos = 0;
    while pos + 4 <= body.len() {
        let key_len = BigEndian::read_u32(&body[pos..pos + 4]) as usize;
        pos += 4;
        if pos + key_len > body.len() {
            return Err(Error::new(ErrorKind::DecodingFailure, "range-scan item truncated (key)"));
        }
        let key = body[pos..pos + key_len].to_vec();
        pos += key_len;

        if key_only {
            items.push(ScanItem { key, value: None, cas: 0 });
            continue;
        }

        if pos + 12 > body.len() {
            return Err(Error::new(ErrorKind::DecodingFailure, "range-scan item truncated (meta)"));
        }
        let value_len = BigEndian::read_u32(&body[pos..pos + 4]) as usize;
        let cas = BigEndian::read_u64(&body[pos + 4..pos + 12]);
        pos += 12;
        if pos + value_len > body.len() {
            return Err(Error::new(ErrorKind::DecodingFailure, "range-scan item truncated (value)"));
        }
        let value = Bytes::copy_from_slice(&body[pos..pos + value_len]);
        pos += value_len;
        items.push(ScanItem { key, value: Some(value), cas });
    }
    Ok(items)
}

/// Drives one partition end to end: create, then continue until complete
/// or the partition turns out to be empty. Feeds items straight into `tx`,
/// registering itself in `cancel_slot` for the duration so a caller's
/// `RangeScanHandle::cancel()` can reach it.
#[allow(clippy::too_many_arguments)]
async fn run_partition(
    pool: Arc<KvConnectionPool>,
    host: String,
    port: u16,
    bucket: Option<String>,
    credentials: Option<Credentials>,
    vbucket: u16,
    bounds: RangeScanBounds,
    options: RangeScanOptions,
    tx: mpsc::Sender<Result<ScanItem>>,
    budget: Option<Arc<AtomicI64>>,
    cancel_slot: Arc<Mutex<Option<PartitionCancelInfo>>>,
) {
    // A partition that hasn't started yet is simply never issued once the
    // global item budget is already spent -- the cheapest form of
    // cancelling "remaining partitions" once a scan-wide limit is hit.
    if let Some(budget) = &budget {
        if budget.load(Ordering::SeqCst) <= 0 {
            return;
        }
    }
    let deadline = tokio::time::Instant::now() + options.timeout;
    match create_partition_scan(&pool, &host, port, bucket.as_deref(), credentials.as_ref(), vbucket, &bounds, &options, deadline).await {
        Ok(None) => {} // empty partition
        Ok(Some((session, scan_uuid))) => {
            *cancel_slot.lock().await = Some(PartitionCancelInfo {
                session: session.clone(),
                vbucket,
                scan_uuid: scan_uuid.clone(),
            });
            let result = continue_partition_scan(&session, vbucket, &scan_uuid, &options, deadline, &tx, budget.as_ref()).await;
            *cancel_slot.lock().await = None;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// Fans a scan out across every vbucket owned by a node in `cluster`,
/// returning a stream of items in stream order (arrival order across
/// partitions) or key order, per `options.sort`.
pub async fn scan(
    cluster: Arc<ClusterConfig>,
    pool: Arc<KvConnectionPool>,
    bucket: &str,
    credentials: Option<&Credentials>,
    bounds: RangeScanBounds,
    options: RangeScanOptions,
) -> Result<RangeScan> {
    let vbucket_map = cluster
        .vbucket_map
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::InternalServerFailure, "cluster snapshot has no vbucket map"))?;

    let mut partition_targets = Vec::new();
    for (vbucket, (primary, _)) in vbucket_map.iter().enumerate() {
        let Some(primary) = primary else { continue };
        let Some(node) = cluster.nodes.get(*primary) else { continue };
        let Some((host, port)) = cluster.kv_endpoint_for_node(node, pool.is_tls()) else { continue };
        partition_targets.push((vbucket as u16, host, port));
    }

    // `item_limit` is a scan-wide cap, not a per-partition one: once it's
    // spent, partitions still queued are never issued and partitions
    // mid-flight stop after their current response.
    let budget = options.item_limit.map(|limit| Arc::new(AtomicI64::new(limit as i64)));
    let handle = RangeScanHandle::new(partition_targets.len());

    match options.sort {
        SortOrder::StreamOrder => {
            let (tx, rx) = mpsc::channel(256);
            for (slot, (vbucket, host, port)) in partition_targets.into_iter().enumerate() {
                let pool = pool.clone();
                let bounds = bounds.clone();
                let options = options.clone();
                let tx = tx.clone();
                let budget = budget.clone();
                let cancel_slot = handle.partitions[slot].clone();
                let bucket = Some(bucket.to_string());
                let credentials = credentials.cloned();
                tokio::spawn(run_partition(pool, host, port, bucket, credentials, vbucket, bounds, options, tx, budget, cancel_slot));
            }
            Ok(RangeScan { rx, handle })
        }
        SortOrder::KeyOrder => {
            let (collect_tx, mut collect_rx) = mpsc::channel(256);
            for (slot, (vbucket, host, port)) in partition_targets.into_iter().enumerate() {
                let pool = pool.clone();
                let bounds = bounds.clone();
                let options = options.clone();
                let tx = collect_tx.clone();
                let budget = budget.clone();
                let cancel_slot = handle.partitions[slot].clone();
                let bucket = Some(bucket.to_string());
                let credentials = credentials.cloned();
                tokio::spawn(run_partition(pool, host, port, bucket, credentials, vbucket, bounds, options, tx, budget, cancel_slot));
            }
            drop(collect_tx);

            let mut buffered = Vec::new();
            let mut first_error = None;
            while let Some(item) = collect_rx.recv().await {
                match item {
                    Ok(item) => buffered.push(item),
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(_) => {}
                }
            }

            let (tx, rx) = mpsc::channel(buffered.len().max(1));
            if let Some(e) = first_error {
                let _ = tx.send(Err(e)).await;
                return Ok(RangeScan { rx, handle });
            }

            // Bounded max-heap keyed by key bytes, descending pop order via
            // `Reverse` to get ascending key order out of a max-heap.
            let mut heap: BinaryHeap<Reverse<OrderedItem>> = buffered.into_iter().map(|i| Reverse(OrderedItem(i))).collect();
            while let Some(Reverse(OrderedItem(item))) = heap.pop() {
                if tx.send(Ok(item)).await.is_err() {
                    break;
                }
            }
            Ok(RangeScan { rx, handle })
        }
    }
}

struct OrderedItem(ScanItem);

impl PartialEq for OrderedItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key
    }
}
impl Eq for OrderedItem {}
impl PartialOrd for OrderedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.key.cmp(&other.0.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_key_only_items() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(b"abc");
        let items = decode_scan_items(&body, true).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, b"abc");
        assert!(items[0].value.is_none());
    }

    #[test]
    fn decodes_full_items_with_value_and_cas() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(b"k");
        body.extend_from_slice(&2u32.to_be_bytes());
        body.extend_from_slice(&7u64.to_be_bytes());
        body.extend_from_slice(b"ok");
        let items = decode_scan_items(&body, false).unwrap();
        assert_eq!(items[0].key, b"k");
        assert_eq!(items[0].value.as_deref(), Some(&b"ok"[..]));
        assert_eq!(items[0].cas, 7);
    }

    #[test]
    fn truncated_item_is_a_decoding_failure() {
        let body = vec![0, 0, 0, 5, b'a', b'b'];
        let err = decode_scan_items(&body, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodingFailure);
    }

    #[tokio::test]
    async fn a_partition_is_never_issued_once_the_scan_budget_is_already_spent() {
        let pool = Arc::new(KvConnectionPool::new(Default::default()));
        let (tx, mut rx) = mpsc::channel(4);
        let budget = Some(Arc::new(AtomicI64::new(0)));
        run_partition(
            pool,
            "127.0.0.1".to_string(),
            11210,
            None,
            None,
            0,
            RangeScanBounds { start: vec![], end: vec![] },
            RangeScanOptions { item_limit: Some(0), ..Default::default() },
            tx,
            budget,
            Arc::new(Mutex::new(None)),
        )
        .await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn ordered_item_heap_pops_ascending_by_key() {
        let mut heap: BinaryHeap<Reverse<OrderedItem>> = BinaryHeap::new();
        for key in [b"c".to_vec(), b"a".to_vec(), b"b".to_vec()] {
            heap.push(Reverse(OrderedItem(ScanItem { key, value: None, cas: 0 })));
        }
        let mut out = Vec::new();
        while let Some(Reverse(OrderedItem(item))) = heap.pop() {
            out.push(item.key);
        }
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
