//! Mock LogConsumer / LogProducer for pump tests.
//!
//! Records all calls for assertions. The consumer replays scripted batches;
//! the producer can gate acknowledgements to simulate a slow syncs topic.

use mirror_engine::client::{BoxFuture, FetchedRecord, LogConsumer, LogProducer};
use mirror_engine::error::{MirrorError, Result};
use mirror_engine::sync::{OffsetSync, TopicPartition};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// =============================================================================
// MockConsumer
// =============================================================================

struct ConsumerState {
    /// Scripted poll results, popped front to back.
    batches: Mutex<VecDeque<Result<Vec<FetchedRecord>>>>,
    /// Recorded assign() positions.
    assigned: Mutex<Vec<(TopicPartition, i64)>>,
    close_calls: AtomicUsize,
    /// When set, an exhausted script makes poll() pend forever
    /// (for wake/shutdown tests) instead of returning an empty batch.
    block_when_empty: AtomicBool,
}

/// Mock consumer replaying scripted batches.
///
/// Clones share state, so tests can keep a handle for assertions after
/// moving one into the task.
#[derive(Clone)]
pub struct MockConsumer {
    state: Arc<ConsumerState>,
}

impl MockConsumer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ConsumerState {
                batches: Mutex::new(VecDeque::new()),
                assigned: Mutex::new(Vec::new()),
                close_calls: AtomicUsize::new(0),
                block_when_empty: AtomicBool::new(false),
            }),
        }
    }

    /// A consumer whose poll() never returns once the script is exhausted.
    pub fn blocking() -> Self {
        let consumer = Self::new();
        consumer.state.block_when_empty.store(true, Ordering::SeqCst);
        consumer
    }

    /// Queue one poll result.
    pub fn push_batch(&self, batch: Vec<FetchedRecord>) {
        self.state.batches.lock().unwrap().push_back(Ok(batch));
    }

    /// Queue one poll failure.
    pub fn push_error(&self, error: MirrorError) {
        self.state.batches.lock().unwrap().push_back(Err(error));
    }

    /// Positions recorded by assign().
    pub fn assigned(&self) -> Vec<(TopicPartition, i64)> {
        self.state.assigned.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Number of scripted batches not yet consumed.
    pub fn remaining_batches(&self) -> usize {
        self.state.batches.lock().unwrap().len()
    }
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogConsumer for MockConsumer {
    fn assign(&self, positions: &[(TopicPartition, i64)]) -> Result<()> {
        self.state.assigned.lock().unwrap().extend_from_slice(positions);
        Ok(())
    }

    fn poll(&self, _timeout: Duration) -> BoxFuture<'_, Vec<FetchedRecord>> {
        let next = self.state.batches.lock().unwrap().pop_front();
        let block = self.state.block_when_empty.load(Ordering::SeqCst);
        Box::pin(async move {
            match next {
                Some(result) => result,
                None if block => {
                    std::future::pending::<()>().await;
                    unreachable!("pending() never resolves")
                }
                None => Ok(Vec::new()),
            }
        })
    }

    fn close(&self, _timeout: Duration) -> BoxFuture<'_, ()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(()) })
    }
}

// =============================================================================
// MockProducer
// =============================================================================

/// A recorded send() call.
#[derive(Debug, Clone)]
pub struct SendCall {
    pub topic: String,
    pub partition: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

struct ProducerState {
    sends: Mutex<Vec<SendCall>>,
    /// Permits gate acknowledgements when auto_ack is off.
    acks: Semaphore,
    auto_ack: AtomicBool,
    fail_sends: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_offset: AtomicI64,
    close_calls: AtomicUsize,
}

/// Mock producer recording sends, with gateable acknowledgements.
#[derive(Clone)]
pub struct MockProducer {
    state: Arc<ProducerState>,
}

impl MockProducer {
    /// A producer that acknowledges every send immediately.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A producer whose acknowledgements stall until
    /// [`release_acks`](Self::release_acks) hands out permits.
    pub fn gated() -> Self {
        Self::build(false)
    }

    fn build(auto_ack: bool) -> Self {
        Self {
            state: Arc::new(ProducerState {
                sends: Mutex::new(Vec::new()),
                acks: Semaphore::new(0),
                auto_ack: AtomicBool::new(auto_ack),
                fail_sends: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                next_offset: AtomicI64::new(0),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every subsequent acknowledgement report failure.
    pub fn fail_sends(&self) {
        self.state.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Allow `n` stalled acknowledgements through.
    pub fn release_acks(&self, n: usize) {
        self.state.acks.add_permits(n);
    }

    /// All recorded send() calls, in call order.
    pub fn sends(&self) -> Vec<SendCall> {
        self.state.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.state.sends.lock().unwrap().len()
    }

    /// Recorded sends decoded as offset syncs, in call order.
    pub fn decoded_syncs(&self) -> Vec<OffsetSync> {
        self.sends()
            .iter()
            .map(|send| OffsetSync::decode_record(&send.key, &send.value).expect("send decodes"))
            .collect()
    }

    /// Sends whose acknowledgement has not resolved yet.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrent unacknowledged sends.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogProducer for MockProducer {
    fn send(
        &self,
        topic: &str,
        partition: i32,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> BoxFuture<'static, i64> {
        self.state.sends.lock().unwrap().push(SendCall {
            topic: topic.to_string(),
            partition,
            key,
            value,
        });
        let offset = self.state.next_offset.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let now_in_flight = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            if !state.auto_ack.load(Ordering::SeqCst) {
                match state.acks.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => {} // semaphore closed: treat as released
                }
            }

            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            if state.fail_sends.load(Ordering::SeqCst) {
                Err(MirrorError::kafka_msg("send", "simulated broker failure"))
            } else {
                Ok(offset)
            }
        })
    }

    fn close(&self, _timeout: Duration) -> BoxFuture<'_, ()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(()) })
    }
}
