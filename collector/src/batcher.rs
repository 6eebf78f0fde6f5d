//! Batch accumulator.
//!
//! [`Accumulator`] is the synchronous core: it buffers admitted records and
//! cuts batches by size, deadline or shutdown. [`run_accumulator`] drives it
//! from the ingress channel and hands every batch to the fan-out dispatcher.

use crate::admission::MemoryPermit;
use crate::exporter::Dispatcher;
use shared::models::Record;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// What caused a batch to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// `max_batch_size` records were buffered.
    Size,
    /// `max_wait` elapsed since the first buffered record.
    Deadline,
    /// The pipeline is shutting down.
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size => "size",
            Self::Deadline => "deadline",
            Self::Shutdown => "shutdown",
        })
    }
}

/// An ordered, immutable group of records of one signal type.
///
/// Cloning is cheap: records and the memory permit are shared, and the
/// permit's bytes return to the budget when the last clone is dropped.
pub struct Batch<T> {
    records: Arc<Vec<T>>,
    trigger: FlushTrigger,
    sequence: u64,
    permit: Arc<MemoryPermit>,
}

impl<T> Clone for Batch<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            trigger: self.trigger,
            sequence: self.sequence,
            permit: Arc::clone(&self.permit),
        }
    }
}

impl<T> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.records.len())
            .field("trigger", &self.trigger)
            .field("sequence", &self.sequence)
            .field("bytes", &self.permit.bytes())
            .finish()
    }
}

impl<T> Batch<T> {
    /// Creates a batch.
    #[must_use]
    pub fn new(records: Vec<T>, trigger: FlushTrigger, sequence: u64, permit: MemoryPermit) -> Self {
        Self {
            records: Arc::new(records),
            trigger,
            sequence,
            permit: Arc::new(permit),
        }
    }

    /// The records, in arrival order.
    #[must_use]
    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// What caused the flush.
    #[must_use]
    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    /// Position of the batch in its pipeline, starting at 0.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes of admitted memory held by the batch.
    #[must_use]
    pub fn permit_bytes(&self) -> usize {
        self.permit.bytes()
    }
}

/// Records that passed the processor chain, with their reserved memory.
#[derive(Debug)]
pub struct Admitted<T> {
    /// Records in arrival order.
    pub records: Vec<T>,
    /// Memory reserved for them.
    pub permit: MemoryPermit,
}

/// Buffers records until a size or time threshold is reached.
#[derive(Debug)]
pub struct Accumulator<T> {
    pending: Vec<T>,
    permit: MemoryPermit,
    first_at: Option<Instant>,
    max_batch_size: usize,
    max_wait: Duration,
    sequence: u64,
}

impl<T: Record> Accumulator<T> {
    /// Creates an accumulator.
    #[must_use]
    pub fn new(max_batch_size: usize, max_wait: Duration) -> Self {
        Self {
            pending: Vec::new(),
            permit: MemoryPermit::empty(),
            first_at: None,
            max_batch_size: max_batch_size.max(1),
            max_wait,
            sequence: 0,
        }
    }

    /// Records currently buffered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// When the buffered records must be flushed, if any are buffered.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.first_at.map(|at| at + self.max_wait)
    }

    /// Buffers records and returns every batch that became full.
    pub fn push(&mut self, admitted: Admitted<T>, now: Instant) -> Vec<Batch<T>> {
        if admitted.records.is_empty() {
            return Vec::new();
        }
        if self.pending.is_empty() {
            self.first_at = Some(now);
        }
        self.pending.extend(admitted.records);
        self.permit.merge(admitted.permit);

        let mut full = Vec::new();
        while self.pending.len() >= self.max_batch_size {
            let records: Vec<T> = self.pending.drain(..self.max_batch_size).collect();
            full.push(self.cut(records, FlushTrigger::Size));
        }
        if !full.is_empty() && !self.pending.is_empty() {
            // After a size flush the remainder came from the latest push.
            self.first_at = Some(now);
        }
        full
    }

    /// Emits everything buffered, whatever the thresholds.
    pub fn take(&mut self, trigger: FlushTrigger) -> Option<Batch<T>> {
        if self.pending.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.pending);
        Some(self.cut(records, trigger))
    }

    fn cut(&mut self, records: Vec<T>, trigger: FlushTrigger) -> Batch<T> {
        let permit = if self.pending.is_empty() {
            self.first_at = None;
            std::mem::take(&mut self.permit)
        } else {
            let bytes = records.iter().map(Record::estimated_size).sum();
            self.permit.split(bytes)
        };
        let sequence = self.sequence;
        self.sequence += 1;
        Batch::new(records, trigger, sequence, permit)
    }
}

/// Drives an accumulator until shutdown, then flushes what is left.
///
/// On cancellation the ingress channel is closed and drained before the final
/// `Shutdown` flush, so records admitted before the signal are never lost.
pub async fn run_accumulator<T: Record>(
    mut rx: mpsc::Receiver<Admitted<T>>,
    mut accumulator: Accumulator<T>,
    dispatcher: Dispatcher<T>,
    shutdown: CancellationToken,
) {
    let signal = T::SIGNAL;
    tracing::debug!(signal = %signal, "Batch accumulator started");

    loop {
        let deadline = accumulator.deadline();
        let wait = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(admitted) => {
                    for batch in accumulator.push(admitted, Instant::now()) {
                        dispatcher.dispatch(&batch);
                    }
                }
                None => break,
            },
            () = wait => {
                if let Some(batch) = accumulator.take(FlushTrigger::Deadline) {
                    dispatcher.dispatch(&batch);
                }
            }
        }
    }

    rx.close();
    while let Some(admitted) = rx.recv().await {
        for batch in accumulator.push(admitted, Instant::now()) {
            dispatcher.dispatch(&batch);
        }
    }
    if let Some(batch) = accumulator.take(FlushTrigger::Shutdown) {
        tracing::info!(signal = %signal, records = batch.len(), "Flushed pending records on shutdown");
        dispatcher.dispatch(&batch);
    }
    tracing::debug!(signal = %signal, "Batch accumulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryBudget;
    use shared::config::MemoryLimits;
    use shared::models::{LogRecord, Resource, Severity};

    fn records(range: std::ops::Range<usize>) -> Vec<LogRecord> {
        let resource = Resource::for_service("api").shared();
        range
            .map(|i| LogRecord::new(Severity::Info, i.to_string(), Arc::clone(&resource)))
            .collect()
    }

    fn admitted(range: std::ops::Range<usize>) -> Admitted<LogRecord> {
        Admitted {
            records: records(range),
            permit: MemoryPermit::empty(),
        }
    }

    fn bodies(batch: &Batch<LogRecord>) -> Vec<String> {
        batch.records().iter().map(|r| r.body.clone()).collect()
    }

    #[test]
    fn test_full_batches_emitted_immediately() {
        let mut acc = Accumulator::new(3, Duration::from_secs(5));
        let now = Instant::now();

        assert!(acc.push(admitted(0..2), now).is_empty());
        let full = acc.push(admitted(2..9), now);

        assert_eq!(full.len(), 3);
        assert!(full.iter().all(|b| b.len() == 3 && b.trigger() == FlushTrigger::Size));
        assert_eq!(bodies(&full[0]), vec!["0", "1", "2"]);
        assert_eq!(bodies(&full[2]), vec!["6", "7", "8"]);
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.deadline(), None);
    }

    #[test]
    fn test_remainder_waits_for_deadline() {
        let mut acc = Accumulator::new(4, Duration::from_millis(100));
        let start = Instant::now();
        let later = start + Duration::from_millis(30);

        acc.push(admitted(0..2), start);
        assert_eq!(acc.deadline(), Some(start + Duration::from_millis(100)));

        let full = acc.push(admitted(2..7), later);
        assert_eq!(full.len(), 1);
        assert_eq!(acc.pending(), 3);
        assert_eq!(acc.deadline(), Some(later + Duration::from_millis(100)));

        let rest = acc.take(FlushTrigger::Deadline).unwrap();
        assert_eq!(bodies(&rest), vec!["4", "5", "6"]);
        assert_eq!(rest.trigger(), FlushTrigger::Deadline);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut acc = Accumulator::new(1, Duration::from_secs(1));
        let batches = acc.push(admitted(0..3), Instant::now());
        let sequences: Vec<u64> = batches.iter().map(Batch::sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_take_on_empty_is_none() {
        let mut acc: Accumulator<LogRecord> = Accumulator::new(10, Duration::from_secs(1));
        assert!(acc.take(FlushTrigger::Shutdown).is_none());
        assert!(acc.push(admitted(0..0), Instant::now()).is_empty());
        assert_eq!(acc.deadline(), None);
    }

    #[test]
    fn test_permit_bytes_follow_records() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let batch_records = records(0..5);
        let bytes: usize = batch_records.iter().map(Record::estimated_size).sum();
        let permit = budget.admit(bytes).unwrap();

        let mut acc = Accumulator::new(2, Duration::from_secs(1));
        let full = acc.push(
            Admitted {
                records: batch_records,
                permit,
            },
            Instant::now(),
        );
        let last = acc.take(FlushTrigger::Shutdown).unwrap();

        let held: usize = full.iter().map(Batch::permit_bytes).sum::<usize>() + last.permit_bytes();
        assert_eq!(held, bytes);
        assert_eq!(budget.used(), bytes);

        drop(full);
        let clone = last.clone();
        drop(last);
        assert!(budget.used() > 0);
        drop(clone);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_batch_count_is_ceiling() {
        for (n, m) in [(10, 3), (9, 3), (1, 100), (100, 100), (101, 100)] {
            let mut acc = Accumulator::new(m, Duration::from_secs(5));
            let mut batches = Vec::new();
            let now = Instant::now();
            for i in 0..n {
                batches.extend(acc.push(admitted(i..i + 1), now));
            }
            batches.extend(acc.take(FlushTrigger::Deadline));

            assert_eq!(batches.len(), n.div_ceil(m), "n={n} m={m}");
            let order: Vec<String> = batches.iter().flat_map(bodies).collect();
            let expected: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            assert_eq!(order, expected);
        }
    }

    fn dispatcher_to(
        destination: &Arc<crate::exporter::tests::ScriptedDestination>,
    ) -> (Dispatcher<LogRecord>, crate::exporter::Exporter<LogRecord>) {
        let exporter = crate::exporter::Exporter::new(
            "memory",
            Arc::clone(destination) as Arc<dyn crate::exporter::Destination<LogRecord>>,
            crate::exporter::RetryPolicy::from(&shared::config::RetryConfig::default()),
            16,
            crate::telemetry::Counters::new_shared(),
            MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20)),
        );
        (Dispatcher::new(vec![exporter.handle()]), exporter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_flushes_on_deadline() {
        let destination = crate::exporter::tests::ScriptedDestination::succeeding();
        let (dispatcher, exporter) = dispatcher_to(&destination);
        let handle = exporter.handle();
        let worker = tokio::spawn(exporter.run(CancellationToken::new()));

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(run_accumulator(
            rx,
            Accumulator::new(100, Duration::from_millis(200)),
            dispatcher,
            shutdown.clone(),
        ));

        tx.send(admitted(0..3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(destination.delivered().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(destination.delivered(), vec![(0, 3)]);

        shutdown.cancel();
        driver.await.unwrap();
        handle.close();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_drains_channel_on_shutdown() {
        let destination = crate::exporter::tests::ScriptedDestination::succeeding();
        let (dispatcher, exporter) = dispatcher_to(&destination);
        let handle = exporter.handle();

        let (tx, rx) = mpsc::channel(8);
        tx.send(admitted(0..2)).await.unwrap();
        tx.send(admitted(2..5)).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run_accumulator(rx, Accumulator::new(4, Duration::from_secs(60)), dispatcher, shutdown).await;
        assert!(tx.send(admitted(5..6)).await.is_err());

        handle.close();
        let report = exporter.run(CancellationToken::new()).await;
        assert_eq!(report.delivered_batches, 2);
        assert_eq!(destination.delivered(), vec![(0, 4), (1, 1)]);
    }
}
