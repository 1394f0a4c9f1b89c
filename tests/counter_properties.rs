mod common;

use std::sync::Arc;

use batch_stats::transition::{self, Transition};
use batch_stats::{
    BatchCounters, BatchStore, Channel, EngineMetrics, MemoryStore, MessageStatus,
    StatusChangeEvent, StatusEventProcessor,
};
use common::{fast_config, ground_truth, new_batch};
use proptest::prelude::*;

fn any_status() -> impl Strategy<Value = MessageStatus> {
    prop::sample::select(MessageStatus::ALL.to_vec())
}

proptest! {
    /// Whatever sequence of status pairs is thrown at the counters, a
    /// persisted value always sums to the batch total.
    #[test]
    fn counters_never_break_the_total(
        total in 1u32..50,
        moves in prop::collection::vec((any_status(), any_status()), 0..200),
    ) {
        let mut counters = BatchCounters::initial(total);
        for (from, to) in moves {
            if let Ok(Transition::Apply(delta)) = transition::validate(from, to) {
                if let Some(next) = counters.apply(delta, total) {
                    counters = next;
                }
            }
            prop_assert_eq!(counters.sum(), total);
        }
    }

    /// Sequential delivery in any order, with duplicates and illegal events
    /// mixed in, ends on the true distribution.
    #[test]
    fn shuffled_deliveries_converge(
        outcomes in prop::collection::vec(any::<bool>(), 1..20),
        noise in prop::collection::vec((any::<prop::sample::Index>(), any_status()), 0..30),
        seed in any::<u64>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let processor = StatusEventProcessor::new(
                store.clone(),
                Arc::new(EngineMetrics::new()),
                fast_config(),
            );
            let (batch, messages) = store
                .create_batch(new_batch(Channel::Email, outcomes.len()))
                .await
                .unwrap();

            let mut events = Vec::new();
            for (message, ok) in messages.iter().zip(&outcomes) {
                events.push(StatusChangeEvent::new(message.id, MessageStatus::Sending));
                events.push(if *ok {
                    StatusChangeEvent::new(message.id, MessageStatus::Success)
                } else {
                    StatusChangeEvent::failed(message.id, "rejected")
                });
            }
            for (index, status) in &noise {
                events.push(StatusChangeEvent::new(messages[index.index(messages.len())].id, *status));
            }

            // Out-of-order events are rejected by the guard and leave no trace.
            let mut order: Vec<usize> = (0..events.len()).collect();
            let mut state = seed | 1;
            for i in (1..order.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                order.swap(i, (state % (i as u64 + 1)) as usize);
            }
            for i in order {
                processor.handle(events[i].clone()).await.unwrap();
            }

            let record = store.read_batch(&batch.batch_id).await.unwrap().unwrap();
            let truth = ground_truth(&*store, &batch.batch_id).await;
            assert_eq!(record.counters, truth);
            assert_eq!(record.counters.sum(), record.total_count);
        });
    }
}
