use std::collections::VecDeque;

use crate::error::{protocol_violation, ReplicaResult};
use crate::model::{BatchId, MutationBatch, BATCH_ID_UNKNOWN};

/// Batches taken from the mutation queue and not yet acknowledged, in id
/// order.
///
/// At most one batch (the head) is in flight on the write stream; the rest
/// wait client-side. A stream restart resends the head under the same id.
#[derive(Debug)]
pub struct WritePipeline {
    batches: VecDeque<MutationBatch>,
    max_pending: usize,
    last_batch_id: BatchId,
    in_flight: Option<BatchId>,
}

impl WritePipeline {
    pub fn new(max_pending: usize) -> Self {
        Self {
            batches: VecDeque::new(),
            max_pending,
            last_batch_id: BATCH_ID_UNKNOWN,
            in_flight: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_full(&self) -> bool {
        self.batches.len() >= self.max_pending
    }

    /// Id of the newest batch taken from the mutation queue since the last
    /// `clear`, even if it has been retired since.
    pub fn last_batch_id(&self) -> BatchId {
        self.last_batch_id
    }

    pub fn push(&mut self, batch: MutationBatch) {
        self.last_batch_id = batch.batch_id;
        self.batches.push_back(batch);
    }

    /// The head batch, if it still has to be sent. Marks it in flight.
    pub fn next_to_send(&mut self) -> Option<MutationBatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let head = self.batches.front()?;
        self.in_flight = Some(head.batch_id);
        Some(head.clone())
    }

    /// The stream went away; the head has to be sent again.
    pub fn reset_in_flight(&mut self) {
        self.in_flight = None;
    }

    /// The in-flight batch, which a response must name.
    pub fn in_flight_batch(&self, batch_id: BatchId) -> ReplicaResult<&MutationBatch> {
        match (self.in_flight, self.batches.front()) {
            (Some(in_flight), Some(head)) if in_flight == batch_id && head.batch_id == batch_id => {
                Ok(head)
            }
            (Some(in_flight), _) => Err(protocol_violation(format!(
                "Write response for batch {batch_id} while batch {in_flight} is in flight"
            ))),
            (None, _) => Err(protocol_violation(format!(
                "Write response for batch {batch_id} with nothing in flight"
            ))),
        }
    }

    /// Retires the in-flight head batch, which must be `batch_id`.
    pub fn pop_head(&mut self, batch_id: BatchId) -> ReplicaResult<MutationBatch> {
        self.in_flight_batch(batch_id)?;
        self.in_flight = None;
        self.batches
            .pop_front()
            .ok_or_else(|| protocol_violation("Write pipeline emptied unexpectedly"))
    }

    pub fn clear(&mut self) {
        self.batches.clear();
        self.last_batch_id = BATCH_ID_UNKNOWN;
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey, Mutation, Timestamp};

    fn batch(batch_id: BatchId) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::now(),
            vec![Mutation::delete(DocumentKey::from_string("rooms/a").unwrap())],
        )
    }

    #[test]
    fn sends_one_batch_at_a_time() {
        let mut pipeline = WritePipeline::new(2);
        pipeline.push(batch(1));
        pipeline.push(batch(2));
        assert!(pipeline.is_full());

        assert_eq!(pipeline.next_to_send().unwrap().batch_id, 1);
        assert!(pipeline.next_to_send().is_none());

        assert!(pipeline.pop_head(2).is_err());
        assert_eq!(pipeline.pop_head(1).unwrap().batch_id, 1);
        assert_eq!(pipeline.next_to_send().unwrap().batch_id, 2);
        assert_eq!(pipeline.last_batch_id(), 2);
    }

    #[test]
    fn restart_resends_head() {
        let mut pipeline = WritePipeline::new(3);
        pipeline.push(batch(4));
        assert_eq!(pipeline.next_to_send().unwrap().batch_id, 4);
        pipeline.reset_in_flight();
        assert!(pipeline.pop_head(4).is_err());
        assert_eq!(pipeline.next_to_send().unwrap().batch_id, 4);
    }

    #[test]
    fn retired_batches_are_not_fetched_again() {
        let mut pipeline = WritePipeline::new(1);
        pipeline.push(batch(1));
        pipeline.next_to_send();
        pipeline.pop_head(1).unwrap();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.last_batch_id(), 1);

        pipeline.clear();
        assert_eq!(pipeline.last_batch_id(), BATCH_ID_UNKNOWN);
        assert!(pipeline.pop_head(1).is_err());
    }
}
