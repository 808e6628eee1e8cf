//! Reorder buffer in front of the dispatch connection.
//!
//! Engine callbacks for a record may complete in any order, but the
//! dispatcher renders them as a live log and expects case 1 before case 2.
//! Ordered frames carry a dense sequence id starting at 1; frames that
//! arrive early wait in a map keyed by id until every lower id has been
//! written. Frames without an id bypass the buffer.

use std::collections::BTreeMap;

use judge_protocol::ClientFrame;
use tracing::{debug, warn};

use crate::channel::DispatchSender;
use crate::error::JudgeError;

pub struct OrderedEmitter {
    out: DispatchSender,
    next_id: u64,
    waiting: BTreeMap<u64, Vec<ClientFrame>>,
}

impl OrderedEmitter {
    pub fn new(out: DispatchSender) -> Self {
        Self {
            out,
            next_id: 1,
            waiting: BTreeMap::new(),
        }
    }

    /// Id the next in-order frame must carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Number of frames parked in the reorder buffer.
    pub fn pending(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    pub fn sender(&self) -> &DispatchSender {
        &self.out
    }

    pub async fn emit(&mut self, frame: ClientFrame, id: Option<u64>) -> Result<(), JudgeError> {
        let Some(id) = id else {
            return self.write(&frame).await;
        };

        if id < self.next_id {
            warn!(id, next_id = self.next_id, "late sequence id, writing immediately");
            return self.write(&frame).await;
        }

        if id != self.next_id {
            debug!(id, next_id = self.next_id, "buffering out-of-order frame");
            self.waiting.entry(id).or_default().push(frame);
            return Ok(());
        }

        self.write(&frame).await?;
        self.next_id += 1;
        while let Some(frames) = self.waiting.remove(&self.next_id) {
            for frame in &frames {
                self.write(frame).await?;
            }
            self.next_id += 1;
        }
        Ok(())
    }

    /// Emit in order at the current head of the stream.
    pub async fn emit_in_order(&mut self, frame: ClientFrame) -> Result<(), JudgeError> {
        let id = self.next_id;
        self.emit(frame, Some(id)).await
    }

    /// Write whatever is still parked, lowest id first. Used when the
    /// producer has finished and will never fill the gaps.
    pub async fn flush(&mut self) -> Result<(), JudgeError> {
        if self.waiting.is_empty() {
            return Ok(());
        }
        warn!(
            pending = self.pending(),
            next_id = self.next_id,
            "sequence gap at end of stream, flushing buffered frames"
        );
        while let Some((id, frames)) = self.waiting.pop_first() {
            for frame in &frames {
                self.write(frame).await?;
            }
            self.next_id = id + 1;
        }
        Ok(())
    }

    async fn write(&mut self, frame: &ClientFrame) -> Result<(), JudgeError> {
        if let Err(e) = self.out.send(frame).await {
            // Nothing buffered can be delivered any more.
            self.waiting.clear();
            return Err(e);
        }
        Ok(())
    }
}
