use std::sync::Arc;

use prism_capture::prelude::*;

use super::error::PipelineError;

/// Why a header could not be forwarded; the header is handed back.
pub(crate) enum ForwardError {
    NotHeld(OwnershipError, BufferHeader),
    Refused(PlatformError, BufferHeader),
}

/// Managed buffer pipe from a processor output to the consumer.
///
/// Owns the pool of headers handed to the producing port and the completion queue the
/// port's callback fills. Headers move by value, so the ledger in the pool is the single
/// record of who owns what.
pub(crate) struct Connection {
    platform: Arc<dyn Platform>,
    producer: PortId,
    pool: BufferPool,
    tx: CompletionTx<BufferHeader>,
    rx: CompletionRx<BufferHeader>,
}

impl Connection {
    pub(crate) fn new(
        platform: Arc<dyn Platform>,
        producer: PortId,
        buffer_num: usize,
        buffer_size: usize,
    ) -> Self {
        let pool = BufferPool::new(buffer_num, buffer_size);
        // Room for every header, so a completion is never turned away while open.
        let (tx, rx) = completion_queue(pool.capacity());
        Self {
            platform,
            producer,
            pool,
            tx,
            rx,
        }
    }

    /// Callback for the producing port: queue every completed header.
    pub(crate) fn completion_callback(&self) -> CompletionCallback {
        let tx = self.tx.clone();
        Arc::new(move |_port: PortId, buffer: BufferHeader| match tx.send(buffer) {
            SendOutcome::Ok => {}
            // Dropping the header returns it to the free list.
            SendOutcome::Full(buffer) | SendOutcome::Closed(buffer) => drop(buffer),
        })
    }

    /// Processor output the pool feeds.
    pub(crate) fn producer(&self) -> PortId {
        self.producer
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Send every free header to the producing port; returns how many went.
    pub(crate) fn drain_free_buffers_to_port(&self) -> Result<usize, PlatformError> {
        let mut sent = 0;
        for _ in 0..self.pool.free_len() {
            let Some(buffer) = self.pool.acquire() else {
                break;
            };
            self.platform
                .send_buffer(self.producer, buffer)
                .map_err(|err| err.error)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Release completions that were queued before the caller asked for a frame.
    pub(crate) fn discard_stale(&self) -> usize {
        self.rx.drain().len()
    }

    /// Block until the producer completes a header; it leaves as held by the caller.
    pub(crate) fn wait_for_completed_buffer(&self) -> Result<BufferHeader, PipelineError> {
        loop {
            match self.rx.recv_blocking() {
                RecvOutcome::Data(buffer) => {
                    buffer.transition(Ownership::InFlight, Ownership::Held)?;
                    return Ok(buffer);
                }
                RecvOutcome::Closed => return Err(PipelineError::TornDown),
                RecvOutcome::Empty => continue,
            }
        }
    }

    /// Hand a held header to `port`; on failure it comes back still held.
    pub(crate) fn send_buffer_downstream(
        &self,
        port: PortId,
        buffer: BufferHeader,
    ) -> Result<(), ForwardError> {
        if let Err(err) = buffer.transition(Ownership::Held, Ownership::Forwarded) {
            return Err(ForwardError::NotHeld(err, buffer));
        }
        self.platform.send_buffer(port, buffer).map_err(|err| {
            let SendError { error, buffer } = err;
            let _ = buffer.transition(Ownership::Forwarded, Ownership::Held);
            ForwardError::Refused(error, buffer)
        })
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Completions queued and not yet taken by the consumer.
    pub(crate) fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Close the completion queue, waking any waiter, and release what it still holds.
    pub(crate) fn close(&self) {
        self.tx.close();
        drop(self.rx.drain());
    }
}
