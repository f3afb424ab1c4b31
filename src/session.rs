// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HSM session pool.
//!
//! A bounded, blocking queue of authenticated token sessions. Every
//! cryptographic operation borrows a session through
//! [`SessionQueue::acquire`] and returns it by dropping the returned
//! [`SessionHandle`]; the guard makes release exactly-once on every control
//! path, including panics. Capacity is fixed at construction: at any
//! instant, sessions loaned out plus sessions queued equals the configured
//! pool size.

use std::collections::VecDeque;
use std::ops::Deref;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::error;

use crate::error::SpmError;
use crate::error::SpmResult;
use crate::pk11;

pub(crate) struct SessionQueue {
    /// Number of sessions managed by the queue.
    num_sessions: usize,

    /// Upper bound on the time [`SessionQueue::acquire`] may block.
    acquire_timeout: Option<Duration>,

    queue: Mutex<VecDeque<Box<dyn pk11::Session>>>,
    available: Condvar,
}

impl SessionQueue {
    /// Creates an empty queue with capacity `num_sessions`.
    pub(crate) fn new(num_sessions: usize, acquire_timeout: Option<Duration>) -> Self {
        SessionQueue {
            num_sessions,
            acquire_timeout,
            queue: Mutex::new(VecDeque::with_capacity(num_sessions)),
            available: Condvar::new(),
        }
    }

    /// Adds a session to the queue; fails if capacity would be exceeded.
    pub(crate) fn insert(&self, session: Box<dyn pk11::Session>) -> SpmResult<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.num_sessions {
            return Err(SpmError::resource(
                "reached maximum session queue capacity",
            ));
        }
        queue.push_back(session);
        self.available.notify_one();
        Ok(())
    }

    /// Borrows a session, blocking while the queue is empty.
    ///
    /// The session returns to the queue when the handle drops. With an
    /// acquisition timeout configured, waiting longer than the timeout is a
    /// resource error instead of an unbounded block.
    pub(crate) fn acquire(&self) -> SpmResult<SessionHandle<'_>> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(session) = queue.pop_front() {
                return Ok(SessionHandle {
                    queue: self,
                    session: Some(session),
                });
            }
            match self.acquire_timeout {
                Some(timeout) => {
                    let result = self.available.wait_for(&mut queue, timeout);
                    if result.timed_out() && queue.is_empty() {
                        return Err(SpmError::resource(
                            "timed out waiting for an HSM session",
                        ));
                    }
                }
                None => self.available.wait(&mut queue),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Scoped loan of a pooled session.
pub(crate) struct SessionHandle<'q> {
    queue: &'q SessionQueue,
    session: Option<Box<dyn pk11::Session>>,
}

impl Deref for SessionHandle<'_> {
    type Target = dyn pk11::Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("session is present until the handle drops")
    }
}

impl Drop for SessionHandle<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // Unreachable while every acquire is paired with one release,
            // but an overflow here would silently shrink the pool.
            if let Err(err) = self.queue.insert(session) {
                error!("failed to return session to the queue: {err}");
            }
        }
    }
}
