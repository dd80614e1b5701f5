//! Scripted fakes shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::DsqlError;
use crate::factory::ConnectionFactory;

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    closed: AtomicUsize,
    fail_next: AtomicUsize,
}

/// A factory whose connections are sequence numbers.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeFactory {
    counters: Arc<Counters>,
}

impl FakeFactory {
    /// Successful connects so far.
    pub(crate) fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::Acquire)
    }

    /// Connections closed through the factory.
    pub(crate) fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::Acquire)
    }

    /// Make the next `n` connects fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.counters.fail_next.store(n, Ordering::Release);
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    type Connection = usize;

    async fn connect(&self) -> Result<usize, DsqlError> {
        let failed = self
            .counters
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DsqlError::Config("scripted connect failure".to_owned()));
        }
        Ok(self.counters.connects.fetch_add(1, Ordering::AcqRel))
    }

    async fn close(&self, _conn: usize) {
        self.counters.closed.fetch_add(1, Ordering::AcqRel);
    }
}
