//! Transport boundary
//!
//! The poller only ever talks to a device through [`Transport`]: one range
//! read and one multi-word write, each bounded by a caller supplied timeout.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;
use crate::register::Bank;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Read `count` consecutive words starting at `start`.
    async fn read_range(
        &mut self,
        bank: Bank,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write `words` starting at `address`.
    async fn write_words(
        &mut self,
        bank: Bank,
        address: u16,
        words: &[u16],
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Run `fut`, failing with [`TransportError::Timeout`] once `timeout` elapses.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory register banks used by tests across the crate.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct Banks {
        pub words: HashMap<(Bank, u16), u16>,
        /// Reads starting at one of these addresses fail with a timeout.
        pub failing: HashSet<(Bank, u16)>,
        pub delay: Option<Duration>,
        pub reads: usize,
        pub writes: Vec<(Bank, u16, Vec<u16>)>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryTransport {
        pub banks: Arc<Mutex<Banks>>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, bank: Bank, address: u16, words: &[u16]) {
            let mut banks = self.banks.lock().unwrap();
            for (offset, word) in words.iter().enumerate() {
                banks.words.insert((bank, address + offset as u16), *word);
            }
        }

        pub fn get(&self, bank: Bank, address: u16) -> u16 {
            self.banks
                .lock()
                .unwrap()
                .words
                .get(&(bank, address))
                .copied()
                .unwrap_or(0)
        }

        pub fn fail_at(&self, bank: Bank, start: u16, failing: bool) {
            let mut banks = self.banks.lock().unwrap();
            if failing {
                banks.failing.insert((bank, start));
            } else {
                banks.failing.remove(&(bank, start));
            }
        }

        pub fn set_delay(&self, delay: Duration) {
            self.banks.lock().unwrap().delay = Some(delay);
        }

        pub fn reads(&self) -> usize {
            self.banks.lock().unwrap().reads
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn read_range(
            &mut self,
            bank: Bank,
            start: u16,
            count: u16,
            timeout: Duration,
        ) -> Result<Vec<u16>, TransportError> {
            let (delay, failing) = {
                let mut banks = self.banks.lock().unwrap();
                banks.reads += 1;
                (banks.delay, banks.failing.contains(&(bank, start)))
            };
            with_timeout(timeout, async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if failing {
                    return Err(TransportError::Timeout(timeout));
                }
                let banks = self.banks.lock().unwrap();
                Ok((0..count)
                    .map(|i| banks.words.get(&(bank, start + i)).copied().unwrap_or(0))
                    .collect())
            })
            .await
        }

        async fn write_words(
            &mut self,
            bank: Bank,
            address: u16,
            words: &[u16],
            _timeout: Duration,
        ) -> Result<(), TransportError> {
            if bank == Bank::ReadOnly {
                return Err(TransportError::ReadOnlyBank(bank));
            }
            self.set(bank, address, words);
            self.banks
                .lock()
                .unwrap()
                .writes
                .push((bank, address, words.to_vec()));
            Ok(())
        }
    }
}
