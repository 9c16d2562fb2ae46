//! Sorted object listing over either a streaming or a paginated store capability.
//!
//! The lister yields entries in strictly increasing key order within `[start, end]`. A failed
//! page or stream is retried from the last yielded key; when retries are exhausted, or when the
//! store returns keys out of order, a single error terminates the sequence.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::object::ObjectEntry;
use crate::retry::{self, Backoff};
use crate::store::{Endpoint, StoreError};

/// Page size requested from paginated stores.
pub const MAX_RESULTS: usize = 1000;

pub const LIST_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("listing {store} failed after {attempts} attempts: {source}")]
    Store {
        store: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },
    #[error("listing {store} returned keys out of order: {next:?} after {prev:?}")]
    OutOfOrder {
        store: String,
        prev: String,
        next: String,
    },
}

pub type Item = Result<ObjectEntry, ListingError>;

/// Receiving side of a background listing.
#[derive(Debug)]
pub struct SortedLister {
    rx: mpsc::Receiver<Item>,
}

impl SortedLister {
    /// Start listing `endpoint` in the background; `start` and `end` are inclusive, empty means
    /// unbounded.
    pub fn start(endpoint: Endpoint, prefix: &str, start: &str, end: &str) -> Self {
        let (tx, rx) = mpsc::channel(MAX_RESULTS * 10);
        let mut producer = Producer {
            endpoint,
            prefix: prefix.to_string(),
            end: end.to_string(),
            last: None,
            tx,
        };
        let start = start.to_string();
        tokio::spawn(async move {
            if let Err(err) = producer.run(&start).await {
                tracing::error!("{:#}", err);
                let _ = producer.tx.send(Err(err)).await;
            }
        });
        Self { rx }
    }

    /// Next entry, `None` once the listing is exhausted.
    pub async fn next(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    /// Drain everything into a vector, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<ObjectEntry>, ListingError> {
        let mut entries = vec![];
        while let Some(item) = self.next().await {
            entries.push(item?);
        }
        Ok(entries)
    }
}

/// Outcome of forwarding one batch of entries.
enum Flow {
    Continue,
    /// the end of the range was reached or the consumer went away
    Stop,
}

struct Producer {
    endpoint: Endpoint,
    prefix: String,
    end: String,
    last: Option<String>,
    tx: mpsc::Sender<Item>,
}

impl Producer {
    fn store_name(&self) -> String {
        self.endpoint.to_string()
    }

    /// The key listing resumes after.
    fn marker<'a>(&'a self, start: &'a str) -> &'a str {
        self.last.as_deref().unwrap_or(start)
    }

    async fn run(&mut self, start: &str) -> Result<(), ListingError> {
        if !start.is_empty() {
            if let Ok(entry) = self.endpoint.head(start).await {
                if let Flow::Stop = self.forward(entry, None).await? {
                    return Ok(());
                }
            }
        }
        match self.stream(start).await {
            Err(ListingError::Store {
                source: StoreError::NotSupported(_),
                ..
            }) => {
                tracing::debug!("{}: streaming listing not supported, paginating", self.store_name());
                self.paginate(start).await
            }
            res => res,
        }
    }

    async fn stream(&mut self, start: &str) -> Result<(), ListingError> {
        let mut failures = 0;
        loop {
            let marker = self.marker(start).to_string();
            let mut stream = match self.endpoint.list_all(&self.prefix, &marker).await {
                Ok(stream) => stream,
                Err(err @ StoreError::NotSupported(_)) => {
                    return Err(self.store_error(1, err));
                }
                Err(err) => {
                    failures += 1;
                    self.backoff(failures, err).await?;
                    continue;
                }
            };
            let mut first = true;
            let mut broken = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(entry) => {
                        // some stores return the marker again
                        if first && !marker.is_empty() && entry.key == marker {
                            first = false;
                            continue;
                        }
                        first = false;
                        if let Flow::Stop = self.forward(entry, Some(&marker)).await? {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        broken = Some(err);
                        break;
                    }
                }
            }
            match broken {
                None => return Ok(()),
                Some(err) => {
                    failures += 1;
                    self.backoff(failures, err).await?;
                }
            }
        }
    }

    async fn paginate(&mut self, start: &str) -> Result<(), ListingError> {
        loop {
            let marker = self.marker(start).to_string();
            let (endpoint, prefix) = (&self.endpoint, self.prefix.as_str());
            let page = retry::retry(
                "list",
                retry::ATTEMPTS,
                Backoff::Fixed(LIST_BACKOFF),
                |_| endpoint.list(prefix, &marker, MAX_RESULTS),
            )
            .await
            .map_err(|err| self.store_error(retry::ATTEMPTS, err))?;
            let mut entries = page.entries.into_iter().peekable();
            if !marker.is_empty() && entries.next_if(|entry| entry.key == marker).is_some() {
                tracing::debug!("{}: dropped repeated marker {:?}", self.store_name(), marker);
            }
            let mut forwarded = false;
            for entry in entries {
                forwarded = true;
                if let Flow::Stop = self.forward(entry, Some(&marker)).await? {
                    return Ok(());
                }
            }
            if !page.has_more {
                return Ok(());
            }
            if !forwarded {
                if page.next_marker.is_empty() || page.next_marker == marker {
                    return Ok(());
                }
                self.last = Some(page.next_marker);
            }
        }
    }

    async fn backoff(&self, failures: usize, err: StoreError) -> Result<(), ListingError> {
        if failures >= retry::ATTEMPTS {
            return Err(self.store_error(failures, err));
        }
        tracing::warn!(
            "{}: listing attempt {}/{} failed: {}, retrying",
            self.store_name(),
            failures,
            retry::ATTEMPTS,
            err
        );
        tokio::time::sleep(LIST_BACKOFF).await;
        Ok(())
    }

    fn store_error(&self, attempts: usize, source: StoreError) -> ListingError {
        ListingError::Store {
            store: self.store_name(),
            attempts,
            source,
        }
    }

    /// Check ordering and the end bound, then hand the entry to the consumer.
    async fn forward(&mut self, entry: ObjectEntry, marker: Option<&str>) -> Result<Flow, ListingError> {
        let prev = self.last.as_deref().or(marker.filter(|m| !m.is_empty()));
        if let Some(prev) = prev {
            if entry.key.as_str() <= prev {
                return Err(ListingError::OutOfOrder {
                    store: self.store_name(),
                    prev: prev.to_string(),
                    next: entry.key,
                });
            }
        }
        if !self.end.is_empty() && entry.key > self.end {
            return Ok(Flow::Stop);
        }
        self.last = Some(entry.key.clone());
        if self.tx.send(Ok(entry)).await.is_err() {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}
