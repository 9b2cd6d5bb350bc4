use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::Stream;

use crate::channel::{Channel, CloseReason};
use crate::config::WHOLE_KEYSPACE;
use crate::wire::Record;

use super::Client;

/// Exclusive upper bound of a prefix scan: the prefix with its last
///  character replaced by the next code point (`"/a"` -> `"/b"`).
///
/// The empty prefix and the whole-keyspace sentinel map to the sentinel,
///  and so does a prefix ending in `char::MAX`. The surrogate gap is
///  skipped (`U+D7FF` -> `U+E000`).
pub fn end_key(prefix: &str) -> String {
    if prefix.is_empty() || prefix == WHOLE_KEYSPACE {
        return WHOLE_KEYSPACE.to_string();
    }
    let mut chars = prefix.chars();
    let Some(last) = chars.next_back() else {
        return WHOLE_KEYSPACE.to_string();
    };
    match next_char(last) {
        Some(next) => format!("{}{}", chars.as_str(), next),
        None => WHOLE_KEYSPACE.to_string(),
    }
}

fn next_char(c: char) -> Option<char> {
    match c {
        '\u{D7FF}' => Some('\u{E000}'),
        char::MAX => None,
        c => char::from_u32(c as u32 + 1),
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("range scan aborted: {0}")]
pub struct ScanAborted(pub String);

/// A prefix scan in progress.
///
/// Key-only records arrive in key order through a bounded channel; the
///  scan suspends while the consumer lags. Closing the channel, or
///  dropping the scan, cancels it.
#[derive(Debug)]
pub struct RangeScan {
    records: Channel<Record>,
    start_revision: Arc<AtomicI64>,
}

impl RangeScan {
    pub fn records(&self) -> &Channel<Record> {
        &self.records
    }

    pub async fn recv(&self) -> Option<Record> {
        self.records.recv().await
    }

    /// Stop the scan; it halts within one page
    pub fn cancel(&self) {
        self.records.close();
    }

    /// Store revision reported with the first page, once it has arrived
    pub fn start_revision(&self) -> Option<i64> {
        match self.start_revision.load(Ordering::Acquire) {
            0 => None,
            revision => Some(revision),
        }
    }

    /// `None` while the scan is still running
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.records.close_reason()
    }

    pub fn into_stream(self) -> impl Stream<Item = Record> {
        self.records.clone().into_stream()
    }

    /// Read every record, failing if the scan did not run to completion
    pub async fn collect(&self) -> Result<Vec<Record>, ScanAborted> {
        let mut records = Vec::new();
        while let Some(record) = self.records.recv().await {
            records.push(record);
        }
        match self.records.close_reason() {
            Some(CloseReason::Aborted(message)) => Err(ScanAborted(message)),
            _ => Ok(records),
        }
    }
}

/// Start a paginated scan of every key beginning with `prefix`
pub(crate) fn spawn_scan(client: Client, prefix: &str) -> RangeScan {
    let config = client.config();
    let records = Channel::new(config.range_buffer);
    let start_revision = Arc::new(AtomicI64::new(0));
    let page_size = config.range_page_size.max(1);

    tokio::spawn(run_scan(
        client,
        prefix.to_string(),
        page_size,
        records.clone(),
        start_revision.clone(),
    ));

    RangeScan {
        records,
        start_revision,
    }
}

async fn run_scan(
    client: Client,
    prefix: String,
    page_size: u32,
    records: Channel<Record>,
    start_revision: Arc<AtomicI64>,
) {
    let endkey = end_key(&prefix);
    let mut cursor = prefix.clone().into_bytes();
    let mut pages = 0u64;

    while records.is_open() {
        let page = match client
            .query_page(cursor.clone(), endkey.clone().into_bytes(), page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(prefix = %prefix.escape_debug(), error = %err, "range scan aborted");
                records.abort(err.to_string());
                return;
            }
        };
        if pages == 0 {
            start_revision.store(page.header.revision, Ordering::Release);
        }
        pages += 1;

        let more = page.more;
        let last = page.kvs.last().map(|record| record.key.clone());
        for record in page.kvs {
            if records.send(record).await.is_err() {
                tracing::debug!(prefix = %prefix.escape_debug(), "range scan cancelled by consumer");
                return;
            }
        }

        match last {
            Some(mut key) if more => {
                key.push(0);
                cursor = key;
            }
            _ => {
                tracing::debug!(prefix = %prefix.escape_debug(), pages, "range scan complete");
                records.close();
                return;
            }
        }
    }
    tracing::debug!(prefix = %prefix.escape_debug(), "range scan cancelled by consumer");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_end_key() {
        assert_eq!(end_key(""), "\0");
        assert_eq!(end_key("\0"), "\0");
        assert_eq!(end_key("a"), "b");
        assert_eq!(end_key("/app/"), "/app0");
        assert_eq!(end_key("/x/é"), "/x/ê");
        assert_eq!(end_key("k\u{D7FF}"), "k\u{E000}");
        assert_eq!(end_key("k\u{10FFFF}"), "\0");
    }
}
