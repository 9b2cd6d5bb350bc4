use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::wire::{
    Action, ChangeEvent, ChangeKind, EventPayload, Record, RequestFrame, ResponseFrame,
    ResponseHeader,
};

use super::connector::{MockListener, ServerLink};

/// In-memory key-value store speaking the gateway protocol over
///  [`ServerLink`]s.
///
/// Keys are ordered bytes; every mutation bumps the store revision and is
///  pushed to all connected clients as a watch event. Range queries return
///  key-only records, single-key queries include the value.
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Shared>,
}

struct Shared {
    store: Mutex<Store>,
    watch: broadcast::Sender<ChangeEvent>,
    kick: watch::Sender<u64>,
    rejects: Mutex<HashMap<Action, String>>,
    accepted: AtomicUsize,
}

struct Store {
    revision: i64,
    kvs: BTreeMap<Vec<u8>, Record>,
}

impl MemoryServer {
    /// Serve every connection accepted by `listener`
    pub fn spawn(mut listener: MockListener) -> Self {
        let (watch, _) = broadcast::channel(1024);
        let (kick, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            store: Mutex::new(Store {
                revision: 1,
                kvs: BTreeMap::new(),
            }),
            watch,
            kick,
            rejects: Mutex::new(HashMap::new()),
            accepted: AtomicUsize::new(0),
        });

        let server = shared.clone();
        tokio::spawn(async move {
            while let Some(link) = listener.accept().await {
                server.accepted.fetch_add(1, Ordering::SeqCst);
                // subscribe before the client can observe the connection
                let events = server.watch.subscribe();
                tokio::spawn(serve(server.clone(), link, events));
            }
        });

        Self { shared }
    }

    pub fn revision(&self) -> i64 {
        self.shared.store.lock().revision
    }

    /// Stored keys in order, as text
    pub fn keys(&self) -> Vec<String> {
        self.shared
            .store
            .lock()
            .kvs
            .keys()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Write directly, as another client would. Returns the new revision.
    pub fn put(&self, key: &str, value: &str) -> i64 {
        self.shared.put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), 0).header.revision
    }

    /// Delete directly. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        self.shared.delete(key.as_bytes(), false).prev_kv.is_some()
    }

    /// Answer every call of `action` with a failure carrying `message`,
    ///  or stop doing so with `None`
    pub fn reject(&self, action: Action, message: Option<&str>) {
        let mut rejects = self.shared.rejects.lock();
        match message {
            Some(message) => {
                rejects.insert(action, message.to_string());
            }
            None => {
                rejects.remove(&action);
            }
        }
    }

    /// Close every open connection
    pub fn drop_connections(&self) {
        self.shared.kick.send_modify(|generation| *generation += 1);
    }
}

async fn serve(
    shared: Arc<Shared>,
    mut link: ServerLink,
    mut events: broadcast::Receiver<ChangeEvent>,
) {
    let mut kick = shared.kick.subscribe();

    loop {
        tokio::select! {
            text = link.recv_text() => {
                let Some(text) = text else { break };
                let request = match serde_json::from_str::<RequestFrame>(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::debug!(error = %err, "test server dropping bad request");
                        continue;
                    }
                };
                if let Some(response) = shared.handle(request) {
                    if link.send(&response).is_err() {
                        break;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if link.send(&ResponseFrame::watch(&event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = kick.changed() => break,
        }
    }
}

impl Shared {
    fn handle(&self, request: RequestFrame) -> Option<ResponseFrame> {
        let RequestFrame {
            id,
            action,
            request,
        } = request;

        if let Some(message) = self.rejects.lock().get(&action) {
            return Some(ResponseFrame::failure(id, action, message.clone()));
        }

        match action {
            Action::Create | Action::Delete | Action::Query => {}
            Action::Ping => return Some(ResponseFrame::keepalive(id, Action::Pong)),
            _ => return None,
        }

        let Some(key) = request.key else {
            return Some(ResponseFrame::failure(id, action, "key is required"));
        };

        let payload = match action {
            Action::Create => self.put(key, request.val.unwrap_or_default(), request.lease.unwrap_or(0)),
            Action::Delete => self.delete(&key, request.prefix.unwrap_or(false)),
            _ => match request.endkey {
                Some(endkey) => self.range(&key, &endkey, request.limit.unwrap_or(0)),
                None => self.lookup(&key),
            },
        };
        Some(ResponseFrame::success(id, action, &payload))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>, lease: i64) -> EventPayload {
        let event = {
            let mut store = self.store.lock();
            store.revision += 1;
            let revision = store.revision;
            let prev = store.kvs.get(&key).cloned();
            let (create_revision, version) = match &prev {
                Some(prev) => (prev.create_revision, prev.version + 1),
                None => (revision, 1),
            };
            let mut record = Record::key_only(key.clone())
                .with_value(value)
                .with_revisions(create_revision, revision, version);
            record.lease = lease;
            store.kvs.insert(key, record.clone());

            let header = ResponseHeader::new(revision);
            match prev {
                Some(prev) => ChangeEvent::Update {
                    header,
                    kvs: vec![record],
                    prev_kv: Some(prev),
                },
                None => ChangeEvent::Create {
                    header,
                    kvs: vec![record],
                },
            }
        };
        let _ = self.watch.send(event.clone());

        match event {
            ChangeEvent::Create { header, kvs } => EventPayload {
                kind: Some(ChangeKind::Create),
                header,
                kvs,
                ..Default::default()
            },
            ChangeEvent::Update {
                header,
                kvs,
                prev_kv,
            } => EventPayload {
                kind: Some(ChangeKind::Update),
                header,
                kvs,
                prev_kv,
                ..Default::default()
            },
            ChangeEvent::Delete { header, prev_kv } => EventPayload {
                kind: Some(ChangeKind::Delete),
                header,
                prev_kv: Some(prev_kv),
                ..Default::default()
            },
        }
    }

    fn delete(&self, key: &[u8], prefix: bool) -> EventPayload {
        let (header, removed) = {
            let mut store = self.store.lock();
            let matched: Vec<Vec<u8>> = if prefix {
                store
                    .kvs
                    .keys()
                    .filter(|candidate| candidate.starts_with(key))
                    .cloned()
                    .collect()
            } else {
                store.kvs.keys().filter(|candidate| *candidate == key).cloned().collect()
            };
            if !matched.is_empty() {
                store.revision += 1;
            }
            let removed: Vec<Record> = matched
                .iter()
                .filter_map(|key| store.kvs.remove(key))
                .collect();
            (ResponseHeader::new(store.revision), removed)
        };

        for prev_kv in &removed {
            let _ = self.watch.send(ChangeEvent::Delete {
                header,
                prev_kv: prev_kv.clone(),
            });
        }

        EventPayload {
            kind: Some(ChangeKind::Delete),
            header,
            prev_kv: removed.into_iter().next(),
            ..Default::default()
        }
    }

    fn lookup(&self, key: &[u8]) -> EventPayload {
        let store = self.store.lock();
        EventPayload {
            header: ResponseHeader::new(store.revision),
            kvs: store.kvs.get(key).cloned().into_iter().collect(),
            ..Default::default()
        }
    }

    /// Keys in `[key, endkey)`, where an `endkey` of NUL means no upper bound
    fn range(&self, key: &[u8], endkey: &[u8], limit: i64) -> EventPayload {
        let store = self.store.lock();
        let in_range: Vec<&Record> = store
            .kvs
            .range(key.to_vec()..)
            .take_while(|(candidate, _)| endkey == b"\0" || candidate.as_slice() < endkey)
            .map(|(_, record)| record)
            .collect();

        let limit = usize::try_from(limit).unwrap_or(0);
        let (page, more) = if limit > 0 && in_range.len() > limit {
            (&in_range[..limit], true)
        } else {
            (&in_range[..], false)
        };

        EventPayload {
            more,
            header: ResponseHeader::new(store.revision),
            kvs: page
                .iter()
                .map(|record| Record {
                    value: None,
                    ..(*record).clone()
                })
                .collect(),
            ..Default::default()
        }
    }
}
