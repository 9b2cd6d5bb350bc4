//! Keeps a [`KeyTree`] in step with the store
//!
//! Every `Open` and `Reconnect` triggers a full reload, and so does switching
//! the followed prefix through [`TreeHandle::set_prefix`]: a prefix scan fills
//! a fresh tree which then replaces the published one. Change events that
//! arrive during a reload are buffered and replayed on top of the scan,
//! skipping those the scan already reflects. Outside a reload, events are
//! applied one by one in delivery order. Events for keys outside the
//! followed prefix are ignored.

use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::channel::CloseReason;
use crate::client::{Client, ConnectionState, RangeScan, SessionEvent};
use crate::config::{scan_start, WHOLE_KEYSPACE};
use crate::tree::{DuplicatePolicy, KeyTree, TreeError};
use crate::wire::{ChangeEvent, Record};

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("tree sync has stopped")]
pub struct SyncStopped;

enum SyncCommand {
    SetPrefix(String),
}

/// Read access to the synchronized tree
#[derive(Debug, Clone)]
pub struct TreeHandle {
    tree: Arc<RwLock<KeyTree<Record>>>,
    generation: watch::Receiver<u64>,
    commands: flume::Sender<SyncCommand>,
}

impl TreeHandle {
    /// Follow `prefix` from now on. The tree is reloaded from a scan of the
    ///  new prefix and replaces the published one once complete; an empty
    ///  or `/` prefix follows the whole keyspace.
    pub fn set_prefix(&self, prefix: impl Into<String>) -> Result<(), SyncStopped> {
        self.commands
            .send(SyncCommand::SetPrefix(prefix.into()))
            .map_err(|_| SyncStopped)
    }

    /// Copy of the current tree
    pub fn snapshot(&self) -> KeyTree<Record> {
        self.tree.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&KeyTree<Record>) -> R) -> R {
        f(&self.tree.read())
    }

    /// Bumped on every change to the published tree; 0 until the first load
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Wait for the next change to the published tree
    pub async fn changed(&mut self) -> Result<u64, SyncStopped> {
        self.generation.changed().await.map_err(|_| SyncStopped)?;
        Ok(*self.generation.borrow_and_update())
    }

    /// Wait until `predicate` holds for the published tree
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&KeyTree<Record>) -> bool,
    ) -> Result<(), SyncStopped> {
        loop {
            self.generation.borrow_and_update();
            if predicate(&self.tree.read()) {
                return Ok(());
            }
            self.generation.changed().await.map_err(|_| SyncStopped)?;
        }
    }
}

enum Mode {
    /// Nothing loaded yet
    Idle,
    Live,
    Reloading {
        scan: RangeScan,
        fresh: KeyTree<Record>,
        buffered: Vec<ChangeEvent>,
    },
}

impl Mode {
    fn is_reloading(&self) -> bool {
        matches!(self, Mode::Reloading { .. })
    }

    async fn next_record(&self) -> Option<Record> {
        match self {
            Mode::Reloading { scan, .. } => scan.recv().await,
            _ => futures::future::pending().await,
        }
    }
}

/// Drives a tree from a client's session events
pub struct TreeSync {
    client: Client,
    events: broadcast::Receiver<SessionEvent>,
    commands: flume::Receiver<SyncCommand>,
    prefix: String,
    /// Start revision of the scan behind the published tree
    loaded_revision: i64,
    tree: Arc<RwLock<KeyTree<Record>>>,
    generation: watch::Sender<u64>,
    policy: DuplicatePolicy,
    mode: Mode,
    retry: Option<Pin<Box<Sleep>>>,
}

impl TreeSync {
    /// `events` should be subscribed before the client's first `Open`, as
    ///  the one returned by [`Client::connect`] is.
    pub fn new(client: Client, events: broadcast::Receiver<SessionEvent>) -> (Self, TreeHandle) {
        let tree = Arc::new(RwLock::new(KeyTree::new()));
        let (generation, generation_rx) = watch::channel(0);
        let (commands_tx, commands) = flume::unbounded();
        let handle = TreeHandle {
            tree: tree.clone(),
            generation: generation_rx,
            commands: commands_tx,
        };
        let prefix = client.endpoint().prefix().to_string();
        let sync = Self {
            client,
            events,
            commands,
            prefix,
            loaded_revision: 0,
            tree,
            generation,
            policy: DuplicatePolicy::default(),
            mode: Mode::Idle,
            retry: None,
        };
        (sync, handle)
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Prefix of the keys the tree follows
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn spawn(client: Client, events: broadcast::Receiver<SessionEvent>) -> (JoinHandle<()>, TreeHandle) {
        let (sync, handle) = Self::new(client, events);
        (tokio::spawn(sync.run()), handle)
    }

    /// Run until the client is closed
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                // events queued before a scan completes must be buffered, not applied on top of it
                biased;
                event = self.events.recv() => match event {
                    Ok(SessionEvent::Open) | Ok(SessionEvent::Reconnect) => self.start_reload(),
                    Ok(SessionEvent::Data(change)) => self.on_change(change),
                    // the sync holds a client handle, so the stream never ends on its own
                    Ok(SessionEvent::Close) if self.client.state() == ConnectionState::Closed => break,
                    Ok(SessionEvent::Close) | Ok(SessionEvent::Error(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "missed change events, reloading");
                        self.start_reload();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Ok(command) = self.commands.recv_async() => match command {
                    SyncCommand::SetPrefix(prefix) => self.switch_prefix(prefix),
                },
                record = self.mode.next_record(), if self.mode.is_reloading() => match record {
                    Some(record) => self.on_scanned(record),
                    None => self.finish_reload(),
                },
                _ = wait_retry(&mut self.retry), if self.retry.is_some() => {
                    self.retry = None;
                    self.start_reload();
                }
            }
        }
        debug!("tree sync stopped");
    }

    fn publish(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    fn switch_prefix(&mut self, prefix: String) {
        if scan_start(&prefix) == scan_start(&self.prefix) {
            debug!(prefix = %prefix.escape_debug(), "prefix unchanged");
            return;
        }
        info!(
            from = %self.prefix.escape_debug(),
            to = %prefix.escape_debug(),
            "switching prefix"
        );
        self.prefix = prefix;
        // events buffered for the old view are covered by the new scan
        if let Mode::Reloading { scan, .. } = std::mem::replace(&mut self.mode, Mode::Idle) {
            scan.cancel();
        }
        self.start_reload();
    }

    fn start_reload(&mut self) {
        let buffered = match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Reloading { scan, buffered, .. } => {
                debug!("restarting reload in progress");
                scan.cancel();
                buffered
            }
            _ => Vec::new(),
        };
        self.retry = None;
        info!(
            endpoint = %self.client.endpoint(),
            prefix = %self.prefix.escape_debug(),
            "reloading key tree"
        );
        self.mode = Mode::Reloading {
            scan: self.client.get_prefix(scan_start(&self.prefix)),
            fresh: KeyTree::with_policy(self.policy),
            buffered,
        };
    }

    fn on_scanned(&mut self, record: Record) {
        if let Mode::Reloading { fresh, .. } = &mut self.mode {
            let key = record.key_text().into_owned();
            if let Err(err) = fresh.append_record(record) {
                warn!(key = %key.escape_debug(), error = %err, "skipping scanned key");
            }
        }
    }

    fn finish_reload(&mut self) {
        let Mode::Reloading {
            scan,
            fresh,
            buffered,
        } = std::mem::replace(&mut self.mode, Mode::Live)
        else {
            return;
        };

        if let Some(CloseReason::Aborted(message)) = scan.close_reason() {
            warn!(error = %message, "reload aborted, keeping the current tree");
            {
                let mut tree = self.tree.write();
                for change in &buffered {
                    apply_idempotent(&mut tree, change);
                }
            }
            if !buffered.is_empty() {
                self.publish();
            }
            self.retry = Some(Box::pin(tokio::time::sleep(
                self.client.config().reconnect_delay(),
            )));
            return;
        }

        let mut fresh = fresh;
        let start_revision = scan.start_revision().unwrap_or(0);
        let replayed = replay(&mut fresh, &buffered, start_revision);
        info!(
            keys = fresh.len(),
            revision = start_revision,
            replayed,
            skipped = buffered.len() - replayed,
            "key tree loaded"
        );
        *self.tree.write() = fresh;
        self.loaded_revision = start_revision;
        self.publish();
    }

    fn on_change(&mut self, change: ChangeEvent) {
        let Some(change) = retain_in_view(change, &self.prefix) else {
            return;
        };
        if let Mode::Reloading { buffered, .. } = &mut self.mode {
            buffered.push(change);
            return;
        }
        // before the first load there is nothing to apply to
        if !matches!(self.mode, Mode::Live) {
            return;
        }
        if is_stale(&change, self.loaded_revision) {
            debug!(revision = change.revision(), loaded = self.loaded_revision, "change already loaded");
            return;
        }

        let result = {
            let mut tree = self.tree.write();
            apply_live(&mut tree, &change)
        };
        match result {
            Ok(()) => self.publish(),
            Err(TreeError::DuplicateKey(key)) => {
                warn!(key = %key.escape_debug(), revision = change.revision(), "tree out of step, reloading");
                self.start_reload();
            }
            Err(err) => {
                warn!(error = %err, revision = change.revision(), "ignoring change");
                self.publish();
            }
        }
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(delay) => delay.await,
        None => futures::future::pending().await,
    }
}

fn within(prefix: &str, key: &[u8]) -> bool {
    let start = scan_start(prefix);
    start == WHOLE_KEYSPACE || key.starts_with(start.as_bytes())
}

/// The part of `change` that concerns keys under `prefix`, if any
fn retain_in_view(change: ChangeEvent, prefix: &str) -> Option<ChangeEvent> {
    match change {
        ChangeEvent::Create { header, mut kvs } => {
            kvs.retain(|record| within(prefix, &record.key));
            (!kvs.is_empty()).then_some(ChangeEvent::Create { header, kvs })
        }
        ChangeEvent::Update {
            header,
            mut kvs,
            prev_kv,
        } => {
            kvs.retain(|record| within(prefix, &record.key));
            (!kvs.is_empty()).then_some(ChangeEvent::Update {
                header,
                kvs,
                prev_kv,
            })
        }
        ChangeEvent::Delete { ref prev_kv, .. } if !within(prefix, &prev_kv.key) => None,
        delete => Some(delete),
    }
}

/// A change the loaded scan already reflects. Revision 0 means unknown.
fn is_stale(change: &ChangeEvent, loaded_revision: i64) -> bool {
    let revision = change.revision();
    loaded_revision > 0 && revision > 0 && revision <= loaded_revision
}

/// Apply the changes newer than `start_revision`. Returns how many were applied.
fn replay(tree: &mut KeyTree<Record>, buffered: &[ChangeEvent], start_revision: i64) -> usize {
    let mut replayed = 0;
    for change in buffered.iter().filter(|change| change.revision() > start_revision) {
        apply_idempotent(tree, change);
        replayed += 1;
    }
    replayed
}

/// Strict application: a create of a key already present is an error
fn apply_live(tree: &mut KeyTree<Record>, change: &ChangeEvent) -> Result<(), TreeError> {
    match change {
        ChangeEvent::Create { kvs, .. } => {
            for record in kvs {
                tree.append_record(record.clone())?;
            }
        }
        ChangeEvent::Update { kvs, .. } => {
            for record in kvs {
                if !tree.change_record(record.clone()) {
                    tree.append_record(record.clone())?;
                }
            }
        }
        ChangeEvent::Delete { prev_kv, .. } => {
            if !tree.remove_key(&prev_kv.key) {
                debug!(key = %prev_kv.key_text().escape_debug(), "delete of unknown key");
            }
        }
    }
    Ok(())
}

/// Replay that converges whether or not the scan already saw the change
fn apply_idempotent(tree: &mut KeyTree<Record>, change: &ChangeEvent) {
    match change {
        ChangeEvent::Create { kvs, .. } | ChangeEvent::Update { kvs, .. } => {
            for record in kvs {
                if let Err(err) = tree.upsert_record(record.clone()) {
                    warn!(key = %record.key_text().escape_debug(), error = %err, "skipping change");
                }
            }
        }
        ChangeEvent::Delete { prev_kv, .. } => {
            tree.remove_key(&prev_kv.key);
        }
    }
}
