//! # Share Synchronization Engine
//!
//! One [`ShareEngine`] task per share. It reacts to two streams:
//!
//! - **Remote messages** handed over by the dispatcher: file and directory
//!   changes, membership changes, peer advertisements and chunk transfer.
//! - **Local filesystem events** from the share's watch source.
//!
//! Remote changes are applied to disk and recorded in the metadata store so
//! the resulting filesystem events are recognised as already known. Local
//! changes are detected with a shallow (mtime) check followed by a deep
//! (SHA-1) check and broadcast to every live member.
//!
//! File content moves in [`CHUNK_SIZE`] pieces: the receiving engine requests
//! chunk 0 from the peer that announced the change and asks for the next index
//! after each chunk arrives. Chunks land in a partial sibling file that
//! replaces the target once the digest matches; an abandoned transfer deletes
//! it. Local events for a path are ignored while its transfer is pending.
//!
//! A new member is sent the share tree a few entries at a time without
//! blocking on its outbound queue, so the engine keeps serving commands while
//! a large tree is being advertised. Files whose latest content was produced
//! here are advertised as `Updated` so peers that missed the change pull it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connector::PeerInfo;
use crate::dispatcher::MessageHandler;
use crate::crypto;
use crate::error::{DispatchError, SessionError, ShareError};
use crate::message::{
    ChunkData, ChunkRequest, Digest, FileAction, FileMessage, Message, Payload, PeerIdentity,
    PeerMessage, ShareAction,
};
use crate::p2p::ClientRegistry;
use crate::session::Session;
use crate::share::{self, Entry, Share, CHUNK_SIZE};
use crate::watcher::{FsEvent, WatchSource};

pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// A transfer with no chunk for this long is abandoned.
const TRANSFER_IDLE_LIMIT: Duration = Duration::from_secs(60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(15);
/// Entries sent per advertising step.
const ADVERT_BATCH: usize = 32;
const ADVERT_PACE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Running,
    Stopping,
    Stopped,
}

/// Node-wide collaborators an engine consults.
#[derive(Clone, Default)]
pub struct EngineContext {
    /// Live sessions by fingerprint.
    pub registry: ClientRegistry,
    /// Configured peer names and their fingerprints.
    pub known_peers: HashMap<String, String>,
    /// Where dial requests for advertised peers go.
    pub dial_requests: Option<mpsc::Sender<PeerInfo>>,
}

enum Command {
    Deliver(Message),
    AddMember(Session),
    RemoveMember(String),
}

/// Share entries still to be announced to one member.
struct Advert {
    fingerprint: String,
    entries: VecDeque<Entry>,
    sent: usize,
}

struct Transfer {
    source: String,
    expected: Option<Digest>,
    next_index: u64,
    last_activity: Instant,
}

/// Control handle for a running engine. Registered with the dispatcher under
/// the share name.
pub struct ShareHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    stop_tx: watch::Sender<bool>,
    state: watch::Receiver<ShareState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShareHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ShareState {
        *self.state.borrow()
    }

    pub async fn add_member(&self, session: Session) -> Result<(), DispatchError> {
        self.command(Command::AddMember(session)).await
    }

    pub async fn remove_member(&self, fingerprint: &str) -> Result<(), DispatchError> {
        self.command(Command::RemoveMember(fingerprint.to_string())).await
    }

    /// Ask the engine to stop and wait until it has.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("[{}] engine task failed: {}", self.name, e);
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DispatchError::HandlerClosed(self.name.clone()))
    }
}

#[async_trait]
impl MessageHandler for ShareHandle {
    async fn hand_over(&self, message: Message) -> Result<(), DispatchError> {
        match message.payload().share_name() {
            Some(share) if share != self.name => {
                debug!(
                    "[{}] ignoring {} message for share {}",
                    self.name,
                    message.payload().kind(),
                    share
                );
                Ok(())
            }
            _ => self.command(Command::Deliver(message)).await,
        }
    }
}

pub struct ShareEngine<W> {
    share: Share,
    watcher: W,
    events: mpsc::Receiver<FsEvent>,
    commands: mpsc::Receiver<Command>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ShareState>,
    context: EngineContext,
    transfers: HashMap<String, Transfer>,
    adverts: VecDeque<Advert>,
    /// Files whose current content was produced here rather than pulled.
    local_changes: HashSet<String>,
}

impl<W> ShareEngine<W>
where
    W: WatchSource + Sync + 'static,
{
    /// Spawn the engine task for `share`.
    pub fn start(share: Share, watcher: W, events: mpsc::Receiver<FsEvent>, context: EngineContext) -> ShareHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ShareState::Running);
        let name = share.name().to_string();

        let engine = Self {
            share,
            watcher,
            events,
            commands: command_rx,
            stop_rx,
            state_tx,
            context,
            transfers: HashMap::new(),
            adverts: VecDeque::new(),
            local_changes: HashSet::new(),
        };
        let task = tokio::spawn(engine.run());

        ShareHandle {
            name,
            commands: command_tx,
            stop_tx,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) {
        info!("[{}] share engine starting at {}", self.share.name(), self.share.root().display());
        if let Err(e) = self.initial_scan().await {
            error!("[{}] initial scan failed: {}", self.share.name(), e);
        }

        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut advert_pace = interval(ADVERT_PACE);
        advert_pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => break,
                Some(event) = self.events.recv() => {
                    if let Err(e) = self.handle_local_event(event).await {
                        warn!("[{}] local change not propagated: {}", self.share.name(), e);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = advert_pace.tick(), if !self.adverts.is_empty() => self.advertise_batch().await,
                _ = housekeeping.tick() => self.housekeeping().await,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.state_tx.send_replace(ShareState::Stopping);
        info!("[{}] share engine stopping", self.share.name());

        let leaving = Message::share(self.share.name(), ShareAction::Leaving);
        for member in self.share.members() {
            if let Err(e) = member.try_send(leaving.clone()) {
                debug!("[{}] leave notice to {} not sent: {}", self.share.name(), member.identity().short(), e);
            }
        }
        self.share.clear_members();
        self.adverts.clear();
        let pending: Vec<String> = self.transfers.keys().cloned().collect();
        for path in pending {
            self.abandon_transfer(&path).await;
        }
        self.watcher.release();

        self.state_tx.send_replace(ShareState::Stopped);
        info!("[{}] share engine stopped", self.share.name());
    }

    /// Watch every directory and pick up changes made while the node was down.
    async fn initial_scan(&mut self) -> Result<(), ShareError> {
        self.watcher.add_watch(self.share.root())?;

        let cleared = self.share.clear_partials().await?;
        if cleared > 0 {
            info!("[{}] removed {} unfinished transfer(s)", self.share.name(), cleared);
        }

        let entries = self.share.scan(None).await?;
        let mut present = HashSet::new();
        for entry in &entries {
            present.insert(entry.path.clone());
            if entry.is_directory {
                self.watcher.add_watch(&self.share.resolve(&entry.path)?)?;
                if !self.share.is_known(&entry.path)? {
                    self.share.record(&entry.path, None).await?;
                }
            } else if let Err(e) = self.refresh_file(&entry.path).await {
                warn!("[{}] cannot check {}: {}", self.share.name(), entry.path, e);
            }
        }

        for path in self.share.known_paths()? {
            if !present.contains(&path) {
                debug!("[{}] {} disappeared while offline", self.share.name(), path);
                self.share.forget(&path)?;
            }
        }

        info!(
            "[{}] {} entries, {} watched directories",
            self.share.name(),
            entries.len(),
            self.watcher.watched_paths()
        );
        Ok(())
    }

    async fn refresh_file(&mut self, path: &str) -> Result<(), ShareError> {
        if !self.share.check_shallow(path).await? {
            return Ok(());
        }
        let known = self.share.stored_digest(path)?.is_some();
        let (changed, digest) = self.share.check_deep(path).await?;
        if changed && known {
            debug!("[{}] {} changed while offline", self.share.name(), path);
            self.local_changes.insert(path.to_string());
        }
        self.share.record(path, Some(digest)).await
    }

    async fn housekeeping(&mut self) {
        self.share.prune_dead_members();

        let stalled: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, transfer)| transfer.last_activity.elapsed() >= TRANSFER_IDLE_LIMIT)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stalled {
            warn!("[{}] abandoning stalled transfer of {}", self.share.name(), path);
            self.abandon_transfer(&path).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Deliver(message) => {
                let kind = message.payload().kind();
                if let Err(e) = self.handle_remote(message).await {
                    warn!("[{}] failed to apply remote {} message: {}", self.share.name(), kind, e);
                }
            }
            Command::AddMember(session) => {
                self.share.add_member(session);
            }
            Command::RemoveMember(fingerprint) => {
                self.share.remove_member(&fingerprint);
                self.forget_member(&fingerprint).await;
            }
        }
    }

    async fn handle_remote(&mut self, message: Message) -> Result<(), ShareError> {
        let sender = message.sender().cloned();

        match message.into_payload() {
            Payload::Peer(advert) => {
                self.handle_peer_advert(advert);
                Ok(())
            }
            Payload::Share(share_message) => {
                let Some(sender) = sender else {
                    return Ok(());
                };
                match share_message.action {
                    ShareAction::Entering => self.handle_entering(&sender).await,
                    ShareAction::Leaving => {
                        info!("[{}] {} left", self.share.name(), sender.short());
                        self.share.remove_member(&sender.fingerprint);
                        self.forget_member(&sender.fingerprint).await;
                        Ok(())
                    }
                }
            }
            payload => {
                let Some(sender) = sender.filter(|s| self.share.is_member(&s.fingerprint)) else {
                    debug!("[{}] discarding {} message from a non-member", self.share.name(), payload.kind());
                    return Ok(());
                };
                match payload {
                    Payload::File(change) => self.apply_file_change(&sender, change).await,
                    Payload::ChunkRequest(request) => self.serve_chunk(&sender, request).await,
                    Payload::ChunkData(chunk) => self.receive_chunk(&sender, chunk).await,
                    Payload::Peer(_) | Payload::Share(_) => Ok(()),
                }
            }
        }
    }

    async fn handle_entering(&mut self, sender: &PeerIdentity) -> Result<(), ShareError> {
        let Some(session) = self.context.registry.get(&sender.fingerprint) else {
            warn!("[{}] {} entered without a live session", self.share.name(), sender.short());
            return Ok(());
        };
        if !self.share.add_member(session) {
            return Ok(());
        }
        info!("[{}] {} entered", self.share.name(), sender.short());

        let entering = Message::share(self.share.name(), ShareAction::Entering);
        if !self.share.send_to(&sender.fingerprint, entering).await {
            return Ok(());
        }

        let entries = self.share.scan(None).await?;
        self.adverts.retain(|advert| advert.fingerprint != sender.fingerprint);
        self.adverts.push_back(Advert {
            fingerprint: sender.fingerprint.clone(),
            entries: entries.into(),
            sent: 0,
        });
        Ok(())
    }

    /// Announce the next few entries of the oldest pending advertisement.
    /// A full outbound queue leaves the rest for a later step.
    async fn advertise_batch(&mut self) {
        let Some(mut advert) = self.adverts.pop_front() else {
            return;
        };

        let mut batch = 0;
        while batch < ADVERT_BATCH {
            let Some(entry) = advert.entries.front().cloned() else {
                break;
            };
            let message = match self.advert_message(&entry).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    advert.entries.pop_front();
                    continue;
                }
                Err(e) => {
                    warn!("[{}] cannot advertise {}: {}", self.share.name(), entry.path, e);
                    advert.entries.pop_front();
                    continue;
                }
            };

            match self.share.try_send_to(&advert.fingerprint, message) {
                Ok(()) => {
                    advert.entries.pop_front();
                    advert.sent += 1;
                    batch += 1;
                }
                Err(SessionError::QueueFull) => break,
                Err(_) => return,
            }
        }

        if advert.entries.is_empty() {
            debug!("[{}] advertised {} entries", self.share.name(), advert.sent);
        } else {
            self.adverts.push_back(advert);
        }
    }

    async fn advert_message(&self, entry: &Entry) -> Result<Option<Message>, ShareError> {
        let name = self.share.name();
        if entry.is_directory {
            return Ok(Some(Message::file(name, &entry.path, true, FileAction::Created, None)));
        }
        if self.transfers.contains_key(&entry.path) {
            return Ok(None);
        }

        let digest = match self.share.stored_digest(&entry.path)? {
            Some(digest) => digest,
            None => self.share.digest(&entry.path).await?,
        };
        let action = if self.local_changes.contains(&entry.path) {
            FileAction::Updated
        } else {
            FileAction::Created
        };
        Ok(Some(Message::file(name, &entry.path, false, action, Some(digest))))
    }

    fn handle_peer_advert(&self, advert: PeerMessage) {
        if !advert.share_names.iter().any(|name| name == self.share.name()) {
            return;
        }
        let Some(fingerprint) = self.context.known_peers.get(&advert.peer_name) else {
            debug!("[{}] ignoring advert for unknown peer {}", self.share.name(), advert.peer_name);
            return;
        };
        if self.context.registry.is_connected(fingerprint) {
            return;
        }
        let Some(dial_requests) = &self.context.dial_requests else {
            return;
        };

        let target = PeerInfo {
            address: advert.address,
            port: advert.port,
            fingerprint: fingerprint.clone(),
        };
        info!("[{}] requesting connection to {} at {}:{}", self.share.name(), advert.peer_name, target.address, target.port);
        if let Err(e) = dial_requests.try_send(target) {
            warn!("[{}] dial request for {} dropped: {}", self.share.name(), advert.peer_name, e);
        }
    }

    async fn apply_file_change(&mut self, sender: &PeerIdentity, change: FileMessage) -> Result<(), ShareError> {
        let filename = change.filename.as_str();
        if share::is_partial(filename) {
            debug!("[{}] ignoring change to transfer file {}", self.share.name(), filename);
            return Ok(());
        }

        match (change.action, change.is_directory) {
            (FileAction::Removed, _) => {
                self.abandon_transfer(filename).await;
                self.local_changes.remove(filename);
                let path = self.share.resolve(filename)?;
                self.watcher.remove_watch(&path)?;
                if self.share.remove(filename).await? {
                    info!("[{}] removed {} (from {})", self.share.name(), filename, sender.short());
                }
            }
            (_, true) => {
                self.ensure_directory(filename).await?;
            }
            (FileAction::Created, false) => {
                self.ensure_parents(filename).await?;
                if self.transfers.contains_key(filename) || self.share.file_exists(filename).await? {
                    return Ok(());
                }

                match change.hash {
                    Some(remote) if remote != crypto::hash_bytes(&[]) => {
                        self.start_pull(&sender.fingerprint, filename, Some(remote)).await;
                    }
                    _ => {
                        self.share.create_file(filename).await?;
                        let local = self.share.digest(filename).await?;
                        self.share.record(filename, Some(local)).await?;
                        info!("[{}] created {} (from {})", self.share.name(), filename, sender.short());
                    }
                }
            }
            (FileAction::Updated, false) => {
                self.ensure_parents(filename).await?;
                let local = if self.share.file_exists(filename).await? {
                    Some(self.share.digest(filename).await?)
                } else {
                    None
                };

                match local {
                    Some(local) if change.hash == Some(local) => {
                        debug!("[{}] {} already up to date", self.share.name(), filename);
                        self.local_changes.remove(filename);
                        self.share.record(filename, Some(local)).await?;
                    }
                    _ => self.start_pull(&sender.fingerprint, filename, change.hash).await,
                }
            }
        }
        Ok(())
    }

    /// Create, watch and record a directory.
    async fn ensure_directory(&mut self, relative: &str) -> Result<(), ShareError> {
        let created = self.share.create_directory(relative).await?;
        self.watcher.add_watch(&self.share.resolve(relative)?)?;
        if created || !self.share.is_known(relative)? {
            self.share.record(relative, None).await?;
        }
        Ok(())
    }

    async fn ensure_parents(&mut self, relative: &str) -> Result<(), ShareError> {
        let parts: Vec<&str> = relative.split('/').collect();
        for depth in 1..parts.len() {
            let parent = parts[..depth].join("/");
            self.ensure_directory(&parent).await?;
        }
        Ok(())
    }

    async fn start_pull(&mut self, source: &str, filename: &str, expected: Option<Digest>) {
        if let Err(e) = self.share.discard_partial(filename).await {
            warn!("[{}] cannot pull {}: {}", self.share.name(), filename, e);
            return;
        }
        self.transfers.insert(
            filename.to_string(),
            Transfer {
                source: source.to_string(),
                expected,
                next_index: 0,
                last_activity: Instant::now(),
            },
        );

        info!("[{}] pulling {}", self.share.name(), filename);
        if !self.request_chunk(source, filename, 0).await {
            self.abandon_transfer(filename).await;
        }
    }

    async fn request_chunk(&mut self, source: &str, filename: &str, index: u64) -> bool {
        let request = Message::new(Payload::ChunkRequest(ChunkRequest {
            share_name: self.share.name().to_string(),
            filename: filename.to_string(),
            index,
        }));
        self.share.send_to(source, request).await
    }

    async fn serve_chunk(&mut self, sender: &PeerIdentity, request: ChunkRequest) -> Result<(), ShareError> {
        let (data, total_size) = self.share.read_chunk(&request.filename, request.index).await?;
        debug!(
            "[{}] serving chunk {} of {} to {}",
            self.share.name(),
            request.index,
            request.filename,
            sender.short()
        );

        let reply = Message::new(Payload::ChunkData(ChunkData {
            share_name: self.share.name().to_string(),
            filename: request.filename,
            index: request.index,
            total_size,
            data,
        }));
        self.share.send_to(&sender.fingerprint, reply).await;
        Ok(())
    }

    async fn receive_chunk(&mut self, sender: &PeerIdentity, chunk: ChunkData) -> Result<(), ShareError> {
        let expected = match self.transfers.get(&chunk.filename) {
            Some(transfer) if transfer.source == sender.fingerprint && transfer.next_index == chunk.index => {
                transfer.expected
            }
            _ => {
                debug!(
                    "[{}] ignoring unsolicited chunk {} of {}",
                    self.share.name(),
                    chunk.index,
                    chunk.filename
                );
                return Ok(());
            }
        };

        if let Err(e) = self.share.write_partial(&chunk.filename, chunk.index, &chunk.data).await {
            self.abandon_transfer(&chunk.filename).await;
            return Err(e);
        }

        let end = chunk.index * CHUNK_SIZE as u64 + chunk.data.len() as u64;
        if end >= chunk.total_size || chunk.data.len() < CHUNK_SIZE {
            self.transfers.remove(&chunk.filename);
            return self.finish_pull(&chunk.filename, chunk.total_size, expected).await;
        }

        let next_index = chunk.index + 1;
        if let Some(transfer) = self.transfers.get_mut(&chunk.filename) {
            transfer.next_index = next_index;
            transfer.last_activity = Instant::now();
        }
        if !self.request_chunk(&sender.fingerprint, &chunk.filename, next_index).await {
            self.abandon_transfer(&chunk.filename).await;
        }
        Ok(())
    }

    async fn finish_pull(&mut self, filename: &str, total_size: u64, expected: Option<Digest>) -> Result<(), ShareError> {
        let committed = match self.share.commit_partial(filename, total_size, expected).await {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(discard) = self.share.discard_partial(filename).await {
                    debug!("[{}] partial file of {} not removed: {}", self.share.name(), filename, discard);
                }
                return Err(e);
            }
        };

        match committed {
            Some(digest) => {
                self.share.record(filename, Some(digest)).await?;
                self.local_changes.remove(filename);
                info!("[{}] received {} ({} bytes)", self.share.name(), filename, total_size);
            }
            None => warn!(
                "[{}] discarded {}: content changed at its source during transfer",
                self.share.name(),
                filename
            ),
        }
        Ok(())
    }

    /// Drop a pending transfer and its partial file.
    async fn abandon_transfer(&mut self, filename: &str) {
        if self.transfers.remove(filename).is_none() {
            return;
        }
        if let Err(e) = self.share.discard_partial(filename).await {
            warn!("[{}] partial file of {} not removed: {}", self.share.name(), filename, e);
        }
    }

    /// Forget transfers and advertisements involving a departed member.
    async fn forget_member(&mut self, fingerprint: &str) {
        self.adverts.retain(|advert| advert.fingerprint != fingerprint);
        let sourced: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, transfer)| transfer.source == fingerprint)
            .map(|(path, _)| path.clone())
            .collect();
        for path in sourced {
            self.abandon_transfer(&path).await;
        }
    }

    async fn handle_local_event(&mut self, event: FsEvent) -> Result<(), ShareError> {
        let Some(relative) = self.share.relative(&event.path) else {
            return Ok(());
        };
        if self.transfers.contains_key(&relative) {
            debug!("[{}] {} is being received, ignoring {:?}", self.share.name(), relative, event.kind);
            return Ok(());
        }

        match tokio::fs::symlink_metadata(&event.path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => self.handle_local_removal(&relative).await,
            Err(e) => Err(e.into()),
            Ok(meta) if meta.is_dir() => {
                if self.share.is_known(&relative)? {
                    return Ok(());
                }
                self.handle_new_directory(&relative).await
            }
            Ok(meta) if meta.is_file() => {
                if share::is_partial(&relative) {
                    return Ok(());
                }
                self.handle_local_file(&relative).await
            }
            Ok(_) => Ok(()),
        }
    }

    async fn handle_local_removal(&mut self, relative: &str) -> Result<(), ShareError> {
        if !self.share.is_known(relative)? {
            return Ok(());
        }
        // Only files have a recorded digest.
        let is_directory = self.share.stored_digest(relative)?.is_none();

        self.share.forget(relative)?;
        self.local_changes.remove(relative);
        self.watcher.remove_watch(&self.share.resolve(relative)?)?;
        info!("[{}] {} removed locally", self.share.name(), relative);

        self.share
            .broadcast(Message::file(self.share.name(), relative, is_directory, FileAction::Removed, None))
            .await;
        Ok(())
    }

    async fn handle_new_directory(&mut self, relative: &str) -> Result<(), ShareError> {
        self.announce_directory(relative).await?;

        for entry in self.share.scan(Some(relative)).await? {
            if entry.is_directory {
                if !self.share.is_known(&entry.path)? {
                    self.announce_directory(&entry.path).await?;
                }
            } else if let Err(e) = self.handle_local_file(&entry.path).await {
                warn!("[{}] cannot check {}: {}", self.share.name(), entry.path, e);
            }
        }
        Ok(())
    }

    async fn announce_directory(&mut self, relative: &str) -> Result<(), ShareError> {
        self.watcher.add_watch(&self.share.resolve(relative)?)?;
        self.share.record(relative, None).await?;
        info!("[{}] directory {} created locally", self.share.name(), relative);

        self.share
            .broadcast(Message::file(self.share.name(), relative, true, FileAction::Created, None))
            .await;
        Ok(())
    }

    async fn handle_local_file(&mut self, relative: &str) -> Result<(), ShareError> {
        if self.transfers.contains_key(relative) {
            return Ok(());
        }
        if !self.share.check_shallow(relative).await? {
            return Ok(());
        }

        let known = self.share.stored_digest(relative)?.is_some();
        let (changed, digest) = self.share.check_deep(relative).await?;
        if !changed {
            // Touched but identical content.
            return self.share.record(relative, Some(digest)).await;
        }

        let action = if known {
            self.local_changes.insert(relative.to_string());
            FileAction::Updated
        } else {
            FileAction::Created
        };
        info!("[{}] {} {:?} locally", self.share.name(), relative, action);
        self.share
            .broadcast(Message::file(self.share.name(), relative, false, action, Some(digest)))
            .await;
        self.share.record(relative, Some(digest)).await
    }
}
