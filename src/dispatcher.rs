//! # Dispatcher
//!
//! Multicasts every inbound message to all registered handlers. Handlers
//! receive messages in registration order, one hand-over at a time, and each
//! hand-over is bounded by a timeout so a stuck handler cannot stall the rest.
//! Each handler decides for itself whether a message concerns it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::message::Message;

/// Default upper bound on a single hand-over.
pub const DEFAULT_HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that accepts dispatched messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn hand_over(&self, message: Message) -> Result<(), DispatchError>;
}

type Registry = Vec<(String, Arc<dyn MessageHandler>)>;

pub struct Dispatcher {
    handlers: Arc<RwLock<Registry>>,
    handover_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HANDOVER_TIMEOUT)
    }
}

impl Dispatcher {
    pub fn new(handover_timeout: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            handover_timeout,
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Register a handler under a unique name. Waits for an in-progress
    /// fan-out to finish.
    pub async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write().await;
        if handlers.iter().any(|(existing, _)| existing == name) {
            return Err(DispatchError::AlreadyRegistered(name.to_string()));
        }
        handlers.push((name.to_string(), handler));
        debug!("Registered handler {}", name);
        Ok(())
    }

    pub async fn remove_handler(&self, name: &str) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write().await;
        let position = handlers
            .iter()
            .position(|(existing, _)| existing == name)
            .ok_or_else(|| DispatchError::NotRegistered(name.to_string()))?;
        handlers.remove(position);
        debug!("Removed handler {}", name);
        Ok(())
    }

    pub async fn handler_names(&self) -> Vec<String> {
        self.handlers.read().await.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Start consuming `input`. A dispatcher runs at most once.
    pub async fn start(&self, mut input: mpsc::Receiver<Message>) -> Result<(), DispatchError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let handlers = self.handlers.clone();
        let handover_timeout = self.handover_timeout;
        let mut stop_rx = self.stop_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            info!("Dispatcher running");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let message = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    message = input.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                fan_out(&handlers, message, handover_timeout).await;
            }
            info!("Dispatcher stopped");
        }));
        Ok(())
    }

    /// Signal the loop to exit after the current fan-out and wait for it.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn fan_out(handlers: &RwLock<Registry>, message: Message, handover_timeout: Duration) {
    let handlers = handlers.read().await;
    for (name, handler) in handlers.iter() {
        match timeout(handover_timeout, handler.hand_over(message.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Handler {} rejected {} message: {}", name, message.payload().kind(), e),
            Err(_) => warn!(
                "Handler {} timed out accepting {} message, dropped",
                name,
                message.payload().kind()
            ),
        }
    }
}
