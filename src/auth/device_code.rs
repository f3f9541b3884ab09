// Device code flow controller
// The acquisition runs in its own task while the caller drains a one-shot message channel

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::provider::DeviceCodeCallback;
use super::types::TokenResult;
use crate::error::{AuthError, Result};

/// Lifecycle of one device code flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    CodeIssued,
    Polling,
    Succeeded,
    TimedOut,
    Cancelled,
    Failed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Succeeded | FlowState::TimedOut | FlowState::Cancelled | FlowState::Failed
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceCodeSendError {
    #[error("device code message channel is closed")]
    Closed,
}

/// Create a channel that carries at most one verification message
pub fn device_code_channel() -> (DeviceCodeSender, DeviceCodeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        DeviceCodeSender {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        DeviceCodeReceiver { rx },
    )
}

/// Sending half; the first send closes the channel for every clone
#[derive(Clone, Debug)]
pub struct DeviceCodeSender {
    slot: Arc<Mutex<Option<mpsc::Sender<String>>>>,
}

impl DeviceCodeSender {
    pub fn send(&self, message: String) -> std::result::Result<(), DeviceCodeSendError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DeviceCodeSendError::Closed)?;
        sender
            .try_send(message)
            .map_err(|_| DeviceCodeSendError::Closed)
    }

    pub fn close(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug)]
pub struct DeviceCodeReceiver {
    rx: mpsc::Receiver<String>,
}

impl DeviceCodeReceiver {
    /// Wait for the message; `None` once the channel is closed or `cancel` fires
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}

/// What a running flow exposes to the credential callback
#[derive(Clone, Debug)]
pub struct FlowReporter {
    sender: DeviceCodeSender,
    state: Arc<watch::Sender<FlowState>>,
}

impl FlowReporter {
    pub fn report(&self, message: String) {
        match self.sender.send(message) {
            Ok(()) => {
                self.state.send_replace(FlowState::CodeIssued);
            }
            Err(e) => tracing::debug!("Device code message dropped: {}", e),
        }
    }

    pub fn callback(&self) -> DeviceCodeCallback {
        let reporter = self.clone();
        Arc::new(move |message| reporter.report(message))
    }
}

/// Routes a reused credential's callback to whichever flow is currently running
#[derive(Clone, Debug, Default)]
pub struct DeviceCodeRelay {
    target: Arc<Mutex<Option<FlowReporter>>>,
}

impl DeviceCodeRelay {
    pub fn attach(&self, reporter: FlowReporter) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(reporter);
    }

    pub fn callback(&self) -> DeviceCodeCallback {
        let relay = self.clone();
        Arc::new(move |message| {
            let target = relay
                .target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match target {
                Some(reporter) => reporter.report(message),
                None => tracing::warn!("Device code message received with no flow attached"),
            }
        })
    }
}

/// A device code login in progress
pub struct DeviceCodeFlow {
    messages: DeviceCodeReceiver,
    state: Arc<watch::Sender<FlowState>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<TokenResult>>,
}

impl DeviceCodeFlow {
    /// Spawn the acquisition built by `start`, handing it the reporter for its callback
    pub(crate) fn spawn<F, Fut>(cancel: CancellationToken, start: F) -> Self
    where
        F: FnOnce(FlowReporter) -> Fut,
        Fut: Future<Output = Result<TokenResult>> + Send + 'static,
    {
        let (sender, messages) = device_code_channel();
        let (state_tx, _) = watch::channel(FlowState::Idle);
        let state = Arc::new(state_tx);
        let reporter = FlowReporter {
            sender: sender.clone(),
            state: state.clone(),
        };

        let acquisition = start(reporter);
        let task_state = state.clone();
        let task = tokio::spawn(async move {
            let result = acquisition.await;
            // Nothing can be reported after the acquisition ends
            sender.close();
            task_state.send_replace(match &result {
                Ok(_) => FlowState::Succeeded,
                Err(AuthError::LoginTimedOut { .. }) => FlowState::TimedOut,
                Err(AuthError::Cancelled) => FlowState::Cancelled,
                Err(_) => FlowState::Failed,
            });
            result
        });

        Self {
            messages,
            state,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Next verification message; `None` when no more can arrive or the caller cancelled
    pub async fn next_message(&mut self) -> Option<String> {
        let message = self.messages.recv(&self.cancel).await;
        if message.is_some() {
            self.state.send_if_modified(|state| {
                if *state == FlowState::CodeIssued {
                    *state = FlowState::Polling;
                    true
                } else {
                    false
                }
            });
        }
        message
    }

    /// Wait for the acquisition to finish
    pub async fn finish(self) -> Result<TokenResult> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AuthError::Cancelled),
            Err(e) => Err(AuthError::Internal(anyhow::anyhow!(
                "Device code task failed: {}",
                e
            ))),
        }
    }

    /// Surface every message through `on_message`, then wait for the token
    pub async fn run(mut self, mut on_message: impl FnMut(&str)) -> Result<TokenResult> {
        while let Some(message) = self.next_message().await {
            on_message(&message);
        }
        self.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_exactly_one_message() {
        let (sender, mut receiver) = device_code_channel();
        let cancel = CancellationToken::new();

        assert_eq!(sender.send("first".to_string()), Ok(()));
        assert_eq!(
            sender.send("second".to_string()),
            Err(DeviceCodeSendError::Closed)
        );
        assert!(sender.is_closed());

        assert_eq!(receiver.recv(&cancel).await, Some("first".to_string()));
        assert_eq!(receiver.recv(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_clones_share_the_single_slot() {
        let (sender, mut receiver) = device_code_channel();
        let clone = sender.clone();

        assert!(clone.send("only".to_string()).is_ok());
        assert_eq!(
            sender.send("again".to_string()),
            Err(DeviceCodeSendError::Closed)
        );
        assert_eq!(
            receiver.recv(&CancellationToken::new()).await,
            Some("only".to_string())
        );
    }

    #[tokio::test]
    async fn test_receiver_stops_on_cancel() {
        let (_sender, mut receiver) = device_code_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(receiver.recv(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_relay_forwards_to_attached_flow() {
        let relay = DeviceCodeRelay::default();
        let callback = relay.callback();

        // Nothing attached yet, message is dropped
        callback("lost".to_string());

        let (sender, mut receiver) = device_code_channel();
        let (state, _) = watch::channel(FlowState::Idle);
        let state = Arc::new(state);
        relay.attach(FlowReporter {
            sender,
            state: state.clone(),
        });

        callback("code".to_string());
        assert_eq!(*state.borrow(), FlowState::CodeIssued);
        assert_eq!(
            receiver.recv(&CancellationToken::new()).await,
            Some("code".to_string())
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(FlowState::Succeeded.is_terminal());
        assert!(FlowState::TimedOut.is_terminal());
        assert!(!FlowState::Polling.is_terminal());
        assert!(!FlowState::Idle.is_terminal());
    }
}
