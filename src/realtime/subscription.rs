//! Long-lived subscription handle with explicit connection states.

use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ChangeFeed, RealtimeSync};
use crate::admission::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
  Connecting,
  Connected,
  /// Channel closed; a reconnect is scheduled
  Disconnected,
  /// Last connect or read failed. Final once reconnects are exhausted.
  Errored(String),
  /// Shut down through `disconnect()` or by dropping the handle
  Closed,
}

/// Handle to a running feed pump.
///
/// Reconnects follow `reconnect`: `max_retries` consecutive failures are
/// tolerated, with backoff between attempts. A successful connect resets the
/// count.
pub struct Subscription {
  state: watch::Receiver<SubscriptionState>,
  shutdown: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl Subscription {
  pub fn spawn<F>(mut feed: F, sync: Arc<RealtimeSync>, reconnect: RetryConfig) -> Self
  where
    F: ChangeFeed + 'static,
  {
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      let mut failures: u32 = 0;
      loop {
        state_tx.send_replace(SubscriptionState::Connecting);
        let connected = tokio::select! {
          _ = &mut shutdown_rx => break,
          result = feed.connect() => result,
        };

        match connected {
          Ok(()) => {
            failures = 0;
            state_tx.send_replace(SubscriptionState::Connected);
            info!("Realtime subscription connected");
            loop {
              let next = tokio::select! {
                _ = &mut shutdown_rx => {
                  state_tx.send_replace(SubscriptionState::Closed);
                  return;
                }
                next = feed.next() => next,
              };
              match next {
                Ok(Some(event)) => {
                  if let Err(e) = sync.handle(event) {
                    warn!(error = %e, "Dropping unusable change event");
                  }
                }
                Ok(None) => {
                  state_tx.send_replace(SubscriptionState::Disconnected);
                  break;
                }
                Err(e) => {
                  warn!(error = %e, "Realtime channel error");
                  state_tx.send_replace(SubscriptionState::Errored(e.to_string()));
                  break;
                }
              }
            }
          }
          Err(e) => {
            warn!(error = %e, attempt = failures + 1, "Realtime connect failed");
            state_tx.send_replace(SubscriptionState::Errored(e.to_string()));
          }
        }

        if failures >= reconnect.max_retries {
          warn!(attempts = failures + 1, "Giving up on realtime subscription");
          let closed_cleanly = *state_tx.borrow() == SubscriptionState::Disconnected;
          if closed_cleanly {
            state_tx.send_replace(SubscriptionState::Errored("channel closed".into()));
          }
          return;
        }
        let delay = reconnect.backoff_duration(failures);
        failures += 1;
        tokio::select! {
          _ = &mut shutdown_rx => break,
          _ = tokio::time::sleep(delay) => {}
        }
      }
      state_tx.send_replace(SubscriptionState::Closed);
    });

    Self {
      state: state_rx,
      shutdown: Some(shutdown_tx),
      task,
    }
  }

  pub fn state(&self) -> SubscriptionState {
    self.state.borrow().clone()
  }

  /// Watch state transitions.
  pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
    self.state.clone()
  }

  /// Whether the pump has stopped, by request or after giving up.
  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Stop the pump and wait for it to exit.
  pub async fn disconnect(mut self) -> SubscriptionState {
    if let Some(shutdown) = self.shutdown.take() {
      // Already exited if the receiver is gone
      let _ = shutdown.send(());
    }
    if let Err(e) = (&mut self.task).await {
      warn!(error = %e, "Realtime task ended abnormally");
    }
    self.state()
  }
}
