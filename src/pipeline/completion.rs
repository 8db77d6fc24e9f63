//! Completion signals between pipeline stages.
//!
//! A [`CompletionSignal`] is held by the producing stage and fired once it
//! has finished successfully. The consuming stage awaits the paired
//! [`CompletionGate`] before starting. If the producer fails, the signal is
//! dropped unfired and the gate reports the upstream stage as incomplete.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};

use crate::error::StageError;

use super::{PipelineState, Stage};

/// Creates a signal/gate pair for the output of `stage`.
pub fn completion(stage: Stage) -> (CompletionSignal, CompletionGate) {
    let (tx, rx) = oneshot::channel();
    (
        CompletionSignal {
            stage,
            tx,
            notify: None,
        },
        CompletionGate { stage, rx },
    )
}

/// Producer side of a completion hand-off.
#[derive(Debug)]
pub struct CompletionSignal {
    stage: Stage,
    tx: oneshot::Sender<bool>,
    notify: Option<(Arc<watch::Sender<PipelineState>>, PipelineState)>,
}

impl CompletionSignal {
    /// Publishes `next` on `state` when the signal fires.
    pub fn on_fire(mut self, state: Arc<watch::Sender<PipelineState>>, next: PipelineState) -> Self {
        self.notify = Some((state, next));
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Marks the stage as finished.
    pub fn fire(self) {
        if let Some((state, next)) = &self.notify {
            state.send_replace(*next);
        }
        // The consumer may already be gone; that is its own failure.
        let _ = self.tx.send(true);
    }
}

/// Consumer side of a completion hand-off.
#[derive(Debug)]
pub struct CompletionGate {
    stage: Stage,
    rx: oneshot::Receiver<bool>,
}

impl CompletionGate {
    /// A gate that is already open, for running a stage on its own.
    pub fn open(stage: Stage) -> Self {
        let (signal, gate) = completion(stage);
        signal.fire();
        gate
    }

    /// The stage this gate waits for.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Waits until the upstream stage has fired its signal.
    pub async fn wait(self) -> Result<(), StageError> {
        match self.rx.await {
            Ok(true) => Ok(()),
            _ => Err(StageError::UpstreamIncomplete(self.stage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fired_signal_opens_gate() {
        let (signal, gate) = completion(Stage::Staging);
        signal.fire();
        assert!(gate.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_signal_closes_gate() {
        let (signal, gate) = completion(Stage::Executing);
        drop(signal);
        let err = gate.wait().await.unwrap_err();
        assert!(matches!(err, StageError::UpstreamIncomplete(Stage::Executing)));
    }

    #[tokio::test]
    async fn test_fire_publishes_state() {
        let (tx, rx) = watch::channel(PipelineState::Staging);
        let (signal, gate) = completion(Stage::Staging);
        signal
            .on_fire(Arc::new(tx), PipelineState::Executing)
            .fire();
        gate.wait().await.unwrap();
        assert_eq!(*rx.borrow(), PipelineState::Executing);
    }

    #[tokio::test]
    async fn test_open_gate() {
        assert!(CompletionGate::open(Stage::Staging).wait().await.is_ok());
    }
}
