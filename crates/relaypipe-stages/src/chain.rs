//! Chain: an ordered stack of stages, interface first.
//!
//! The chain owns its stages and is the application's handle on them:
//! transmit goes in at the top, delivered messages and faults come out of
//! the top stage's event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relaypipe_core::ByteMessage;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::stage::{Fault, Stage, StageError, StageEvent};

pub struct Chain {
    stages: Vec<Arc<dyn Stage>>,
    disposed: AtomicBool,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Stack `stage` on top of the chain.
    ///
    /// The first stage must be an interface. Every later stage becomes the
    /// upward neighbor of the current top; a non-interface stage also takes
    /// the current top as its downward neighbor.
    pub fn add(&mut self, stage: Arc<dyn Stage>) -> Result<(), StageError> {
        match self.stages.last() {
            None => {
                if !stage.is_interface() {
                    return Err(StageError::InvalidTopology(format!(
                        "first stage {} is not an interface",
                        stage.name()
                    )));
                }
            }
            Some(top) => {
                top.attach_upward(&stage, false)?;
                if !stage.is_interface() {
                    if let Err(e) = stage.attach_downward(top.clone(), false) {
                        top.core().detach_upward();
                        return Err(e);
                    }
                }
            }
        }
        tracing::debug!(stage = stage.name(), depth = self.stages.len(), "stage added");
        self.stages.push(stage);
        Ok(())
    }

    /// Builder form of [`add`](Self::add).
    pub fn with(mut self, stage: Arc<dyn Stage>) -> Result<Self, StageError> {
        self.add(stage)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn interface(&self) -> Option<&Arc<dyn Stage>> {
        self.stages.first()
    }

    pub fn top(&self) -> Option<&Arc<dyn Stage>> {
        self.stages.last()
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Start every stage's workers, interface first.
    pub fn start(&self) -> Result<(), StageError> {
        for stage in &self.stages {
            stage.clone().start()?;
        }
        tracing::info!(
            stages = self.stages.len(),
            top = self.top().map(|s| s.name()).unwrap_or(""),
            "chain started"
        );
        Ok(())
    }

    pub fn transmit(&self, msg: ByteMessage) -> Result<(), StageError> {
        self.top_stage()?.transmit(msg)
    }

    /// Events of the top stage. Subscribe after the chain is fully built:
    /// stages added later are not covered.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<StageEvent>, StageError> {
        Ok(self.top_stage()?.core().subscribe())
    }

    /// Delivered messages only, in arrival order.
    pub fn messages(&self) -> Result<MessageStream, StageError> {
        Ok(MessageStream {
            events: self.subscribe()?,
        })
    }

    /// Drain faults raised anywhere in the chain.
    pub fn take_exceptions(&self) -> Vec<Fault> {
        self.top()
            .map(|s| s.core().take_exceptions())
            .unwrap_or_default()
    }

    pub fn is_broken(&self) -> bool {
        self.stages.iter().any(|s| s.is_broken())
    }

    pub fn reset(&self) {
        for stage in &self.stages {
            stage.core().reset();
        }
    }

    /// Shut every stage down, interface first. Only the first call has an
    /// effect; dropping the chain disposes it too.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for stage in &self.stages {
            stage.shutdown();
        }
        tracing::info!(stages = self.stages.len(), "chain disposed");
    }

    /// Wait until every stage's background tasks have finished and their
    /// OS handles are released. Call after [`dispose`](Self::dispose).
    pub async fn closed(&self) {
        for stage in &self.stages {
            for task in stage.take_tasks() {
                let _ = task.await;
            }
        }
    }

    fn top_stage(&self) -> Result<&Arc<dyn Stage>, StageError> {
        self.top()
            .ok_or_else(|| StageError::InvalidTopology("chain is empty".into()))
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Stream of the messages delivered out of the top of a chain.
pub struct MessageStream {
    events: broadcast::Receiver<StageEvent>,
}

impl MessageStream {
    /// Next delivered message, or `None` once the top stage is gone.
    /// Messages lost to a lagging receiver are skipped with a warning.
    pub async fn next(&mut self) -> Option<ByteMessage> {
        loop {
            match self.events.recv().await {
                Ok(StageEvent::MessageAvailable(msg)) => return Some(msg),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "message stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
