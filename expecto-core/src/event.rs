//! Process-wide stream of step events consumed by reporters.
use eyre::WrapErr;
use once_cell::sync::Lazy;
use std::{ops::Deref, sync::Mutex};
use tokio::sync::broadcast;

use crate::{
    mode::StepMode,
    step::{Attachment, Check, StepId, StepRecord},
};

pub static CHANNEL: Lazy<Mutex<Option<broadcast::Sender<Event>>>> =
    Lazy::new(|| Mutex::new(Some(broadcast::channel(1000).0)));

#[derive(Debug, Clone)]
pub enum Event {
    StepStart {
        id: StepId,
        parent: Option<StepId>,
        name: String,
        mode: Option<StepMode>,
    },
    Check {
        id: StepId,
        check: Check,
    },
    Log {
        id: StepId,
        message: String,
    },
    Attachment {
        id: StepId,
        attachment: Attachment,
    },
    StepEnd {
        id: StepId,
        parent: Option<StepId>,
        record: Box<StepRecord>,
    },
}

impl Event {
    pub fn step_id(&self) -> StepId {
        match self {
            Event::StepStart { id, .. }
            | Event::Check { id, .. }
            | Event::Log { id, .. }
            | Event::Attachment { id, .. }
            | Event::StepEnd { id, .. } => *id,
        }
    }
}

/// Publish an event. Nothing happens while no reporter is subscribed.
pub fn publish(msg: Event) -> eyre::Result<()> {
    let Ok(guard) = CHANNEL.lock() else {
        eyre::bail!("failed to acquire event channel lock");
    };
    let Some(tx) = guard.deref() else {
        eyre::bail!("event channel has been already closed");
    };
    if tx.receiver_count() == 0 {
        return Ok(());
    }

    tx.send(msg)
        .wrap_err("failed to publish message to the event channel")?;

    Ok(())
}

/// Subscribe to the channel to see step events in real time.
pub fn subscribe() -> eyre::Result<broadcast::Receiver<Event>> {
    let Ok(guard) = CHANNEL.lock() else {
        eyre::bail!("failed to acquire event channel lock");
    };
    let Some(tx) = guard.deref() else {
        eyre::bail!("event channel has been already closed");
    };

    Ok(tx.subscribe())
}

/// Close the channel. Running reporters drain the remaining events and stop.
pub fn close() -> eyre::Result<()> {
    let Ok(mut guard) = CHANNEL.lock() else {
        eyre::bail!("failed to acquire event channel lock");
    };
    guard.take();
    Ok(())
}
