use async_trait::async_trait;
use conveyor::{Error, Message, MessageRef, Metadata, Source, SourceContext};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Source yielding a fixed list of messages, then ending.
pub struct VecSource {
    items: VecDeque<Message>,
    stopped: bool,
}

impl VecSource {
    pub fn new(items: Vec<Message>) -> Self {
        VecSource {
            items: items.into(),
            stopped: false,
        }
    }
}

#[async_trait]
impl Source for VecSource {
    async fn read(&mut self) -> Result<MessageRef, Error> {
        if self.stopped {
            return Err(Error::EndOfInput);
        }
        match self.items.pop_front() {
            Some(message) => Ok(MessageRef::new(message, Metadata::new())),
            None => Err(Error::EndOfInput),
        }
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.stopped = true;
        Ok(())
    }
}

/// Source that yields its items, then waits for a trigger, evicts every
/// queued reference, and ends.
pub struct EvictingSource {
    items: VecDeque<Message>,
    trigger: Option<oneshot::Receiver<()>>,
    ctx: Option<SourceContext>,
}

impl EvictingSource {
    pub fn new(items: Vec<Message>, trigger: oneshot::Receiver<()>) -> Self {
        EvictingSource {
            items: items.into(),
            trigger: Some(trigger),
            ctx: None,
        }
    }
}

#[async_trait]
impl Source for EvictingSource {
    async fn start(&mut self, ctx: SourceContext) -> Result<(), Error> {
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read(&mut self) -> Result<MessageRef, Error> {
        if let Some(message) = self.items.pop_front() {
            return Ok(MessageRef::new(message, Metadata::new()));
        }
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.await;
            if let Some(ctx) = &self.ctx {
                ctx.evict(|_| true).await;
            }
        }
        Err(Error::EndOfInput)
    }
}
