//! Hooks invoked around publish and processing.
//!
//! Hooks run in registration order. A hook that returns an error or panics
//! is logged and skipped; it never aborts the operation it observes.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use tracing::warn;

use crate::{
    message::{Message, PublishReceipt, Settlement},
    utils::panic_message,
};

pub trait Middleware: Send + Sync + 'static {
    fn before_publish(&self, _channel: &str, _payload: &[u8]) -> eyre::Result<()> {
        Ok(())
    }

    fn after_publish(&self, _channel: &str, _receipt: &PublishReceipt) -> eyre::Result<()> {
        Ok(())
    }

    fn before_process(&self, _message: &Message) -> eyre::Result<()> {
        Ok(())
    }

    /// Called once the message is settled, including when it was dead-lettered
    /// or skipped as a duplicate.
    fn after_process(&self, _message: &Message, _settlement: &Settlement) -> eyre::Result<()> {
        Ok(())
    }

    fn on_error(&self, _message: &Message, _error: &eyre::Report) -> eyre::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Pipeline {
    hooks: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Pipeline {
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(middleware);
    }

    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn each(&self, hook: &'static str, f: impl Fn(&dyn Middleware) -> eyre::Result<()>) {
        for middleware in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| f(middleware.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(hook, error = %error, "middleware hook failed"),
                Err(panic) => warn!(
                    hook,
                    panic = panic_message(&*panic),
                    "middleware hook panicked"
                ),
            }
        }
    }

    pub fn before_publish(&self, channel: &str, payload: &[u8]) {
        self.each("before_publish", |m| m.before_publish(channel, payload));
    }

    pub fn after_publish(&self, channel: &str, receipt: &PublishReceipt) {
        self.each("after_publish", |m| m.after_publish(channel, receipt));
    }

    pub fn before_process(&self, message: &Message) {
        self.each("before_process", |m| m.before_process(message));
    }

    pub fn after_process(&self, message: &Message, settlement: &Settlement) {
        self.each("after_process", |m| m.after_process(message, settlement));
    }

    pub fn on_error(&self, message: &Message, error: &eyre::Report) {
        self.each("on_error", |m| m.on_error(message, error));
    }
}
