//! Propagation of a graceful-termination request into a running runner.

use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::watch;

/// Observes whether termination was requested.
#[derive(Clone)]
pub struct Interrupt(watch::Receiver<bool>);

/// Requests termination of everything watching the paired [Interrupt].
pub struct InterruptTrigger(watch::Sender<bool>);

impl Interrupt {
    pub fn pair() -> (InterruptTrigger, Interrupt) {
        let (tx, rx) = watch::channel(false);
        (InterruptTrigger(tx), Interrupt(rx))
    }

    /// An interrupt that never fires.
    pub fn never() -> Interrupt {
        Self::pair().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once termination is requested; pends forever otherwise.
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // The trigger is gone without firing.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl InterruptTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Fires the returned interrupt on SIGTERM or SIGINT.
///
/// Must be called from within a tokio runtime.
pub fn on_termination_signals() -> std::io::Result<Interrupt> {
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let (trigger, interrupt) = Interrupt::pair();
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "termination requested");
            trigger.trigger();
        }
        // Keep the handler registered so later signals do not kill the runner
        // while it waits for its test to wind down.
        while signals.next().await.is_some() {}
    });
    Ok(interrupt)
}
