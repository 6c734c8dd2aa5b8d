//! Job control from signals.

use avocado_workers::scheduler::SchedulerCommand;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM, SIGTSTP};
use signal_hook_tokio::{Handle, Signals};
use tokio::sync::mpsc;

fn command_for(signal: i32) -> Option<SchedulerCommand> {
    match signal {
        SIGINT | SIGTERM => Some(SchedulerCommand::Interrupt),
        SIGTSTP => Some(SchedulerCommand::TogglePause),
        _ => None,
    }
}

/// Turns SIGINT and SIGTERM into interrupts and SIGTSTP into pause toggles
/// for the scheduler. Closing the returned handle stops the forwarding.
///
/// Must be called from within a tokio runtime.
pub fn forward_to_scheduler() -> std::io::Result<(Handle, mpsc::UnboundedReceiver<SchedulerCommand>)> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGTSTP])?;
    let handle = signals.handle();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            let Some(command) = command_for(signal) else {
                continue;
            };
            tracing::info!(signal, ?command, "job control signal");
            if tx.send(command).is_err() {
                break;
            }
        }
    });
    Ok((handle, rx))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signals_map_to_commands() {
        assert!(matches!(command_for(SIGINT), Some(SchedulerCommand::Interrupt)));
        assert!(matches!(command_for(SIGTERM), Some(SchedulerCommand::Interrupt)));
        assert!(matches!(command_for(SIGTSTP), Some(SchedulerCommand::TogglePause)));
        assert!(command_for(signal_hook::consts::SIGHUP).is_none());
    }
}
