//! Operator interrupt handling.
//!
//! SIGINT and SIGTERM set a shared flag. The watchdog checks it once per
//! poll, terminates the local processes and reports the job as interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install the signal handler and return the flag it sets.
///
/// Can only succeed once per process.
pub fn install_interrupt_flag() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("second interrupt received, termination already in progress");
        } else {
            tracing::info!("interrupt received, stopping local processes");
        }
    })?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_handler_is_single_use() {
        let flag = install_interrupt_flag().unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        assert!(matches!(
            install_interrupt_flag(),
            Err(ctrlc::Error::MultipleHandlers)
        ));
    }
}
