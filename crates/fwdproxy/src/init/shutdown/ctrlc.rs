use anyhow::{Context, Result};

/// Fire `notify` on Ctrl-C or SIGTERM.
pub fn init<F>(notify: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    let _ = ctrlc2::set_handler(move || {
        log::info!("Shutdown requested. Waiting for in-flight requests...");
        notify();
        true
    })
    .context("should install ctrl c handler but failed")?;
    Ok(())
}
