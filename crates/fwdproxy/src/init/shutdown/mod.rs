use std::sync::mpsc::{self, Receiver};

use anyhow::Result;

mod ctrlc;

/// Install signal handling and return a channel that receives one message
/// once shutdown is requested.
pub fn init() -> Result<Receiver<()>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::init(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}
