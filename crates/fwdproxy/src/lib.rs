use std::time::Duration;

use anyhow::Result;

mod acl;
mod cmd;
mod forward;
mod http;
mod init;
mod proxy;

pub use acl::{Acl, Verdict};
pub use forward::MultiForwarder;
pub use proxy::{Proxy, ProxyConfig};

pub fn run() -> Result<()> {
    let shutdown = init::shutdown::init()?;

    let args = init::cmd::init()?;
    anyhow::ensure!(args.timeout >= 0.0, "timeout must be non-negative");

    let config = ProxyConfig {
        bind: *args.bindaddr,
        acl: Acl::compile(&args.allow, &args.block)?,
        maxsize: args.max,
        numthreads: args.threads,
        timeout: Duration::from_secs_f64(args.timeout),
    };
    let proxy = Proxy::start(config)?;
    log::info!("listening on {}", proxy.local_addr());

    let _ = shutdown.recv();
    proxy.stop();
    log::info!("Shutdown complete.");
    Ok(())
}
