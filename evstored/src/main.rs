#![deny(clippy::as_conversions)]
use opts::Opts;
use std::io;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let node = evstored::Node::new(opts.to_params())?;

    let node_ctrl = node.get_ctrl();
    node_ctrl.install_signal_handler()?;
    info!(
        id = %node_ctrl.instance_id(),
        internal = %node_ctrl.internal_addr(),
        "Node running"
    );

    node.wait();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
