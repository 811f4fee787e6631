// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context as _;
use anyhow::anyhow;
use std::io::IsTerminal;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::time::uptime;

/// Enables tracing output to stderr.
///
/// Guest console bytes go to stdout, so keeping diagnostics on stderr lets
/// both be redirected independently.
pub fn enable_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if let Ok(filter) = std::env::var("MINIVISOR_LOG") {
        tracing_subscriber::EnvFilter::try_new(filter).context("invalid MINIVISOR_LOG")?
    } else {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing::metadata::LevelFilter::INFO.into())
    };

    let format = Format::default()
        .with_timer(uptime())
        .with_ansi(std::io::stderr().is_terminal());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!(e).context("failed to enable tracing"))?;

    Ok(())
}
