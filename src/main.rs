use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::oneshot,
};
use wsinspect::{
    bridge::{ContextBridge, PageChannel},
    config::Config,
    coordinator::{Coordinator, CoordinatorHandle, InstallReason},
    frame::Payload,
    host::LocalHost,
    interceptor::{Interceptor, Socket, SocketFactory},
    logging,
    protocol::{PushEvent, Request, Response},
    storage::SqliteStorage,
    store::StoreSnapshot,
    tungstenite::TungsteniteFactory,
};

#[derive(Debug, Parser)]
#[command(name = "wsinspect")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a WebSocket through the interceptor and print captured messages.
    Tap {
        /// `ws://` or `wss://` URL to connect to.
        socket_url: String,
        /// Tab URL the captured messages are stored under. Defaults to the socket URL.
        #[arg(long)]
        tab_url: Option<String>,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print every stored message as JSON.
    Messages {
        /// Tab the caller is looking at; reported back as `activeTabUrl`.
        #[arg(long)]
        tab_url: Option<String>,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Clear stored messages for one tab, or all of them.
    Clear {
        #[arg(long)]
        tab_url: Option<String>,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the install or update lifecycle hook.
    Installed {
        #[arg(value_enum)]
        reason: InstallArg,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InstallArg {
    Install,
    Update,
}

impl From<InstallArg> for InstallReason {
    fn from(value: InstallArg) -> Self {
        match value {
            InstallArg::Install => Self::Install,
            InstallArg::Update => Self::Update,
        }
    }
}

fn start_coordinator(
    config: &Config,
    host: Arc<LocalHost>,
) -> anyhow::Result<(CoordinatorHandle, PathBuf)> {
    let db_path = config.storage.resolved_path()?;
    let storage = SqliteStorage::open(db_path.clone())?;
    let coordinator = Coordinator::start(Arc::new(storage), host, config.coordinator_options());
    Ok((coordinator, db_path))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Tap {
            socket_url,
            tab_url,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let tab_url = tab_url.unwrap_or_else(|| socket_url.clone());
            run_tap(&config, &socket_url, &tab_url).await?;
        }
        Command::Messages { tab_url, config } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, None)?;
            let (coordinator, _) = start_coordinator(&config, Arc::new(LocalHost::new()))?;
            match coordinator.request(Request::GetMessages { tab_url }).await? {
                Some(response) => print_json(&response)?,
                None => bail!("coordinator sent no response to get_messages"),
            }
        }
        Command::Clear { tab_url, config } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, None)?;
            let (coordinator, _) = start_coordinator(&config, Arc::new(LocalHost::new()))?;
            match coordinator
                .request(Request::ClearMessages { tab_url })
                .await?
            {
                Some(response) => print_json(&response)?,
                None => bail!("coordinator sent no response to clear_messages"),
            }
        }
        Command::Installed { reason, config } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, None)?;
            let (coordinator, _) = start_coordinator(&config, Arc::new(LocalHost::new()))?;
            let committed = coordinator.installed(reason.into()).await?;
            print_json(&Response::Ack { success: committed })?;
            if !committed {
                bail!("lifecycle hook `{reason:?}` did not reach durable storage");
            }
        }
    }

    Ok(())
}

async fn run_tap(config: &Config, socket_url: &str, tab_url: &str) -> anyhow::Result<()> {
    let host = Arc::new(LocalHost::new());
    let tab_rx = host.register_tab(tab_url);
    host.focus(Some(tab_url));
    let (coordinator, db_path) = start_coordinator(config, host)?;

    let baseline = match coordinator
        .request(Request::GetMessages {
            tab_url: Some(tab_url.to_owned()),
        })
        .await?
    {
        Some(Response::Messages(response)) => newest_id(&response.messages, tab_url),
        _ => 0,
    };
    let (stop_tx, stop_rx) = oneshot::channel();
    let printer = tokio::spawn(print_captured(
        coordinator.clone(),
        MessagePrinter::new(tab_url, baseline),
        stop_rx,
    ));

    let (page, page_rx) = PageChannel::new();
    let (bridge, mut page_commands) = ContextBridge::new(tab_url, coordinator.clone());
    let bridge_task = tokio::spawn(bridge.run(page_rx, tab_rx));

    let interceptor = Interceptor::new(TungsteniteFactory::new(), page)
        .with_listen_url_fragment(config.interceptor.listen_url_fragment.clone())
        .with_tab_url(Some(tab_url.to_owned()));
    let mut socket = interceptor.connect(socket_url).await?;
    if !socket.is_tapped() {
        tracing::warn!(
            socket_url,
            "socket URL does not match `interceptor.listen_url_fragment`; traffic is not captured"
        );
    }
    eprintln!(
        "{}",
        startup_summary(config, &db_path, socket_url, tab_url, socket.is_tapped())
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut page_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => socket.send(Payload::Text(line)).await?,
                None => {
                    stdin_open = false;
                    socket.close().await?;
                }
            },
            message = socket.recv() => match message {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(socket_url, error = %err, "socket receive failed");
                    break;
                }
                None => break,
            },
            command = page_commands.recv(), if page_open => match command {
                Some(command) => tracing::info!(tab_url, ?command, "page command"),
                None => page_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                socket.close().await?;
                break;
            }
        }
    }

    drop(socket);
    drop(interceptor);
    bridge_task.await?;
    // Everything the bridge forwarded is queued ahead of this request.
    flush(&coordinator, tab_url).await?;
    let _ = stop_tx.send(());
    printer.await??;
    // Same for the printer's last acknowledgements.
    flush(&coordinator, tab_url).await?;
    Ok(())
}

async fn flush(coordinator: &CoordinatorHandle, tab_url: &str) -> anyhow::Result<()> {
    coordinator
        .request(Request::GetMessages {
            tab_url: Some(tab_url.to_owned()),
        })
        .await?;
    Ok(())
}

async fn print_captured(
    coordinator: CoordinatorHandle,
    mut printer: MessagePrinter,
    mut stop: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut observer = coordinator.connect_observer()?;
    loop {
        tokio::select! {
            event = observer.recv() => match event {
                Some(event) => printer.emit(&coordinator, &event)?,
                None => {
                    tracing::warn!(observer = observer.id(), "observer channel dropped; reconnecting");
                    observer = coordinator.connect_observer()?;
                    observer.request(Request::SidebarReady).await?;
                }
            },
            _ = &mut stop => break,
        }
    }
    while let Some(event) = observer.try_recv() {
        printer.emit(&coordinator, &event)?;
    }
    observer.disconnect();
    Ok(())
}

fn newest_id(messages: &StoreSnapshot, tab_url: &str) -> u64 {
    messages
        .get(tab_url)
        .and_then(|list| list.first())
        .map_or(0, |message| message.id)
}

/// Prints each Stored Message of one tab once, oldest first, as a JSON line.
struct MessagePrinter {
    tab_url: String,
    last_printed: u64,
}

impl MessagePrinter {
    fn new(tab_url: &str, last_printed: u64) -> Self {
        Self {
            tab_url: tab_url.to_owned(),
            last_printed,
        }
    }

    fn emit(&mut self, coordinator: &CoordinatorHandle, event: &PushEvent) -> anyhow::Result<()> {
        let printed = self.print_update(event, &mut std::io::stdout().lock())?;
        if !printed.is_empty() {
            coordinator.notify(Request::MarkSeen {
                tab_url: self.tab_url.clone(),
                message_ids: printed,
            })?;
        }
        Ok(())
    }

    /// Returns the ids it printed.
    fn print_update(&mut self, event: &PushEvent, out: &mut impl Write) -> anyhow::Result<Vec<u64>> {
        let PushEvent::MessagesUpdate { messages, .. } = event else {
            return Ok(Vec::new());
        };
        // Ids restart after a clear.
        if newest_id(messages, &self.tab_url) < self.last_printed {
            self.last_printed = 0;
        }
        let Some(list) = messages.get(&self.tab_url) else {
            return Ok(Vec::new());
        };

        let mut printed = Vec::new();
        for message in list.iter().rev().filter(|m| m.id > self.last_printed) {
            writeln!(out, "{}", serde_json::to_string(message)?)?;
            printed.push(message.id);
        }
        if let Some(&last) = printed.last() {
            self.last_printed = last;
        }
        Ok(printed)
    }
}

fn startup_summary(
    config: &Config,
    db_path: &Path,
    socket_url: &str,
    tab_url: &str,
    tapped: bool,
) -> String {
    format!(
        "startup config: socket_url={}, tab_url={}, tapped={}, listen_url_fragment={}, db_path={}, max_messages={}",
        socket_url,
        tab_url,
        tapped,
        config
            .interceptor
            .listen_url_fragment
            .as_deref()
            .unwrap_or("none"),
        db_path.display(),
        config.store.max_messages,
    )
}
