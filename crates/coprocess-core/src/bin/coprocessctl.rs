use anyhow::{Context, Result};
use clap::Parser;
use coprocess_core::cli::{Cli, Command, event_payload, object_from_file};
use coprocess_core::config::ServerConfig;
use coprocess_core::driver::{dispatch_event_once, dispatch_once};
use coprocess_core::shutdown::{ShutdownState, listen_for_ctrl_c};
use coprocess_core::{logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Command::Serve { config, addr } => {
            let mut server_config = ServerConfig::load(config.as_deref())
                .context("Failed to load server config")?;
            if let Some(addr) = addr {
                server_config.listen_addr = addr;
            }
            let shutdown = ShutdownState::new();
            listen_for_ctrl_c(shutdown.clone());
            server::serve(&server_config, shutdown)
                .await
                .context("dispatcher server failed")?;
        }
        Command::Dispatch {
            addr,
            object,
            hook_name,
            hook_type,
            call,
        } => {
            let object = object_from_file(&object, hook_name, hook_type)?;
            let returned = dispatch_once(&addr, object, &call.options())
                .await
                .with_context(|| format!("dispatch to {addr} failed"))?;
            println!("{}", serde_json::to_string_pretty(&returned)?);
        }
        Command::DispatchEvent {
            addr,
            handler_name,
            message,
            call,
        } => {
            let payload = event_payload(&handler_name, message.as_deref())?;
            dispatch_event_once(&addr, payload, &call.options())
                .await
                .with_context(|| format!("dispatch event to {addr} failed"))?;
            println!("event '{handler_name}' dispatched");
        }
    }
    Ok(())
}
