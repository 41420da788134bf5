//! CLI entry point: brings the stack up against the in-process mock
//! link driver, following the teacher's `Api`/`View` subcommand split
//! (`src/cli.rs`) for `run`/`dump-tables`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lontalk_stack::link::driver::{LinkDriver, MockLinkDriver};
use lontalk_stack::persist::MemoryBackend;
use lontalk_stack::stack::DeviceStack;
use lontalk_stack::tables::DeviceStackTables;

#[derive(Parser)]
#[command(name = "lontalk-stack", about = "Device-side LonTalk/LonWorks protocol stack")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring up the stack against the mock link driver and run until interrupted.
    Run {
        #[arg(long, default_value = "mock0")]
        interface: String,
        #[arg(long, default_value_t = 4)]
        xcvr_id: i32,
    },
    /// Print the current state of the device stack tables (node state, error log).
    DumpTables,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { interface, xcvr_id } => run(&interface, xcvr_id).await?,
        Command::DumpTables => dump_tables().await?,
    }
    Ok(())
}

async fn run(interface: &str, xcvr_id: i32) -> Result<(), Box<dyn std::error::Error>> {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(xcvr_id, [0x00, 0x02, 0x47, 0x94, 0x89, 0x00]));
    link.open(interface).await?;

    let tables = DeviceStackTables::new(Arc::new(MemoryBackend::new()), link.get_unique_id(), *b"SIGNAL\x00\x01");
    let stack = DeviceStack::new(link, tables, xcvr_id as u8);

    tracing::info!(interface, "device stack running; ctrl-c to stop");
    let loop_handle = tokio::spawn(stack.clone().run_receive_loop());

    tokio::signal::ctrl_c().await?;
    stack.request_shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;
    Ok(())
}

async fn dump_tables() -> Result<(), Box<dyn std::error::Error>> {
    let tables = DeviceStackTables::new(
        Arc::new(MemoryBackend::new()),
        [0x00, 0x02, 0x47, 0x94, 0x89, 0x00],
        *b"SIGNAL\x00\x01",
    );
    println!("node_state: {:?}", tables.config.node_state);
    println!("error_log: {:?}", tables.config.error_log);
    println!("read_only_query_id: {:02x?}", tables.read_only.query_id_payload());
    Ok(())
}
