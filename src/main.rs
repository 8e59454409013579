use clap::Parser;

use fsr_bridge_lib::config::Cli;
use fsr_bridge_lib::serial::SerialInterface;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    fsr_bridge_lib::logging::init(&cli.log_level);

    if cli.list_ports {
        for port in SerialInterface::available_ports()? {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "{}  {:04x}:{:04x}  {}",
                    port.port_name,
                    vid,
                    pid,
                    port.product.as_deref().unwrap_or("")
                ),
                _ => println!("{}", port.port_name),
            }
        }
        return Ok(());
    }

    let settings = cli.into_settings()?;
    fsr_bridge_lib::run(settings).await
}
