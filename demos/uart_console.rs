//! Interactive UART console
//!
//! Connects to a peripheral exposing the UART service, prints every TX
//! notification and sends each line typed on stdin.
//!
//! Run with: cargo run --example uart_console [device-name]

use ble_uart_session::{
    BtleplugTransport, NoticeLevel, PeripheralFilter, Result, Session, SessionConfig,
    TransportConfig,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    println!("UART Console");
    println!("============\n");

    let mut config = SessionConfig::default();
    if let Some(name) = std::env::args().nth(1) {
        config = config.with_filter(PeripheralFilter::Name(name));
    }

    let transport = BtleplugTransport::new(TransportConfig::default()).await?;
    let session = Session::new(Arc::new(transport), config);

    let _frames = session.on_frame(|frame| println!("<- {}", frame));
    let _notices = session.on_notice(|notice| match notice.level {
        NoticeLevel::Info => println!("** {}", notice.message),
        _ => eprintln!("!! {}", notice.message),
    });

    println!("Scanning...");
    let peripheral = session.connect().await?;
    println!("Connected to {}. Type to send, Ctrl+C to exit.\n", peripheral);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !session.is_ready() {
                    println!("Not connected");
                    break;
                }
                if let Err(e) = session.send_text(&format!("{}\n", line)).await {
                    eprintln!("Send failed: {}", e);
                }
            }
        }
    }

    session.disconnect().await?;

    println!("\nSession log:");
    print!("{}", session.log().to_text());

    Ok(())
}
