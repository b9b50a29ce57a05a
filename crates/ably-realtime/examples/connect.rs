//! Connect to Ably, print state changes and the recovery key, then close.
//!
//! Usage: `cargo run --example connect -- <api-key> [environment] [recovery-key]`
//! The key may also come from `ABLY_API_KEY`.

use std::time::Duration;

use ably_realtime::{ClientOptions, ConnectionState, RealtimeClient};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let key = match args.next().or_else(|| std::env::var("ABLY_API_KEY").ok()) {
        Some(key) => key,
        None => {
            eprintln!("usage: connect <api-key> [environment] [recovery-key]");
            std::process::exit(2);
        }
    };

    let mut options = ClientOptions::with_key(key);
    if let Some(environment) = args.next() {
        options.set_environment(environment);
    }
    options.recover = args.next();
    println!("realtime host: {}", options.realtime_host());

    let client = RealtimeClient::new(options)?;
    client.on(|change| match &change.reason {
        Some(reason) => println!("{} -> {}: {reason}", change.previous, change.current),
        None => println!("{} -> {}", change.previous, change.current),
    });

    client
        .connection()
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(30))
        .await?;
    println!("recovery key: {}", client.recovery_key()?);

    tokio::time::sleep(Duration::from_secs(2)).await;
    client.close();
    client
        .connection()
        .wait_for_state(ConnectionState::Closed, Duration::from_secs(15))
        .await?;
    Ok(())
}
