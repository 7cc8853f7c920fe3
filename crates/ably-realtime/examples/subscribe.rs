//! Subscribe to an Ably channel and print what arrives.
//!
//! ```sh
//! cargo run -p ably-realtime --example subscribe -- <API_KEY> <CHANNEL> [CLIENT_ID]
//! ```
//!
//! Or pass the API key via environment variable:
//! ```sh
//! ABLY_API_KEY=appId.keyId:secret cargo run -p ably-realtime --example subscribe \
//!     -- <CHANNEL> [CLIENT_ID]
//! ```
//!
//! With a `CLIENT_ID` the example also enters presence on the channel.
//! Message data is printed to stdout (pipe to `jq` for formatting).

use ably_realtime::{ClientOptions, ConnectionState, Realtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_key = std::env::var("ABLY_API_KEY").ok();

    let (api_key, channel, client_id) = if let Some(ref key) = env_key {
        let channel = args.first().ok_or("usage: subscribe <CHANNEL> [CLIENT_ID]")?;
        (key.clone(), channel.clone(), args.get(1).cloned())
    } else {
        let api_key = args
            .first()
            .ok_or("usage: subscribe <API_KEY> <CHANNEL> [CLIENT_ID]")?;
        let channel = args
            .get(1)
            .ok_or("usage: subscribe <API_KEY> <CHANNEL> [CLIENT_ID]")?;
        (api_key.clone(), channel.clone(), args.get(2).cloned())
    };

    let mut options = ClientOptions::with_key(api_key).with_auto_connect(false);
    if let Some(id) = &client_id {
        options = options.with_client_id(id.clone());
    }
    let client = Realtime::new(options)?;

    let mut states = client.connection().on_state_change();
    client.connect();

    let channel = client.channels().get(&channel);
    let mut messages = channel.subscribe();
    let mut members = channel.presence().subscribe();
    eprintln!("subscribing to '{}' ...", channel.name());

    if client_id.is_some() {
        channel.presence().enter(serde_json::Value::Null).await?;
        eprintln!("[presence] entered");
    }

    loop {
        tokio::select! {
            Some(change) = states.next() => {
                eprintln!(
                    "[connection] {} -> {}{}",
                    change.previous.as_str(),
                    change.current.as_str(),
                    change.reason.map(|r| format!(" ({r})")).unwrap_or_default(),
                );
                if change.current == ConnectionState::Failed {
                    break;
                }
            }
            Some(msg) = messages.next() => {
                eprintln!(
                    "[message] name={} id={} ts={}",
                    msg.name.as_deref().unwrap_or("-"),
                    msg.id.as_deref().unwrap_or("-"),
                    msg.timestamp.map_or_else(|| "-".to_string(), |t| t.to_string()),
                );
                println!("{}", msg.data);
            }
            Some(member) = members.next() => {
                eprintln!(
                    "[presence] {:?} client={} data={}",
                    member.action,
                    member.client_id.as_deref().unwrap_or("-"),
                    member.data,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await?;
    Ok(())
}
