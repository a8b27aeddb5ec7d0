//! Command execution.

use crate::Commands;
use colored::Colorize;
use flowhub_client::Client;
use flowhub_protocol::message::{type_name, DeviceItem};
use flowhub_protocol::Frame;
use sha2::{Digest, Sha256};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Listen | Commands::HashSecret { .. } => unreachable!(),

        Commands::Ping => {
            let reply = client.keepalive().await?;
            Ok(reply.to_uppercase().green().to_string())
        }

        Commands::Login => {
            let uid = client.device_uid();
            if uid == 0 {
                Ok(format!("{} (no credentials given)", "Anonymous".yellow()))
            } else {
                Ok(format!("{} as uid {}", "Authenticated".green(), uid.to_string().cyan()))
            }
        }

        Commands::Register { hardware_id } => {
            let resp = client.register(&hardware_id).await?;
            Ok(format!(
                "{} {} as uid {}\nsecret: {}",
                "Registered".green(),
                hardware_id.cyan(),
                resp.device_uid,
                resp.secret.yellow()
            ))
        }

        Commands::Nodes => {
            let devices = client.query_nodes().await?;
            if devices.is_empty() {
                return Ok("No devices".dimmed().to_string());
            }
            let mut out = format!(
                "{:>8}  {:<8}  {:>8}  {:<24}  {}\n",
                "UID", "ROLE", "PARENT", "HARDWARE ID", "NAME"
            );
            for device in &devices {
                out.push_str(&format_device(device));
                out.push('\n');
            }
            out.push_str(&format!("{} device(s)", devices.len()));
            Ok(out)
        }

        Commands::Send { target, message } => {
            let payload = parse_payload(&message)?;
            client.send_to(target, &payload).await?;
            Ok(format!(
                "{} {} bytes to uid {}",
                "Sent".green(),
                payload.len(),
                target.to_string().cyan()
            ))
        }

        Commands::Broadcast { message } => {
            let payload = parse_payload(&message)?;
            client.broadcast(&payload).await?;
            Ok(format!("{} {} bytes", "Broadcast".green(), payload.len()))
        }
    }
}

/// SHA-256 hex digest, as stored in config files.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parses a message argument. `hex:` prefixes raw bytes, anything else is sent as UTF-8.
fn parse_payload(arg: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match arg.strip_prefix("hex:") {
        Some(hex_str) => Ok(hex::decode(hex_str)?),
        None => Ok(arg.as_bytes().to_vec()),
    }
}

fn format_device(device: &DeviceItem) -> String {
    let parent = device
        .parent_uid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>8}  {:<8}  {:>8}  {:<24}  {}",
        device.uid, device.role, parent, device.hardware_id, device.name
    )
}

/// One line per received frame.
pub fn format_frame(frame: &Frame) -> String {
    let h = &frame.header;
    let body = match std::str::from_utf8(&frame.payload) {
        Ok(text) if !text.chars().any(|c| c.is_control()) => text.to_string(),
        _ => format!("hex:{}", hex::encode(&frame.payload)),
    };
    format!(
        "[{}] {} {} -> {} #{}: {}",
        h.timestamp,
        type_name(h.type_id).cyan(),
        h.source,
        h.target,
        h.msg_id,
        body
    )
}
