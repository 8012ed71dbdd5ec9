//! Wake-on-LAN magic packet support.

use tokio::net::UdpSocket;
use tracing::debug;

/// Discard-protocol port, the conventional WOL destination
const WOL_PORT: u16 = 9;

/// Parse a MAC address in `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` form.
pub fn parse_mac(s: &str) -> anyhow::Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        anyhow::bail!("Invalid MAC address '{}': expected 6 octets", s);
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| anyhow::anyhow!("Invalid MAC address '{}': bad octet '{}'", s, part))?;
    }
    Ok(mac)
}

/// Build the magic packet payload: 6 bytes of 0xFF followed by the MAC
/// repeated 16 times.
fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

/// Broadcast a magic packet for the given MAC address.
pub async fn send_magic_packet(mac_address: &str) -> anyhow::Result<()> {
    let mac = parse_mac(mac_address)?;
    let packet = magic_packet(mac);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(&packet, ("255.255.255.255", WOL_PORT))
        .await?;

    debug!(mac = %mac_address, "magic packet sent");
    Ok(())
}
