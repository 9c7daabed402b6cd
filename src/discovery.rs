//! # LAN Discovery Beacon
//!
//! Best-effort membership publication over UDP probe ports. Every interface
//! task binds the first free port from the configured probe list, then
//! periodically announces `{magic, overlay digest, session port}` to all
//! probe ports on that interface (the subnet broadcast address for real
//! interfaces, the interface itself for loopback). Foreign beacons carrying
//! the same overlay digest surface as [`Probe`] events.
//!
//! Duplicates are expected and flow through untouched; the routing state's
//! duplicate suppression is the single point of deduplication. A beacon
//! naming our own listener is dropped here, everything else is the
//! shaker's problem.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use crate::config::OverlayConfig;
use crate::messages;

const BEACON_MAGIC: [u8; 4] = *b"wft1";

/// Largest datagram the beacon reader accepts.
const MAX_BEACON: usize = 128;

/// A dial candidate observed on the local link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Serialize, Deserialize)]
struct Beacon {
    magic: [u8; 4],
    overlay: [u8; 32],
    port: u16,
}

/// Binds a probe port on `ip` and spawns the beacon task for one
/// interface. `session_port` is the TCP listener being advertised.
pub async fn spawn(
    ip: IpAddr,
    overlay_digest: [u8; 32],
    session_port: u16,
    config: &OverlayConfig,
    probes: mpsc::Sender<Probe>,
    mut quit: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let (socket, own_port) = bind_probe_port(ip, &config.probe_ports).await?;
    let targets = beacon_targets(ip, &config.probe_ports, own_port);
    if !targets.iter().any(|t| t.ip().is_loopback() || t.ip() == ip) {
        socket.set_broadcast(true)?;
    }
    debug!(%ip, port = own_port, "discovery beacon bound");

    let announcement = messages::serialize(&Beacon {
        magic: BEACON_MAGIC,
        overlay: overlay_digest,
        port: session_port,
    })
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    let interval = config.beacon_interval;
    Ok(tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        let mut buf = [0u8; MAX_BEACON];
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    for &target in &targets {
                        if let Err(err) = socket.send_to(&announcement, target).await {
                            trace!(%target, error = %err, "beacon send failed");
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            trace!(error = %err, "beacon receive failed");
                            continue;
                        }
                    };
                    let beacon: Beacon = match messages::deserialize_bounded(&buf[..n]) {
                        Ok(beacon) => beacon,
                        Err(_) => continue,
                    };
                    if beacon.magic != BEACON_MAGIC || beacon.overlay != overlay_digest {
                        continue;
                    }
                    if beacon.port == session_port && from.ip() == ip {
                        continue; // our own announcement
                    }
                    // Best effort: a full channel just drops the probe, the
                    // next beacon round repeats it.
                    let _ = probes.try_send(Probe { ip: from.ip(), port: beacon.port });
                }
            }
        }
    }))
}

/// Binds the first free port of the probe list on `ip`.
async fn bind_probe_port(ip: IpAddr, ports: &[u16]) -> std::io::Result<(UdpSocket, u16)> {
    for &port in ports {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok((socket, port)),
            Err(_) => continue,
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "all discovery probe ports are taken",
    ))
}

/// Destination addresses for our announcements: every probe port except our
/// own, on the interface itself for loopback and on the IPv4 broadcast
/// address otherwise.
fn beacon_targets(ip: IpAddr, ports: &[u16], own_port: u16) -> Vec<SocketAddr> {
    let target_ip = match ip {
        IpAddr::V4(v4) if !v4.is_loopback() => IpAddr::V4(Ipv4Addr::BROADCAST),
        other => other,
    };
    ports
        .iter()
        .filter(|&&port| !(target_ip == ip && port == own_port))
        .map(|&port| SocketAddr::new(target_ip, port))
        .collect()
}
