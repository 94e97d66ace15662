//! TCP listener and advertisement/state fan-out to every accepted
//! [`Session`] (`SPEC_FULL.md` §4.8).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use crate::ble::AdvertisementEvent;
use crate::sensors::registry::SensorRegistry;
use crate::wire::native::{decode, FrameError};

use super::messages::BluetoothLeRawAdvertisement;
use super::session::{DeviceIdentity, Session, SessionState};

type SharedSession = Arc<Mutex<Session>>;

/// Shared handle the rest of the service uses to push advertisements and
/// sensor state into every live session.
pub struct NativeApiServer {
    sessions: Mutex<HashMap<u64, SharedSession>>,
    registry: Arc<SensorRegistry>,
    identity: DeviceIdentity,
    next_session_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl NativeApiServer {
    pub fn new(registry: Arc<SensorRegistry>, identity: DeviceIdentity) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            registry,
            identity,
            next_session_id: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    /// Binds `addr` and spawns the accept loop as a background task.
    /// Returns the actually-bound address, so callers that pass port `0`
    /// (tests, mainly) can learn which port the OS picked.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("native API listening on {bound}");
        let this = self.clone();
        tokio::spawn(async move { this.accept_loop(listener).await });
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else { continue };
                    let this = self.clone();
                    tokio::spawn(async move { this.run_session(stream, peer_addr).await });
                }
            }
        }
    }

    fn identity_clone(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: self.identity.name.clone(),
            mac_address: self.identity.mac_address.clone(),
            esphome_version: self.identity.esphome_version.clone(),
            model: self.identity.model.clone(),
            manufacturer: self.identity.manufacturer.clone(),
            project_name: self.identity.project_name.clone(),
            project_version: self.identity.project_version.clone(),
        }
    }

    async fn run_session(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        info!("session {id} connected from {peer_addr}");
        let (mut read_half, write_half) = tokio::io::split(stream);
        let session: SharedSession = Arc::new(Mutex::new(Session::new(
            id,
            peer_addr,
            write_half,
            self.identity_clone(),
        )));
        self.sessions.lock().await.insert(id, session.clone());

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buf = Vec::with_capacity(4096);
        let mut read_buf = [0u8; 4096];
        'outer: loop {
            let n = tokio::select! {
                _ = shutdown.recv() => {
                    info!("session {id} closing for shutdown");
                    break;
                }
                read = read_half.read(&mut read_buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("session {id} read error: {e}");
                        break;
                    }
                },
            };
            buf.extend_from_slice(&read_buf[..n]);

            loop {
                match decode(&buf) {
                    Ok(Some((msg_type, payload, consumed))) => {
                        let payload = payload.to_vec();
                        let entities = self.registry.entities_snapshot().await;
                        let mut guard = session.lock().await;
                        if guard
                            .handle_frame(msg_type, &payload, &entities)
                            .await
                            .is_err()
                        {
                            drop(guard);
                            break 'outer;
                        }
                        let should_close = guard.should_close();
                        drop(guard);
                        buf.drain(..consumed);
                        if should_close {
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(FrameError::BadPreamble(byte)) => {
                        warn!("session {id} sent bad preamble {byte:#04x}, closing");
                        break 'outer;
                    }
                    Err(e) => {
                        warn!("session {id} framing error: {e}");
                        break 'outer;
                    }
                }
            }
        }

        session.lock().await.close().await;
        self.sessions.lock().await.remove(&id);
        info!("session {id} disconnected");
    }

    /// Encodes and writes one advertisement to every subscribed session,
    /// dropping (with a warning) any session whose write fails.
    pub async fn fan_out_advertisement(&self, event: &AdvertisementEvent) {
        let sessions: Vec<SharedSession> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            let mut guard = session.lock().await;
            let id = guard.id;
            if guard.send_advertisement(event).await.is_err() {
                warn!("session {id} advertisement write failed, dropping");
            }
        }
    }

    /// Pushes one sensor reading to every session subscribed to states.
    /// Sessions that never enumerated `key` are closed (handled inside
    /// `Session::send_sensor_state`).
    pub async fn publish_sensor_state(&self, key: u32, value: f32, missing: bool) {
        let mut sessions = self.sessions.lock().await;
        let mut to_remove = Vec::new();
        for (id, session) in sessions.iter() {
            let mut guard = session.lock().await;
            if guard.send_sensor_state(key, value, missing).await.is_err()
                || guard.state() == SessionState::Closing
            {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            sessions.remove(&id);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Gracefully closes every live session so its controller re-issues
    /// `ListEntitiesRequest` on reconnect. Called whenever the registry
    /// reports a newly allocated entity key — §4.7's policy for keeping
    /// `key` stable once a session has enumerated it.
    pub async fn disconnect_all_for_new_entities(&self) {
        let mut sessions = self.sessions.lock().await;
        if sessions.is_empty() {
            return;
        }
        info!(
            "new sensor entity registered, disconnecting {} session(s) for re-enumeration",
            sessions.len()
        );
        for (id, session) in sessions.drain() {
            let mut guard = session.lock().await;
            guard.close().await;
            debug_disconnected(id);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn debug_disconnected(id: u64) {
    log::debug!("session {id} closed for re-enumeration");
}

/// Builds the GAP-segment byte string for a `BluetoothLERawAdvertisementsResponse`
/// entry, reconstructing it bit-exactly from the parsed event per §4.8's
/// segment ordering.
pub fn synthesize_raw_advertisement(event: &AdvertisementEvent) -> BluetoothLeRawAdvertisement {
    let mut data = Vec::new();
    push_segment(&mut data, 0x01, &[event.flags.unwrap_or(0x06)]);

    if let Some(name) = &event.local_name {
        push_segment(&mut data, 0x09, name.as_bytes());
    }

    for (company_id, payload) in &event.manufacturer_data {
        let mut seg = Vec::with_capacity(2 + payload.len());
        seg.extend_from_slice(&company_id.to_le_bytes());
        seg.extend_from_slice(payload);
        push_segment(&mut data, 0xFF, &seg);
    }

    for (uuid, payload) in &event.service_data {
        let ad_type = match uuid.len() {
            4 => 0x16,
            8 => 0x20,
            _ => 0x21,
        };
        if let Some(uuid_bytes) = hex_le(uuid) {
            let mut seg = Vec::with_capacity(uuid_bytes.len() + payload.len());
            seg.extend_from_slice(&uuid_bytes);
            seg.extend_from_slice(payload);
            push_segment(&mut data, ad_type, &seg);
        }
    }

    if !event.service_uuids.is_empty() {
        let all_same_width = |len: usize| event.service_uuids.iter().all(|u| u.len() == len);
        let (ad_type, bytes): (u8, Vec<u8>) = if all_same_width(4) {
            (0x03, concat_hex_le(&event.service_uuids))
        } else if all_same_width(8) {
            (0x05, concat_hex_le(&event.service_uuids))
        } else {
            (0x07, concat_hex_le(&event.service_uuids))
        };
        push_segment(&mut data, ad_type, &bytes);
    }

    if let Some(tx_power) = event.tx_power {
        push_segment(&mut data, 0x0A, &[tx_power as u8]);
    }

    BluetoothLeRawAdvertisement {
        address: event.address.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        rssi: event.rssi as i32,
        address_type: event.address_type.wire_value() as u32,
        data,
    }
}

fn concat_hex_le(uuids: &[String]) -> Vec<u8> {
    uuids.iter().filter_map(|u| hex_le(u)).flatten().collect()
}

fn push_segment(buf: &mut Vec<u8>, ad_type: u8, payload: &[u8]) {
    if payload.len() > 254 {
        return;
    }
    buf.push(payload.len() as u8 + 1);
    buf.push(ad_type);
    buf.extend_from_slice(payload);
}

/// Parses a hyphen-free hex UUID string into little-endian bytes.
fn hex_le(uuid: &str) -> Option<Vec<u8>> {
    let clean: String = uuid.chars().filter(|c| *c != '-').collect();
    if clean.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(clean.len() / 2);
    for i in (0..clean.len()).step_by(2) {
        bytes.push(u8::from_str_radix(&clean[i..i + 2], 16).ok()?);
    }
    bytes.reverse();
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn raw_advertisement_orders_segments_and_drops_oversized() {
        let event = AdvertisementEvent {
            address: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            address_type: crate::ble::AddressType::Public,
            rssi: -60,
            local_name: Some("BT-TH-ABCDEF".to_string()),
            manufacturer_data: {
                let mut m = Map::new();
                m.insert(0x0409u16, vec![0x01, 0x02]);
                m
            },
            service_data: Map::new(),
            service_uuids: vec!["ffd0".to_string()],
            tx_power: Some(-4),
            flags: None,
        };
        let raw = synthesize_raw_advertisement(&event);
        assert_eq!(raw.data[0], 2); // len=1(flags byte)+1
        assert_eq!(raw.data[1], 0x01);
        assert_eq!(raw.data[2], 0x06); // default flags

        let oversized_name = "x".repeat(260);
        let event2 = AdvertisementEvent {
            local_name: Some(oversized_name),
            ..event
        };
        let raw2 = synthesize_raw_advertisement(&event2);
        // The oversized name segment (AD type 0x09) must be entirely absent.
        assert!(!raw2.data.windows(2).any(|w| w[1] == 0x09));
    }
}
