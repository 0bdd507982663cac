//! The DHCP worker: a broadcast UDP socket, option-53 classification and
//! OFFER/ACK emission.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::leases::{Lease, LeaseTable, LEASE_SECS};
use super::packet::{self, BootpRequest, MacAddr, MessageType, OPTIONS_OFFSET};
use crate::config::Config;
use crate::{Error, Result};

/// Validated DHCP service settings, extracted from the shared [`Config`].
#[derive(Debug, Clone)]
pub struct DhcpSettings {
    pub server_ip: Ipv4Addr,
    pub port: u16,
    pub offer_from: Ipv4Addr,
    pub offer_to: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub broadcast: Ipv4Addr,
    pub fileserver: Option<String>,
    pub filename: Option<String>,
    pub leases_file: PathBuf,
}

impl DhcpSettings {
    /// Fail fast on a missing pool, mask or broadcast address; warn about
    /// optional fields that suppress their DHCP option.
    pub fn from_config(config: &Config) -> Result<Self> {
        let offer_from = config
            .dhcp_begin
            .ok_or_else(|| Error::Config("DHCP pool start undefined".into()))?;
        let offer_to = config
            .dhcp_end
            .ok_or_else(|| Error::Config("DHCP pool end undefined".into()))?;
        let subnet_mask = config
            .dhcp_subnet_mask
            .ok_or_else(|| Error::Config("DHCP subnet mask undefined".into()))?;
        let broadcast = config
            .dhcp_broadcast
            .ok_or_else(|| Error::Config("DHCP broadcast undefined".into()))?;
        if u32::from(offer_from) > u32::from(offer_to) {
            return Err(Error::Config(format!(
                "DHCP pool is backwards: {} > {}",
                offer_from, offer_to
            )));
        }
        if config.dhcp_gateway.is_none() {
            warn!("DHCP: router undefined, option 3 will not be sent");
        }
        if config.dhcp_dns.is_none() {
            warn!("DHCP: DNS server undefined, option 6 will not be sent");
        }
        Ok(DhcpSettings {
            server_ip: config.ip,
            port: config.dhcp_port,
            offer_from,
            offer_to,
            subnet_mask,
            router: config.dhcp_gateway,
            dns: config.dhcp_dns,
            broadcast,
            fileserver: config.dhcp_fileserver.clone(),
            filename: config.dhcp_filename.clone(),
            leases_file: config.dhcp_leases_file.clone(),
        })
    }
}

pub struct DhcpServer {
    socket: UdpSocket,
    settings: DhcpSettings,
    leases: LeaseTable,
}

impl DhcpServer {
    pub async fn bind(settings: DhcpSettings) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, settings.port)).await?;
        socket.set_broadcast(true)?;
        info!(
            "DHCP: server starting on {}:{}",
            settings.server_ip, settings.port
        );
        debug!("DHCP: lease range: {} - {}", settings.offer_from, settings.offer_to);
        debug!("DHCP: subnet mask: {}", settings.subnet_mask);
        debug!("DHCP: router: {:?}", settings.router);
        debug!("DHCP: DNS server: {:?}", settings.dns);
        debug!("DHCP: broadcast address: {}", settings.broadcast);
        debug!("DHCP: file server: {:?}", settings.fileserver);
        debug!("DHCP: file name: {:?}", settings.filename);
        debug!("DHCP: lease file: {}", settings.leases_file.display());
        // a broken lease file costs the recorded leases, not the service
        let leases = match LeaseTable::load(&settings.leases_file) {
            Ok(leases) => leases,
            Err(error) => {
                warn!("DHCP: {}, starting with an empty lease table", error);
                LeaseTable::new()
            }
        };
        Ok(DhcpServer {
            socket,
            settings,
            leases,
        })
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!("DHCP: service running");
        let mut buf = vec![0u8; 1024];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => {
                    info!("DHCP: worker stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, _peer) = received?;
            if let Some(reply) = self.handle_message(&buf[..len]) {
                let dest = (self.settings.broadcast, 68);
                if let Err(error) = self.socket.send_to(&reply, dest).await {
                    error!("DHCP: error sending reply: {}", error);
                }
            }
        }
    }

    /// Classify one inbound message and build the matching reply:
    /// DISCOVER gets an OFFER, REQUEST gets an ACK (wherever it came
    /// from), everything else is ignored.
    pub fn handle_message(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        let Some(request) = BootpRequest::parse(message) else {
            debug!("DHCP: runt message ({} bytes), ignoring", message.len());
            return None;
        };
        let options = if message.len() > OPTIONS_OFFSET {
            packet::tlv_parse(&message[OPTIONS_OFFSET..])
        } else {
            Default::default()
        };
        let message_type = options
            .get(&53)
            .and_then(|values| values.first())
            .and_then(|value| value.first())
            .copied();
        let reply_type = match message_type {
            Some(1) => {
                debug!("DHCP: received DHCPDISCOVER");
                MessageType::Offer
            }
            Some(3) => {
                debug!("DHCP: received DHCPREQUEST");
                MessageType::Ack
            }
            other => {
                debug!("DHCP: message type {:?} ignored", other);
                return None;
            }
        };

        let mac = request.client_mac();
        let offer = self.offer_for(mac)?;
        let mut reply = packet::build_reply(&request, offer, self.settings.server_ip);
        self.append_options(&mut reply, reply_type);
        Some(reply.to_vec())
    }

    /// The address for a client: its recorded lease if there is one, a
    /// fresh allocation otherwise. New allocations rewrite the lease file.
    fn offer_for(&mut self, mac: MacAddr) -> Option<Ipv4Addr> {
        if let Some(lease) = self.leases.get(mac) {
            info!("DHCP: assignment from lease table: {} -> {}", mac, lease.ip);
            return Some(lease.ip);
        }
        let now = crate::now_secs();
        let Some(ip) = self
            .leases
            .next_ip(self.settings.offer_from, self.settings.offer_to, now)
        else {
            warn!("DHCP: address pool exhausted, ignoring request from {}", mac);
            return None;
        };
        self.leases.insert(
            mac,
            Lease {
                ip,
                expire: now + LEASE_SECS,
            },
        );
        info!(
            "DHCP: writing lease file: {}",
            self.settings.leases_file.display()
        );
        if let Err(error) = self.leases.save(&self.settings.leases_file) {
            error!("DHCP: cannot write lease file: {}", error);
        }
        info!("DHCP: new assignment: {} -> {}", mac, ip);
        Some(ip)
    }

    /// Options in emission order: 53, 54, 1, optional 3 and 6, 51, optional
    /// 66 and 67 (NUL-terminated), end marker.
    fn append_options(&self, reply: &mut BytesMut, message_type: MessageType) {
        packet::tlv_encode(reply, 53, &[message_type as u8]);
        packet::tlv_encode(reply, 54, &self.settings.server_ip.octets());
        packet::tlv_encode(reply, 1, &self.settings.subnet_mask.octets());
        if let Some(router) = self.settings.router {
            packet::tlv_encode(reply, 3, &router.octets());
        }
        if let Some(dns) = self.settings.dns {
            packet::tlv_encode(reply, 6, &dns.octets());
        }
        packet::tlv_encode(reply, 51, &(LEASE_SECS as u32).to_be_bytes());
        if let Some(fileserver) = &self.settings.fileserver {
            packet::tlv_encode(reply, 66, fileserver.as_bytes());
            info!("DHCP: encoded option 66: {}", fileserver);
        }
        if let Some(filename) = &self.settings.filename {
            let mut value = filename.as_bytes().to_vec();
            value.push(0);
            packet::tlv_encode(reply, 67, &value);
            info!("DHCP: encoded option 67: {}", filename);
        }
        reply.put_u8(255);
    }
}
