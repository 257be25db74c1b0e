// src/network.rs

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use sysinfo::Networks;
use tracing::{debug, info, warn};

use crate::models::{ConnectionType, NetworkStatus};

const MIB: u64 = 1024 * 1024;

pub const REASON_NOT_CONNECTED: &str = "no network connection";
pub const REASON_TOO_SLOW: &str = "network speed is too low";
pub const REASON_METERED: &str = "metered connection detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
    Mobile,
    Loopback,
    Other,
}

/// One network interface as seen by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
    pub is_up: bool,
    /// Nominal link speed in bits per second, when the driver reports one.
    pub link_speed_bps: Option<u64>,
}

/// Lists the host's network interfaces.
pub trait InterfaceProbe: Send + Sync {
    fn interfaces(&self) -> Vec<InterfaceInfo>;
}

/// Decides whether a link should be treated as metered.
pub trait MeteredPolicy: Send + Sync {
    fn is_metered(&self, interface: &InterfaceInfo, connection: ConnectionType) -> bool;
}

/// Mobile links are assumed metered; everything else is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct MobileIsMetered;

impl MeteredPolicy for MobileIsMetered {
    fn is_metered(&self, _interface: &InterfaceInfo, connection: ConnectionType) -> bool {
        connection == ConnectionType::Mobile
    }
}

/// Anything able to produce a fresh [`NetworkStatus`].
#[async_trait]
pub trait NetworkAssessment: Send + Sync {
    async fn assess(&self) -> NetworkStatus;
}

/// Interfaces reported by `sysinfo`, enriched from `/sys/class/net` where available.
#[derive(Debug, Default)]
pub struct SystemInterfaces;

impl InterfaceProbe for SystemInterfaces {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        let networks = Networks::new_with_refreshed_list();
        let mut found: Vec<InterfaceInfo> = networks
            .list()
            .iter()
            .map(|(name, data)| {
                let sysfs = Path::new("/sys/class/net").join(name);
                if sysfs.exists() {
                    describe_sysfs(name, &sysfs)
                } else {
                    InterfaceInfo {
                        name: name.clone(),
                        kind: kind_from_name(name),
                        is_up: data.total_received() > 0 || data.total_transmitted() > 0,
                        link_speed_bps: None,
                    }
                }
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }
}

fn read_sysfs(dir: &Path, file: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(file))
        .ok()
        .map(|s| s.trim().to_string())
}

fn describe_sysfs(name: &str, dir: &Path) -> InterfaceInfo {
    // ARPHRD_* values from if_arp.h
    let kind = match read_sysfs(dir, "type").and_then(|t| t.parse::<u32>().ok()) {
        Some(772) => InterfaceKind::Loopback,
        Some(512) | Some(519) | Some(530) => InterfaceKind::Mobile,
        _ if dir.join("wireless").exists() || dir.join("phy80211").exists() => InterfaceKind::Wireless,
        Some(1) => kind_from_name(name),
        _ => InterfaceKind::Other,
    };
    let is_up = matches!(read_sysfs(dir, "operstate").as_deref(), Some("up"));
    let link_speed_bps = read_sysfs(dir, "speed")
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|mbps| *mbps > 0)
        .map(|mbps| mbps as u64 * 1_000_000);
    InterfaceInfo { name: name.to_string(), kind, is_up, link_speed_bps }
}

fn kind_from_name(name: &str) -> InterfaceKind {
    let lower = name.to_lowercase();
    if lower == "lo" || lower.starts_with("loopback") || lower.starts_with("lo0") {
        InterfaceKind::Loopback
    } else if lower.starts_with("wl") || lower.contains("wi-fi") || lower.contains("wireless") {
        InterfaceKind::Wireless
    } else if lower.starts_with("wwan") || lower.starts_with("ppp") || lower.starts_with("rmnet") {
        InterfaceKind::Mobile
    } else if lower.starts_with("en") || lower.starts_with("eth") || lower.contains("ethernet") {
        InterfaceKind::Ethernet
    } else {
        InterfaceKind::Other
    }
}

pub fn connection_type(kind: InterfaceKind) -> ConnectionType {
    match kind {
        InterfaceKind::Ethernet => ConnectionType::Ethernet,
        InterfaceKind::Wireless => ConnectionType::WiFi,
        InterfaceKind::Mobile => ConnectionType::Mobile,
        InterfaceKind::Loopback | InterfaceKind::Other => ConnectionType::Other,
    }
}

/// Classifies the active link and decides whether it can carry a large download.
pub struct NetworkAssessor {
    probe: Box<dyn InterfaceProbe>,
    metered: Box<dyn MeteredPolicy>,
    client: Client,
    speed_test_url: String,
    threshold_mbps: f64,
}

impl NetworkAssessor {
    pub fn new(client: Client, speed_test_url: impl Into<String>, threshold_mbps: f64) -> Self {
        Self {
            probe: Box::new(SystemInterfaces),
            metered: Box::new(MobileIsMetered),
            client,
            speed_test_url: speed_test_url.into(),
            threshold_mbps,
        }
    }

    pub fn with_probe(mut self, probe: impl InterfaceProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_metered_policy(mut self, policy: impl MeteredPolicy + 'static) -> Self {
        self.metered = Box::new(policy);
        self
    }

    /// Times a small download and converts it to megabits per second.
    async fn run_speed_test(&self) -> Option<f64> {
        let started = Instant::now();
        let resp = self
            .client
            .get(&self.speed_test_url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let bytes = resp.bytes().await.ok()?;
        let secs = started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let mbps = bytes.len() as f64 * 8.0 / (secs * 1_000_000.0);
        debug!(bytes = bytes.len(), secs, mbps, "speed test finished");
        Some(mbps)
    }

    fn verdict(&self, mut status: NetworkStatus) -> NetworkStatus {
        let speed_ok = status.estimated_speed_mbps > self.threshold_mbps;
        let cost_ok = !status.metered;
        status.suitable_for_download = speed_ok && cost_ok;
        status.unsuitability_reason = if !speed_ok {
            Some(REASON_TOO_SLOW.to_string())
        } else if !cost_ok {
            Some(REASON_METERED.to_string())
        } else {
            None
        };
        status
    }
}

#[async_trait]
impl NetworkAssessment for NetworkAssessor {
    async fn assess(&self) -> NetworkStatus {
        let interfaces = self.probe.interfaces();
        let up: Vec<&InterfaceInfo> = interfaces
            .iter()
            .filter(|i| i.is_up && i.kind != InterfaceKind::Loopback)
            .collect();

        let Some(active) = up
            .iter()
            .find(|i| matches!(i.kind, InterfaceKind::Ethernet | InterfaceKind::Wireless))
            .or_else(|| up.first())
            .copied()
        else {
            info!("no active network interface");
            return NetworkStatus {
                unsuitability_reason: Some(REASON_NOT_CONNECTED.to_string()),
                ..Default::default()
            };
        };

        let connection = connection_type(active.kind);
        let mut speed = active
            .link_speed_bps
            .map(|bps| bps as f64 / 1_000_000.0)
            .unwrap_or(0.0);
        if speed <= 0.0 {
            speed = self.run_speed_test().await.unwrap_or_else(|| {
                warn!("speed test failed, assuming no throughput");
                0.0
            });
        }

        let status = self.verdict(NetworkStatus {
            connected: true,
            connection_type: connection,
            metered: self.metered.is_metered(active, connection),
            estimated_speed_mbps: speed,
            ..Default::default()
        });
        info!(
            interface = %active.name,
            connection = ?status.connection_type,
            speed_mbps = status.estimated_speed_mbps,
            metered = status.metered,
            suitable = status.suitable_for_download,
            "network assessed"
        );
        status
    }
}

/// Largest download worth starting on the given link.
pub fn recommended_download_limit(connection: ConnectionType, metered: bool) -> u64 {
    if metered {
        return 50 * MIB;
    }
    match connection {
        ConnectionType::Ethernet => 1024 * MIB,
        ConnectionType::WiFi => 500 * MIB,
        ConnectionType::Mobile => 100 * MIB,
        ConnectionType::Other | ConnectionType::Unknown => 200 * MIB,
    }
}

pub fn recommended_buffer_size(speed_mbps: f64) -> usize {
    if speed_mbps > 50.0 {
        32 * 1024
    } else if speed_mbps > 10.0 {
        16 * 1024
    } else {
        8 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    struct FixedInterfaces(Vec<InterfaceInfo>);

    impl InterfaceProbe for FixedInterfaces {
        fn interfaces(&self) -> Vec<InterfaceInfo> {
            self.0.clone()
        }
    }

    struct NeverMetered;

    impl MeteredPolicy for NeverMetered {
        fn is_metered(&self, _: &InterfaceInfo, _: ConnectionType) -> bool {
            false
        }
    }

    fn iface(name: &str, kind: InterfaceKind, up: bool, speed: Option<u64>) -> InterfaceInfo {
        InterfaceInfo { name: name.into(), kind, is_up: up, link_speed_bps: speed }
    }

    fn assessor(interfaces: Vec<InterfaceInfo>, url: &str) -> NetworkAssessor {
        NetworkAssessor::new(Client::new(), url, 1.0).with_probe(FixedInterfaces(interfaces))
    }

    #[tokio::test]
    async fn fast_wired_link_is_suitable() {
        let status = assessor(
            vec![
                iface("lo", InterfaceKind::Loopback, true, Some(10_000_000_000)),
                iface("eth0", InterfaceKind::Ethernet, true, Some(1_000_000_000)),
            ],
            "http://127.0.0.1:9/unused",
        )
        .assess()
        .await;
        assert!(status.connected);
        assert_eq!(status.connection_type, ConnectionType::Ethernet);
        assert_eq!(status.estimated_speed_mbps, 1000.0);
        assert!(status.suitable_for_download);
        assert_eq!(status.unsuitability_reason, None);
    }

    #[tokio::test]
    async fn no_interface_up_is_not_connected() {
        let status = assessor(
            vec![iface("eth0", InterfaceKind::Ethernet, false, Some(1_000_000_000))],
            "http://127.0.0.1:9/unused",
        )
        .assess()
        .await;
        assert!(!status.connected);
        assert!(!status.suitable_for_download);
        assert_eq!(status.unsuitability_reason.as_deref(), Some(REASON_NOT_CONNECTED));
    }

    #[tokio::test]
    async fn mobile_link_is_metered_by_default() {
        let status = assessor(
            vec![iface("wwan0", InterfaceKind::Mobile, true, Some(50_000_000))],
            "http://127.0.0.1:9/unused",
        )
        .assess()
        .await;
        assert_eq!(status.connection_type, ConnectionType::Mobile);
        assert!(status.metered);
        assert!(!status.suitable_for_download);
        assert_eq!(status.unsuitability_reason.as_deref(), Some(REASON_METERED));
    }

    #[tokio::test]
    async fn metered_policy_is_pluggable() {
        let status = assessor(
            vec![iface("wwan0", InterfaceKind::Mobile, true, Some(50_000_000))],
            "http://127.0.0.1:9/unused",
        )
        .with_metered_policy(NeverMetered)
        .assess()
        .await;
        assert!(!status.metered);
        assert!(status.suitable_for_download);
    }

    #[tokio::test]
    async fn slow_speed_reason_wins_over_metered() {
        let status = assessor(
            vec![iface("wwan0", InterfaceKind::Mobile, true, Some(500_000))],
            "http://127.0.0.1:9/unused",
        )
        .assess()
        .await;
        assert!(status.metered);
        assert_eq!(status.unsuitability_reason.as_deref(), Some(REASON_TOO_SLOW));
    }

    #[tokio::test]
    async fn unknown_link_speed_falls_back_to_speed_test() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/logo.png")
            .with_body(vec![0u8; 64 * 1024])
            .expect(1)
            .create_async()
            .await;

        let status = assessor(
            vec![iface("wlan0", InterfaceKind::Wireless, true, None)],
            &format!("{}/logo.png", server.url()),
        )
        .assess()
        .await;
        mock.assert_async().await;
        assert_eq!(status.connection_type, ConnectionType::WiFi);
        assert!(status.estimated_speed_mbps > 0.0);
    }

    #[tokio::test]
    async fn failed_speed_test_means_too_slow() {
        let status = assessor(
            vec![iface("wlan0", InterfaceKind::Wireless, true, None)],
            "http://127.0.0.1:9/unreachable",
        )
        .assess()
        .await;
        assert!(status.connected);
        assert_eq!(status.estimated_speed_mbps, 0.0);
        assert_eq!(status.unsuitability_reason.as_deref(), Some(REASON_TOO_SLOW));
    }

    #[test]
    fn names_map_to_kinds() {
        assert_eq!(kind_from_name("lo"), InterfaceKind::Loopback);
        assert_eq!(kind_from_name("wlp3s0"), InterfaceKind::Wireless);
        assert_eq!(kind_from_name("enp0s31f6"), InterfaceKind::Ethernet);
        assert_eq!(kind_from_name("wwan0"), InterfaceKind::Mobile);
        assert_eq!(kind_from_name("docker0"), InterfaceKind::Other);
    }

    #[test]
    fn sizing_hints() {
        assert_eq!(recommended_download_limit(ConnectionType::Ethernet, true), 50 * MIB);
        assert_eq!(recommended_download_limit(ConnectionType::Ethernet, false), 1024 * MIB);
        assert_eq!(recommended_download_limit(ConnectionType::WiFi, false), 500 * MIB);
        assert_eq!(recommended_download_limit(ConnectionType::Mobile, false), 100 * MIB);
        assert_eq!(recommended_download_limit(ConnectionType::Unknown, false), 200 * MIB);
        assert_eq!(recommended_buffer_size(100.0), 32 * 1024);
        assert_eq!(recommended_buffer_size(20.0), 16 * 1024);
        assert_eq!(recommended_buffer_size(1.0), 8 * 1024);
    }
}
