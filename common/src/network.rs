use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{DeviceConfig, NetworkConfig},
    hal::NetworkDriver,
    supervisor::{frozen, Guard},
    types::{BoardType, NetworkMode, RadioStatus},
};

pub const NETWORK_RETRY_INTERVAL_MS: u64 = 30_000;
pub const DHCP_RENEW_INTERVAL_MS: u64 = 60_000;
pub const CONNECT_TIMEOUT_MS: u32 = 5_000;
pub const ACCESS_POINT_PREFIX: &str = "opta2iot";
pub const ACCESS_POINT_PASSWORD: &str = "opta2iot";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0} hardware not found")]
    NoHardware(&'static str),
    #[error("ethernet cable is not connected")]
    CableUnplugged,
    #[error("failed to configure network: {0}")]
    Negotiation(String),
    #[error("failed to connect to wifi: {0}")]
    Wifi(String),
    #[error("failed to create wifi access point: {0}")]
    AccessPoint(String),
}

/// One-time transport decision made at setup.
pub fn select_mode(board: BoardType, radio_ready: bool, network: &NetworkConfig) -> NetworkMode {
    if !(board.has_wifi() && radio_ready && network.wifi) {
        NetworkMode::Ethernet
    } else if network.has_wifi_credentials() {
        NetworkMode::WifiStandard
    } else {
        NetworkMode::WifiAccessPoint
    }
}

pub fn access_point_ssid(device_id: &str) -> String {
    format!("{ACCESS_POINT_PREFIX}{device_id}")
}

#[derive(Debug)]
pub struct NetworkSession {
    mode: NetworkMode,
    connected: bool,
    configured: bool,
    last_attempt_ms: Option<u64>,
    last_renew_ms: u64,
    link_up: bool,
    radio_status: Option<RadioStatus>,
    first_transition_seen: bool,
}

impl NetworkSession {
    pub fn new(mode: NetworkMode) -> Self {
        Self {
            mode,
            connected: false,
            configured: false,
            last_attempt_ms: None,
            last_renew_ms: 0,
            link_up: false,
            radio_status: None,
            first_transition_seen: false,
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    /// Brings the selected transport up once. Missing hardware and a failed access point are
    /// fatal; a failed client connect is left to the retry timer.
    pub fn setup<N, G>(
        &mut self,
        now_ms: u64,
        driver: &mut N,
        guard: &mut G,
        config: &DeviceConfig,
    ) -> Result<(), NetworkError>
    where
        N: NetworkDriver + ?Sized,
        G: Guard + ?Sized,
    {
        info!("network mode {}", self.mode.as_str());
        match self.mode {
            NetworkMode::Ethernet => {
                if !driver.ethernet_present() {
                    return Err(NetworkError::NoHardware("ethernet"));
                }
                if let Err(err) = self.connect_ethernet(now_ms, driver, guard, &config.network) {
                    warn!("{err}");
                }
            }
            NetworkMode::WifiStandard => {
                if !driver.wifi_present() {
                    return Err(NetworkError::NoHardware("wifi"));
                }
                if let Err(err) = self.connect_wifi(now_ms, driver, guard, &config.network) {
                    warn!("{err}");
                }
            }
            NetworkMode::WifiAccessPoint => {
                if !driver.wifi_present() {
                    return Err(NetworkError::NoHardware("wifi"));
                }
                let ssid = access_point_ssid(&config.device_id);
                debug!("creating access point {ssid}");
                self.last_attempt_ms = Some(now_ms);
                frozen(guard, |_| {
                    driver.wifi_begin_access_point(&ssid, ACCESS_POINT_PASSWORD, config.network.ip)
                })?;
                self.connected = true;
                self.configured = true;
                info!("access point {ssid} listening at {}", config.network.ip);
            }
        }
        Ok(())
    }

    /// Non-blocking maintenance, called once per loop pass.
    pub fn poll<N, G>(
        &mut self,
        now_ms: u64,
        driver: &mut N,
        guard: &mut G,
        config: &DeviceConfig,
    ) where
        N: NetworkDriver + ?Sized,
        G: Guard + ?Sized,
    {
        match self.mode {
            NetworkMode::Ethernet => self.poll_ethernet(now_ms, driver, guard, &config.network),
            NetworkMode::WifiStandard => {
                if self.connected && driver.wifi_status() != RadioStatus::Connected {
                    warn!("wifi connection lost");
                    self.connected = false;
                }
                if !self.connected && self.retry_due(now_ms) {
                    if let Err(err) = self.connect_wifi(now_ms, driver, guard, &config.network) {
                        warn!("{err}");
                    }
                }
            }
            NetworkMode::WifiAccessPoint => self.poll_access_point(driver),
        }
    }

    fn poll_ethernet<N, G>(
        &mut self,
        now_ms: u64,
        driver: &mut N,
        guard: &mut G,
        network: &NetworkConfig,
    ) where
        N: NetworkDriver + ?Sized,
        G: Guard + ?Sized,
    {
        let link = driver.ethernet_link_up();
        if link != self.link_up {
            self.link_up = link;
            if link {
                info!("ethernet cable connected");
                self.connected = self.configured;
            } else {
                warn!("ethernet cable disconnected");
                self.connected = false;
            }
        }

        if !self.connected {
            if link && self.retry_due(now_ms) {
                if let Err(err) = self.connect_ethernet(now_ms, driver, guard, network) {
                    warn!("{err}");
                }
            }
            return;
        }

        if network.dhcp && now_ms.saturating_sub(self.last_renew_ms) > DHCP_RENEW_INTERVAL_MS {
            self.last_renew_ms = now_ms;
            driver.ethernet_maintain();
        }
    }

    fn poll_access_point<N: NetworkDriver + ?Sized>(&mut self, driver: &mut N) {
        let status = driver.wifi_status();
        if self.radio_status == Some(status) {
            return;
        }
        let previous = self.radio_status.replace(status);
        if previous.is_none() {
            return;
        }
        if status == RadioStatus::ClientAttached {
            info!("device connected to access point");
        } else if !self.first_transition_seen {
            self.first_transition_seen = true;
        } else {
            warn!("device disconnected from access point");
        }
    }

    fn retry_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map_or(true, |at| now_ms.saturating_sub(at) >= NETWORK_RETRY_INTERVAL_MS)
    }

    fn connect_ethernet<N, G>(
        &mut self,
        now_ms: u64,
        driver: &mut N,
        guard: &mut G,
        network: &NetworkConfig,
    ) -> Result<(), NetworkError>
    where
        N: NetworkDriver + ?Sized,
        G: Guard + ?Sized,
    {
        debug!(
            "connecting ethernet ({})",
            if network.dhcp { "dhcp" } else { "static" }
        );
        self.last_attempt_ms = Some(now_ms);
        let result = frozen(guard, |_| {
            driver.ethernet_begin(&network.ip_assignment(), CONNECT_TIMEOUT_MS)
        });
        self.link_up = driver.ethernet_link_up();
        match result {
            Ok(()) => {
                self.connected = true;
                self.configured = true;
                self.last_renew_ms = now_ms;
                info!("ethernet connected, ip {}", driver.local_ip(self.mode));
                Ok(())
            }
            Err(err) => {
                self.connected = false;
                if self.link_up {
                    Err(NetworkError::Negotiation(err.to_string()))
                } else {
                    Err(NetworkError::CableUnplugged)
                }
            }
        }
    }

    fn connect_wifi<N, G>(
        &mut self,
        now_ms: u64,
        driver: &mut N,
        guard: &mut G,
        network: &NetworkConfig,
    ) -> Result<(), NetworkError>
    where
        N: NetworkDriver + ?Sized,
        G: Guard + ?Sized,
    {
        debug!("connecting to wifi {}", network.ssid);
        self.last_attempt_ms = Some(now_ms);
        let result = frozen(guard, |_| {
            driver.wifi_begin(
                &network.ssid,
                &network.password,
                &network.ip_assignment(),
                CONNECT_TIMEOUT_MS,
            )
        });
        match result {
            Ok(()) => {
                self.connected = true;
                self.configured = true;
                info!("wifi connected, ip {}", driver.local_ip(self.mode));
                Ok(())
            }
            Err(err) => {
                self.connected = false;
                Err(NetworkError::Wifi(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeNetwork, NullGuard};

    fn wifi_config(ssid: &str, password: &str) -> NetworkConfig {
        NetworkConfig {
            wifi: true,
            ssid: ssid.into(),
            password: password.into(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn mode_selection_follows_hardware_and_credentials() {
        let creds = wifi_config("plant", "secret");
        let open = wifi_config("", "");
        let disabled = NetworkConfig {
            wifi: false,
            ..creds.clone()
        };

        assert_eq!(
            select_mode(BoardType::Wifi, true, &creds),
            NetworkMode::WifiStandard
        );
        assert_eq!(
            select_mode(BoardType::Wifi, true, &open),
            NetworkMode::WifiAccessPoint
        );
        assert_eq!(
            select_mode(BoardType::Wifi, true, &disabled),
            NetworkMode::Ethernet
        );
        assert_eq!(
            select_mode(BoardType::Wifi, false, &creds),
            NetworkMode::Ethernet
        );
        assert_eq!(
            select_mode(BoardType::Lite, true, &creds),
            NetworkMode::Ethernet
        );
    }

    #[test]
    fn ethernet_failure_is_not_fatal_and_retries_on_interval() {
        let mut driver = FakeNetwork {
            link_up: true,
            ethernet_ok: false,
            ..FakeNetwork::default()
        };
        let mut guard = NullGuard::default();
        let config = DeviceConfig::default();
        let mut session = NetworkSession::new(NetworkMode::Ethernet);

        session.setup(0, &mut driver, &mut guard, &config).unwrap();
        assert!(!session.is_connected());

        let mut attempts = vec![0];
        let mut seen = driver.ethernet_attempts;
        for now in (0..=3 * NETWORK_RETRY_INTERVAL_MS).step_by(500) {
            session.poll(now, &mut driver, &mut guard, &config);
            if driver.ethernet_attempts != seen {
                seen = driver.ethernet_attempts;
                attempts.push(now);
            }
        }

        assert_eq!(
            attempts,
            vec![
                0,
                NETWORK_RETRY_INTERVAL_MS,
                2 * NETWORK_RETRY_INTERVAL_MS,
                3 * NETWORK_RETRY_INTERVAL_MS
            ]
        );
        assert!(attempts
            .windows(2)
            .all(|pair| pair[1] - pair[0] >= NETWORK_RETRY_INTERVAL_MS));
        assert_eq!(guard.freezes, 4);
        assert_eq!(guard.releases, 4);
    }

    #[test]
    fn unplugged_cable_is_reported_and_not_retried() {
        let mut driver = FakeNetwork::default();
        let mut guard = NullGuard::default();
        let mut session = NetworkSession::new(NetworkMode::Ethernet);

        let err = session
            .connect_ethernet(0, &mut driver, &mut guard, &NetworkConfig::default())
            .unwrap_err();
        assert!(matches!(err, NetworkError::CableUnplugged));

        session.poll(
            NETWORK_RETRY_INTERVAL_MS * 2,
            &mut driver,
            &mut guard,
            &DeviceConfig::default(),
        );
        assert_eq!(driver.ethernet_attempts, 1);
    }

    #[test]
    fn link_transitions_flip_connection_immediately() {
        let mut driver = FakeNetwork {
            link_up: true,
            ..FakeNetwork::default()
        };
        let mut guard = NullGuard::default();
        let config = DeviceConfig::default();
        let mut session = NetworkSession::new(NetworkMode::Ethernet);
        session.setup(0, &mut driver, &mut guard, &config).unwrap();
        assert!(session.is_connected());

        driver.link_up = false;
        session.poll(10, &mut driver, &mut guard, &config);
        assert!(!session.is_connected());

        driver.link_up = true;
        session.poll(20, &mut driver, &mut guard, &config);
        assert!(session.is_connected());
        assert_eq!(driver.ethernet_attempts, 1);
    }

    #[test]
    fn dhcp_lease_is_renewed_periodically() {
        let mut driver = FakeNetwork {
            link_up: true,
            ..FakeNetwork::default()
        };
        let mut guard = NullGuard::default();
        let mut config = DeviceConfig::default();
        config.network.dhcp = true;
        let mut session = NetworkSession::new(NetworkMode::Ethernet);
        session.setup(0, &mut driver, &mut guard, &config).unwrap();

        session.poll(DHCP_RENEW_INTERVAL_MS, &mut driver, &mut guard, &config);
        assert_eq!(driver.maintains, 0);
        session.poll(DHCP_RENEW_INTERVAL_MS + 1, &mut driver, &mut guard, &config);
        assert_eq!(driver.maintains, 1);
    }

    #[test]
    fn access_point_uses_derived_ssid_and_static_ip() {
        let mut driver = FakeNetwork::default();
        let mut guard = NullGuard::default();
        let config = DeviceConfig::default();
        let mut session = NetworkSession::new(NetworkMode::WifiAccessPoint);

        session.setup(0, &mut driver, &mut guard, &config).unwrap();

        assert!(session.is_connected());
        assert_eq!(
            driver.access_point,
            Some((
                "opta2iot99999".to_string(),
                ACCESS_POINT_PASSWORD.to_string(),
                config.network.ip
            ))
        );
    }

    #[test]
    fn access_point_failure_is_fatal() {
        let mut driver = FakeNetwork {
            access_point_ok: false,
            ..FakeNetwork::default()
        };
        let mut guard = NullGuard::default();
        let mut session = NetworkSession::new(NetworkMode::WifiAccessPoint);

        let result = session.setup(0, &mut driver, &mut guard, &DeviceConfig::default());
        assert!(matches!(result, Err(NetworkError::AccessPoint(_))));
    }

    #[test]
    fn missing_radio_is_fatal_for_wifi_modes() {
        let mut driver = FakeNetwork {
            wifi_present: false,
            ..FakeNetwork::default()
        };
        let mut guard = NullGuard::default();
        let mut session = NetworkSession::new(NetworkMode::WifiStandard);

        let result = session.setup(0, &mut driver, &mut guard, &DeviceConfig::default());
        assert!(matches!(result, Err(NetworkError::NoHardware("wifi"))));
    }

    #[test]
    fn standard_wifi_reconnects_after_loss() {
        let mut driver = FakeNetwork::default();
        let mut guard = NullGuard::default();
        let mut config = DeviceConfig::default();
        config.network = wifi_config("plant", "secret");
        let mut session = NetworkSession::new(NetworkMode::WifiStandard);
        session.setup(0, &mut driver, &mut guard, &config).unwrap();
        assert!(session.is_connected());

        driver.radio_status = RadioStatus::Disconnected;
        driver.wifi_ok = false;
        session.poll(100, &mut driver, &mut guard, &config);
        assert!(!session.is_connected());
        assert_eq!(driver.wifi_attempts, 1);

        driver.wifi_ok = true;
        session.poll(NETWORK_RETRY_INTERVAL_MS, &mut driver, &mut guard, &config);
        assert!(session.is_connected());
        assert_eq!(driver.wifi_attempts, 2);
    }

    #[test]
    fn access_point_first_transition_is_suppressed() {
        let mut driver = FakeNetwork {
            radio_status: RadioStatus::Listening,
            ..FakeNetwork::default()
        };
        let mut session = NetworkSession::new(NetworkMode::WifiAccessPoint);

        session.poll_access_point(&mut driver);
        driver.radio_status = RadioStatus::Idle;
        session.poll_access_point(&mut driver);
        assert!(session.first_transition_seen);

        driver.radio_status = RadioStatus::ClientAttached;
        session.poll_access_point(&mut driver);
        assert_eq!(session.radio_status, Some(RadioStatus::ClientAttached));
    }
}
