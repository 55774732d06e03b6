use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::DeviceConfig,
    hal::{BrokerClient, BrokerMessage, BrokerOptions},
    io::InputSample,
    network::CONNECT_TIMEOUT_MS,
    supervisor::{frozen, Guard},
    topics::Topics,
    types::{NetworkMode, FIRMWARE_REVISION, OUTPUT_COUNT},
};

pub const BROKER_RETRY_INTERVAL_MS: u64 = 30_000;
/// Incoming payloads are cut to this many bytes before routing.
pub const BROKER_PAYLOAD_LIMIT: usize = 19;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCommand {
    PublishDevice,
    SetOutput { index: usize, on: bool },
}

/// Network facts the session needs for one pass.
#[derive(Debug, Clone, Copy)]
pub struct Uplink {
    pub connected: bool,
    pub mode: NetworkMode,
}

#[derive(Debug, Default)]
pub struct BrokerSession {
    connected: bool,
    last_retry_ms: Option<u64>,
    last_publish_ms: Option<u64>,
    subscriptions: Vec<String>,
}

impl BrokerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Returns true only when a new session was established on this call; the caller then
    /// publishes device info.
    pub fn connect<C, G>(
        &mut self,
        now_ms: u64,
        client: &mut C,
        guard: &mut G,
        uplink: Uplink,
        config: &DeviceConfig,
    ) -> bool
    where
        C: BrokerClient + ?Sized,
        G: Guard + ?Sized,
    {
        if !uplink.connected || uplink.mode.is_access_point() || !config.broker.is_enabled() {
            self.connected = false;
            return false;
        }
        if client.is_connected() {
            self.connected = true;
            self.last_retry_ms = None;
            return false;
        }
        if self.connected {
            warn!("broker connection lost");
            self.connected = false;
        }
        if self
            .last_retry_ms
            .is_some_and(|at| now_ms.saturating_sub(at) < BROKER_RETRY_INTERVAL_MS)
        {
            return false;
        }
        self.last_retry_ms = Some(now_ms);

        let broker = &config.broker;
        debug!("connecting to broker {}:{}", broker.host(), broker.port);
        let options = BrokerOptions {
            client_id: &config.device_id,
            host: broker.host(),
            port: broker.port,
            user: &broker.user,
            password: &broker.password,
            timeout_ms: CONNECT_TIMEOUT_MS,
        };
        if let Err(err) = frozen(guard, |_| client.connect(&options)) {
            warn!("{err}");
            return false;
        }
        self.connected = true;
        self.last_retry_ms = None;
        info!("connected to broker {}:{}", broker.host(), broker.port);

        let topics = Topics::new(&broker.base, &config.device_id);
        self.subscriptions.clear();
        let wanted = std::iter::once(topics.device_get())
            .chain((0..OUTPUT_COUNT).map(|index| topics.output(index)));
        for topic in wanted {
            match client.subscribe(&topic) {
                Ok(()) => {
                    debug!("subscribed to {topic}");
                    self.subscriptions.push(topic);
                }
                Err(err) => warn!("subscribe {topic}: {err}"),
            }
        }
        true
    }

    /// At most one pending message, already routed.
    pub fn poll_command<C: BrokerClient + ?Sized>(
        &mut self,
        client: &mut C,
        topics: &Topics,
    ) -> Option<BrokerCommand> {
        if !self.connected {
            return None;
        }
        let message = client.poll_message()?;
        route(topics, &message)
    }

    /// True once every `interval_secs` while connected; zero disables.
    pub fn periodic_due(&mut self, now_ms: u64, interval_secs: u32) -> bool {
        if !self.connected || interval_secs == 0 {
            return false;
        }
        let interval_ms = u64::from(interval_secs) * 1_000;
        match self.last_publish_ms {
            Some(at) if now_ms.saturating_sub(at) < interval_ms => false,
            _ => {
                self.last_publish_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn publish<C: BrokerClient + ?Sized>(
        &mut self,
        client: &mut C,
        topic: &str,
        payload: &str,
    ) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        client.publish(topic, payload.as_bytes())
    }

    pub fn publish_device<C: BrokerClient + ?Sized>(
        &mut self,
        client: &mut C,
        topics: &Topics,
        board_name: &str,
        ip: &str,
    ) -> Result<(), BrokerError> {
        self.publish(client, &topics.device_type(), board_name)?;
        self.publish(client, &topics.device_ip(), ip)?;
        self.publish(client, &topics.device_revision(), &FIRMWARE_REVISION.to_string())?;
        debug!("device info published");
        Ok(())
    }

    pub fn publish_input<C: BrokerClient + ?Sized>(
        &mut self,
        client: &mut C,
        topics: &Topics,
        sample: &InputSample,
    ) -> Result<(), BrokerError> {
        self.publish(client, &topics.input_value(sample.index), &sample.value)?;
        self.publish(
            client,
            &topics.input_type(sample.index),
            &sample.kind.code().to_string(),
        )
    }

    pub fn publish_inputs<C: BrokerClient + ?Sized>(
        &mut self,
        client: &mut C,
        topics: &Topics,
        samples: &[InputSample],
    ) -> Result<(), BrokerError> {
        for sample in samples {
            self.publish_input(client, topics, sample)?;
        }
        debug!("inputs published");
        Ok(())
    }
}

pub fn route(topics: &Topics, message: &BrokerMessage) -> Option<BrokerCommand> {
    let payload = &message.payload[..message.payload.len().min(BROKER_PAYLOAD_LIMIT)];
    let payload = String::from_utf8_lossy(payload);
    debug!("message on {}: {payload}", message.topic);

    if message.topic == topics.device_get() {
        return Some(BrokerCommand::PublishDevice);
    }
    let index = topics.parse_output(&message.topic, OUTPUT_COUNT)?;
    let value = leading_int(&payload);
    if value.is_none() {
        warn!("payload {payload:?} for O{} is not a number, treating as 0", index + 1);
    }
    Some(BrokerCommand::SetOutput {
        index,
        on: value.unwrap_or(0) != 0,
    })
}

/// Integer spelled by the leading digits of `text`, after optional whitespace and sign.
/// Trailing garbage is ignored. `None` when no digit follows.
fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (negative, rest) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let end = rest.bytes().take_while(u8::is_ascii_digit).count();
    if end == 0 {
        return None;
    }
    let magnitude = rest[..end]
        .bytes()
        .fold(0i64, |acc, digit| acc.saturating_mul(10).saturating_add(i64::from(digit - b'0')));
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::InputType,
        testing::{FakeBroker, NullGuard},
    };

    const ONLINE: Uplink = Uplink {
        connected: true,
        mode: NetworkMode::Ethernet,
    };

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.device_id = "gw1".into();
        config.broker.base = "opta/".into();
        config
    }

    fn message(topic: &str, payload: &str) -> BrokerMessage {
        BrokerMessage {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn connect_subscribes_to_device_and_outputs() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();

        assert!(session.connect(0, &mut client, &mut guard, ONLINE, &config()));

        assert_eq!(
            session.subscriptions(),
            [
                "opta/gw1/device/get",
                "opta/gw1/O1",
                "opta/gw1/O2",
                "opta/gw1/O3",
                "opta/gw1/O4"
            ]
        );
        assert_eq!(client.connects, 1);
        assert_eq!(guard.freezes, 1);
    }

    #[test]
    fn connect_is_noop_offline_in_access_point_or_disabled() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();
        let mut disabled = config();
        disabled.broker.set_host("");

        let offline = Uplink {
            connected: false,
            ..ONLINE
        };
        let access_point = Uplink {
            connected: true,
            mode: NetworkMode::WifiAccessPoint,
        };
        assert!(!session.connect(0, &mut client, &mut guard, offline, &config()));
        assert!(!session.connect(0, &mut client, &mut guard, access_point, &config()));
        assert!(!session.connect(0, &mut client, &mut guard, ONLINE, &disabled));
        assert_eq!(client.connects, 0);
    }

    #[test]
    fn already_connected_session_is_refreshed_without_reconnect() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();
        session.connect(0, &mut client, &mut guard, ONLINE, &config());

        assert!(!session.connect(10, &mut client, &mut guard, ONLINE, &config()));
        assert!(session.is_connected());
        assert_eq!(client.connects, 1);
    }

    #[test]
    fn failed_connect_waits_for_retry_interval() {
        let mut client = FakeBroker {
            accept: false,
            ..FakeBroker::default()
        };
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();

        for now in (0..BROKER_RETRY_INTERVAL_MS).step_by(100) {
            session.connect(now, &mut client, &mut guard, ONLINE, &config());
        }
        assert_eq!(client.connects, 1);

        client.accept = true;
        assert!(session.connect(
            BROKER_RETRY_INTERVAL_MS,
            &mut client,
            &mut guard,
            ONLINE,
            &config()
        ));
        assert_eq!(client.connects, 2);
    }

    #[test]
    fn lost_connection_is_noticed_and_retried() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();
        session.connect(0, &mut client, &mut guard, ONLINE, &config());

        client.connected = false;
        client.accept = false;
        assert!(!session.connect(100, &mut client, &mut guard, ONLINE, &config()));
        assert!(!session.is_connected());
        assert_eq!(client.connects, 2);
    }

    #[test]
    fn routes_device_request_and_outputs() {
        let topics = Topics::new("opta/", "gw1");

        assert_eq!(
            route(&topics, &message("opta/gw1/device/get", "")),
            Some(BrokerCommand::PublishDevice)
        );
        assert_eq!(
            route(&topics, &message("opta/gw1/O2", "1")),
            Some(BrokerCommand::SetOutput { index: 1, on: true })
        );
        assert_eq!(
            route(&topics, &message("opta/gw1/O2", "0")),
            Some(BrokerCommand::SetOutput {
                index: 1,
                on: false
            })
        );
        assert_eq!(route(&topics, &message("opta/gw1/O9", "1")), None);
        assert_eq!(route(&topics, &message("elsewhere", "1")), None);
    }

    #[test]
    fn output_payload_uses_leading_digits() {
        let topics = Topics::new("opta/", "gw1");
        let set = |payload: &str| route(&topics, &message("opta/gw1/O2", payload));

        assert_eq!(set("1abc"), Some(BrokerCommand::SetOutput { index: 1, on: true }));
        assert_eq!(set("  -3"), Some(BrokerCommand::SetOutput { index: 1, on: true }));
        assert_eq!(set("on"), Some(BrokerCommand::SetOutput { index: 1, on: false }));
        assert_eq!(set(""), Some(BrokerCommand::SetOutput { index: 1, on: false }));
        assert_eq!(set("0x1"), Some(BrokerCommand::SetOutput { index: 1, on: false }));
    }

    #[test]
    fn leading_int_reads_sign_and_digits() {
        assert_eq!(leading_int(" +42rest"), Some(42));
        assert_eq!(leading_int("-7"), Some(-7));
        assert_eq!(leading_int("-"), None);
        assert_eq!(leading_int("abc"), None);
    }

    #[test]
    fn oversized_payload_is_truncated_before_parsing() {
        let topics = Topics::new("opta/", "gw1");
        let long = format!("{}{}", "0".repeat(BROKER_PAYLOAD_LIMIT), "1");
        assert_eq!(
            route(&topics, &message("opta/gw1/O1", &long)),
            Some(BrokerCommand::SetOutput {
                index: 0,
                on: false
            })
        );
    }

    #[test]
    fn device_and_input_publishes_use_expected_topics() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();
        session.connect(0, &mut client, &mut guard, ONLINE, &config());
        let topics = Topics::new("opta/", "gw1");

        session
            .publish_device(&mut client, &topics, "Opta Lite AFX00003", "10.0.0.5")
            .unwrap();
        session
            .publish_input(
                &mut client,
                &topics,
                &InputSample {
                    index: 0,
                    kind: InputType::Analog,
                    value: "4.9".into(),
                },
            )
            .unwrap();

        assert_eq!(
            client.published,
            vec![
                ("opta/gw1/device/type".to_string(), "Opta Lite AFX00003".to_string()),
                ("opta/gw1/device/ip".to_string(), "10.0.0.5".to_string()),
                ("opta/gw1/device/revision".to_string(), "2025121900".to_string()),
                ("opta/gw1/I1/val".to_string(), "4.9".to_string()),
                ("opta/gw1/I1/type".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn publish_without_session_is_refused() {
        let mut client = FakeBroker::default();
        let mut session = BrokerSession::new();
        let result = session.publish(&mut client, "opta/gw1/device/ip", "10.0.0.5");
        assert!(matches!(result, Err(BrokerError::NotConnected)));
        assert!(client.published.is_empty());
    }

    #[test]
    fn periodic_publish_follows_interval() {
        let mut client = FakeBroker::default();
        let mut guard = NullGuard::default();
        let mut session = BrokerSession::new();
        assert!(!session.periodic_due(0, 5));

        session.connect(0, &mut client, &mut guard, ONLINE, &config());
        assert!(!session.periodic_due(0, 0));
        assert!(session.periodic_due(0, 5));
        assert!(!session.periodic_due(4_999, 5));
        assert!(session.periodic_due(5_000, 5));
    }
}
