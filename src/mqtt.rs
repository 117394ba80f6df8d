//! Persistent MQTT broker connection with a bounded outbound queue and a
//! dedicated drain worker (spec §4.5).
//!
//! Two background tasks share one `rumqttc` client/eventloop pair: one
//! drives the eventloop (the only task that touches the socket) and
//! tracks connection state in a `watch` channel; the other drains the
//! outbound queue and calls `client.publish`, waiting on that same
//! channel whenever the connection drops.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::MqttSettings;
use crate::discovery::MqttMessage as DiscoveryMessage;
use crate::health::HealthRegistry;

#[derive(Debug, Clone)]
struct Queued {
    topic: String,
    payload: String,
    qos: QoS,
    retain: bool,
}

/// Handle to the running publisher. Cloning is cheap; every clone shares
/// the same outbound queue.
#[derive(Clone)]
pub struct MqttPublisher {
    tx: mpsc::Sender<Queued>,
    queued_len: Arc<AtomicUsize>,
    default_qos: QoS,
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any certificate. Only reachable via `mqtt.tls_insecure`,
    /// which is refused outside explicit opt-in (spec §6 security notes).
    #[derive(Debug)]
    pub struct NoVerifier(pub rustls::crypto::CryptoProvider);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Builds a rustls client config from `mqtt.tls_ca_cert`. A CA file is
/// required unless `tls_insecure` is set — there is no bundled root
/// store, so trusting the platform roots is not an option here.
fn build_tls_config(settings: &MqttSettings) -> anyhow::Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut roots = rustls::RootCertStore::empty();

    if let Some(ca_path) = &settings.tls_ca_cert {
        let mut reader = std::io::BufReader::new(std::fs::File::open(ca_path)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
    } else if !settings.tls_insecure {
        anyhow::bail!("mqtt.tls is enabled but mqtt.tls_ca_cert is not set and mqtt.tls_insecure is false");
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let mut config = builder.with_no_client_auth();

    if settings.tls_insecure {
        warn!("mqtt TLS certificate verification disabled via tls_insecure, do not use in production");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerifier(provider)));
    }

    Ok(config)
}

fn build_mqtt_options(settings: &MqttSettings) -> anyhow::Result<MqttOptions> {
    let mut opts = MqttOptions::new(settings.client_id.clone(), settings.broker.clone(), settings.port);
    opts.set_keep_alive(Duration::from_secs(settings.keepalive.max(5)));
    opts.set_clean_session(false);

    if let (Some(user), Some(pass)) = (&settings.user, &settings.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }

    if settings.tls {
        let tls_config = build_tls_config(settings)?;
        opts.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls_config))));
    }

    Ok(opts)
}

impl MqttPublisher {
    /// Spawns the eventloop-driver and drain-worker tasks and returns a
    /// handle plus their join handles. `capacity` bounds the outbound
    /// queue (spec §4.5 default 1000); overflow drops the newest message
    /// and bumps the `mqtt_errors_total{queue_full}` counter.
    pub fn spawn(
        settings: &MqttSettings,
        capacity: usize,
        health: Arc<HealthRegistry>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<(Self, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)> {
        let opts = build_mqtt_options(settings)?;
        let (client, eventloop) = AsyncClient::new(opts, capacity.max(1));

        let (connected_tx, connected_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queued_len = Arc::new(AtomicUsize::new(0));

        let driver_handle = tokio::spawn(drive_eventloop(
            eventloop,
            health.clone(),
            connected_tx,
            shutdown_rx.clone(),
        ));

        let drain_handle = tokio::spawn(drain_loop(
            client,
            rx,
            connected_rx,
            health,
            queued_len.clone(),
            { shutdown_rx.mark_changed(); shutdown_rx },
        ));

        Ok((
            Self {
                tx,
                queued_len,
                default_qos: qos_from_u8(settings.qos),
            },
            driver_handle,
            drain_handle,
        ))
    }

    /// Enqueues a discovery/state message with the publisher's default
    /// QoS. Drops the newest message on a full queue rather than
    /// blocking the poll job that produced it.
    pub fn enqueue(&self, message: DiscoveryMessage, health: &HealthRegistry) {
        let queued = Queued {
            topic: message.topic,
            payload: message.payload,
            qos: self.default_qos,
            retain: message.retain,
        };
        match self.tx.try_send(queued) {
            Ok(()) => {
                self.queued_len.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("mqtt outbound queue full, dropping newest message");
                health.record_mqtt_error("queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("mqtt publisher drain task is gone, message dropped");
                health.record_mqtt_error("publisher_closed");
            }
        }
    }

    /// Blocks until the outbound queue drains or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.queued_len.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("mqtt flush timed out with messages still queued");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn drive_eventloop(
    mut eventloop: rumqttc::EventLoop,
    health: Arc<HealthRegistry>,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt broker connection established");
                        let _ = connected_tx.send(true);
                        health.set_mqtt_connected(true);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt broker disconnected");
                        let _ = connected_tx.send(false);
                        health.set_mqtt_connected(false);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error, retrying");
                        let _ = connected_tx.send(false);
                        health.set_mqtt_connected(false);
                        health.record_mqtt_error("connect");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}

async fn drain_loop(
    client: AsyncClient,
    mut rx: mpsc::Receiver<Queued>,
    mut connected_rx: watch::Receiver<bool>,
    health: Arc<HealthRegistry>,
    queued_len: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut pending: Option<Queued> = None;

    loop {
        if *shutdown_rx.borrow() && pending.is_none() {
            // Drain remaining queued messages best-effort before exiting,
            // but do not block forever on a broker that never reconnects.
            match rx.try_recv() {
                Ok(m) => pending = Some(m),
                Err(_) => break,
            }
        }

        let msg = match pending.take() {
            Some(m) => m,
            None => {
                tokio::select! {
                    _ = shutdown_rx.changed() => continue,
                    m = rx.recv() => match m {
                        Some(m) => m,
                        None => break,
                    },
                }
            }
        };

        if !*connected_rx.borrow() {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        pending = Some(msg);
                        continue;
                    }
                }
                res = connected_rx.wait_for(|c| *c) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            if pending.is_some() {
                continue;
            }
        }

        match client.publish(&msg.topic, msg.qos, msg.retain, msg.payload.clone()).await {
            Ok(()) => {
                health.record_mqtt_published();
                queued_len.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(error = %e, topic = %msg.topic, "mqtt publish failed, will retry after reconnect");
                health.record_mqtt_error("publish");
                pending = Some(msg);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
