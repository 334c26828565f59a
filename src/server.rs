use crate::clock::DisciplinedClock;
use crate::config::Config;
use crate::packet::{LeapIndicator, NtpMode, NtpPacket};
use anyhow::{Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Identifiant de référence annoncé : source GNSS locale
pub const REFERENCE_ID: [u8; 4] = *b"GPS\0";

/// Pause entre deux scrutations quand aucun datagramme n'est disponible
const IDLE_POLL_PAUSE: Duration = Duration::from_millis(100);

/// Statistiques du serveur
pub struct ServerStats {
    pub requests_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub requests_ignored: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats {
            requests_received: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            requests_ignored: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn log_stats(&self) {
        let received = self.requests_received.load(Ordering::Relaxed);
        let sent = self.replies_sent.load(Ordering::Relaxed);
        let ignored = self.requests_ignored.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);

        info!(
            "Stats: received={}, replied={}, ignored={}, errors={}",
            received, sent, ignored, errors
        );
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport datagramme consommé par le serveur : scrutation non bloquante
/// en entrée, envoi vers l'adresse du demandeur en sortie
pub trait Transport: Send + Sync {
    /// Retourne le prochain datagramme disponible, ou None s'il n'y en a pas
    fn poll_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;

    /// Envoie un datagramme à l'adresse donnée
    fn send(&self, buf: &[u8], dest: SocketAddr) -> Result<()>;
}

/// Transport UDP standard (socket non bloquante)
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(bind_address: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_address)
            .with_context(|| format!("Failed to bind UDP socket on {}", bind_address))?;

        socket
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;

        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    fn poll_datagram(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => Ok(Some((size, addr))),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, buf: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.send_to(buf, dest)?;
        Ok(())
    }
}

/// Serveur NTP stratum 1 adossé à l'horloge disciplinée
pub struct NtpServer {
    clock: Arc<DisciplinedClock>,
    precision: i8,
    log_requests: bool,
    stats: ServerStats,
}

impl NtpServer {
    pub fn new(config: &Config, clock: Arc<DisciplinedClock>) -> Self {
        NtpServer {
            clock,
            precision: config.server.precision,
            log_requests: config.logging.log_requests,
            stats: ServerStats::new(),
        }
    }

    /// Boucle de service : scrute le transport, répond à chaque requête,
    /// marque une pause quand rien n'est disponible. Tourne jusqu'au
    /// positionnement du drapeau d'arrêt.
    pub fn run(&self, transport: &dyn Transport, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!("NTP server running (stratum 1, precision 2^{})", self.precision);

        let mut buffer = [0u8; 512];
        let mut last_stats_log = Instant::now();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown signal received, stopping NTP server...");
                break;
            }

            match transport.poll_datagram(&mut buffer) {
                Ok(Some((size, client_addr))) => {
                    self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

                    match self.handle_datagram(&buffer[..size]) {
                        Some(response) => {
                            if let Err(e) = transport.send(&response, client_addr) {
                                error!("Failed to send NTP response to {}: {:#}", client_addr, e);
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            } else {
                                self.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
                                if self.log_requests {
                                    debug!("NTP response sent to {}", client_addr);
                                }
                            }
                        }
                        None => {
                            // Datagramme trop court : ignoré en silence
                            self.stats.requests_ignored.fetch_add(1, Ordering::Relaxed);
                            if self.log_requests {
                                debug!(
                                    "Ignored {}-byte datagram from {}",
                                    size, client_addr
                                );
                            }
                        }
                    }
                }
                Ok(None) => {
                    std::thread::sleep(IDLE_POLL_PAUSE);
                }
                Err(e) => {
                    error!("Error receiving datagram: {:#}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(IDLE_POLL_PAUSE);
                }
            }

            if last_stats_log.elapsed() > Duration::from_secs(60) {
                self.stats.log_stats();
                last_stats_log = Instant::now();
            }
        }

        info!("NTP server stopped");
        Ok(())
    }

    /// Construit la réponse à un datagramme entrant.
    /// Retourne None pour un datagramme de moins de 48 octets (ignoré,
    /// pas de réponse d'erreur). Tout datagramme d'au moins 48 octets est
    /// traité comme une requête client, sans contrôle de mode ni version.
    pub fn handle_datagram(&self, datagram: &[u8]) -> Option<[u8; NtpPacket::SIZE]> {
        // TIMESTAMP T2 : moment de réception, lu au plus tôt
        let receive_time = self.clock.now_ntp();

        let request = NtpPacket::from_bytes(datagram).ok()?;

        let mut response = NtpPacket::new_server_response();
        response.leap_indicator = LeapIndicator::NoWarning;
        response.version = 4;
        response.mode = NtpMode::Server;
        response.stratum = 1;

        // Poll : copié depuis la requête
        response.poll = request.poll;

        response.precision = self.precision;
        response.root_delay = 0;
        response.root_dispersion = 0;
        response.reference_identifier = u32::from_be_bytes(REFERENCE_ID);

        // Reference timestamp : le moment de réception pour un stratum 1
        response.reference_timestamp = receive_time;

        // Originate timestamp (T1) : transmit timestamp du client, copié tel quel
        response.originate_timestamp = request.transmit_timestamp;

        // Receive timestamp (T2)
        response.receive_timestamp = receive_time;

        // TIMESTAMP T3 : relu juste avant l'émission, jamais mis en cache
        response.transmit_timestamp = self.clock.now_ntp();

        Some(response.to_bytes())
    }

    /// Retourne les statistiques du serveur
    #[allow(dead_code)]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NTP_UNIX_OFFSET;

    fn test_server(clock_seconds: u64) -> (NtpServer, Arc<DisciplinedClock>) {
        let config = Config::default();
        let clock = Arc::new(DisciplinedClock::seeded_from_system());
        clock.set(clock_seconds, 0);
        let server = NtpServer::new(&config, Arc::clone(&clock));
        (server, clock)
    }

    fn client_request() -> [u8; 48] {
        let mut request = [0u8; 48];
        request[0] = 0x23; // LI=0, VN=4, mode=3 (client)
        request
    }

    #[test]
    fn test_short_datagram_ignored() {
        let (server, _clock) = test_server(1_700_000_000);

        assert!(server.handle_datagram(&[0u8; 0]).is_none());
        assert!(server.handle_datagram(&[0u8; 47]).is_none());
    }

    #[test]
    fn test_minimal_datagram_answered() {
        let (server, _clock) = test_server(1_700_000_000);
        let response = server.handle_datagram(&client_request());
        assert!(response.is_some());
    }

    #[test]
    fn test_lenient_mode_and_version() {
        let (server, _clock) = test_server(1_700_000_000);

        // Premier octet arbitraire : toujours répondu dès 48 octets
        let mut request = client_request();
        request[0] = 0xFF;
        assert!(server.handle_datagram(&request).is_some());
    }

    #[test]
    fn test_response_fields() {
        let (server, _clock) = test_server(1_700_000_000);

        let mut request = client_request();
        request[2] = 6; // poll
        let transmit = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];
        request[40..48].copy_from_slice(&transmit);

        let response = server.handle_datagram(&request).unwrap();

        // Octet 0 : LI=0, VN=4, mode=4 (serveur)
        assert_eq!(response[0], 0x24);
        // Stratum 1
        assert_eq!(response[1], 1);
        // Poll copié de la requête
        assert_eq!(response[2], 6);
        // Precision configurée
        assert_eq!(response[3] as i8, -20);
        // Root delay et dispersion à zéro
        assert_eq!(&response[4..12], &[0u8; 8]);
        // Reference identifier
        assert_eq!(&response[12..16], b"GPS\0");
        // Originate timestamp : copie exacte des octets 40..48 de la requête
        assert_eq!(&response[24..32], &transmit);
    }

    #[test]
    fn test_response_timestamps_from_disciplined_clock() {
        let (server, _clock) = test_server(1_700_000_000);

        let response = server.handle_datagram(&client_request()).unwrap();

        let expected_seconds = (1_700_000_000u64 + NTP_UNIX_OFFSET) as u32;
        let reference = u32::from_be_bytes([response[16], response[17], response[18], response[19]]);
        let receive = u32::from_be_bytes([response[32], response[33], response[34], response[35]]);
        let transmit = u32::from_be_bytes([response[40], response[41], response[42], response[43]]);

        assert_eq!(reference, expected_seconds);
        assert_eq!(receive, expected_seconds);
        assert_eq!(transmit, expected_seconds);

        // Reference = receive pour un stratum 1
        assert_eq!(&response[16..24], &response[32..40]);
    }

    #[test]
    fn test_receive_and_transmit_read_separately() {
        let (server, _clock) = test_server(1_700_000_000);

        let response = server.handle_datagram(&client_request()).unwrap();

        // T3 est relu après T2 : jamais antérieur
        let receive = u64::from_be_bytes(response[32..40].try_into().unwrap());
        let transmit = u64::from_be_bytes(response[40..48].try_into().unwrap());
        assert!(transmit >= receive);
    }
}
