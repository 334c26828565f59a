/*!
Source de temps GNSS

Lit les trames NMEA sur port série, en extrait les champs calendaires
(date + heure UTC) et publie la dernière trame décodée pour le moteur de
discipline d'horloge. Le décodage s'arrête aux champs calendaires : la
fusion avec le front PPS est faite ailleurs.

Architecture :
- Thread séparé pour ne jamais bloquer la boucle de discipline
- Reconnexion automatique avec backoff en cas de déconnexion
- Chaque nouvelle trame remplace la précédente, aucun historique
*/

use crate::config::GnssConfig;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info};

/// Champs calendaires d'une trame GNSS décodée (UTC)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarFix {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,

    /// Validité des champs de date
    pub date_valid: bool,

    /// Validité des champs d'heure
    pub time_valid: bool,
}

impl CalendarFix {
    pub fn is_valid(&self) -> bool {
        self.date_valid && self.time_valid
    }

    /// Conversion calendrier grégorien UTC -> secondes depuis l'epoch Unix.
    /// Retourne None si la trame est invalide ou hors plage.
    pub fn unix_seconds(&self) -> Option<i64> {
        if !self.is_valid() {
            return None;
        }

        let date = chrono::NaiveDate::from_ymd_opt(
            self.year as i32,
            self.month as u32,
            self.day as u32,
        )?;
        let datetime = date.and_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        )?;

        Some(datetime.and_utc().timestamp())
    }
}

/// Source de trames calendaires, interrogeable sans blocage
pub trait FixSource: Send + Sync {
    /// Dernière trame décodée ; une trame invalide est retournée telle
    /// quelle, c'est au consommateur de l'ignorer
    fn latest_fix(&self) -> CalendarFix;
}

/// Lecteur NMEA sur port série publiant la dernière trame RMC décodée
pub struct SerialFixSource {
    latest: Arc<RwLock<CalendarFix>>,
    running: Arc<AtomicBool>,
}

impl SerialFixSource {
    pub fn new() -> Self {
        SerialFixSource {
            latest: Arc::new(RwLock::new(CalendarFix::default())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Démarre le thread de lecture série.
    /// Le thread tourne indéfiniment avec reconnexion automatique.
    pub fn start(&self, config: GnssConfig) -> std::thread::JoinHandle<()> {
        info!("Starting GNSS reader thread");
        info!("  Port: {}", config.serial_port);
        info!("  Baud rate: {}", config.baud_rate);

        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);

        std::thread::spawn(move || {
            let mut reconnect_delay = Duration::from_secs(5);
            let max_reconnect_delay = Duration::from_secs(60);

            while running.load(Ordering::Relaxed) {
                match run_reader(&config, &latest, &running) {
                    Ok(_) => {
                        info!("GNSS reader stopped normally");
                        break;
                    }
                    Err(e) => {
                        error!("GNSS reader error: {:#}", e);
                        error!("Reconnecting in {:?}...", reconnect_delay);

                        std::thread::sleep(reconnect_delay);

                        // Backoff exponentiel plafonné
                        reconnect_delay =
                            std::cmp::min(reconnect_delay * 2, max_reconnect_delay);
                    }
                }
            }

            info!("GNSS reader thread terminated");
        })
    }

    /// Arrête le thread de lecture proprement
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for SerialFixSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FixSource for SerialFixSource {
    fn latest_fix(&self) -> CalendarFix {
        self.latest
            .read()
            .map(|guard| *guard)
            .unwrap_or_default()
    }
}

impl Drop for SerialFixSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Boucle de lecture série : réassemble les lignes NMEA et publie
/// chaque trame RMC décodée
fn run_reader(
    config: &GnssConfig,
    latest: &Arc<RwLock<CalendarFix>>,
    running: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    info!("Opening GNSS serial port: {}", config.serial_port);

    let mut port = serialport::new(&config.serial_port, config.baud_rate)
        .timeout(Duration::from_millis(100))
        .open()?;

    port.write_request_to_send(true)?;
    port.write_data_terminal_ready(true)?;
    port.clear(serialport::ClearBuffer::All)?;

    info!("GNSS serial port opened successfully");

    let mut buffer = String::new();
    let mut read_buf = [0u8; 512];
    let mut sentence_count: u64 = 0;

    while running.load(Ordering::Relaxed) {
        match port.read(&mut read_buf) {
            Ok(n) if n > 0 => {
                let s = String::from_utf8_lossy(&read_buf[..n]);
                buffer.push_str(&s);

                // Traitement ligne par ligne
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer.drain(..=pos).collect::<String>();
                    let trimmed = line.trim();

                    if let Some(fix) = parse_rmc(trimmed) {
                        sentence_count += 1;
                        if sentence_count % 600 == 0 {
                            info!("GNSS stats: {} RMC sentences decoded", sentence_count);
                        }
                        debug!(
                            "RMC fix: {:04}-{:02}-{:02} {:02}:{:02}:{:02} valid={}",
                            fix.year, fix.month, fix.day,
                            fix.hour, fix.minute, fix.second,
                            fix.is_valid()
                        );

                        if let Ok(mut guard) = latest.write() {
                            *guard = fix;
                        }
                    }
                }
            }
            Ok(_) => {
                // Pas de données, continuer
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout normal, continuer
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Parse une trame RMC ($GPRMC / $GNRMC) en champs calendaires.
/// Retourne None pour toute autre trame ou format inattendu ;
/// une trame RMC au statut "V" produit une CalendarFix invalide.
fn parse_rmc(sentence: &str) -> Option<CalendarFix> {
    if !sentence.starts_with("$GPRMC") && !sentence.starts_with("$GNRMC") {
        return None;
    }

    let fields: Vec<&str> = sentence.split(',').collect();
    if fields.len() < 10 {
        return None;
    }

    // Champ 1 : heure UTC (hhmmss ou hhmmss.sss)
    // Champ 9 : date (ddmmyy)
    let time_str = fields[1];
    let date_str = fields[9];

    // Champ 2 : statut (A = valide, V = invalide)
    if fields[2] != "A" {
        debug!("GNSS fix not valid (status: {})", fields[2]);
        return Some(CalendarFix::default());
    }

    if time_str.len() < 6 || date_str.len() != 6 {
        return None;
    }

    // Le bruit de ligne série devient U+FFFD via from_utf8_lossy ;
    // un découpage par index d'octet paniquerait sur une frontière
    // de caractère
    if !time_str.is_ascii() || !date_str.is_ascii() {
        return None;
    }

    let hour: u8 = time_str[0..2].parse().ok()?;
    let minute: u8 = time_str[2..4].parse().ok()?;
    let second: u8 = time_str[4..6].parse().ok()?;

    let day: u8 = date_str[0..2].parse().ok()?;
    let month: u8 = date_str[2..4].parse().ok()?;
    let year: u16 = 2000 + date_str[4..6].parse::<u16>().ok()?;

    Some(CalendarFix {
        year,
        month,
        day,
        hour,
        minute,
        second,
        date_valid: true,
        time_valid: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_seconds_known_date() {
        let fix = CalendarFix {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            date_valid: true,
            time_valid: true,
        };
        assert_eq!(fix.unix_seconds(), Some(1_704_067_200));
    }

    #[test]
    fn test_unix_seconds_leap_day() {
        let fix = CalendarFix {
            year: 2024,
            month: 2,
            day: 29,
            hour: 12,
            minute: 30,
            second: 15,
            date_valid: true,
            time_valid: true,
        };
        // 2024-02-29T12:30:15Z
        assert_eq!(fix.unix_seconds(), Some(1_709_209_815));
    }

    #[test]
    fn test_unix_seconds_invalid_fix() {
        let mut fix = CalendarFix {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            date_valid: false,
            time_valid: true,
        };
        assert_eq!(fix.unix_seconds(), None);

        fix.date_valid = true;
        fix.time_valid = false;
        assert_eq!(fix.unix_seconds(), None);
    }

    #[test]
    fn test_unix_seconds_out_of_range_fields() {
        let fix = CalendarFix {
            year: 2024,
            month: 13,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            date_valid: true,
            time_valid: true,
        };
        assert_eq!(fix.unix_seconds(), None);
    }

    #[test]
    fn test_parse_rmc_valid() {
        let sentence = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        let fix = parse_rmc(sentence).unwrap();

        assert!(fix.is_valid());
        assert_eq!(fix.year, 2094);
        assert_eq!(fix.month, 3);
        assert_eq!(fix.day, 23);
        assert_eq!(fix.hour, 12);
        assert_eq!(fix.minute, 35);
        assert_eq!(fix.second, 19);
    }

    #[test]
    fn test_parse_rmc_void_status() {
        let sentence = "$GPRMC,123519,V,,,,,,,230394,,*00";
        let fix = parse_rmc(sentence).unwrap();
        assert!(!fix.is_valid());
    }

    #[test]
    fn test_parse_rmc_non_ascii_noise() {
        // Octet corrompu dans le champ heure : ne doit jamais paniquer
        let sentence =
            "$GPRMC,12\u{FFFD}519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        assert!(parse_rmc(sentence).is_none());

        // Même chose dans le champ date
        let sentence =
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,23\u{FFFD}94,003.1,W*6A";
        assert!(parse_rmc(sentence).is_none());
    }

    #[test]
    fn test_parse_rmc_ignores_other_sentences() {
        let sentence = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        assert!(parse_rmc(sentence).is_none());
    }
}
