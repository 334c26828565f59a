use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration du serveur NTP
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Configuration du serveur
    pub server: ServerConfig,

    /// Configuration de la source GNSS
    pub gnss: GnssConfig,

    /// Configuration du signal PPS
    #[serde(default)]
    pub pps: PpsConfig,

    /// Configuration des logs
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Adresse d'écoute (ex: "0.0.0.0:123")
    pub bind_address: String,

    /// Précision annoncée en log2 secondes (ex: -20 = ~1µs)
    #[serde(default = "default_precision")]
    pub precision: i8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GnssConfig {
    /// Port série du module GNSS (ex: "/dev/ttyUSB0" sur Linux, "COM9" sur Windows)
    pub serial_port: String,

    /// Baud rate (généralement 9600 pour NMEA)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Intervalle de scrutation de la dernière trame par la boucle de
    /// discipline, en millisecondes : assez court pour attraper chaque
    /// nouvelle trame rapidement
    #[serde(default = "default_fix_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PpsConfig {
    /// Activer la détection PPS via la ligne CTS du port série
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fenêtre de sondage de la ligne PPS au démarrage, en millisecondes
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Intervalle d'échantillonnage pendant le sondage, en millisecondes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Borne de l'attente d'un front à chaque mise à jour d'horloge,
    /// en millisecondes ; au-delà la mise à jour se fait sans alignement.
    /// Doit couvrir au moins une période PPS entière (1 s).
    #[serde(default = "default_edge_wait_ms")]
    pub edge_wait_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Niveau de log: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Activer les logs de chaque requête
    #[serde(default = "default_false")]
    pub log_requests: bool,
}

// Fonctions par défaut pour serde
fn default_precision() -> i8 { -20 }
fn default_baud_rate() -> u32 { 9600 }
fn default_fix_poll_interval_ms() -> u64 { 50 }
fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_probe_timeout_ms() -> u64 { 1500 }
fn default_probe_interval_ms() -> u64 { 1 }
fn default_edge_wait_ms() -> u64 { 1500 }
fn default_log_level() -> String { "info".to_string() }

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_address: "0.0.0.0:123".to_string(),
                precision: -20,
            },
            gnss: GnssConfig {
                serial_port: default_serial_port(),
                baud_rate: 9600,
                poll_interval_ms: 50,
            },
            pps: PpsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PpsConfig {
    fn default() -> Self {
        PpsConfig {
            enabled: true,
            probe_timeout_ms: 1500,
            probe_interval_ms: 1,
            edge_wait_ms: 1500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            log_requests: false,
        }
    }
}

fn default_serial_port() -> String {
    #[cfg(target_os = "windows")]
    return "COM9".to_string();

    #[cfg(not(target_os = "windows"))]
    return "/dev/ttyUSB0".to_string();
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid bind address: {}", self.server.bind_address);
        }

        if self.server.precision >= 0 {
            anyhow::bail!("Invalid precision: must be negative (log2 seconds)");
        }

        if self.pps.probe_timeout_ms == 0 || self.pps.probe_interval_ms == 0 {
            anyhow::bail!("PPS probe timeout and interval must be non-zero");
        }

        // L'attente de front doit pouvoir couvrir une période PPS entière
        if self.pps.enabled && self.pps.edge_wait_ms < 1000 {
            anyhow::bail!("PPS edge wait must be at least 1000 ms");
        }

        if self.gnss.poll_interval_ms == 0 {
            anyhow::bail!("GNSS poll interval must be non-zero");
        }

        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let example_config = Config::default();
        example_config.to_file(path)
    }
}
