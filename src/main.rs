mod clock;
mod config;
mod discipline;
mod gnss;
mod packet;
mod pps;
mod server;

use anyhow::{Context, Result};
use clock::DisciplinedClock;
use config::Config;
use discipline::{ClockDiscipline, ClockUpdate};
use gnss::{CalendarFix, FixSource, SerialFixSource};
use pps::{CtsPpsLine, EdgeLatch, PpsLine};
use server::{NtpServer, UdpTransport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // Initialiser les logs
    init_logging()?;

    info!("Metronome NTP server v{}", env!("CARGO_PKG_VERSION"));
    info!("Stratum-1 time source disciplined by GNSS + PPS");

    // Charger la configuration
    let config_path = get_config_path();
    let config = load_or_create_config(&config_path)?;

    info!("Configuration:");
    info!("  Bind address: {}", config.server.bind_address);
    info!("  GNSS serial port: {}", config.gnss.serial_port);
    info!("  PPS enabled: {}", config.pps.enabled);

    // Horloge murale partagée, amorcée sur l'horloge système en attendant
    // la première trame GNSS valide
    let wall_clock = Arc::new(DisciplinedClock::seeded_from_system());
    let edge_latch = Arc::new(EdgeLatch::new());

    // Démarrer le lecteur GNSS
    let fix_source = Arc::new(SerialFixSource::new());
    let _gnss_thread = fix_source.start(config.gnss.clone());

    // Sonder la ligne PPS une seule fois au démarrage ; le résultat est
    // immuable pour toute la durée du processus
    let mut pps_line = if config.pps.enabled {
        match serialport::new(&config.gnss.serial_port, config.gnss.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
        {
            Ok(port) => Some(CtsPpsLine::new(port)),
            Err(e) => {
                warn!("Failed to open PPS line on {}: {}", config.gnss.serial_port, e);
                None
            }
        }
    } else {
        None
    };

    let pps_available = match pps_line.as_mut() {
        Some(line) => {
            info!(
                "Probing PPS line for {} ms...",
                config.pps.probe_timeout_ms
            );
            let found = pps::probe_availability(
                line,
                Duration::from_millis(config.pps.probe_timeout_ms),
                Duration::from_millis(config.pps.probe_interval_ms),
            );

            if found {
                // Le gestionnaire de front ne fait que poser le latch :
                // aucun verrou, aucun blocage dans ce contexte
                let latch_for_edge = Arc::clone(&edge_latch);
                line.on_rising_edge(Box::new(move || latch_for_edge.signal()))
                    .context("Failed to register PPS edge handler")?;

                info!("PPS signal detected, sub-second alignment enabled");
            } else {
                warn!(
                    "No PPS signal within {} ms, running without edge alignment",
                    config.pps.probe_timeout_ms
                );
            }

            found
        }
        None => false,
    };

    // Moteur de discipline d'horloge
    let engine = ClockDiscipline::new(
        Arc::clone(&wall_clock),
        Arc::clone(&edge_latch),
        pps_available,
        Duration::from_millis(config.pps.edge_wait_ms),
    );

    // Gérer Ctrl+C
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        warn!("Ctrl+C received, shutting down...");
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Boucle de discipline : rejoue le moteur à intervalle court pour
    // attraper chaque nouvelle trame calendaire rapidement
    let fix_poll = Duration::from_millis(config.gnss.poll_interval_ms);
    let shutdown_discipline = Arc::clone(&shutdown);
    let fix_source_discipline = Arc::clone(&fix_source);
    let discipline_thread = std::thread::spawn(move || {
        let mut last_applied: Option<CalendarFix> = None;

        while !shutdown_discipline.load(Ordering::Relaxed) {
            let fix = fix_source_discipline.latest_fix();

            // Une trame déjà appliquée ne déclenche pas de nouvelle
            // attente de front
            if last_applied != Some(fix) {
                match engine.update_clock(&fix) {
                    ClockUpdate::Updated => {
                        last_applied = Some(fix);
                    }
                    ClockUpdate::Skipped => {
                        debug!("Calendar fix not valid yet, skipped");
                    }
                }
            }

            std::thread::sleep(fix_poll);
        }

        info!("Clock discipline loop stopped");
    });

    // Boucle de service NTP sur le thread principal
    let transport = UdpTransport::bind(&config.server.bind_address)?;
    let ntp_server = NtpServer::new(&config, Arc::clone(&wall_clock));

    info!("Starting NTP server on {}", config.server.bind_address);
    let result = ntp_server.run(&transport, Arc::clone(&shutdown));

    if let Err(e) = &result {
        error!("Server error: {:#}", e);
    }

    shutdown.store(true, Ordering::SeqCst);
    let _ = discipline_thread.join();

    result
}

/// Initialise le système de logging
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Obtient le chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    // Vérifier les arguments de ligne de commande
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return PathBuf::from(&args[1]);
    }

    // Sinon, utiliser le chemin par défaut
    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/metronome/config.toml");

    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

/// Charge la configuration ou crée un fichier exemple
fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        info!("Loading configuration from {}", path.display());
        Config::from_file(path)
    } else {
        warn!("Configuration file not found: {}", path.display());
        warn!("Creating example configuration...");

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create config directory")?;
            }
        }

        Config::create_example_config(path)
            .context("Failed to create example config")?;

        info!("Example configuration created at {}", path.display());
        info!("Please edit the configuration file and restart the server.");

        Config::from_file(path)
    }
}
