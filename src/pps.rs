/*!
Synchroniseur de front PPS

Le signal PPS fournit un front montant aligné sur le début de chaque
seconde UTC. Ce module latch le front dans un unique booléen atomique,
consommé par le moteur de discipline. Le gestionnaire de front s'exécute
dans un contexte de type interruption : un seul store atomique, jamais
de verrou, jamais de blocage.
*/

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Latch de front : "un front a été observé depuis la dernière consommation".
///
/// Écrit par le gestionnaire de front (contexte interruption), consommé
/// par la boucle de discipline. Les fronts sont coalescés : si le
/// producteur va plus vite que le consommateur, au plus un front en
/// attente est représenté.
#[derive(Debug, Default)]
pub struct EdgeLatch(AtomicBool);

impl EdgeLatch {
    pub fn new() -> Self {
        EdgeLatch(AtomicBool::new(false))
    }

    /// Pose le latch. Appelé depuis le contexte d'interruption :
    /// un seul store atomique, aucun travail bloquant.
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consomme le front en attente. Retourne true si un front était posé ;
    /// le latch est remis à false de façon atomique vis-à-vis du producteur.
    pub fn consume(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Lecture sans consommation
    #[allow(dead_code)]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Attente bornée d'un front, par scrutation à `poll_interval`.
    ///
    /// Retourne true dès qu'un front est consommé, false si `timeout`
    /// s'écoule sans front. L'attente est volontairement bornée : un PPS
    /// qui cesse d'émettre (câble, récepteur) fait dégrader l'appelant en
    /// mise à jour non alignée au lieu de le suspendre indéfiniment.
    pub fn wait(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.consume() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll_interval);
        }
    }
}

/// Ligne PPS côté matériel : lecture de niveau + enregistrement d'un
/// gestionnaire de front montant
pub trait PpsLine: Send {
    /// Niveau logique courant de la ligne
    fn level(&mut self) -> Result<bool>;

    /// Enregistre un gestionnaire invoqué à chaque front montant.
    /// Le gestionnaire doit être réentrant et non bloquant.
    fn on_rising_edge(&mut self, handler: Box<dyn Fn() + Send + Sync>) -> Result<()>;
}

/// Sonde la ligne PPS à l'intervalle donné jusqu'à observer un niveau haut
/// (true) ou épuiser le délai (false).
///
/// Décidé une fois au démarrage : un échec est une dégradation permanente
/// (précision réduite), jamais re-sondé ensuite.
pub fn probe_availability(
    line: &mut dyn PpsLine,
    timeout: Duration,
    sample_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        match line.level() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to read PPS line level: {}", e);
            }
        }

        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(sample_interval);
    }
}

/// Ligne PPS câblée sur l'entrée CTS d'un port série.
///
/// Les modules GNSS courants exposent leur sortie PPS sur une broche que
/// l'on raccorde à CTS. Faute d'interruption matérielle accessible, un
/// thread de surveillance scrute CTS à ~1 ms et joue le rôle du contexte
/// d'interruption : il n'invoque le gestionnaire que sur front montant.
pub struct CtsPpsLine {
    port: Box<dyn serialport::SerialPort>,
    running: Arc<AtomicBool>,
}

impl CtsPpsLine {
    pub fn new(port: Box<dyn serialport::SerialPort>) -> Self {
        CtsPpsLine {
            port,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Arrête le thread de surveillance
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl PpsLine for CtsPpsLine {
    fn level(&mut self) -> Result<bool> {
        Ok(self.port.read_clear_to_send()?)
    }

    fn on_rising_edge(&mut self, handler: Box<dyn Fn() + Send + Sync>) -> Result<()> {
        let mut port = self.port.try_clone()?;
        let running = Arc::clone(&self.running);

        std::thread::spawn(move || {
            let mut last_level = false;
            let mut edge_count: u64 = 0;

            while running.load(Ordering::Relaxed) {
                match port.read_clear_to_send() {
                    Ok(level) => {
                        if level && !last_level {
                            // Front montant
                            handler();
                            edge_count += 1;
                            if edge_count % 600 == 0 {
                                debug!("PPS edges observed: {}", edge_count);
                            }
                        }
                        last_level = level;
                    }
                    Err(e) => {
                        warn!("Failed to read CTS status: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }

                std::thread::sleep(Duration::from_millis(1));
            }
        });

        Ok(())
    }
}

impl Drop for CtsPpsLine {
    fn drop(&mut self) {
        self.stop();
    }
}
