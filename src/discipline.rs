use crate::clock::DisciplinedClock;
use crate::gnss::CalendarFix;
use crate::pps::EdgeLatch;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Intervalle de scrutation du latch pendant l'attente d'un front
const EDGE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Issue d'un passage du moteur de discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockUpdate {
    /// L'horloge a été fixée à une nouvelle valeur
    Updated,

    /// Trame invalide, aucune mutation
    Skipped,
}

/// Moteur de discipline d'horloge.
///
/// La trame calendaire donne la *valeur* à la seconde près ; le front PPS
/// donne l'*alignement* sous-milliseconde. La trame décrit la seconde
/// entière précédente, donc on calcule d'abord la cible (+1 s), puis on
/// attend le front qui marque exactement ce passage de seconde.
pub struct ClockDiscipline {
    clock: Arc<DisciplinedClock>,
    latch: Arc<EdgeLatch>,

    /// Décidé une fois au démarrage par la sonde PPS, immuable ensuite
    pps_available: bool,

    /// Borne de l'attente de front ; au-delà, mise à jour non alignée
    edge_wait: Duration,
}

impl ClockDiscipline {
    pub fn new(
        clock: Arc<DisciplinedClock>,
        latch: Arc<EdgeLatch>,
        pps_available: bool,
        edge_wait: Duration,
    ) -> Self {
        ClockDiscipline {
            clock,
            latch,
            pps_available,
            edge_wait,
        }
    }

    /// Applique une trame calendaire à l'horloge.
    ///
    /// Trame invalide (date ou heure) : `Skipped`, sans mutation ni
    /// nouvelle tentative, la trame suivante la remplacera. Trame
    /// valide : l'horloge est fixée à la seconde décodée + 1 s de
    /// compensation, alignée sur le prochain front PPS quand il y en a un.
    pub fn update_clock(&self, fix: &CalendarFix) -> ClockUpdate {
        let Some(fix_seconds) = fix.unix_seconds() else {
            return ClockUpdate::Skipped;
        };

        // La trame décrit la seconde entière précédente ; le front à venir
        // marque la suivante.
        let Ok(target_seconds) = u64::try_from(fix_seconds + 1) else {
            return ClockUpdate::Skipped;
        };

        let mut aligned = false;
        if self.pps_available {
            // Écarter tout front déjà en attente : il précède la trame et
            // marquerait la mauvaise seconde. L'alignement se fait sur le
            // front qui suit la trame, pas sur un front quelconque.
            self.latch.consume();

            if self.latch.wait(self.edge_wait, EDGE_POLL_INTERVAL) {
                aligned = true;
            } else {
                warn!(
                    "No PPS edge within {:?}, applying unaligned clock update",
                    self.edge_wait
                );
            }
        }

        self.clock.set(target_seconds, 0);

        debug!(
            "Clock disciplined to {} s (pps_aligned={})",
            target_seconds, aligned
        );

        ClockUpdate::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_fix() -> CalendarFix {
        CalendarFix {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            date_valid: true,
            time_valid: true,
        }
    }

    fn make_engine(pps_available: bool) -> (ClockDiscipline, Arc<DisciplinedClock>, Arc<EdgeLatch>) {
        let clock = Arc::new(DisciplinedClock::seeded_from_system());
        let latch = Arc::new(EdgeLatch::new());
        let engine = ClockDiscipline::new(
            Arc::clone(&clock),
            Arc::clone(&latch),
            pps_available,
            Duration::from_millis(100),
        );
        (engine, clock, latch)
    }

    #[test]
    fn test_valid_fix_without_pps() {
        let (engine, clock, _latch) = make_engine(false);

        let result = engine.update_clock(&valid_fix());
        assert_eq!(result, ClockUpdate::Updated);

        // 2024-01-01T00:00:00Z + 1 s de compensation
        assert_eq!(clock.now().unix_seconds, 1_704_067_201);
    }

    #[test]
    fn test_valid_fix_waits_for_edge() {
        let (engine, clock, latch) = make_engine(true);

        // Front simulé pendant l'attente du moteur
        let producer = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.signal();
        });

        let result = engine.update_clock(&valid_fix());
        handle.join().unwrap();

        assert_eq!(result, ClockUpdate::Updated);
        assert_eq!(clock.now().unix_seconds, 1_704_067_201);
        // Le front a été consommé
        assert!(!latch.is_set());
    }

    #[test]
    fn test_stale_edge_discarded_before_wait() {
        use std::time::Instant;

        let (engine, clock, latch) = make_engine(true);

        // Front posé avant l'application de la trame : il marque la
        // seconde précédente et ne doit pas servir d'alignement
        latch.signal();

        let start = Instant::now();
        let result = engine.update_clock(&valid_fix());

        // Aucun front frais n'arrive : l'attente bornée court jusqu'au
        // bout au lieu de consommer le front périmé immédiatement
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(result, ClockUpdate::Updated);
        assert_eq!(clock.now().unix_seconds, 1_704_067_201);
    }

    #[test]
    fn test_alignment_uses_edge_following_the_fix() {
        use std::time::Instant;

        let (engine, _clock, latch) = make_engine(true);

        // Front périmé déjà en attente, front frais 30 ms plus tard
        latch.signal();
        let producer = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.signal();
        });

        let start = Instant::now();
        let result = engine.update_clock(&valid_fix());
        handle.join().unwrap();

        assert_eq!(result, ClockUpdate::Updated);
        // Retour sur le front frais, ni instantané ni au timeout
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25));
        assert!(elapsed < Duration::from_millis(90));
    }

    #[test]
    fn test_missing_edge_degrades_to_unaligned_update() {
        let (engine, clock, _latch) = make_engine(true);

        // Aucun front : l'attente bornée expire puis l'horloge est
        // quand même fixée
        let result = engine.update_clock(&valid_fix());
        assert_eq!(result, ClockUpdate::Updated);
        assert_eq!(clock.now().unix_seconds, 1_704_067_201);
    }

    #[test]
    fn test_invalid_fix_skipped_twice() {
        let (engine, clock, _latch) = make_engine(false);
        clock.set(1_000_000_000, 0);

        let invalid = CalendarFix::default();
        assert_eq!(engine.update_clock(&invalid), ClockUpdate::Skipped);
        assert_eq!(engine.update_clock(&invalid), ClockUpdate::Skipped);

        // L'horloge n'a pas bougé (la dérive d'extrapolation du test
        // reste très en dessous de la seconde)
        assert_eq!(clock.now().unix_seconds, 1_000_000_000);
    }

    #[test]
    fn test_partially_invalid_fix_skipped() {
        let (engine, clock, _latch) = make_engine(false);
        clock.set(1_000_000_000, 0);

        let mut fix = valid_fix();
        fix.time_valid = false;
        assert_eq!(engine.update_clock(&fix), ClockUpdate::Skipped);

        let mut fix = valid_fix();
        fix.date_valid = false;
        assert_eq!(engine.update_clock(&fix), ClockUpdate::Skipped);

        assert_eq!(clock.now().unix_seconds, 1_000_000_000);
    }
}
