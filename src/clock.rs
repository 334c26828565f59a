use crate::packet::NtpTimestamp;
use std::sync::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Heure murale courante : secondes Unix + microsecondes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub unix_seconds: u64,
    pub microseconds: u32,
}

/// État interne : valeur fixée par le moteur de discipline, ancrée sur
/// l'horloge monotone pour l'extrapolation entre deux mises à jour
struct ClockState {
    unix_seconds: u64,
    subsec_nanos: u32,
    anchor: Instant,
}

/// Horloge murale du processus, disciplinée par GNSS/PPS.
///
/// Un seul écrivain (la boucle de discipline), plusieurs lecteurs
/// (le répondeur NTP). La monotonie n'est PAS garantie à travers un
/// `set` : une correction GNSS peut faire sauter l'horloge, chaque
/// mise à jour étant supposée plus juste que la précédente.
pub struct DisciplinedClock {
    state: RwLock<ClockState>,
}

impl DisciplinedClock {
    /// Crée l'horloge amorcée sur l'horloge système, pour que le serveur
    /// réponde quelque chose de sensé avant la première trame GNSS valide
    pub fn seeded_from_system() -> Self {
        let (unix_seconds, subsec_nanos) = system_realtime();
        DisciplinedClock {
            state: RwLock::new(ClockState {
                unix_seconds,
                subsec_nanos,
                anchor: Instant::now(),
            }),
        }
    }

    /// Fixe l'horloge à la valeur donnée (appelé par le moteur de discipline)
    pub fn set(&self, unix_seconds: u64, subsec_nanos: u32) {
        // Verrou empoisonné : l'état reste cohérent (écriture d'un bloc),
        // on le récupère plutôt que de perdre la mise à jour
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = ClockState {
            unix_seconds,
            subsec_nanos,
            anchor: Instant::now(),
        };
    }

    /// Heure courante, extrapolée depuis la dernière mise à jour
    pub fn now(&self) -> WallTime {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let elapsed = state.anchor.elapsed();

        let mut seconds = state.unix_seconds + elapsed.as_secs();
        let mut nanos = state.subsec_nanos + elapsed.subsec_nanos();
        if nanos >= 1_000_000_000 {
            seconds += 1;
            nanos -= 1_000_000_000;
        }

        WallTime {
            unix_seconds: seconds,
            microseconds: nanos / 1_000,
        }
    }

    /// Heure courante au format timestamp NTP (epoch 1900)
    pub fn now_ntp(&self) -> NtpTimestamp {
        let t = self.now();
        NtpTimestamp::from_unix(t.unix_seconds, t.microseconds)
    }
}

/// Lit l'horloge temps réel avec la meilleure précision de la plateforme
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn system_realtime() -> (u64, u32) {
    use libc::{clock_gettime, timespec, CLOCK_REALTIME};
    use std::mem::MaybeUninit;

    unsafe {
        let mut ts = MaybeUninit::<timespec>::uninit();
        if clock_gettime(CLOCK_REALTIME, ts.as_mut_ptr()) == 0 {
            let ts = ts.assume_init();
            (ts.tv_sec as u64, ts.tv_nsec as u32)
        } else {
            fallback_realtime()
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn system_realtime() -> (u64, u32) {
    fallback_realtime()
}

#[allow(dead_code)]
fn fallback_realtime() -> (u64, u32) {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before UNIX epoch");

    (duration.as_secs(), duration.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_clock_advances() {
        let clock = DisciplinedClock::seeded_from_system();
        let t1 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = clock.now();

        assert!(
            t2.unix_seconds > t1.unix_seconds
                || (t2.unix_seconds == t1.unix_seconds && t2.microseconds > t1.microseconds)
        );
    }

    #[test]
    fn test_set_overrides_clock() {
        let clock = DisciplinedClock::seeded_from_system();
        clock.set(1_704_067_201, 0);
        let t = clock.now();
        // Lecture immédiate : la dérive d'extrapolation reste sous la seconde
        assert_eq!(t.unix_seconds, 1_704_067_201);
    }

    #[test]
    fn test_now_ntp_applies_epoch_offset() {
        let clock = DisciplinedClock::seeded_from_system();
        clock.set(1_700_000_000, 0);
        let ts = clock.now_ntp();
        assert_eq!(ts.seconds() as u64, 1_700_000_000 + crate::packet::NTP_UNIX_OFFSET);
    }

    #[test]
    fn test_clock_survives_poisoned_lock() {
        use std::sync::Arc;

        let clock = Arc::new(DisciplinedClock::seeded_from_system());
        clock.set(1_000_000_000, 0);

        // Empoisonne le verrou : panique en détenant le guard d'écriture
        let poisoner = Arc::clone(&clock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.write().unwrap();
            panic!("poisoning clock lock");
        })
        .join();

        // Lecture et écriture restent possibles
        assert_eq!(clock.now().unix_seconds, 1_000_000_000);
        clock.set(2_000_000_000, 0);
        assert_eq!(clock.now().unix_seconds, 2_000_000_000);
    }

    #[test]
    fn test_backwards_jump_allowed() {
        let clock = DisciplinedClock::seeded_from_system();
        clock.set(2_000_000_000, 0);
        clock.set(1_000_000_000, 0);
        assert_eq!(clock.now().unix_seconds, 1_000_000_000);
    }
}
