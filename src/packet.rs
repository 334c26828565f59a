use thiserror::Error;

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Erreurs liées au parsing des paquets NTP
#[derive(Error, Debug)]
pub enum NtpError {
    #[error("Packet too short: {0} bytes (minimum 48)")]
    PacketTooShort(usize),
}

/// Leap Indicator values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning = 0,
    LastMinute61Seconds = 1,
    LastMinute59Seconds = 2,
    AlarmCondition = 3,
}

impl From<u8> for LeapIndicator {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::LastMinute61Seconds,
            2 => LeapIndicator::LastMinute59Seconds,
            _ => LeapIndicator::AlarmCondition,
        }
    }
}

/// NTP Mode values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpMode {
    Reserved = 0,
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    NtpControlMessage = 6,
    ReservedPrivate = 7,
}

impl From<u8> for NtpMode {
    fn from(value: u8) -> Self {
        match value & 0x07 {
            0 => NtpMode::Reserved,
            1 => NtpMode::SymmetricActive,
            2 => NtpMode::SymmetricPassive,
            3 => NtpMode::Client,
            4 => NtpMode::Server,
            5 => NtpMode::Broadcast,
            6 => NtpMode::NtpControlMessage,
            _ => NtpMode::ReservedPrivate,
        }
    }
}

/// Structure représentant un timestamp NTP (64 bits)
/// Format: 32 bits de secondes depuis 1900-01-01 + 32 bits de fraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Crée un timestamp NTP à partir de secondes Unix et microsecondes.
    /// La fraction est arrondie au plus proche : round(µs * 2^32 / 1e6)
    pub fn from_unix(unix_seconds: u64, microseconds: u32) -> Self {
        let ntp_seconds = unix_seconds + NTP_UNIX_OFFSET;
        let fraction = ((microseconds as u64) * (1u64 << 32) + 500_000) / 1_000_000;
        NtpTimestamp((ntp_seconds << 32) | (fraction & 0xFFFF_FFFF))
    }

    /// Retourne la partie secondes du timestamp (epoch NTP)
    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Retourne la partie fraction du timestamp
    #[allow(dead_code)]
    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }

    /// Partie secondes ramenée à l'epoch Unix
    #[allow(dead_code)]
    pub fn unix_seconds(&self) -> u64 {
        (self.seconds() as u64).saturating_sub(NTP_UNIX_OFFSET)
    }

    /// Fraction convertie en microsecondes, arrondie au plus proche
    #[allow(dead_code)]
    pub fn microseconds(&self) -> u32 {
        (((self.fraction() as u64) * 1_000_000 + (1u64 << 31)) >> 32) as u32
    }
}

/// Structure du paquet NTP (48 octets)
/// Tous les champs multi-octets sont en big-endian (network byte order)
#[derive(Debug, Clone, Copy)]
pub struct NtpPacket {
    // Octet 0
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: NtpMode,

    // Octets 1-3
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,

    // Octets 4-7
    pub root_delay: u32,

    // Octets 8-11
    pub root_dispersion: u32,

    // Octets 12-15
    pub reference_identifier: u32,

    // Octets 16-23
    pub reference_timestamp: NtpTimestamp,

    // Octets 24-31
    pub originate_timestamp: NtpTimestamp,

    // Octets 32-39
    pub receive_timestamp: NtpTimestamp,

    // Octets 40-47
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpPacket {
    /// Taille du paquet NTP en octets
    pub const SIZE: usize = 48;

    /// Crée un paquet de réponse serveur par défaut (stratum 1, mode 4)
    pub fn new_server_response() -> Self {
        NtpPacket {
            leap_indicator: LeapIndicator::NoWarning,
            version: 4,
            mode: NtpMode::Server,
            stratum: 1,
            poll: 4,
            precision: -20,
            root_delay: 0,
            root_dispersion: 0,
            reference_identifier: 0,
            reference_timestamp: NtpTimestamp::default(),
            originate_timestamp: NtpTimestamp::default(),
            receive_timestamp: NtpTimestamp::default(),
            transmit_timestamp: NtpTimestamp::default(),
        }
    }

    /// Parse un buffer en paquet NTP.
    /// Seule la taille est vérifiée : tout datagramme d'au moins 48 octets
    /// est accepté comme requête, quel que soit son mode ou sa version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NtpError> {
        if bytes.len() < Self::SIZE {
            return Err(NtpError::PacketTooShort(bytes.len()));
        }

        // Octet 0: LI (2 bits) + VN (3 bits) + Mode (3 bits)
        let li_vn_mode = bytes[0];
        let leap_indicator = LeapIndicator::from((li_vn_mode >> 6) & 0x03);
        let version = (li_vn_mode >> 3) & 0x07;
        let mode = NtpMode::from(li_vn_mode & 0x07);

        // Octets 1-3
        let stratum = bytes[1];
        let poll = bytes[2] as i8;
        let precision = bytes[3] as i8;

        // Octets 4-47: tous en big-endian
        let root_delay = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let root_dispersion = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let reference_identifier = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        let reference_timestamp = NtpTimestamp(u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19],
            bytes[20], bytes[21], bytes[22], bytes[23],
        ]));

        let originate_timestamp = NtpTimestamp(u64::from_be_bytes([
            bytes[24], bytes[25], bytes[26], bytes[27],
            bytes[28], bytes[29], bytes[30], bytes[31],
        ]));

        let receive_timestamp = NtpTimestamp(u64::from_be_bytes([
            bytes[32], bytes[33], bytes[34], bytes[35],
            bytes[36], bytes[37], bytes[38], bytes[39],
        ]));

        let transmit_timestamp = NtpTimestamp(u64::from_be_bytes([
            bytes[40], bytes[41], bytes[42], bytes[43],
            bytes[44], bytes[45], bytes[46], bytes[47],
        ]));

        Ok(NtpPacket {
            leap_indicator,
            version,
            mode,
            stratum,
            poll,
            precision,
            root_delay,
            root_dispersion,
            reference_identifier,
            reference_timestamp,
            originate_timestamp,
            receive_timestamp,
            transmit_timestamp,
        })
    }

    /// Convertit le paquet en bytes pour transmission (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        // Octet 0: LI + VN + Mode
        bytes[0] = ((self.leap_indicator as u8) << 6)
                 | ((self.version & 0x07) << 3)
                 | (self.mode as u8 & 0x07);

        // Octets 1-3
        bytes[1] = self.stratum;
        bytes[2] = self.poll as u8;
        bytes[3] = self.precision as u8;

        // Octets 4-7: Root delay (big-endian)
        bytes[4..8].copy_from_slice(&self.root_delay.to_be_bytes());

        // Octets 8-11: Root dispersion (big-endian)
        bytes[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());

        // Octets 12-15: Reference identifier (big-endian)
        bytes[12..16].copy_from_slice(&self.reference_identifier.to_be_bytes());

        // Octets 16-23: Reference timestamp (big-endian)
        bytes[16..24].copy_from_slice(&self.reference_timestamp.0.to_be_bytes());

        // Octets 24-31: Originate timestamp (big-endian)
        bytes[24..32].copy_from_slice(&self.originate_timestamp.0.to_be_bytes());

        // Octets 32-39: Receive timestamp (big-endian)
        bytes[32..40].copy_from_slice(&self.receive_timestamp.0.to_be_bytes());

        // Octets 40-47: Transmit timestamp (big-endian)
        bytes[40..48].copy_from_slice(&self.transmit_timestamp.0.to_be_bytes());

        bytes
    }
}
