//! Reserved packet IDs.
//!
//! | ID        | Meaning                                  |
//! |-----------|------------------------------------------|
//! | 0         | UTF-8 string                             |
//! | 1         | 64-bit signed integer                    |
//! | 2..=240   | user-defined packets                     |
//! | 241..=249 | reserved for future internal use        |
//! | 250       | request                                  |
//! | 251       | response                                 |
//! | 252       | property sync                            |
//! | 253       | peer-info handshake                      |
//! | 254       | disconnect notice                        |
//! | 255       | server stop (reserved, not wired up)     |

pub const STRING: u8 = 0;
pub const INT64: u8 = 1;
pub const REQUEST: u8 = 250;
pub const RESPONSE: u8 = 251;
pub const PROPERTY_SYNC: u8 = 252;
pub const PEER_INFO: u8 = 253;
pub const DISCONNECT: u8 = 254;
pub const SERVER_STOP: u8 = 255;

/// Lowest user-defined packet ID
pub const FIRST_CUSTOM: u8 = 2;

/// Highest user-defined packet ID
pub const LAST_CUSTOM: u8 = 240;

/// Whether `id` may not be used for a custom packet
#[inline]
pub fn is_reserved(id: u8) -> bool {
    !(FIRST_CUSTOM..=LAST_CUSTOM).contains(&id)
}

/// Short name used in logs and diagnostics
pub fn describe(id: u8) -> &'static str {
    match id {
        STRING => "string",
        INT64 => "int64",
        REQUEST => "request",
        RESPONSE => "response",
        PROPERTY_SYNC => "property-sync",
        PEER_INFO => "peer-info",
        DISCONNECT => "disconnect",
        SERVER_STOP => "server-stop",
        FIRST_CUSTOM..=LAST_CUSTOM => "custom",
        _ => "reserved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ranges() {
        for id in [0u8, 1, 241, 245, 249, 250, 251, 252, 253, 254, 255] {
            assert!(is_reserved(id), "{id} should be reserved");
        }
        for id in [2u8, 9, 120, 240] {
            assert!(!is_reserved(id), "{id} should be free");
        }
    }

    #[test]
    fn names() {
        assert_eq!(describe(0), "string");
        assert_eq!(describe(17), "custom");
        assert_eq!(describe(244), "reserved");
        assert_eq!(describe(255), "server-stop");
    }
}
