//! Minimal NMEA 0183 sentence recognition
//!
//! The supervisor does not parse positions. It only needs to tell real
//! sentence traffic apart from gpsd's JSON chatter and line noise when it
//! decides whether data is flowing.

/// XOR of every byte between the leading `$`/`!` and the `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Render `body` as a complete sentence: `$<body>*<checksum>`.
pub fn with_checksum(body: &str) -> String {
    format!("${}*{:02X}", body, checksum(body))
}

/// Whether `line` looks like one NMEA sentence.
///
/// The line must start with `$` or `!` and carry a non-empty body. When a
/// `*hh` suffix is present it has to match the computed checksum; sentences
/// without one are accepted, since some receivers omit it.
pub fn is_sentence(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix('$').or_else(|| line.strip_prefix('!')) else {
        return false;
    };

    match rest.rsplit_once('*') {
        Some((body, sum)) => {
            if body.is_empty() || sum.len() != 2 {
                return false;
            }
            match u8::from_str_radix(sum, 16) {
                Ok(expected) => checksum(body) == expected,
                Err(_) => false,
            }
        }
        None => !rest.is_empty() && rest.is_ascii(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_checksum() {
        // Reference sentence from a Garmin receiver
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        assert!(is_sentence(line));
    }

    #[test]
    fn test_with_checksum_is_accepted() {
        let line = with_checksum("HCHDG,101.1,,,,0.0");
        assert!(line.starts_with("$HCHDG"));
        assert!(is_sentence(&line));
    }

    #[test]
    fn test_rejects_bad_checksum() {
        assert!(!is_sentence(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00"
        ));
        assert!(!is_sentence("$GPGGA*4"));
        assert!(!is_sentence("$*00"));
    }

    #[test]
    fn test_rejects_non_sentences() {
        assert!(!is_sentence(r#"{"class":"VERSION","release":"3.22"}"#));
        assert!(!is_sentence(""));
        assert!(!is_sentence("$"));
        assert!(!is_sentence("garbage"));
    }

    #[test]
    fn test_accepts_missing_checksum_and_crlf() {
        assert!(is_sentence("$GPRMC,081836,A,3751.65,S,14507.36,E\r\n"));
        assert!(is_sentence("!AIVDM,1,1,,B,15M67FC000G?ufbE`FepT@3n00Sa,0"));
    }
}
