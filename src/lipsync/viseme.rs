// Phoneme to viseme lookup
// The map is supplied by a TTS collaborator and used verbatim; only a SIL entry is required

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const SILENCE: &str = "SIL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisemeMap {
    entries: HashMap<String, u8>,
    silence: u8,
}

impl VisemeMap {
    pub fn new(entries: HashMap<String, u8>) -> Result<Self> {
        let entries: HashMap<String, u8> = entries
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        let silence = *entries
            .get(SILENCE)
            .ok_or_else(|| Error::InvalidParameter("viseme map has no SIL entry".into()))?;
        Ok(Self { entries, silence })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, u8> = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("Invalid viseme map: {}", e)))?;
        Self::new(entries)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Viseme for a phoneme label, falling back to silence for unknown labels
    pub fn viseme_for(&self, phoneme: &str) -> u8 {
        self.entries
            .get(phoneme.trim().to_ascii_uppercase().as_str())
            .copied()
            .unwrap_or(self.silence)
    }

    pub fn silence(&self) -> u8 {
        self.silence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VisemeMap {
    /// The 14-shape ARPABET table the TTS backend ships with
    fn default() -> Self {
        let table: &[(&str, u8)] = &[
            // Vowels
            ("AH", 0), ("AA", 0), ("AO", 1), ("AW", 1), ("AY", 0),
            ("EH", 2), ("ER", 2), ("EY", 2), ("IH", 3), ("IY", 3),
            ("OW", 1), ("OY", 1), ("UH", 4), ("UW", 4),
            // Bilabial
            ("B", 5), ("P", 5), ("M", 5),
            // Labiodental
            ("F", 6), ("V", 6),
            // Dental
            ("TH", 7), ("DH", 7),
            // Alveolar
            ("T", 8), ("D", 8), ("N", 8), ("L", 8), ("R", 8),
            // Sibilants
            ("S", 9), ("Z", 9),
            // Post-alveolar
            ("SH", 10), ("ZH", 10), ("CH", 10), ("JH", 10),
            // Velar
            ("K", 11), ("G", 11), ("NG", 11),
            // Glottal and approximants
            ("HH", 12), ("Y", 12), ("W", 12),
            (SILENCE, 13),
        ];
        Self {
            entries: table.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            silence: 13,
        }
    }
}

/// One phoneme interval as produced by the TTS collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhonemeTiming {
    pub phoneme: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Phoneme timings resolved to visemes, queryable by playback time
#[derive(Debug, Clone)]
pub struct VisemeTrack {
    // (start_ms, end_ms, viseme), sorted by start
    spans: Vec<(u64, u64, u8)>,
    silence: u8,
}

impl VisemeTrack {
    pub fn new(timings: &[PhonemeTiming], map: &VisemeMap) -> Self {
        let mut spans: Vec<(u64, u64, u8)> = timings
            .iter()
            .filter(|t| t.end_ms > t.start_ms)
            .map(|t| (t.start_ms, t.end_ms, map.viseme_for(&t.phoneme)))
            .collect();
        spans.sort_by_key(|s| s.0);
        Self {
            spans,
            silence: map.silence(),
        }
    }

    pub fn from_json(json: &str, map: &VisemeMap) -> Result<Self> {
        let timings: Vec<PhonemeTiming> = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("Invalid phoneme timings: {}", e)))?;
        Ok(Self::new(&timings, map))
    }

    /// Viseme whose interval contains `seconds`; silence between and after intervals
    pub fn viseme_at(&self, seconds: f64) -> u8 {
        if !seconds.is_finite() || seconds < 0.0 {
            return self.silence;
        }
        let ms = (seconds * 1000.0) as u64;
        let idx = self.spans.partition_point(|s| s.0 <= ms);
        if idx == 0 {
            return self.silence;
        }
        let (_, end, viseme) = self.spans[idx - 1];
        if ms < end {
            viseme
        } else {
            self.silence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_map() {
        let map = VisemeMap::from_json(r#"{ "AH": 0, "B": 5, "S": 9, "SIL": 13 }"#).unwrap();
        assert_eq!(map.viseme_for("B"), 5);
        assert_eq!(map.viseme_for("s"), 9);
        assert_eq!(map.viseme_for("ZH"), 13);
        assert_eq!(map.silence(), 13);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_sil_required() {
        assert!(matches!(
            VisemeMap::from_json(r#"{ "AH": 0 }"#),
            Err(Error::InvalidParameter(_))
        ));
        assert!(VisemeMap::from_json(r#"{ "AH": -1, "SIL": 1 }"#).is_err());
    }

    #[test]
    fn test_default_map() {
        let map = VisemeMap::default();
        assert_eq!(map.viseme_for("M"), 5);
        assert_eq!(map.viseme_for("NG"), 11);
        assert_eq!(map.silence(), 13);
    }

    #[test]
    fn test_viseme_track_lookup() {
        let map = VisemeMap::default();
        let track = VisemeTrack::from_json(
            r#"[
                {"phoneme": "HH", "start_ms": 0, "end_ms": 100},
                {"phoneme": "AH", "start_ms": 100, "end_ms": 250},
                {"phoneme": "B", "start_ms": 400, "end_ms": 500}
            ]"#,
            &map,
        )
        .unwrap();

        assert_eq!(track.viseme_at(0.05), 12);
        assert_eq!(track.viseme_at(0.1), 0);
        assert_eq!(track.viseme_at(0.3), 13);
        assert_eq!(track.viseme_at(0.45), 5);
        assert_eq!(track.viseme_at(2.0), 13);
        assert_eq!(track.viseme_at(-1.0), 13);
    }
}
