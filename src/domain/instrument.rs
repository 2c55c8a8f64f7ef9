//! Instrument key normalization.
//!
//! Upstream sends two separator forms for the same instrument
//! (`NSE_FO|NIFTY...` and `NSE_FO:NIFTY...`). The core treats `|` as
//! canonical and folds `:` on ingress so every other component only
//! ever sees one spelling.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    /// Normalize a raw upstream key to canonical form.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.replacen(':', "|", 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstrumentKey {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl From<&str> for InstrumentKey {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_colon_to_pipe() {
        let a = InstrumentKey::normalize("NSE_FO:NIFTY24FEB23500CE");
        let b = InstrumentKey::normalize("NSE_FO|NIFTY24FEB23500CE");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "NSE_FO|NIFTY24FEB23500CE");
    }

    #[test]
    fn leaves_canonical_form_untouched() {
        let a = InstrumentKey::normalize("NSE_INDEX|Nifty 50");
        assert_eq!(a.as_str(), "NSE_INDEX|Nifty 50");
    }

    #[test]
    fn only_first_separator_is_folded() {
        // trading symbols can legitimately contain a colon after the first
        // separator; only the exchange|symbol boundary is normalized.
        let a = InstrumentKey::normalize("NSE_FO:SYM:EXTRA");
        assert_eq!(a.as_str(), "NSE_FO|SYM:EXTRA");
    }
}
