//! Passphrase strength classification.
//!
//! Guidance only: the result is surfaced to the user when choosing a sync
//! passphrase, but no operation is ever rejected because of it.

/// Strength rating for a passphrase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PassphraseStrength {
    /// Very weak - high risk of cracking
    VeryWeak,
    /// Weak - moderate risk
    Weak,
    /// Fair - some protection
    Fair,
    /// Good - strong passphrase
    Good,
    /// Strong - very strong passphrase
    Strong,
    /// Very strong - excellent passphrase
    VeryStrong,
}

impl PassphraseStrength {
    /// Get the strength as a numeric score (0-5)
    pub fn score(&self) -> u8 {
        match self {
            PassphraseStrength::VeryWeak => 0,
            PassphraseStrength::Weak => 1,
            PassphraseStrength::Fair => 2,
            PassphraseStrength::Good => 3,
            PassphraseStrength::Strong => 4,
            PassphraseStrength::VeryStrong => 5,
        }
    }

    /// Get the strength as a display string
    pub fn as_str(&self) -> &'static str {
        match self {
            PassphraseStrength::VeryWeak => "Very Weak",
            PassphraseStrength::Weak => "Weak",
            PassphraseStrength::Fair => "Fair",
            PassphraseStrength::Good => "Good",
            PassphraseStrength::Strong => "Strong",
            PassphraseStrength::VeryStrong => "Very Strong",
        }
    }
}

/// Classify a passphrase from its length and character-class diversity.
///
/// Entropy estimate: E = L * log2(R), where L is the length and R the
/// size of the combined character set in use.
pub fn classify_passphrase(passphrase: &str) -> PassphraseStrength {
    let length = passphrase.chars().count();

    let has_lowercase = passphrase.chars().any(|c| c.is_lowercase());
    let has_uppercase = passphrase.chars().any(|c| c.is_uppercase());
    let has_digits = passphrase.chars().any(|c| c.is_ascii_digit());
    let has_symbols = passphrase
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    let mut charset_size = 0;
    if has_lowercase {
        charset_size += 26;
    }
    if has_uppercase {
        charset_size += 26;
    }
    if has_digits {
        charset_size += 10;
    }
    if has_symbols {
        charset_size += 32; // Approximate for common symbols
    }

    let entropy_bits = if charset_size > 0 {
        (length as f64) * (charset_size as f64).log2()
    } else {
        0.0
    };

    if entropy_bits < 28.0 {
        PassphraseStrength::VeryWeak
    } else if entropy_bits < 36.0 {
        PassphraseStrength::Weak
    } else if entropy_bits < 60.0 {
        PassphraseStrength::Fair
    } else if entropy_bits < 80.0 {
        PassphraseStrength::Good
    } else if entropy_bits < 100.0 {
        PassphraseStrength::Strong
    } else {
        PassphraseStrength::VeryStrong
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_very_weak() {
        assert_eq!(classify_passphrase(""), PassphraseStrength::VeryWeak);
    }

    #[test]
    fn short_digits_are_very_weak() {
        assert_eq!(classify_passphrase("123"), PassphraseStrength::VeryWeak);
    }

    #[test]
    fn mixed_short_is_fair() {
        assert_eq!(classify_passphrase("Pass123!"), PassphraseStrength::Fair);
    }

    #[test]
    fn long_mixed_is_good_or_better() {
        assert!(classify_passphrase("MyP@ssw0rd!23") >= PassphraseStrength::Good);
    }

    #[test]
    fn long_diverse_is_very_strong() {
        assert_eq!(
            classify_passphrase("Tr0ub4dor&3St!le#P@ssw0rd"),
            PassphraseStrength::VeryStrong
        );
    }

    #[test]
    fn ordering_matches_score() {
        assert!(PassphraseStrength::VeryWeak < PassphraseStrength::Weak);
        assert!(PassphraseStrength::Strong < PassphraseStrength::VeryStrong);
        assert_eq!(PassphraseStrength::VeryStrong.score(), 5);
        assert_eq!(PassphraseStrength::Fair.as_str(), "Fair");
    }
}
